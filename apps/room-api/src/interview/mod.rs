//! One collaborative session: language, versioned buffer, patch log.
//!
//! All durable state lives in the shared store under four keys per
//! session, every write refreshing the shared TTL:
//!
//! - `session:<id>:state`   — serialised snapshot `{content, version}`
//! - `session:<id>:version` — latest committed version
//! - `session:<id>:patch`   — left-pushed list of patches above the snapshot
//! - `session:<id>:lang`    — current language identifier

use std::sync::Arc;
use std::time::Duration;

use crate::cache::{CacheError, SessionStore};

mod patch;

pub use patch::{apply_patch, AppendOutcome, CodePatch, CodeState, PatchOp};

/// Sessions expire this long after the last write.
pub const SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Minimum spacing between sandbox runs for one session.
const RUN_COOLDOWN: Duration = Duration::from_secs(10);

/// Every version divisible by this folds the patch log into the snapshot.
pub const COMPACT_EVERY: i64 = 10;

#[derive(Debug, thiserror::Error)]
pub enum InterviewError {
    #[error("session already exists")]
    AlreadyExists,
    #[error("session not found")]
    NotFound,
    #[error("unknown language: {0}")]
    InvalidLanguage(String),
    #[error("invalid patch position range")]
    InvalidPatch,
    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Handle to one session's durable state.
pub struct Interview {
    pub session_id: String,
    pub language: String,
    pub version: i64,
    state_key: String,
    version_key: String,
    patch_key: String,
    lang_key: String,
    run_key: String,
    store: Arc<dyn SessionStore>,
}

impl std::fmt::Debug for Interview {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interview")
            .field("session_id", &self.session_id)
            .field("language", &self.language)
            .field("version", &self.version)
            .field("state_key", &self.state_key)
            .field("version_key", &self.version_key)
            .field("patch_key", &self.patch_key)
            .field("lang_key", &self.lang_key)
            .field("run_key", &self.run_key)
            .finish()
    }
}

fn session_key(session_id: &str, field: &str) -> String {
    format!("session:{session_id}:{field}")
}

/// The store key that marks an existing session.
pub fn state_key(session_id: &str) -> String {
    session_key(session_id, "state")
}

impl Interview {
    fn handle(store: Arc<dyn SessionStore>, session_id: String, language: String, version: i64) -> Self {
        Self {
            state_key: session_key(&session_id, "state"),
            version_key: session_key(&session_id, "version"),
            patch_key: session_key(&session_id, "patch"),
            lang_key: session_key(&session_id, "lang"),
            run_key: session_key(&session_id, "run"),
            session_id,
            language,
            version,
            store,
        }
    }

    /// Creates a fresh session: empty snapshot at version 1, default
    /// language, empty patch log. Fails if the session already exists.
    pub async fn create(
        store: Arc<dyn SessionStore>,
        session_id: &str,
        languages: &[String],
    ) -> Result<Self, InterviewError> {
        let language = languages.first().cloned().unwrap_or_default();
        let interview = Self::handle(store, session_id.to_string(), language, 1);

        if interview.store.exists(&interview.state_key).await? {
            return Err(InterviewError::AlreadyExists);
        }

        let state = CodeState {
            content: String::new(),
            version: 1,
        };
        let state_json = serde_json::to_string(&state).unwrap();
        interview
            .store
            .set(&interview.state_key, &state_json, SESSION_TTL)
            .await?;
        interview
            .store
            .set(&interview.version_key, "1", SESSION_TTL)
            .await?;
        interview
            .store
            .set(&interview.lang_key, &interview.language, SESSION_TTL)
            .await?;
        interview.store.delete(&interview.patch_key).await?;

        Ok(interview)
    }

    /// Loads an existing session. Fails with [`InterviewError::NotFound`]
    /// when the language or version key is missing (expired or never
    /// created).
    pub async fn load(
        store: Arc<dyn SessionStore>,
        session_id: &str,
    ) -> Result<Self, InterviewError> {
        let lang_key = session_key(session_id, "lang");
        let version_key = session_key(session_id, "version");

        let language = store
            .get(&lang_key)
            .await?
            .ok_or(InterviewError::NotFound)?;
        let version = store
            .get(&version_key)
            .await?
            .and_then(|v| v.parse::<i64>().ok())
            .ok_or(InterviewError::NotFound)?;

        Ok(Self::handle(store, session_id.to_string(), language, version))
    }

    /// Switches the session language; `new_lang` must be on the allow-list.
    pub async fn edit_language(
        &mut self,
        new_lang: &str,
        languages: &[String],
    ) -> Result<(), InterviewError> {
        if !languages.iter().any(|l| l == new_lang) {
            return Err(InterviewError::InvalidLanguage(new_lang.to_string()));
        }
        self.store.set(&self.lang_key, new_lang, SESSION_TTL).await?;
        self.language = new_lang.to_string();
        Ok(())
    }

    /// Per-session execution gate. Admits one run per cooldown window; the
    /// gate key expires on its own.
    pub async fn can_run(&self) -> Result<bool, InterviewError> {
        if self.store.exists(&self.run_key).await? {
            return Ok(false);
        }
        self.store.set(&self.run_key, "1", RUN_COOLDOWN).await?;
        Ok(true)
    }
}
