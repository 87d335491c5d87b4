//! The patch engine: optimistic append, snapshot compaction, and
//! deterministic buffer reconstruction.
//!
//! Positions are Unicode code-point indices, not byte offsets, so edits
//! stay stable across multi-byte glyphs. The patch list is left-pushed in
//! the store; reading `0..-1` and reversing yields chronological order.

use serde::{Deserialize, Serialize};

use crate::cache::{CacheWrite, TxDecision, TxOutcome};

use super::{Interview, InterviewError, SESSION_TTL};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchOp {
    Add,
    Remove,
    Replace,
}

/// One authoring operation. `version` names the base version the author
/// saw when composing; the server restamps it with the assigned version
/// on commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodePatch {
    #[serde(default)]
    pub version: i64,
    pub op: PatchOp,
    pub start_pos: i64,
    #[serde(default)]
    pub end_pos: i64,
    #[serde(default)]
    pub content: String,
}

/// The authoritative buffer at a given version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeState {
    pub content: String,
    pub version: i64,
}

/// Result of a well-formed append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Committed; carries the server-assigned version.
    Committed(i64),
    /// The patch was based on a stale version; nothing was written.
    VersionMismatch,
}

/// Applies one patch to a code-point buffer. Positions that fell out of
/// range since the patch's base version are clamped; this never errors.
pub fn apply_patch(code: Vec<char>, patch: &CodePatch) -> Vec<char> {
    let len = code.len() as i64;
    let mut code = code;

    match patch.op {
        PatchOp::Add => {
            let start = patch.start_pos.clamp(0, len) as usize;
            code.splice(start..start, patch.content.chars());
            code
        }
        PatchOp::Remove => {
            if patch.start_pos < 0 || patch.start_pos >= len {
                return code;
            }
            let end = patch.end_pos.min(len);
            if end <= patch.start_pos {
                return code;
            }
            code.drain(patch.start_pos as usize..end as usize);
            code
        }
        PatchOp::Replace => {
            if patch.start_pos < 0 || patch.start_pos >= len {
                return code;
            }
            let end = patch.end_pos.min(len);
            if end < patch.start_pos {
                return code;
            }
            code.splice(
                patch.start_pos as usize..end as usize,
                patch.content.chars(),
            );
            code
        }
    }
}

fn decode_patches(raw: &[String]) -> Vec<CodePatch> {
    // Left-pushed list: newest first. Reverse into chronological order,
    // skipping anything that fails to decode.
    let mut patches: Vec<CodePatch> = raw
        .iter()
        .filter_map(|s| serde_json::from_str(s).ok())
        .collect();
    patches.reverse();
    patches
}

impl Interview {
    /// Appends one patch with optimistic concurrency on the version key.
    ///
    /// The closure reads the committed version, rejects stale bases, and
    /// pipelines the version bump with the patch push; if another writer
    /// races the commit, the whole closure retries.
    pub async fn append_patch(
        &mut self,
        patch: &CodePatch,
    ) -> Result<AppendOutcome, InterviewError> {
        if patch.start_pos < 0 || (patch.op != PatchOp::Add && patch.end_pos <= patch.start_pos) {
            return Err(InterviewError::InvalidPatch);
        }

        let store = self.store.clone();
        let version_key = self.version_key.clone();
        let patch_key = self.patch_key.clone();

        loop {
            let mut assigned = None;
            let mut body = |values: &[Option<String>]| {
                let current: i64 = values[0]
                    .as_deref()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0);

                if patch.version != 0 && patch.version - 1 != current {
                    return TxDecision::Abort;
                }

                let mut stamped = patch.clone();
                stamped.version = current + 1;
                assigned = Some(stamped.version);

                TxDecision::Commit(vec![
                    CacheWrite::SetEx {
                        key: version_key.clone(),
                        value: stamped.version.to_string(),
                        ttl: SESSION_TTL,
                    },
                    CacheWrite::PushLeft {
                        key: patch_key.clone(),
                        value: serde_json::to_string(&stamped).unwrap(),
                    },
                    CacheWrite::Expire {
                        key: patch_key.clone(),
                        ttl: SESSION_TTL,
                    },
                ])
            };

            match store.transact(&[version_key.as_str()], &mut body).await? {
                TxOutcome::Conflict => continue,
                TxOutcome::Aborted => return Ok(AppendOutcome::VersionMismatch),
                TxOutcome::Committed => {
                    let version = assigned.unwrap_or(self.version + 1);
                    self.version = version;
                    return Ok(AppendOutcome::Committed(version));
                }
            }
        }
    }

    /// Reconstructs the current buffer: snapshot content with the patch
    /// log folded in chronologically.
    pub async fn rebuild(&self) -> Result<String, InterviewError> {
        let state_json = self
            .store
            .get(&self.state_key)
            .await?
            .ok_or(InterviewError::NotFound)?;
        let state: CodeState =
            serde_json::from_str(&state_json).map_err(|_| InterviewError::NotFound)?;

        let raw = self.store.list_range(&self.patch_key, 0, -1).await?;
        if raw.is_empty() {
            return Ok(state.content);
        }

        let mut code: Vec<char> = state.content.chars().collect();
        for patch in decode_patches(&raw) {
            code = apply_patch(code, &patch);
        }
        Ok(code.into_iter().collect())
    }

    /// Folds the patch log into a new snapshot at the current version and
    /// clears the log. Idempotent; returns the rebuilt buffer. Nothing is
    /// written when the snapshot cannot be read.
    pub async fn compact(&mut self) -> Result<String, InterviewError> {
        let code = self.rebuild().await?;

        let state = CodeState {
            content: code.clone(),
            version: self.version,
        };
        let state_json = serde_json::to_string(&state).unwrap();
        self.store
            .set(&self.state_key, &state_json, SESSION_TTL)
            .await?;
        self.store.delete(&self.patch_key).await?;

        Ok(code)
    }

    /// Returns the snapshot content, the residual patches above it in
    /// chronological order, and the engine's version. When the snapshot is
    /// current the residual list is empty and clients need no local folds.
    pub async fn get_current_code(
        &self,
    ) -> Result<(String, Vec<CodePatch>, i64), InterviewError> {
        let state_json = self
            .store
            .get(&self.state_key)
            .await?
            .ok_or(InterviewError::NotFound)?;
        let state: CodeState =
            serde_json::from_str(&state_json).map_err(|_| InterviewError::NotFound)?;

        if state.version == self.version {
            return Ok((state.content, Vec::new(), state.version));
        }

        let raw = self.store.list_range(&self.patch_key, 0, -1).await?;
        Ok((state.content, decode_patches(&raw), self.version))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::cache::{MemoryStore, SessionStore};

    use super::super::*;
    use super::*;

    fn chars(s: &str) -> Vec<char> {
        s.chars().collect()
    }

    fn text(code: Vec<char>) -> String {
        code.into_iter().collect()
    }

    fn add(start: i64, content: &str) -> CodePatch {
        CodePatch {
            version: 0,
            op: PatchOp::Add,
            start_pos: start,
            end_pos: 0,
            content: content.to_string(),
        }
    }

    fn remove(start: i64, end: i64) -> CodePatch {
        CodePatch {
            version: 0,
            op: PatchOp::Remove,
            start_pos: start,
            end_pos: end,
            content: String::new(),
        }
    }

    fn replace(start: i64, end: i64, content: &str) -> CodePatch {
        CodePatch {
            version: 0,
            op: PatchOp::Replace,
            start_pos: start,
            end_pos: end,
            content: content.to_string(),
        }
    }

    fn langs() -> Vec<String> {
        vec!["python".to_string(), "go".to_string()]
    }

    #[test]
    fn add_splices_at_position() {
        assert_eq!(text(apply_patch(chars("abc"), &add(0, "x"))), "xabc");
        assert_eq!(text(apply_patch(chars("abc"), &add(1, "x"))), "axbc");
        assert_eq!(text(apply_patch(chars("abc"), &add(3, "x"))), "abcx");
    }

    #[test]
    fn add_clamps_out_of_range_positions() {
        assert_eq!(text(apply_patch(chars("abc"), &add(-5, "x"))), "xabc");
        assert_eq!(text(apply_patch(chars("abc"), &add(99, "x"))), "abcx");
    }

    #[test]
    fn remove_deletes_range() {
        assert_eq!(text(apply_patch(chars("abcde"), &remove(1, 3))), "ade");
        assert_eq!(text(apply_patch(chars("abcde"), &remove(0, 5))), "");
    }

    #[test]
    fn remove_out_of_range_is_unchanged() {
        assert_eq!(text(apply_patch(chars("abc"), &remove(-1, 2))), "abc");
        assert_eq!(text(apply_patch(chars("abc"), &remove(3, 4))), "abc");
        assert_eq!(text(apply_patch(chars("abc"), &remove(2, 2))), "abc");
        // End past the buffer is clamped.
        assert_eq!(text(apply_patch(chars("abc"), &remove(1, 99))), "a");
    }

    #[test]
    fn replace_swaps_range() {
        assert_eq!(text(apply_patch(chars("abc"), &replace(1, 2, "XY"))), "aXYc");
        assert_eq!(text(apply_patch(chars("abc"), &replace(0, 99, "z"))), "z");
        // Zero-width replace inserts.
        assert_eq!(text(apply_patch(chars("abc"), &replace(1, 1, "x"))), "axbc");
    }

    #[test]
    fn apply_never_panics_on_extreme_positions() {
        for patch in [
            add(i64::MAX, "x"),
            add(i64::MIN, "x"),
            remove(i64::MIN, i64::MAX),
            remove(i64::MAX, i64::MIN),
            replace(i64::MIN, i64::MAX, "x"),
            replace(i64::MAX, i64::MIN, "x"),
        ] {
            let _ = apply_patch(chars("abc"), &patch);
        }
    }

    #[test]
    fn positions_are_code_points_not_bytes() {
        // "héllo" is 5 code points but 6 bytes; position 2 must land
        // between the é and the first l.
        let out = text(apply_patch(chars("héllo"), &add(2, "🚀")));
        assert_eq!(out, "hé🚀llo");
    }

    #[tokio::test]
    async fn create_then_duplicate_create_fails() {
        let store = Arc::new(MemoryStore::new());
        let interview = Interview::create(store.clone(), "s1", &langs()).await.unwrap();
        assert_eq!(interview.version, 1);
        assert_eq!(interview.language, "python");

        let err = Interview::create(store, "s1", &langs()).await.unwrap_err();
        assert!(matches!(err, InterviewError::AlreadyExists));
    }

    #[tokio::test]
    async fn load_missing_session_fails() {
        let store = Arc::new(MemoryStore::new());
        let err = Interview::load(store, "nope").await.unwrap_err();
        assert!(matches!(err, InterviewError::NotFound));
    }

    #[tokio::test]
    async fn load_roundtrips_created_session() {
        let store = Arc::new(MemoryStore::new());
        Interview::create(store.clone(), "s1", &langs()).await.unwrap();
        let loaded = Interview::load(store, "s1").await.unwrap();
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.language, "python");
    }

    #[tokio::test]
    async fn append_assigns_strictly_increasing_versions() {
        let store = Arc::new(MemoryStore::new());
        let mut interview = Interview::create(store, "s1", &langs()).await.unwrap();

        let mut last = 1;
        for i in 0..5 {
            let outcome = interview
                .append_patch(&add(i, "x"))
                .await
                .unwrap();
            match outcome {
                AppendOutcome::Committed(v) => {
                    assert!(v > last);
                    last = v;
                }
                AppendOutcome::VersionMismatch => panic!("unexpected mismatch"),
            }
        }
        assert_eq!(last, 6);
    }

    #[tokio::test]
    async fn append_rejects_stale_base_version() {
        let store = Arc::new(MemoryStore::new());
        let mut interview = Interview::create(store, "s1", &langs()).await.unwrap();

        let mut winner = add(0, "hi");
        winner.version = 2; // based on version 1
        assert_eq!(
            interview.append_patch(&winner).await.unwrap(),
            AppendOutcome::Committed(2)
        );

        // Same base version raced by a second writer: exactly one wins.
        let mut loser = remove(0, 1);
        loser.version = 2;
        assert_eq!(
            interview.append_patch(&loser).await.unwrap(),
            AppendOutcome::VersionMismatch
        );
        assert_eq!(interview.version, 2);
    }

    #[tokio::test]
    async fn append_validates_positions() {
        let store = Arc::new(MemoryStore::new());
        let mut interview = Interview::create(store, "s1", &langs()).await.unwrap();

        let err = interview.append_patch(&add(-1, "x")).await.unwrap_err();
        assert!(matches!(err, InterviewError::InvalidPatch));

        let err = interview.append_patch(&remove(3, 3)).await.unwrap_err();
        assert!(matches!(err, InterviewError::InvalidPatch));

        let err = interview.append_patch(&replace(3, 1, "x")).await.unwrap_err();
        assert!(matches!(err, InterviewError::InvalidPatch));
    }

    #[tokio::test]
    async fn rebuild_folds_patches_chronologically() {
        let store = Arc::new(MemoryStore::new());
        let mut interview = Interview::create(store, "s1", &langs()).await.unwrap();

        interview.append_patch(&add(0, "hello")).await.unwrap();
        interview.append_patch(&add(5, " world")).await.unwrap();
        interview.append_patch(&replace(0, 1, "H")).await.unwrap();
        interview.append_patch(&remove(5, 11)).await.unwrap();

        assert_eq!(interview.rebuild().await.unwrap(), "Hello");
        // Deterministic: a second rebuild sees the same buffer.
        assert_eq!(interview.rebuild().await.unwrap(), "Hello");
    }

    #[tokio::test]
    async fn get_current_code_returns_residual_patches() {
        let store = Arc::new(MemoryStore::new());
        let mut interview = Interview::create(store, "s1", &langs()).await.unwrap();

        interview.append_patch(&add(0, "hi")).await.unwrap();

        let (content, patches, version) = interview.get_current_code().await.unwrap();
        assert_eq!(content, "");
        assert_eq!(version, 2);
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].version, 2);
        assert_eq!(patches[0].content, "hi");
    }

    #[tokio::test]
    async fn compact_snapshots_and_clears_patch_log() {
        let store = Arc::new(MemoryStore::new());
        let mut interview = Interview::create(store, "s1", &langs()).await.unwrap();

        interview.append_patch(&add(0, "abc")).await.unwrap();
        interview.append_patch(&add(3, "def")).await.unwrap();

        let code = interview.compact().await.unwrap();
        assert_eq!(code, "abcdef");

        // Snapshot is now authoritative: no residual patches.
        let (content, patches, version) = interview.get_current_code().await.unwrap();
        assert_eq!(content, "abcdef");
        assert!(patches.is_empty());
        assert_eq!(version, 3);

        // Idempotent.
        assert_eq!(interview.compact().await.unwrap(), "abcdef");
    }

    #[tokio::test]
    async fn edit_language_enforces_allow_list() {
        let store = Arc::new(MemoryStore::new());
        let mut interview = Interview::create(store, "s1", &langs()).await.unwrap();

        let err = interview.edit_language("ruby", &langs()).await.unwrap_err();
        assert!(matches!(err, InterviewError::InvalidLanguage(_)));
        assert_eq!(interview.language, "python");

        interview.edit_language("go", &langs()).await.unwrap();
        assert_eq!(interview.language, "go");
    }

    #[tokio::test]
    async fn run_gate_admits_once_per_cooldown() {
        let store = Arc::new(MemoryStore::new());
        let interview = Interview::create(store, "s1", &langs()).await.unwrap();

        assert!(interview.can_run().await.unwrap());
        assert!(!interview.can_run().await.unwrap());
    }

    #[tokio::test]
    async fn undecodable_patch_entries_are_skipped() {
        let store = Arc::new(MemoryStore::new());
        let mut interview = Interview::create(store.clone(), "s1", &langs()).await.unwrap();
        interview.append_patch(&add(0, "ok")).await.unwrap();

        store.push_left("session:s1:patch", "not json").await.unwrap();

        assert_eq!(interview.rebuild().await.unwrap(), "ok");
    }
}
