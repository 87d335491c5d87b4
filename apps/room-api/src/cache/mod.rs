//! Abstraction over the shared key-value store that holds session state.
//!
//! Backed by Redis in production and an in-memory map in tests and
//! development. The trait lifts store primitives only — key naming and
//! session semantics live in [`crate::interview`].

use std::time::Duration;

use async_trait::async_trait;

mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(String),
}

/// A single write queued inside an optimistic transaction pipeline.
#[derive(Debug, Clone)]
pub enum CacheWrite {
    SetEx {
        key: String,
        value: String,
        ttl: Duration,
    },
    PushLeft {
        key: String,
        value: String,
    },
    Expire {
        key: String,
        ttl: Duration,
    },
    Delete {
        key: String,
    },
}

/// What a transaction body decided after inspecting the watched values.
pub enum TxDecision {
    /// Commit this write set atomically.
    Commit(Vec<CacheWrite>),
    /// Write nothing and release the watch.
    Abort,
}

/// How a transaction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOutcome {
    Committed,
    Aborted,
    /// A watched key changed before the commit landed. Retry the closure.
    Conflict,
}

/// Transaction body: receives the current values of the watched keys, in
/// order, and returns the write set (or aborts).
pub type TxBody<'a> = &'a mut (dyn FnMut(&[Option<String>]) -> TxDecision + Send);

/// Store primitives consumed by the session layer.
///
/// A missing key reads as `None`/absent, never as an error.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    async fn exists(&self, key: &str) -> Result<bool, CacheError>;

    /// Remaining time to live, or `None` when the key is missing or has
    /// no expiry.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, CacheError>;

    /// Atomically increments an integer key and returns the new value.
    /// The TTL is applied only when the counter is first created.
    async fn incr(&self, key: &str, ttl: Duration) -> Result<i64, CacheError>;

    /// Pushes a value onto the left end of a list.
    async fn push_left(&self, key: &str, value: &str) -> Result<(), CacheError>;

    /// Inclusive range read; `-1` addresses the last element, so
    /// `list_range(key, 0, -1)` returns the whole list.
    async fn list_range(&self, key: &str, start: isize, stop: isize)
        -> Result<Vec<String>, CacheError>;

    /// Runs `body` under an optimistic watch on `watch_keys`: the body sees
    /// the current values and returns a pipelined write set, which only
    /// commits if no watched key changed in the meantime. On
    /// [`TxOutcome::Conflict`] the caller retries the whole closure.
    async fn transact(
        &self,
        watch_keys: &[&str],
        body: TxBody<'_>,
    ) -> Result<TxOutcome, CacheError>;
}
