//! In-memory store implementation for tests and development mode.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{CacheError, CacheWrite, SessionStore, TxBody, TxDecision, TxOutcome};

enum Value {
    Str(String),
    List(VecDeque<String>),
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self) -> bool {
        matches!(self.expires_at, Some(at) if at <= Instant::now())
    }
}

/// Single-mutex map honouring TTLs via `Instant` deadlines. Transactions
/// run entirely under the lock, so `Conflict` cannot occur here.
pub struct MemoryStore {
    data: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            data: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn live<'a>(map: &'a mut HashMap<String, Entry>, key: &str) -> Option<&'a mut Entry> {
    if map.get(key).is_some_and(Entry::expired) {
        map.remove(key);
    }
    map.get_mut(key)
}

fn read_str(map: &mut HashMap<String, Entry>, key: &str) -> Option<String> {
    match live(map, key)? {
        Entry {
            value: Value::Str(s),
            ..
        } => Some(s.clone()),
        _ => None,
    }
}

fn apply_write(map: &mut HashMap<String, Entry>, write: CacheWrite) {
    match write {
        CacheWrite::SetEx { key, value, ttl } => {
            map.insert(
                key,
                Entry {
                    value: Value::Str(value),
                    expires_at: Some(Instant::now() + ttl),
                },
            );
        }
        CacheWrite::PushLeft { key, value } => match live(map, &key) {
            Some(Entry {
                value: Value::List(items),
                ..
            }) => items.push_front(value),
            _ => {
                map.insert(
                    key,
                    Entry {
                        value: Value::List(VecDeque::from([value])),
                        expires_at: None,
                    },
                );
            }
        },
        CacheWrite::Expire { key, ttl } => {
            if let Some(entry) = live(map, &key) {
                entry.expires_at = Some(Instant::now() + ttl);
            }
        }
        CacheWrite::Delete { key } => {
            map.remove(&key);
        }
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut map = self.data.lock().unwrap();
        apply_write(
            &mut map,
            CacheWrite::SetEx {
                key: key.to_string(),
                value: value.to_string(),
                ttl,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut map = self.data.lock().unwrap();
        Ok(read_str(&mut map, key))
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.data.lock().unwrap().remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let mut map = self.data.lock().unwrap();
        Ok(live(&mut map, key).is_some())
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, CacheError> {
        let mut map = self.data.lock().unwrap();
        Ok(live(&mut map, key)
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(Instant::now())))
    }

    async fn incr(&self, key: &str, ttl: Duration) -> Result<i64, CacheError> {
        let mut map = self.data.lock().unwrap();
        let current: i64 = read_str(&mut map, key)
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        let next = current + 1;
        let expires_at = match live(&mut map, key) {
            Some(entry) => entry.expires_at,
            None => Some(Instant::now() + ttl),
        };
        map.insert(
            key.to_string(),
            Entry {
                value: Value::Str(next.to_string()),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn push_left(&self, key: &str, value: &str) -> Result<(), CacheError> {
        let mut map = self.data.lock().unwrap();
        apply_write(
            &mut map,
            CacheWrite::PushLeft {
                key: key.to_string(),
                value: value.to_string(),
            },
        );
        Ok(())
    }

    async fn list_range(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, CacheError> {
        let mut map = self.data.lock().unwrap();
        let items = match live(&mut map, key) {
            Some(Entry {
                value: Value::List(items),
                ..
            }) => items,
            _ => return Ok(Vec::new()),
        };
        let len = items.len() as isize;
        let norm = |i: isize| if i < 0 { len + i } else { i };
        let lo = norm(start).max(0);
        let hi = norm(stop).min(len - 1);
        if lo > hi {
            return Ok(Vec::new());
        }
        Ok(items
            .iter()
            .skip(lo as usize)
            .take((hi - lo + 1) as usize)
            .cloned()
            .collect())
    }

    async fn transact(
        &self,
        watch_keys: &[&str],
        body: TxBody<'_>,
    ) -> Result<TxOutcome, CacheError> {
        let mut map = self.data.lock().unwrap();
        let current: Vec<Option<String>> = watch_keys
            .iter()
            .map(|k| read_str(&mut map, k))
            .collect();
        match body(&current) {
            TxDecision::Abort => Ok(TxOutcome::Aborted),
            TxDecision::Commit(writes) => {
                for write in writes {
                    apply_write(&mut map, write);
                }
                Ok(TxOutcome::Committed)
            }
        }
    }
}
