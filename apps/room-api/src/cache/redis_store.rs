//! Redis-backed store implementation.
//!
//! Plain operations go through short-lived multiplexed connections.
//! [`SessionStore::transact`] opens a dedicated connection per call so the
//! WATCH state is never shared: a nil EXEC reply means a watched key
//! changed and surfaces as [`TxOutcome::Conflict`].

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;

use super::{CacheError, CacheWrite, SessionStore, TxBody, TxDecision, TxOutcome};

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        CacheError::Backend(err.to_string())
    }
}

pub struct RedisStore {
    client: redis::Client,
}

impl RedisStore {
    /// Opens a client for `url` and verifies the server is reachable.
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)?;
        let mut conn = client.get_multiplexed_async_connection().await?;
        redis::cmd("PING").query_async::<()>(&mut conn).await?;
        Ok(Self { client })
    }

    async fn conn(&self) -> Result<MultiplexedConnection, CacheError> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }
}

fn queue_write(pipe: &mut redis::Pipeline, write: CacheWrite) {
    match write {
        CacheWrite::SetEx { key, value, ttl } => {
            pipe.set_ex(key, value, ttl.as_secs()).ignore();
        }
        CacheWrite::PushLeft { key, value } => {
            pipe.lpush(key, value).ignore();
        }
        CacheWrite::Expire { key, ttl } => {
            pipe.expire(key, ttl.as_secs() as i64).ignore();
        }
        CacheWrite::Delete { key } => {
            pipe.del(key).ignore();
        }
    }
}

#[async_trait]
impl SessionStore for RedisStore {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.conn().await?;
        conn.set_ex::<_, _, ()>(key, value, ttl.as_secs()).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn().await?;
        Ok(conn.get(key).await?)
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn().await?;
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn().await?;
        Ok(conn.exists(key).await?)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, CacheError> {
        let mut conn = self.conn().await?;
        let secs: i64 = conn.ttl(key).await?;
        // -2 = missing key, -1 = no expiry.
        Ok((secs >= 0).then(|| Duration::from_secs(secs as u64)))
    }

    async fn incr(&self, key: &str, ttl: Duration) -> Result<i64, CacheError> {
        let mut conn = self.conn().await?;
        let count: i64 = conn.incr(key, 1).await?;
        if count == 1 {
            conn.expire::<_, ()>(key, ttl.as_secs() as i64).await?;
        }
        Ok(count)
    }

    async fn push_left(&self, key: &str, value: &str) -> Result<(), CacheError> {
        let mut conn = self.conn().await?;
        conn.lpush::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn list_range(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, CacheError> {
        let mut conn = self.conn().await?;
        Ok(conn.lrange(key, start, stop).await?)
    }

    async fn transact(
        &self,
        watch_keys: &[&str],
        body: TxBody<'_>,
    ) -> Result<TxOutcome, CacheError> {
        // A fresh connection per transaction; multiplexed connections must
        // not share WATCH state.
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let mut watch = redis::cmd("WATCH");
        for key in watch_keys {
            watch.arg(*key);
        }
        watch.query_async::<()>(&mut conn).await?;

        let mut current = Vec::with_capacity(watch_keys.len());
        for key in watch_keys {
            let value: Option<String> = conn.get(*key).await?;
            current.push(value);
        }

        match body(&current) {
            TxDecision::Abort => {
                redis::cmd("UNWATCH").query_async::<()>(&mut conn).await?;
                Ok(TxOutcome::Aborted)
            }
            TxDecision::Commit(writes) => {
                let mut pipe = redis::pipe();
                pipe.atomic();
                for write in writes {
                    queue_write(&mut pipe, write);
                }
                // EXEC replies nil when a watched key was touched.
                let reply: Option<redis::Value> = pipe.query_async(&mut conn).await?;
                Ok(match reply {
                    Some(_) => TxOutcome::Committed,
                    None => TxOutcome::Conflict,
                })
            }
        }
    }
}
