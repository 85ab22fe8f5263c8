//! Redis-backed store
//!
//! Thin mapping from the [`Store`] contract onto Redis commands over a
//! multiplexed [`ConnectionManager`]. The manager reconnects on its own;
//! individual command failures surface as [`StoreError::Backend`].

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::info;

use super::{Store, StoreError};
use crate::config::RedisConfig;

/// Production store over a Redis-compatible server
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connect to the configured server
    pub async fn connect(config: &RedisConfig) -> Result<Self, StoreError> {
        info!(host = %config.host, port = config.port, db = config.db, "connecting to redis");
        let client = redis::Client::open(config.url()).map_err(backend)?;
        let conn = ConnectionManager::new(client).await.map_err(backend)?;
        Ok(Self { conn })
    }
}

fn backend(err: redis::RedisError) -> StoreError {
    StoreError::Backend(err.to_string())
}

/// INCR/INCRBY past `i64::MAX` fails server-side; surface it as overflow so
/// the operation layer can answer 400 instead of 500.
fn increment_error(err: redis::RedisError) -> StoreError {
    if err.to_string().contains("increment or decrement would overflow") {
        StoreError::Overflow
    } else {
        backend(err)
    }
}

fn ttl_seconds(ttl: Duration) -> i64 {
    ttl.as_secs().min(i64::MAX as u64) as i64
}

#[async_trait]
impl Store for RedisStore {
    async fn incr(&self, id: &str) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        conn.incr(id, 1).await.map_err(increment_error)
    }

    async fn incr_by(&self, id: &str, delta: i64) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        conn.incr(id, delta).await.map_err(increment_error)
    }

    async fn set_if_absent(
        &self,
        id: &str,
        value: i64,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(id)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_seconds(ttl))
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(reply.is_some())
    }

    async fn set_if_present(
        &self,
        id: &str,
        value: i64,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(id)
            .arg(value)
            .arg("XX")
            .arg("EX")
            .arg(ttl_seconds(ttl))
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(reply.is_some())
    }

    async fn put(&self, id: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.set(id, value).await.map_err(backend)
    }

    async fn get(&self, id: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        conn.get(id).await.map_err(backend)
    }

    async fn del(&self, id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.del(id).await.map_err(backend)
    }

    async fn exists(&self, id: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        conn.exists(id).await.map_err(backend)
    }

    async fn ttl(&self, id: &str) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        conn.ttl(id).await.map_err(backend)
    }

    async fn expire(&self, id: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.expire(id, ttl_seconds(ttl)).await.map_err(backend)
    }

    async fn bump_stats(&self, total: i64, paths: &[(String, i64)]) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.cmd("INCRBY").arg("stats:Total").arg(total).ignore();
        for (path, count) in paths {
            pipe.cmd("INCRBY")
                .arg(format!("stats:{path}"))
                .arg(*count)
                .ignore();
        }
        pipe.query_async::<()>(&mut conn).await.map_err(backend)
    }

    async fn info(&self) -> Result<String, StoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("INFO")
            .query_async(&mut conn)
            .await
            .map_err(backend)
    }
}
