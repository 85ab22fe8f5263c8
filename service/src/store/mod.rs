//! Store adapter - typed operations over the external key-value store
//!
//! The service never speaks raw store commands outside this module. The
//! [`Store`] trait is the contract counter operations are written against;
//! [`RedisStore`] is the production implementation and [`MemoryStore`] backs
//! `TESTING=true` runs and the test suite.
//!
//! Missing keys are ordinary results (`Option` / `bool`), never errors;
//! [`StoreError`] is reserved for overflow and infrastructure failure so the
//! caller can map the two to different status codes.

mod memory;
mod redis;

pub use memory::MemoryStore;
pub use redis::RedisStore;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// TTL answer for a key that does not exist (Redis convention)
pub const TTL_MISSING: i64 = -2;
/// TTL answer for a key that exists without an expiry (Redis convention)
pub const TTL_NO_EXPIRY: i64 = -1;

/// Errors from store operations
#[derive(Debug, Error)]
pub enum StoreError {
    /// The increment would overflow the signed 64-bit value
    #[error("increment would overflow")]
    Overflow,

    /// The store is unreachable or returned a protocol-level failure
    #[error("store backend error: {0}")]
    Backend(String),
}

impl From<StoreError> for abacus_core::CounterError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Overflow => abacus_core::CounterError::Overflow,
            StoreError::Backend(msg) => abacus_core::CounterError::Store(msg),
        }
    }
}

/// Typed operations over the external key-value store
///
/// All counter math relies on the store's atomic primitives; this process
/// never read-modify-writes a counter value.
#[async_trait]
pub trait Store: Send + Sync {
    /// Atomically add one, returning the new value
    async fn incr(&self, id: &str) -> Result<i64, StoreError>;

    /// Atomically add a signed delta, returning the new value
    async fn incr_by(&self, id: &str, delta: i64) -> Result<i64, StoreError>;

    /// Create the key only if absent; true when the key was created
    async fn set_if_absent(&self, id: &str, value: i64, ttl: Duration)
        -> Result<bool, StoreError>;

    /// Update the key only if present, resetting its TTL; true when updated
    async fn set_if_present(
        &self,
        id: &str,
        value: i64,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Unconditionally set a string value with no expiry (admin tokens)
    async fn put(&self, id: &str, value: &str) -> Result<(), StoreError>;

    /// Read a value; `None` when the key is missing
    async fn get(&self, id: &str) -> Result<Option<String>, StoreError>;

    /// Idempotent delete
    async fn del(&self, id: &str) -> Result<(), StoreError>;

    /// Key membership
    async fn exists(&self, id: &str) -> Result<bool, StoreError>;

    /// Remaining lifetime in whole seconds; [`TTL_MISSING`] when the key is
    /// absent, [`TTL_NO_EXPIRY`] when it never expires
    async fn ttl(&self, id: &str) -> Result<i64, StoreError>;

    /// Reset the TTL without touching the value
    async fn expire(&self, id: &str, ttl: Duration) -> Result<(), StoreError>;

    /// One pipelined batch of stats increments: `stats:Total` plus one
    /// `stats:<path>` per entry
    async fn bump_stats(&self, total: i64, paths: &[(String, i64)]) -> Result<(), StoreError>;

    /// Opaque server-info string, section-formatted as Redis `INFO` output
    async fn info(&self) -> Result<String, StoreError>;
}
