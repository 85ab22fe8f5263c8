//! Counter operations - the state-changing heart of the service
//!
//! Each operation is a thin orchestration over the validated name (C1), the
//! store (C2), and the fan-out engine (C3): mutate or read the store, then
//! publish the new value to subscribers when it changed. TTL refreshes are
//! fired asynchronously; the response never waits for them.

use std::sync::Arc;
use std::time::Duration;

use abacus_core::{CounterError, CounterName};
use rand::Rng;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::config::BASE_TTL;
use crate::engine::Engine;
use crate::store::{Store, TTL_MISSING};

/// Alphabet for randomly generated namespaces and keys
const RANDOM_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_";

/// Length of randomly generated name segments
const RANDOM_NAME_LEN: usize = 16;

/// Response body for a successful `create`
#[derive(Debug, Serialize)]
pub struct CreatedCounter {
    /// Key segment the counter was created under
    pub key: String,
    /// Namespace segment
    pub namespace: String,
    /// Freshly minted admin token; shown exactly once
    pub admin_key: String,
    /// Initial value
    pub value: i64,
}

/// Response body for `info`
#[derive(Debug, Serialize)]
pub struct CounterInfo {
    /// Current value, `-1` when the counter does not exist
    pub value: i64,
    /// Canonical store identifier
    pub full_key: String,
    /// True when the counter has no admin token (it materialised via `hit`)
    pub is_genuine: bool,
    /// Remaining TTL in seconds; negative per store TTL conventions
    pub expires_in: i64,
    /// Whether the counter exists at all
    pub exists: bool,
}

/// The public operation set over counters
pub struct Counters {
    store: Arc<dyn Store>,
    engine: Arc<Engine>,
    ttl: Duration,
}

impl Counters {
    /// Build the operations façade
    pub fn new(store: Arc<dyn Store>, engine: Arc<Engine>) -> Self {
        Self {
            store,
            engine,
            ttl: BASE_TTL,
        }
    }

    /// Create a counter, minting its admin token.
    ///
    /// Fails with [`CounterError::AlreadyExists`] when the key is taken. The
    /// initial value is published so early subscribers see a baseline.
    pub async fn create(
        &self,
        name: &CounterName,
        initial_value: i64,
    ) -> Result<CreatedCounter, CounterError> {
        let data_id = name.data_id();
        let created = self
            .store
            .set_if_absent(&data_id, initial_value, self.ttl)
            .await?;
        if !created {
            return Err(CounterError::AlreadyExists);
        }

        let admin_key = Uuid::new_v4().to_string();
        // Best effort pairing: if this write fails the counter stays usable,
        // it is merely genuine (no admin ops) until reaped.
        self.store.put(&name.admin_id(), &admin_key).await?;

        debug!(counter = %name, value = initial_value, "counter created");
        self.engine.publish(&data_id, initial_value);
        Ok(CreatedCounter {
            key: name.key().to_owned(),
            namespace: name.namespace().to_owned(),
            admin_key,
            value: initial_value,
        })
    }

    /// Create a counter under two randomly generated 16-char names
    pub async fn create_random(&self) -> Result<CreatedCounter, CounterError> {
        let namespace = random_name();
        let key = random_name();
        let name = CounterName::from_parts(&namespace, &key)?;
        self.create(&name, 0).await
    }

    /// Atomically increment, refresh the TTL, and publish the new value
    pub async fn hit(&self, name: &CounterName) -> Result<i64, CounterError> {
        let data_id = name.data_id();
        let value = self.store.incr(&data_id).await?;
        self.refresh_ttl(data_id.clone());
        self.engine.publish(&data_id, value);
        Ok(value)
    }

    /// Read the current value, refreshing the TTL
    pub async fn get(&self, name: &CounterName) -> Result<i64, CounterError> {
        let data_id = name.data_id();
        let raw = self
            .store
            .get(&data_id)
            .await?
            .ok_or(CounterError::NotFound)?;
        let value = parse_value(&raw)?;
        self.refresh_ttl(data_id);
        Ok(value)
    }

    /// Overwrite the value; 409 when the counter does not exist
    pub async fn set(&self, name: &CounterName, value: i64) -> Result<i64, CounterError> {
        let data_id = name.data_id();
        let updated = self.store.set_if_present(&data_id, value, self.ttl).await?;
        if !updated {
            return Err(CounterError::MissingForOp);
        }
        self.engine.publish(&data_id, value);
        Ok(value)
    }

    /// Reset the value to zero; 409 when the counter does not exist
    pub async fn reset(&self, name: &CounterName) -> Result<i64, CounterError> {
        self.set(name, 0).await
    }

    /// Atomically add a non-zero delta; 409 when the counter does not exist
    pub async fn update_by(&self, name: &CounterName, delta: i64) -> Result<i64, CounterError> {
        if delta == 0 {
            return Err(CounterError::Validation(
                "changing value by 0 does nothing, please provide a non-zero value \
                 in the fmt of ?value=NEW_VALUE"
                    .to_owned(),
            ));
        }
        let data_id = name.data_id();
        if !self.store.exists(&data_id).await? {
            return Err(CounterError::MissingForUpdate);
        }
        let value = self.store.incr_by(&data_id, delta).await?;
        self.engine.publish(&data_id, value);
        Ok(value)
    }

    /// Delete the counter and its admin token, detaching subscribers.
    ///
    /// Best-effort double delete: a failure removing `A:` after `K:` leaves
    /// an orphan token that an out-of-band sweep reaps.
    pub async fn delete(&self, name: &CounterName) -> Result<String, CounterError> {
        let data_id = name.data_id();
        self.store.del(&data_id).await?;
        self.store.del(&name.admin_id()).await?;
        self.engine.close_counter(&data_id).await;
        debug!(counter = %name, "counter deleted");
        Ok(data_id)
    }

    /// Metadata: value (or -1), TTL, existence, genuineness
    pub async fn info(&self, name: &CounterName) -> Result<CounterInfo, CounterError> {
        let data_id = name.data_id();
        let expires_in = self.store.ttl(&data_id).await?;
        let exists = expires_in != TTL_MISSING;
        let value = if exists {
            self.store
                .get(&data_id)
                .await?
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(0)
        } else {
            -1
        };
        let is_genuine = !self.store.exists(&name.admin_id()).await?;
        Ok(CounterInfo {
            value,
            full_key: data_id,
            is_genuine,
            expires_in,
            exists,
        })
    }

    /// Check a bearer token against the counter's stored admin token.
    ///
    /// Genuine counters (no admin token) answer 400 with an explanatory
    /// message, distinct from the 401 a wrong token earns.
    pub async fn authorize(&self, name: &CounterName, token: &str) -> Result<(), CounterError> {
        let admin_key = self
            .store
            .get(&name.admin_id())
            .await?
            .ok_or(CounterError::Genuine)?;
        if admin_key != token {
            return Err(CounterError::InvalidToken);
        }
        Ok(())
    }

    /// Current value straight from the store, for the stream baseline frame
    pub async fn peek(&self, data_id: &str) -> Option<i64> {
        self.store
            .get(data_id)
            .await
            .ok()
            .flatten()
            .and_then(|raw| raw.parse().ok())
    }

    fn refresh_ttl(&self, data_id: String) {
        let store = Arc::clone(&self.store);
        let ttl = self.ttl;
        tokio::spawn(async move {
            if let Err(err) = store.expire(&data_id, ttl).await {
                debug!(error = %err, id = %data_id, "ttl refresh failed");
            }
        });
    }
}

fn parse_value(raw: &str) -> Result<i64, CounterError> {
    raw.parse()
        .map_err(|_| CounterError::Store(format!("non-numeric counter value: {raw}")))
}

/// Generate a random name segment from the URL-safe alphabet using the
/// thread-local CSPRNG.
pub fn random_name() -> String {
    let mut rng = rand::rng();
    (0..RANDOM_NAME_LEN)
        .map(|_| RANDOM_CHARSET[rng.random_range(0..RANDOM_CHARSET.len())] as char)
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::store::MemoryStore;

    fn name(ns: &str, key: &str) -> CounterName {
        CounterName::from_parts(ns, key).unwrap()
    }

    fn counters() -> (Counters, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let engine = Engine::start(EngineConfig::default());
        (
            Counters::new(Arc::clone(&store) as Arc<dyn Store>, engine),
            store,
        )
    }

    // ========================================================================
    // Create
    // ========================================================================

    #[tokio::test]
    async fn create_mints_an_admin_token() {
        let (ops, store) = counters();
        let created = ops.create(&name("test", "counter"), 0).await.unwrap();

        assert_eq!(created.namespace, "test");
        assert_eq!(created.key, "counter");
        assert_eq!(created.value, 0);
        assert_eq!(
            store.get("A:test:counter").await.unwrap().as_deref(),
            Some(created.admin_key.as_str())
        );
    }

    #[tokio::test]
    async fn create_twice_conflicts() {
        let (ops, _) = counters();
        let n = name("test", "counter");
        ops.create(&n, 5).await.unwrap();
        assert!(matches!(
            ops.create(&n, 9).await,
            Err(CounterError::AlreadyExists)
        ));
        // The original value survives the conflicting attempt.
        assert_eq!(ops.get(&n).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn create_random_yields_valid_names() {
        let (ops, _) = counters();
        let created = ops.create_random().await.unwrap();
        assert_eq!(created.namespace.len(), 16);
        assert_eq!(created.key.len(), 16);
        assert!(CounterName::from_parts(&created.namespace, &created.key).is_ok());
    }

    // ========================================================================
    // Laws: create/hit/get/set/reset/update_by round trips
    // ========================================================================

    #[tokio::test]
    async fn create_then_get_returns_initializer() {
        let (ops, _) = counters();
        let n = name("law", "one");
        ops.create(&n, 42).await.unwrap();
        assert_eq!(ops.get(&n).await.unwrap(), 42);
    }

    #[tokio::test]
    async fn hits_accumulate() {
        let (ops, _) = counters();
        let n = name("law", "two");
        ops.create(&n, 0).await.unwrap();
        for _ in 0..6 {
            ops.hit(&n).await.unwrap();
        }
        assert_eq!(ops.get(&n).await.unwrap(), 6);
    }

    #[tokio::test]
    async fn set_then_reset_zeroes() {
        let (ops, _) = counters();
        let n = name("law", "three");
        ops.create(&n, 0).await.unwrap();
        assert_eq!(ops.set(&n, 42).await.unwrap(), 42);
        assert_eq!(ops.reset(&n).await.unwrap(), 0);
        assert_eq!(ops.get(&n).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn update_by_round_trips() {
        let (ops, _) = counters();
        let n = name("law", "four");
        ops.create(&n, 10).await.unwrap();
        ops.update_by(&n, 7).await.unwrap();
        ops.update_by(&n, -7).await.unwrap();
        assert_eq!(ops.get(&n).await.unwrap(), 10);
    }

    // ========================================================================
    // Preconditions and failure modes
    // ========================================================================

    #[tokio::test]
    async fn hit_materialises_a_genuine_counter() {
        let (ops, _) = counters();
        let n = name("test", "organic");
        assert_eq!(ops.hit(&n).await.unwrap(), 1);

        let info = ops.info(&n).await.unwrap();
        assert!(info.exists);
        assert!(info.is_genuine, "hit-created counters carry no admin token");
        assert!(matches!(
            ops.authorize(&n, "anything").await,
            Err(CounterError::Genuine)
        ));
    }

    #[tokio::test]
    async fn hit_rejects_overflow() {
        let (ops, store) = counters();
        store
            .put("K:test:maxed", &i64::MAX.to_string())
            .await
            .unwrap();
        assert!(matches!(
            ops.hit(&name("test", "maxed")).await,
            Err(CounterError::Overflow)
        ));
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let (ops, _) = counters();
        assert!(matches!(
            ops.get(&name("test", "ghost")).await,
            Err(CounterError::NotFound)
        ));
    }

    #[tokio::test]
    async fn set_and_reset_require_existence() {
        let (ops, _) = counters();
        let n = name("test", "ghost");
        assert!(matches!(
            ops.set(&n, 1).await,
            Err(CounterError::MissingForOp)
        ));
        assert!(matches!(
            ops.reset(&n).await,
            Err(CounterError::MissingForOp)
        ));
    }

    #[tokio::test]
    async fn update_by_rejects_zero_and_missing() {
        let (ops, _) = counters();
        let n = name("test", "ghost");
        assert!(matches!(
            ops.update_by(&n, 0).await,
            Err(CounterError::Validation(_))
        ));
        assert!(matches!(
            ops.update_by(&n, 3).await,
            Err(CounterError::MissingForUpdate)
        ));
    }

    // ========================================================================
    // Ownership
    // ========================================================================

    #[tokio::test]
    async fn authorize_accepts_only_the_minted_token() {
        let (ops, _) = counters();
        let n = name("test", "owned");
        let created = ops.create(&n, 0).await.unwrap();

        ops.authorize(&n, &created.admin_key).await.unwrap();
        assert!(matches!(
            ops.authorize(&n, "wrong-token").await,
            Err(CounterError::InvalidToken)
        ));
    }

    #[tokio::test]
    async fn delete_removes_value_and_token() {
        let (ops, store) = counters();
        let n = name("test", "doomed");
        ops.create(&n, 3).await.unwrap();

        ops.delete(&n).await.unwrap();

        assert!(matches!(
            ops.get(&n).await,
            Err(CounterError::NotFound)
        ));
        assert_eq!(store.get("A:test:doomed").await.unwrap(), None);

        let info = ops.info(&n).await.unwrap();
        assert_eq!(info.value, -1);
        assert!(!info.exists);
        assert!(info.is_genuine);
    }

    // ========================================================================
    // TTL refresh
    // ========================================================================

    #[tokio::test]
    async fn touches_slide_the_ttl() {
        let (ops, store) = counters();
        let n = name("test", "sliding");
        ops.create(&n, 0).await.unwrap();

        ops.hit(&n).await.unwrap();
        // The refresh is spawned; give it a beat.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let ttl = store.ttl("K:test:sliding").await.unwrap();
        let base = BASE_TTL.as_secs() as i64;
        assert!(ttl > base - 5, "ttl {ttl} should be close to {base}");
    }

    #[tokio::test]
    async fn random_names_match_the_alphabet() {
        for _ in 0..20 {
            let n = random_name();
            assert_eq!(n.len(), RANDOM_NAME_LEN);
            assert!(n.bytes().all(|b| RANDOM_CHARSET.contains(&b)));
        }
    }
}
