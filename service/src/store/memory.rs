//! In-memory store for `TESTING=true` runs and the test suite
//!
//! Behaves like the real server for everything the service exercises:
//! atomic increments with overflow errors, conditional sets, TTL
//! bookkeeping with lazy expiry on access, and an `INFO`-shaped server
//! string. State lives in one mutex-guarded map; nothing here is on a hot
//! path that would justify more.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::{Store, StoreError, TTL_MISSING, TTL_NO_EXPIRY};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

/// Mock key-value store with real TTL semantics
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    started: Instant,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            started: Instant::now(),
        }
    }

    /// Number of live (unexpired) keys; test helper
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .values()
            .filter(|e| e.expires_at.is_none_or(|at| at > now))
            .count()
    }

    /// True when no live keys remain
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn with_live_entry<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut HashMap<String, Entry>, Option<Entry>) -> T,
    ) -> T {
        let mut entries = self.entries.lock();
        let live = match entries.get(id) {
            Some(e) if e.expires_at.is_some_and(|at| at <= Instant::now()) => {
                entries.remove(id);
                None
            }
            Some(e) => Some(e.clone()),
            None => None,
        };
        f(&mut entries, live)
    }

    fn add(&self, id: &str, delta: i64) -> Result<i64, StoreError> {
        self.with_live_entry(id, |entries, live| {
            let (current, expires_at) = match live {
                Some(entry) => {
                    let parsed = entry
                        .value
                        .parse::<i64>()
                        .map_err(|_| StoreError::Backend("value is not an integer".into()))?;
                    (parsed, entry.expires_at)
                }
                None => (0, None),
            };
            let next = current.checked_add(delta).ok_or(StoreError::Overflow)?;
            entries.insert(
                id.to_owned(),
                Entry {
                    value: next.to_string(),
                    expires_at,
                },
            );
            Ok(next)
        })
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn incr(&self, id: &str) -> Result<i64, StoreError> {
        self.add(id, 1)
    }

    async fn incr_by(&self, id: &str, delta: i64) -> Result<i64, StoreError> {
        self.add(id, delta)
    }

    async fn set_if_absent(
        &self,
        id: &str,
        value: i64,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        Ok(self.with_live_entry(id, |entries, live| {
            if live.is_some() {
                return false;
            }
            entries.insert(
                id.to_owned(),
                Entry {
                    value: value.to_string(),
                    expires_at: Some(Instant::now() + ttl),
                },
            );
            true
        }))
    }

    async fn set_if_present(
        &self,
        id: &str,
        value: i64,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        Ok(self.with_live_entry(id, |entries, live| {
            if live.is_none() {
                return false;
            }
            entries.insert(
                id.to_owned(),
                Entry {
                    value: value.to_string(),
                    expires_at: Some(Instant::now() + ttl),
                },
            );
            true
        }))
    }

    async fn put(&self, id: &str, value: &str) -> Result<(), StoreError> {
        self.entries.lock().insert(
            id.to_owned(),
            Entry {
                value: value.to_owned(),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<String>, StoreError> {
        Ok(self.with_live_entry(id, |_, live| live.map(|e| e.value)))
    }

    async fn del(&self, id: &str) -> Result<(), StoreError> {
        self.entries.lock().remove(id);
        Ok(())
    }

    async fn exists(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.with_live_entry(id, |_, live| live.is_some()))
    }

    async fn ttl(&self, id: &str) -> Result<i64, StoreError> {
        Ok(self.with_live_entry(id, |_, live| match live {
            None => TTL_MISSING,
            Some(Entry {
                expires_at: None, ..
            }) => TTL_NO_EXPIRY,
            Some(Entry {
                expires_at: Some(at),
                ..
            }) => at.saturating_duration_since(Instant::now()).as_secs() as i64,
        }))
    }

    async fn expire(&self, id: &str, ttl: Duration) -> Result<(), StoreError> {
        self.with_live_entry(id, |entries, live| {
            if live.is_some() {
                if let Some(entry) = entries.get_mut(id) {
                    entry.expires_at = Some(Instant::now() + ttl);
                }
            }
        });
        Ok(())
    }

    async fn bump_stats(&self, total: i64, paths: &[(String, i64)]) -> Result<(), StoreError> {
        self.add("stats:Total", total)?;
        for (path, count) in paths {
            self.add(&format!("stats:{path}"), *count)?;
        }
        Ok(())
    }

    async fn info(&self) -> Result<String, StoreError> {
        let uptime = self.started.elapsed().as_secs();
        Ok(format!(
            "# Server\r\nredis_version:in-memory\r\nuptime_in_seconds:{uptime}\r\n\r\n\
             # Stats\r\nexpired_keys:0\r\nkeyspace_misses:0\r\n"
        ))
    }
}
