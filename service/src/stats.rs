//! Stats aggregator - write-coalescing route hit counters
//!
//! Every request bumps an in-memory counter for its first path segment plus
//! a process-wide total; nothing touches the store on the request path. A
//! background task flushes the coalesced counts as one pipelined batch when
//! the total crosses a threshold or a timer fires, and reconciles the counts
//! back into memory when a flush fails, so a later retry reaches the same
//! stored totals.
//!
//! Stats paths come from the route table, not from user input. The path map
//! is therefore a small bounded set, and exceeding [`MAX_PATHS`] is a
//! programming error that aborts the process rather than a condition to
//! degrade around.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tracing::{error, info, warn};

use crate::metrics::Metrics;
use crate::store::{Store, StoreError};

/// Unique path segments tracked before the process aborts
pub const MAX_PATHS: usize = 64;

/// Pending total that triggers an early flush
pub const SAVE_THRESHOLD: i64 = 100;

const SAVE_INTERVAL: Duration = Duration::from_secs(30);
const HEALTH_INTERVAL: Duration = Duration::from_secs(60);

/// Shutdown handshake message: the aggregator flushes, then echoes on the
/// enclosed sender so the caller knows the store has the final counts.
pub type FlushAndQuit = oneshot::Sender<()>;

struct StatsInner {
    total: AtomicI64,
    paths: RwLock<HashMap<String, Arc<AtomicI64>>>,
    path_count: AtomicUsize,
    kick: Notify,
    save_lock: Mutex<()>,
}

/// Write-coalescing route statistics
///
/// Cloning is cheap; every clone shares the same counters.
#[derive(Clone)]
pub struct StatsAggregator {
    inner: Arc<StatsInner>,
}

impl StatsAggregator {
    /// Create an aggregator with no tracked paths
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StatsInner {
                total: AtomicI64::new(0),
                paths: RwLock::new(HashMap::new()),
                path_count: AtomicUsize::new(0),
                kick: Notify::new(),
                save_lock: Mutex::new(()),
            }),
        }
    }

    /// Record one hit against a path segment
    pub fn record(&self, path: &str) {
        let total = self.inner.total.fetch_add(1, Ordering::AcqRel) + 1;

        let hit = {
            let paths = self.inner.paths.read();
            paths.get(path).map(|counter| {
                counter.fetch_add(1, Ordering::Relaxed);
            })
        };
        if hit.is_none() {
            let mut paths = self.inner.paths.write();
            match paths.entry(path.to_owned()) {
                Entry::Occupied(entry) => {
                    entry.get().fetch_add(1, Ordering::Relaxed);
                }
                Entry::Vacant(entry) => {
                    if self.inner.path_count.load(Ordering::Acquire) >= MAX_PATHS {
                        error!(
                            limit = MAX_PATHS,
                            path, "stats path ceiling exceeded, aborting"
                        );
                        std::process::abort();
                    }
                    self.inner.path_count.fetch_add(1, Ordering::AcqRel);
                    entry.insert(Arc::new(AtomicI64::new(1)));
                }
            }
        }

        if total > SAVE_THRESHOLD {
            self.inner.kick.notify_one();
        }
    }

    /// Pending (unflushed) total; test and snapshot helper
    pub fn pending_total(&self) -> i64 {
        self.inner.total.load(Ordering::Acquire)
    }

    /// Number of distinct path segments seen
    pub fn path_count(&self) -> usize {
        self.inner.path_count.load(Ordering::Acquire)
    }

    /// Flush coalesced counts to the store as one pipelined batch.
    ///
    /// Non-forced flushes are skipped below [`SAVE_THRESHOLD`]. On failure
    /// every swapped-out count is added back, so retrying converges on the
    /// same stored totals as a single successful flush.
    pub async fn flush(&self, store: &dyn Store, force: bool) -> Result<(), StoreError> {
        let _guard = self.inner.save_lock.lock().await;

        if !force && self.inner.total.load(Ordering::Acquire) < SAVE_THRESHOLD {
            return Ok(());
        }
        let total = self.inner.total.swap(0, Ordering::AcqRel);
        if total == 0 {
            return Ok(());
        }

        let tracked: Vec<(String, Arc<AtomicI64>)> = {
            let paths = self.inner.paths.read();
            paths
                .iter()
                .map(|(path, counter)| (path.clone(), Arc::clone(counter)))
                .collect()
        };
        let mut batch = Vec::with_capacity(tracked.len());
        for (path, counter) in &tracked {
            let count = counter.swap(0, Ordering::AcqRel);
            if count > 0 {
                batch.push((path.clone(), count));
            }
        }

        match store.bump_stats(total, &batch).await {
            Ok(()) => {
                info!(total, paths = batch.len(), "saved stats");
                if let Some(metrics) = Metrics::get() {
                    metrics.record_stats_flush(true);
                }
                Ok(())
            }
            Err(err) => {
                // Reconcile: put everything back for the next attempt.
                self.inner.total.fetch_add(total, Ordering::AcqRel);
                for (path, count) in &batch {
                    if let Some(counter) = self.inner.paths.read().get(path) {
                        counter.fetch_add(*count, Ordering::Relaxed);
                    }
                }
                warn!(error = %err, total, "stats flush failed, counts restored");
                if let Some(metrics) = Metrics::get() {
                    metrics.record_stats_flush(false);
                }
                Err(err)
            }
        }
    }

    /// Drive periodic and threshold flushes until the shutdown handshake.
    ///
    /// The final flush is forced; its completion is echoed back on the
    /// sender received over the control channel so the caller can hold the
    /// store open until the counts are safe.
    pub async fn run(self, store: Arc<dyn Store>, mut control: mpsc::Receiver<FlushAndQuit>) {
        let start = tokio::time::Instant::now();
        let mut save_tick = tokio::time::interval_at(start + SAVE_INTERVAL, SAVE_INTERVAL);
        let mut health_tick = tokio::time::interval_at(start + HEALTH_INTERVAL, HEALTH_INTERVAL);

        loop {
            tokio::select! {
                _ = save_tick.tick() => {
                    let _ = self.flush(store.as_ref(), false).await;
                }
                _ = self.inner.kick.notified() => {
                    let _ = self.flush(store.as_ref(), false).await;
                }
                _ = health_tick.tick() => self.log_snapshot(),
                signal = control.recv() => {
                    let _ = self.flush(store.as_ref(), true).await;
                    if let Some(echo) = signal {
                        let _ = echo.send(());
                    }
                    info!("stats aggregator stopped");
                    return;
                }
            }
        }
    }

    fn log_snapshot(&self) {
        let total = self.pending_total();
        info!(
            total,
            paths = self.path_count(),
            "stats health check"
        );
        if total >= SAVE_THRESHOLD {
            self.inner.kick.notify_one();
        }
    }
}

impl Default for StatsAggregator {
    fn default() -> Self {
        Self::new()
    }
}
