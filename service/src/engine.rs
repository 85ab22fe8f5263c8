//! Fan-out engine - realtime delivery of counter updates to subscribers
//!
//! The engine maintains the set of subscribers per counter and broadcasts
//! every published value change to all of them. It is built around three
//! rules that keep publishers fast and cleanup correct under churn:
//!
//! 1. **Sharded registry.** The counter→subscriber map is split across
//!    shards, each behind its own read-write lock. A broadcast holds the
//!    read lock only long enough to copy the sink list; delivery happens
//!    against the snapshot, lock-free.
//! 2. **Bounded everything.** Command queues, worker queues, and subscriber
//!    sinks are all bounded. A full sink drops the frame (the subscriber is
//!    transiently slow, not dead); a full publish queue drops the publish.
//!    Nothing in the delivery path blocks a publisher.
//! 3. **Handlers own their sinks.** The engine stores a sender under the
//!    shard lock but never closes it; removal only forgets the map entry.
//!    The single exception is admission-time refusal, where the offered
//!    sender is dropped before it ever belonged to a live subscription.
//!
//! # Command flow
//!
//! ```text
//! subscribe ──► new queue ────┐
//! drop guard ─► closed queue ─┤──► dispatcher ──► shard maps
//! publish ────► publish queue ┘         │
//!                                       └──► delivery batches ──► workers
//! ```
//!
//! The dispatcher serializes map mutations and broadcast snapshots, so each
//! broadcast observes a coherent subscriber set and per-sink delivery order
//! follows publish order. Delivery batches fan out across the worker pool;
//! a broadcast that outlives its soft deadline logs a warning and keeps
//! delivering in the background.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::metrics::Metrics;

/// Budget for handing a registration to the engine before giving up and
/// signalling rejection to the handler.
const ADMISSION_TIMEOUT: Duration = Duration::from_secs(1);

type Sink = mpsc::Sender<i64>;

struct Registration {
    counter: Arc<str>,
    sink_id: u64,
    sink: Sink,
}

enum Removal {
    /// Forget one sink; the per-counter set is dropped when it empties
    Sink { counter: Arc<str>, sink_id: u64 },
    /// Forget every sink of a deleted counter
    Counter { counter: Arc<str> },
}

struct Publish {
    counter: String,
    value: i64,
}

/// One batch of a broadcast, handed to a delivery worker
struct Delivery {
    counter: Arc<str>,
    value: i64,
    sinks: Vec<(u64, Sink)>,
    tracker: Arc<BroadcastTracker>,
}

/// Completion accounting for one broadcast's soft deadline
struct BroadcastTracker {
    remaining: AtomicUsize,
    done: Notify,
}

impl BroadcastTracker {
    fn new(total: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(total),
            done: Notify::new(),
        }
    }

    fn complete(&self, count: usize) {
        if self.remaining.fetch_sub(count, Ordering::AcqRel) == count {
            self.done.notify_one();
        }
    }

    fn pending(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }
}

struct Shard {
    subscribers: RwLock<HashMap<Arc<str>, HashMap<u64, Sink>>>,
}

struct Shared {
    shards: Vec<Shard>,
    active: AtomicUsize,
    dropped: AtomicU64,
    published: AtomicU64,
    config: EngineConfig,
}

/// Live engine statistics, exposed on `/stats`
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    /// Current subscriber count across all counters
    pub active_connections: usize,
    /// Admission ceiling
    pub max_connections: usize,
    /// Frames dropped because a sink was full or closed
    pub dropped_messages: u64,
    /// Publishes accepted by the engine
    pub total_messages: u64,
    /// Delivery worker tasks
    pub workers: usize,
    /// Registry shards
    pub shards: usize,
}

/// The process-wide fan-out engine
///
/// Created once at startup and shared behind an `Arc`; it has no explicit
/// destructor - dropping the last handle closes the command queues and the
/// dispatcher and workers wind down on their own.
pub struct Engine {
    shared: Arc<Shared>,
    new_tx: mpsc::Sender<Registration>,
    closed_tx: mpsc::Sender<Removal>,
    publish_tx: mpsc::Sender<Publish>,
    next_sink_id: AtomicU64,
}

impl Engine {
    /// Start the engine: spawns the dispatcher and the delivery worker pool
    pub fn start(config: EngineConfig) -> Arc<Self> {
        let shards = (0..config.shard_count)
            .map(|_| Shard {
                subscribers: RwLock::new(HashMap::new()),
            })
            .collect();

        let shared = Arc::new(Shared {
            shards,
            active: AtomicUsize::new(0),
            dropped: AtomicU64::new(0),
            published: AtomicU64::new(0),
            config: config.clone(),
        });

        let (new_tx, new_rx) = mpsc::channel(config.queue_capacity);
        let (closed_tx, closed_rx) = mpsc::channel(config.queue_capacity);
        let (publish_tx, publish_rx) = mpsc::channel(config.queue_capacity);

        let mut worker_txs = Vec::with_capacity(config.worker_count);
        for _ in 0..config.worker_count {
            let (tx, rx) = mpsc::channel::<Delivery>(config.queue_capacity);
            worker_txs.push(tx);
            tokio::spawn(deliver_loop(Arc::clone(&shared), rx, closed_tx.clone()));
        }

        tokio::spawn(dispatch(
            Arc::clone(&shared),
            new_rx,
            closed_rx,
            publish_rx,
            worker_txs,
        ));

        info!(
            workers = config.worker_count,
            shards = config.shard_count,
            max_connections = config.max_subscriptions,
            "fan-out engine started"
        );

        Arc::new(Self {
            shared,
            new_tx,
            closed_tx,
            publish_tx,
            next_sink_id: AtomicU64::new(0),
        })
    }

    /// Register a new subscriber for a counter.
    ///
    /// The returned [`Subscription`] owns the sink for its whole lifetime;
    /// dropping it schedules the deregistration. If the engine refuses the
    /// subscription (over the connection ceiling, or the admission queue
    /// stayed full past its budget) the subscription's receiver reports
    /// closed before any value is delivered.
    pub async fn subscribe(&self, counter: impl Into<Arc<str>>) -> Subscription {
        let counter: Arc<str> = counter.into();
        let (sink, rx) = mpsc::channel(self.shared.config.sink_capacity);
        let sink_id = self.next_sink_id.fetch_add(1, Ordering::Relaxed);

        let registration = Registration {
            counter: Arc::clone(&counter),
            sink_id,
            sink,
        };
        // On timeout or a closed engine the registration (and its sink) is
        // dropped here, which closes `rx` and signals rejection.
        if timeout(ADMISSION_TIMEOUT, self.new_tx.send(registration))
            .await
            .is_err()
        {
            warn!(counter = %counter, "admission queue saturated, refusing subscriber");
        }

        Subscription {
            rx,
            counter,
            sink_id,
            closed_tx: self.closed_tx.clone(),
            remove_timeout: self.shared.config.remove_timeout,
        }
    }

    /// Publish a new value for a counter. Fire-and-forget: a full publish
    /// queue drops the update with a warning and never blocks the caller.
    pub fn publish(&self, counter: &str, value: i64) {
        let publish = Publish {
            counter: counter.to_owned(),
            value,
        };
        if self.publish_tx.try_send(publish).is_err() {
            warn!(counter, "publish queue full, update dropped");
        }
    }

    /// Forget every subscriber of a deleted counter.
    ///
    /// Sinks are not closed; their handlers keep running until the client
    /// disconnects and observe the deletion through the store.
    pub async fn close_counter(&self, counter: &str) {
        let removal = Removal::Counter {
            counter: Arc::from(counter),
        };
        if timeout(self.shared.config.remove_timeout, self.closed_tx.send(removal))
            .await
            .is_err()
        {
            warn!(counter, "timed out scheduling counter close");
        }
    }

    /// Current subscriber count as maintained by admission accounting
    pub fn active_subscriptions(&self) -> usize {
        self.shared.active.load(Ordering::Acquire)
    }

    /// Subscriber count recomputed by walking every shard.
    ///
    /// Always equals [`Engine::active_subscriptions`] outside the instants a
    /// shard lock is held for a mutation.
    pub fn tracked_subscriptions(&self) -> usize {
        self.shared
            .shards
            .iter()
            .map(|s| s.subscribers.read().values().map(HashMap::len).sum::<usize>())
            .sum()
    }

    /// Subscribers currently registered for one counter
    pub fn subscriber_count(&self, counter: &str) -> usize {
        let shard = self.shared.shard(counter);
        shard
            .subscribers
            .read()
            .get(counter)
            .map_or(0, HashMap::len)
    }

    /// Live statistics snapshot
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            active_connections: self.shared.active.load(Ordering::Acquire),
            max_connections: self.shared.config.max_subscriptions,
            dropped_messages: self.shared.dropped.load(Ordering::Acquire),
            total_messages: self.shared.published.load(Ordering::Acquire),
            workers: self.shared.config.worker_count,
            shards: self.shared.config.shard_count,
        }
    }
}

/// One subscriber's end of the fan-out: a bounded queue of counter values.
///
/// The handler that created it is the sink's only owner. Dropping the
/// subscription closes the receiver and schedules the engine-side removal,
/// with a bounded budget so a saturated queue cannot wedge a disconnecting
/// handler.
pub struct Subscription {
    rx: mpsc::Receiver<i64>,
    counter: Arc<str>,
    sink_id: u64,
    closed_tx: mpsc::Sender<Removal>,
    remove_timeout: Duration,
}

impl Subscription {
    /// Receive the next published value. `None` means the engine refused or
    /// abandoned this subscription; no further values will arrive.
    pub async fn recv(&mut self) -> Option<i64> {
        self.rx.recv().await
    }

    /// The counter identifier this subscription is registered under
    pub fn counter(&self) -> &str {
        &self.counter
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.rx.close();
        let removal = Removal::Sink {
            counter: Arc::clone(&self.counter),
            sink_id: self.sink_id,
        };
        match self.closed_tx.try_send(removal) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(removal)) => {
                // Retry off-thread within the removal budget; a stale entry
                // is otherwise reaped when the next publish finds the sink
                // closed.
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    let closed_tx = self.closed_tx.clone();
                    let budget = self.remove_timeout;
                    handle.spawn(async move {
                        if timeout(budget, closed_tx.send(removal)).await.is_err() {
                            warn!("timed out scheduling subscriber removal");
                        }
                    });
                } else {
                    warn!("deregistration queue full outside runtime, entry reaped lazily");
                }
            }
        }
    }
}

impl Shared {
    fn shard(&self, counter: &str) -> &Shard {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        counter.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }

    fn admit(&self, registration: Registration) {
        if registration.sink.is_closed() {
            // The handler gave up while the registration was queued; its
            // deregistration may even have been drained already.
            debug!(counter = %registration.counter, "subscriber vanished before admission");
            return;
        }
        let active = self.active.load(Ordering::Acquire);
        if active >= self.config.max_subscriptions {
            warn!(
                counter = %registration.counter,
                active,
                limit = self.config.max_subscriptions,
                "connection limit reached, refusing subscriber"
            );
            // The one place the engine closes a sink: it never belonged to a
            // live subscription.
            drop(registration.sink);
            return;
        }

        let shard = self.shard(&registration.counter);
        {
            let mut subscribers = shard.subscribers.write();
            subscribers
                .entry(registration.counter)
                .or_default()
                .insert(registration.sink_id, registration.sink);
        }
        let now = self.active.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(active = now, "subscriber added");
        if let Some(metrics) = Metrics::get() {
            metrics.set_active_subscriptions(now);
        }
    }

    fn remove(&self, removal: Removal) {
        let removed = match removal {
            Removal::Sink { counter, sink_id } => {
                let shard = self.shard(&counter);
                let mut subscribers = shard.subscribers.write();
                match subscribers.get_mut(&*counter) {
                    Some(sinks) => {
                        if sinks.remove(&sink_id).is_some() {
                            if sinks.is_empty() {
                                subscribers.remove(&*counter);
                                debug!(counter = %counter, "last subscriber gone, counter entry removed");
                            }
                            1
                        } else {
                            0
                        }
                    }
                    None => 0,
                }
            }
            Removal::Counter { counter } => {
                let shard = self.shard(&counter);
                let mut subscribers = shard.subscribers.write();
                let count = subscribers.remove(&*counter).map_or(0, |sinks| sinks.len());
                if count > 0 {
                    info!(counter = %counter, subscribers = count, "counter closed, subscribers detached");
                }
                count
            }
        };
        if removed > 0 {
            let now = self.active.fetch_sub(removed, Ordering::AcqRel) - removed;
            if let Some(metrics) = Metrics::get() {
                metrics.set_active_subscriptions(now);
            }
        }
    }

    fn note_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = Metrics::get() {
            metrics.inc_dropped_frames();
        }
    }

    /// Deliver one value to one sink: try-send first, then a bounded wait.
    /// Full-and-timed-out counts as a drop but keeps the subscriber; a
    /// closed sink additionally schedules its removal.
    async fn offer(
        &self,
        counter: &Arc<str>,
        sink_id: u64,
        sink: &Sink,
        value: i64,
        closed_tx: &mpsc::Sender<Removal>,
    ) {
        let pending = match sink.try_send(value) {
            Ok(()) => return,
            Err(TrySendError::Closed(_)) => {
                self.note_dropped();
                schedule_removal(closed_tx, counter, sink_id);
                return;
            }
            Err(TrySendError::Full(v)) => v,
        };

        if self.config.offer_timeout.is_zero() {
            self.note_dropped();
            return;
        }

        match timeout(self.config.offer_timeout, sink.send(pending)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                self.note_dropped();
                schedule_removal(closed_tx, counter, sink_id);
            }
            Err(_) => self.note_dropped(),
        }
    }
}

fn schedule_removal(closed_tx: &mpsc::Sender<Removal>, counter: &Arc<str>, sink_id: u64) {
    // Best effort: a full queue just defers the cleanup to the next publish
    // or to the handler's own drop guard.
    let _ = closed_tx.try_send(Removal::Sink {
        counter: Arc::clone(counter),
        sink_id,
    });
}

/// Dispatcher: serializes registry mutations and broadcast snapshots.
///
/// Removals are drained ahead of additions and publishes so cleanup stays
/// prompt even under publish pressure.
async fn dispatch(
    shared: Arc<Shared>,
    mut new_rx: mpsc::Receiver<Registration>,
    mut closed_rx: mpsc::Receiver<Removal>,
    mut publish_rx: mpsc::Receiver<Publish>,
    workers: Vec<mpsc::Sender<Delivery>>,
) {
    let mut next_worker = 0usize;
    loop {
        tokio::select! {
            biased;
            Some(removal) = closed_rx.recv() => shared.remove(removal),
            registration = new_rx.recv() => match registration {
                Some(registration) => shared.admit(registration),
                // All engine handles gone: the process is shutting down.
                None => break,
            },
            Some(publish) = publish_rx.recv() => {
                broadcast(&shared, publish, &workers, &mut next_worker).await;
            }
        }
    }
    debug!("engine dispatcher stopped");
}

/// Broadcast one value: snapshot the sink set under the read lock, release
/// it, then spread delivery batches across the worker pool. Waits for
/// completion only up to the soft deadline.
async fn broadcast(
    shared: &Arc<Shared>,
    publish: Publish,
    workers: &[mpsc::Sender<Delivery>],
    next_worker: &mut usize,
) {
    shared.published.fetch_add(1, Ordering::Relaxed);
    if let Some(metrics) = Metrics::get() {
        metrics.inc_published();
    }

    let shard = shared.shard(&publish.counter);
    let (counter, mut snapshot) = {
        let subscribers = shard.subscribers.read();
        match subscribers.get_key_value(publish.counter.as_str()) {
            Some((counter, sinks)) if !sinks.is_empty() => (
                Arc::clone(counter),
                sinks
                    .iter()
                    .map(|(id, sink)| (*id, sink.clone()))
                    .collect::<Vec<_>>(),
            ),
            _ => return,
        }
    };

    let total = snapshot.len();
    let batch_size = (total / workers.len()).max(1);
    let tracker = Arc::new(BroadcastTracker::new(total));

    while !snapshot.is_empty() {
        let take = batch_size.min(snapshot.len());
        let sinks: Vec<_> = snapshot.drain(..take).collect();
        let delivery = Delivery {
            counter: Arc::clone(&counter),
            value: publish.value,
            sinks,
            tracker: Arc::clone(&tracker),
        };
        if workers[*next_worker % workers.len()].send(delivery).await.is_err() {
            tracker.complete(take);
        }
        *next_worker = next_worker.wrapping_add(1);
    }

    // Soft deadline: late deliveries keep running on the workers, we only
    // stop waiting for them here.
    if timeout(shared.config.broadcast_deadline, tracker.done.notified())
        .await
        .is_err()
    {
        warn!(
            counter = %counter,
            subscribers = total,
            pending = tracker.pending(),
            "broadcast exceeded soft deadline"
        );
    }
}

/// Delivery worker: offers batches of values to sinks
async fn deliver_loop(
    shared: Arc<Shared>,
    mut rx: mpsc::Receiver<Delivery>,
    closed_tx: mpsc::Sender<Removal>,
) {
    while let Some(delivery) = rx.recv().await {
        let count = delivery.sinks.len();
        for (sink_id, sink) in &delivery.sinks {
            shared
                .offer(&delivery.counter, *sink_id, sink, delivery.value, &closed_tx)
                .await;
        }
        delivery.tracker.complete(count);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    fn small_config(max_subscriptions: usize) -> EngineConfig {
        EngineConfig {
            shard_count: 4,
            worker_count: 2,
            queue_capacity: 64,
            sink_capacity: 8,
            max_subscriptions,
            offer_timeout: Duration::from_millis(50),
            broadcast_deadline: Duration::from_millis(100),
            remove_timeout: Duration::from_millis(500),
        }
    }

    fn small_engine(max_subscriptions: usize) -> Arc<Engine> {
        Engine::start(small_config(max_subscriptions))
    }

    async fn settle() {
        // Paused-clock runs auto-advance; this drains dispatcher and workers.
        tokio::time::sleep(Duration::from_millis(250)).await;
    }

    // ========================================================================
    // Delivery
    // ========================================================================

    #[tokio::test(start_paused = true)]
    async fn subscriber_receives_published_values() {
        let engine = small_engine(100);
        let mut sub = engine.subscribe("K:test:a").await;
        settle().await;

        engine.publish("K:test:a", 1);
        engine.publish("K:test:a", 2);

        assert_eq!(sub.recv().await, Some(1));
        assert_eq!(sub.recv().await, Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn delivery_preserves_publish_order_per_sink() {
        let engine = small_engine(100);
        let mut sub = engine.subscribe("K:test:ordered").await;
        settle().await;

        for value in 0..5 {
            engine.publish("K:test:ordered", value);
        }

        for expected in 0..5 {
            assert_eq!(sub.recv().await, Some(expected));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn publishes_are_scoped_to_their_counter() {
        let engine = small_engine(100);
        let mut sub_a = engine.subscribe("K:test:a").await;
        let mut sub_b = engine.subscribe("K:test:b").await;
        settle().await;

        engine.publish("K:test:a", 7);
        settle().await;

        assert_eq!(sub_a.recv().await, Some(7));
        // b saw nothing; its sink must still be empty
        assert!(
            tokio::time::timeout(Duration::from_millis(10), sub_b.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn publish_without_subscribers_is_harmless() {
        let engine = small_engine(100);
        engine.publish("K:test:nobody", 1);
        settle().await;
        assert_eq!(engine.stats().total_messages, 1);
        assert_eq!(engine.stats().dropped_messages, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn fan_out_reaches_every_subscriber() {
        let engine = small_engine(1000);
        let mut subs = Vec::new();
        for _ in 0..50 {
            subs.push(engine.subscribe("K:test:busy").await);
        }
        settle().await;
        assert_eq!(engine.subscriber_count("K:test:busy"), 50);

        engine.publish("K:test:busy", 42);
        settle().await;

        for sub in &mut subs {
            assert_eq!(sub.recv().await, Some(42));
        }
    }

    // ========================================================================
    // Backpressure
    // ========================================================================

    #[tokio::test(start_paused = true)]
    async fn slow_subscriber_drops_frames_but_stays_registered() {
        let engine = small_engine(100);
        let mut sub = engine.subscribe("K:test:slow").await;
        settle().await;

        // Sink capacity is 8; publish well past it without draining.
        for value in 0..20 {
            engine.publish("K:test:slow", value);
        }
        settle().await;

        let stats = engine.stats();
        assert!(stats.dropped_messages > 0, "overflow must be counted");
        assert_eq!(
            engine.subscriber_count("K:test:slow"),
            1,
            "a slow subscriber must not be evicted"
        );

        // The frames that fit arrived in publish order.
        let first = sub.recv().await.unwrap();
        let second = sub.recv().await.unwrap();
        assert!(first < second);
    }

    // ========================================================================
    // Admission control
    // ========================================================================

    #[tokio::test(start_paused = true)]
    async fn over_limit_subscription_is_refused() {
        let engine = small_engine(1);
        let _first = engine.subscribe("K:test:full").await;
        settle().await;

        let mut second = engine.subscribe("K:test:full").await;
        settle().await;

        // Refusal closes the sink before any value is delivered.
        assert_eq!(second.recv().await, None);
        assert_eq!(engine.active_subscriptions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn refused_subscription_drop_does_not_corrupt_accounting() {
        let engine = small_engine(1);
        let first = engine.subscribe("K:test:full").await;
        let second = engine.subscribe("K:test:full").await;
        settle().await;

        drop(second);
        settle().await;
        assert_eq!(engine.active_subscriptions(), 1);
        assert_eq!(engine.tracked_subscriptions(), 1);

        drop(first);
        settle().await;
        assert_eq!(engine.active_subscriptions(), 0);
    }

    // ========================================================================
    // Cleanup
    // ========================================================================

    #[tokio::test(start_paused = true)]
    async fn dropping_a_subscription_removes_it_promptly() {
        let engine = small_engine(100);
        let sub = engine.subscribe("K:test:bye").await;
        settle().await;
        assert_eq!(engine.subscriber_count("K:test:bye"), 1);

        drop(sub);
        settle().await;

        assert_eq!(engine.subscriber_count("K:test:bye"), 0);
        assert_eq!(engine.active_subscriptions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn accounting_matches_shards_under_churn() {
        let engine = small_engine(1000);
        let mut subs = Vec::new();
        for i in 0..30 {
            subs.push(engine.subscribe(format!("K:churn:{}", i % 7)).await);
        }
        settle().await;
        assert_eq!(engine.active_subscriptions(), 30);
        assert_eq!(engine.tracked_subscriptions(), 30);

        let _held: Vec<_> = subs.drain(..10).collect();
        drop(subs);
        settle().await;

        assert_eq!(engine.active_subscriptions(), 10);
        assert_eq!(engine.tracked_subscriptions(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn close_counter_detaches_all_subscribers() {
        let engine = small_engine(100);
        let mut subs = Vec::new();
        for _ in 0..5 {
            subs.push(engine.subscribe("K:test:doomed").await);
        }
        let _other = engine.subscribe("K:test:other").await;
        settle().await;
        assert_eq!(engine.active_subscriptions(), 6);

        engine.close_counter("K:test:doomed").await;
        settle().await;

        assert_eq!(engine.subscriber_count("K:test:doomed"), 0);
        assert_eq!(engine.active_subscriptions(), 1);

        // Sinks were not closed by the engine; they are merely forgotten, so
        // no further values arrive but the receivers stay open.
        engine.publish("K:test:doomed", 9);
        settle().await;
        assert!(
            tokio::time::timeout(Duration::from_millis(10), subs[0].recv())
                .await
                .is_err()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn offer_to_closed_sink_counts_drop_and_schedules_removal() {
        let shared = Arc::new(Shared {
            shards: (0..2)
                .map(|_| Shard {
                    subscribers: RwLock::new(HashMap::new()),
                })
                .collect(),
            active: AtomicUsize::new(0),
            dropped: AtomicU64::new(0),
            published: AtomicU64::new(0),
            config: small_config(100),
        });

        let (sink, rx) = mpsc::channel(1);
        drop(rx); // handler is gone, sink is closed
        let (closed_tx, mut closed_rx) = mpsc::channel(4);

        let counter: Arc<str> = Arc::from("K:test:reap");
        shared.offer(&counter, 5, &sink, 1, &closed_tx).await;

        assert_eq!(shared.dropped.load(Ordering::Acquire), 1);
        match closed_rx.recv().await {
            Some(Removal::Sink { sink_id, counter }) => {
                assert_eq!(sink_id, 5);
                assert_eq!(&*counter, "K:test:reap");
            }
            _ => panic!("expected a scheduled sink removal"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn offer_to_full_sink_times_out_without_removal() {
        let shared = Arc::new(Shared {
            shards: (0..2)
                .map(|_| Shard {
                    subscribers: RwLock::new(HashMap::new()),
                })
                .collect(),
            active: AtomicUsize::new(0),
            dropped: AtomicU64::new(0),
            published: AtomicU64::new(0),
            config: small_config(100),
        });

        let (sink, mut rx) = mpsc::channel(1);
        sink.try_send(0).unwrap(); // fill the buffer, keep the receiver alive
        let (closed_tx, mut closed_rx) = mpsc::channel(4);

        let counter: Arc<str> = Arc::from("K:test:slowpoke");
        shared.offer(&counter, 9, &sink, 1, &closed_tx).await;

        assert_eq!(shared.dropped.load(Ordering::Acquire), 1);
        assert!(
            closed_rx.try_recv().is_err(),
            "a transiently slow sink must not be scheduled for removal"
        );
        assert_eq!(rx.recv().await, Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn stats_reflect_configuration() {
        let engine = small_engine(77);
        let stats = engine.stats();
        assert_eq!(stats.max_connections, 77);
        assert_eq!(stats.workers, 2);
        assert_eq!(stats.shards, 4);
        assert_eq!(stats.active_connections, 0);
    }
}
