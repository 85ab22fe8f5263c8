//! Prometheus metrics
//!
//! One global registry behind a `OnceLock`, initialized at startup and
//! consulted opportunistically everywhere else: callers use
//! [`Metrics::get`] and skip recording when initialization never happened
//! (unit tests, ad-hoc tooling).

use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, Encoder, IntCounter,
    IntCounterVec, IntGauge, TextEncoder,
};
use std::sync::OnceLock;

static METRICS: OnceLock<Metrics> = OnceLock::new();

/// All Abacus metrics
pub struct Metrics {
    /// Requests observed by the stats middleware, by first path segment
    pub requests: IntCounterVec,

    /// Publishes accepted by the fan-out engine
    pub engine_published: IntCounter,

    /// Frames dropped on full or closed sinks
    pub engine_dropped: IntCounter,

    /// Live subscription count
    pub engine_subscriptions: IntGauge,

    /// Stats flushes executed against the store
    pub stats_flushes: IntCounter,

    /// Stats flushes that failed and were reconciled back into memory
    pub stats_flush_failures: IntCounter,
}

impl Metrics {
    /// Initialize metrics; idempotent, returns the global instance
    pub fn init() -> Result<&'static Metrics, prometheus::Error> {
        if let Some(metrics) = METRICS.get() {
            return Ok(metrics);
        }

        let metrics = Metrics {
            requests: register_int_counter_vec!(
                "abacus_requests_total",
                "Requests observed, labelled by first path segment",
                &["route"]
            )?,
            engine_published: register_int_counter!(
                "abacus_engine_published_total",
                "Counter updates accepted by the fan-out engine"
            )?,
            engine_dropped: register_int_counter!(
                "abacus_engine_dropped_frames_total",
                "Frames dropped on full or closed subscriber sinks"
            )?,
            engine_subscriptions: register_int_gauge!(
                "abacus_engine_subscriptions",
                "Live SSE subscriptions"
            )?,
            stats_flushes: register_int_counter!(
                "abacus_stats_flushes_total",
                "Stats batches flushed to the store"
            )?,
            stats_flush_failures: register_int_counter!(
                "abacus_stats_flush_failures_total",
                "Stats flushes that failed and were reconciled in memory"
            )?,
        };

        let _ = METRICS.set(metrics);
        METRICS
            .get()
            .ok_or_else(|| prometheus::Error::Msg("metrics initialization raced".to_owned()))
    }

    /// The global instance, if [`Metrics::init`] has run
    pub fn get() -> Option<&'static Metrics> {
        METRICS.get()
    }

    /// Record one request against a route segment
    pub fn record_request(&self, route: &str) {
        self.requests.with_label_values(&[route]).inc();
    }

    /// Bump the engine publish counter
    pub fn inc_published(&self) {
        self.engine_published.inc();
    }

    /// Bump the dropped-frame counter
    pub fn inc_dropped_frames(&self) {
        self.engine_dropped.inc();
    }

    /// Track the live subscription count
    pub fn set_active_subscriptions(&self, count: usize) {
        self.engine_subscriptions.set(count as i64);
    }

    /// Record a stats flush outcome
    pub fn record_stats_flush(&self, success: bool) {
        self.stats_flushes.inc();
        if !success {
            self.stats_flush_failures.inc();
        }
    }
}

/// Gather all metrics in the Prometheus text exposition format
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&families, &mut buffer).is_ok() {
        String::from_utf8(buffer).unwrap_or_default()
    } else {
        String::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let _ = Metrics::init();
        let _ = Metrics::init();
        if let Some(metrics) = Metrics::get() {
            metrics.record_request("hit");
            metrics.inc_published();
            metrics.set_active_subscriptions(3);
            metrics.record_stats_flush(true);
            metrics.record_stats_flush(false);
        }
    }

    #[test]
    fn gather_produces_text_exposition() {
        let _ = Metrics::init();
        let body = gather();
        assert!(body.contains("abacus_engine_published_total"));
    }
}
