//! abacus-service - the Abacus counter service
//!
//! Clients create named counters, increment them, and subscribe to realtime
//! value updates over server-sent-event streams. Counter values and ownership
//! tokens live in a Redis-compatible store with a sliding TTL; this process
//! owns the realtime fan-out, the route-stats aggregation, and the HTTP
//! surface.
//!
//! # Architecture
//!
//! ```text
//! HTTP handlers ──► Counters (ops) ──► Store (redis / memory)
//!                        │
//!                        └──► Engine ──► per-subscriber sinks ──► SSE frames
//!
//! every request ──► StatsAggregator ──► pipelined stats:* flush
//! ```
//!
//! The engine is sharded by counter identifier. Publishers never block on
//! slow subscribers: each sink is a small bounded queue, full sinks drop the
//! frame, and handlers own sink lifetime end to end.

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]

pub mod badge;
pub mod config;
pub mod engine;
pub mod http;
pub mod metrics;
pub mod ops;
pub mod stats;
pub mod store;

pub use config::{Config, EngineConfig};
pub use engine::{Engine, EngineStats, Subscription};
pub use http::AppState;
pub use ops::Counters;
pub use stats::StatsAggregator;
pub use store::{MemoryStore, RedisStore, Store, StoreError};

/// Service version reported by `/stats`
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Documentation URL used by the fallback redirect and `/docs`
pub const DOCS_URL: &str = "https://jasoncameron.dev/abacus/";
