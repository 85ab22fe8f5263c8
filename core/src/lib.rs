//! abacus-core - Core types for the Abacus counter service
//!
//! This crate provides the foundational types shared between the Abacus
//! service and anything that needs to speak its naming scheme:
//!
//! - [`CounterName`] - a validated `(namespace, key)` pair and its canonical
//!   store identifiers
//! - [`NameError`] - everything that can go wrong while resolving a name
//! - [`CounterError`] - the service-wide error taxonomy that the HTTP layer
//!   translates to status codes
//!
//! # Why this crate exists
//!
//! Counter identifiers appear on both sides of every seam in the service:
//! the HTTP handlers parse them, the store adapter keys on them, and the
//! fan-out engine shards on them. Keeping the naming rules in one leaf crate
//! with no async or I/O dependencies means every layer agrees on exactly one
//! definition of what a valid counter name is.

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]
#![warn(missing_docs)]

mod error;
/// Counter naming: parsing, reserved-token expansion, validation
pub mod keys;

pub use error::CounterError;
pub use keys::{CounterName, NameError, RequestHints, MAX_LENGTH, MIN_LENGTH};
