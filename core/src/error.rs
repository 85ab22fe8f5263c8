//! Service-wide error taxonomy
//!
//! Every counter operation surfaces one of these variants; the HTTP layer
//! owns the mapping to status codes. Infrastructure failures deliberately
//! carry a generic user-facing message so store internals never leak into
//! responses.

use thiserror::Error;

use crate::keys::NameError;

/// Errors surfaced by counter operations
#[derive(Debug, Error)]
pub enum CounterError {
    /// Bad request input: malformed name, bad integer, missing query value
    #[error("{0}")]
    Validation(String),

    /// The key path shape did not match any route
    #[error("Route not found. Use /create/:namespace/:key or /hit/:key instead.")]
    RouteNotFound,

    /// Counter missing for a read
    #[error("Key not found")]
    NotFound,

    /// `create` hit an existing key
    #[error("Key already exists, please use a different key.")]
    AlreadyExists,

    /// A mutating op targeted a key that does not exist
    #[error("Key does not exist, please use a different key.")]
    MissingForOp,

    /// `update_by` targeted a key that was never created
    #[error("Key does not exist, please first create it using /create.")]
    MissingForUpdate,

    /// An admin op targeted a counter that was never explicitly created
    #[error(
        "This entry is genuine and does not have an admin key. You cannot \
         modify or delete it. If you wanted to manage it, you should have \
         created it with the /create endpoint."
    )]
    Genuine,

    /// No bearer token was supplied to an admin operation
    #[error(
        "Token is required, please provide a token in the format of a Bearer \
         token header or ?token=ADMIN_TOKEN"
    )]
    MissingToken,

    /// Supplied bearer token did not match the stored admin token
    #[error("token is invalid")]
    InvalidToken,

    /// The operation would push the counter past the signed 64-bit maximum
    #[error("Value is too large. Max value is {max}", max = i64::MAX)]
    Overflow,

    /// The key-value store failed; the message stays generic on purpose
    #[error("Failed to get data. Try again later.")]
    Store(String),
}

impl From<NameError> for CounterError {
    fn from(err: NameError) -> Self {
        match err {
            NameError::RouteNotFound => CounterError::RouteNotFound,
            other => CounterError::Validation(other.to_string()),
        }
    }
}

impl CounterError {
    /// True when the error is the caller's fault rather than the service's
    pub fn is_client_error(&self) -> bool {
        !matches!(self, CounterError::Store(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{CounterName, RequestHints};

    #[test]
    fn name_errors_map_into_the_taxonomy() {
        let err = CounterName::resolve("ns", "/a/b", RequestHints::default())
            .map_err(CounterError::from)
            .unwrap_err();
        assert!(matches!(err, CounterError::RouteNotFound));

        let err = CounterName::resolve("x", "/key", RequestHints::default())
            .map_err(CounterError::from)
            .unwrap_err();
        assert!(matches!(err, CounterError::Validation(_)));
    }

    #[test]
    fn store_errors_do_not_leak_internals() {
        let err = CounterError::Store("connection refused to 10.0.0.3:6379".into());
        assert_eq!(err.to_string(), "Failed to get data. Try again later.");
        assert!(!err.is_client_error());
    }

    #[test]
    fn validation_messages_pass_through() {
        let err = CounterError::Validation("initializer must be a number".into());
        assert_eq!(err.to_string(), "initializer must be a number");
        assert!(err.is_client_error());
    }
}
