//! Counter naming and validation
//!
//! A counter is addressed by a `(namespace, key)` pair. Both segments must
//! match `^[A-Za-z0-9_\-.]{3,64}$` unless they were produced by expanding a
//! reserved token, in which case the URL-shape filter below is the only
//! gate and the expanded value may legitimately contain `:`, `/` or `.`.
//!
//! Two reserved tokens are expanded per request, before validation:
//!
//! - `:HOST:` is replaced by the request's `Origin` header
//! - `:PATH:` is replaced by the request's `Referer` header
//!
//! The canonical store identifiers are `K:<namespace>:<key>` for the value
//! and `A:<namespace>:<key>` for the admin token.

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

/// Minimum accepted length of a namespace or key segment
pub const MIN_LENGTH: usize = 3;
/// Maximum accepted length of a namespace or key segment
pub const MAX_LENGTH: usize = 64;

/// Namespace used when the request supplies only a single segment
pub const DEFAULT_NAMESPACE: &str = "default";

#[allow(clippy::expect_used)]
static NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_\-.]{3,64}$").expect("name pattern is well-formed"));

/// Characters that disqualify a header value from reserved-token expansion.
/// A minimal shield against header injection and storage poisoning, not a
/// full URL parser.
const FORBIDDEN_URL_CHARS: &[char] = &[
    ' ', '\t', '\r', '\n', '<', '>', '"', '\'', '\\', '%', '{', '}',
];

/// Errors produced while resolving a counter name from request input
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NameError {
    /// The key path component contained an embedded `/`
    #[error("Route not found. Use /create/:namespace/:key or /hit/:key instead.")]
    RouteNotFound,

    /// A reserved token was used but the backing header was absent
    #[error("{header} header is required if {token} is used")]
    MissingHeader {
        /// Header the token expands from (`Origin` or `Referer`)
        header: &'static str,
        /// The reserved token that was requested
        token: &'static str,
    },

    /// The backing header failed the URL-shape filter
    #[error("Invalid {header} header format")]
    InvalidHeader {
        /// Header the token expands from
        header: &'static str,
    },

    /// The namespace segment failed validation
    #[error("Invalid namespace: {0}")]
    InvalidNamespace(String),

    /// The key segment failed validation
    #[error("Invalid key: {0}")]
    InvalidKey(String),
}

/// Request headers consulted during reserved-token expansion
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestHints<'a> {
    /// The request's `Origin` header, if present
    pub origin: Option<&'a str>,
    /// The request's `Referer` header, if present
    pub referer: Option<&'a str>,
}

/// A resolved counter name: expanded, validated, ready to be keyed on
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterName {
    namespace: String,
    key: String,
}

impl CounterName {
    /// Resolve a counter name from raw route parameters.
    ///
    /// The key path component may carry a leading `/` from a wildcard route
    /// segment; it is stripped. A `/` remaining inside the key is rejected.
    /// An empty key promotes the namespace parameter into the key position
    /// under the `default` namespace, so `/hit/foo` counts `default/foo`.
    pub fn resolve(
        namespace_param: &str,
        key_param: &str,
        hints: RequestHints<'_>,
    ) -> Result<Self, NameError> {
        let (namespace_raw, key_raw) = split_route_params(namespace_param, key_param)?;

        let (namespace, ns_expanded) = expand_reserved(&namespace_raw, hints)?;
        let (key, key_expanded) = expand_reserved(&key_raw, hints)?;

        if !ns_expanded {
            validate(&namespace).map_err(NameError::InvalidNamespace)?;
        }
        if !key_expanded {
            validate(&key).map_err(NameError::InvalidKey)?;
        }

        Ok(Self { namespace, key })
    }

    /// Resolve without running segment validation.
    ///
    /// Lookups that only read (`info`, admin-token fetch) accept any name the
    /// store could conceivably hold, so a malformed name simply misses.
    pub fn resolve_lenient(
        namespace_param: &str,
        key_param: &str,
        hints: RequestHints<'_>,
    ) -> Result<Self, NameError> {
        let (namespace_raw, key_raw) = split_route_params(namespace_param, key_param)?;
        let (namespace, _) = expand_reserved(&namespace_raw, hints)?;
        let (key, _) = expand_reserved(&key_raw, hints)?;
        Ok(Self { namespace, key })
    }

    /// Build a name from segments already known to be valid (e.g. randomly
    /// generated ones). Validation still runs; generated names must not be
    /// able to smuggle malformed identifiers into the store.
    pub fn from_parts(namespace: &str, key: &str) -> Result<Self, NameError> {
        validate(namespace).map_err(NameError::InvalidNamespace)?;
        validate(key).map_err(NameError::InvalidKey)?;
        Ok(Self {
            namespace: namespace.to_owned(),
            key: key.to_owned(),
        })
    }

    /// The namespace segment
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The key segment
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Canonical identifier of the counter value: `K:<namespace>:<key>`
    pub fn data_id(&self) -> String {
        format!("K:{}:{}", self.namespace, self.key)
    }

    /// Canonical identifier of the admin token: `A:<namespace>:<key>`
    pub fn admin_id(&self) -> String {
        format!("A:{}:{}", self.namespace, self.key)
    }
}

impl std::fmt::Display for CounterName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.key)
    }
}

/// Strip the wildcard `/` and apply default-namespace promotion.
fn split_route_params(
    namespace_param: &str,
    key_param: &str,
) -> Result<(String, String), NameError> {
    let key = key_param.trim_matches('/');
    if key.contains('/') {
        return Err(NameError::RouteNotFound);
    }
    if key.is_empty() {
        Ok((DEFAULT_NAMESPACE.to_owned(), namespace_param.to_owned()))
    } else {
        Ok((namespace_param.to_owned(), key.to_owned()))
    }
}

/// Expand `:HOST:` / `:PATH:` from request headers.
///
/// Returns the (possibly expanded) segment and whether expansion happened.
/// Expanded values bypass segment validation but must look like an http(s)
/// URL and are clamped into the accepted length band.
fn expand_reserved(segment: &str, hints: RequestHints<'_>) -> Result<(String, bool), NameError> {
    let segment = segment.trim_matches('/');
    let (header, token, value) = match segment {
        ":HOST:" => ("Origin", ":HOST:", hints.origin),
        ":PATH:" => ("Referer", ":PATH:", hints.referer),
        _ => return Ok((segment.to_owned(), false)),
    };

    let value = value
        .filter(|v| !v.is_empty())
        .ok_or(NameError::MissingHeader { header, token })?;
    if !looks_like_url(value) {
        return Err(NameError::InvalidHeader { header });
    }
    Ok((clamp_length(value), true))
}

/// Truncate to [`MAX_LENGTH`]; left-pad with dots up to [`MIN_LENGTH`].
fn clamp_length(s: &str) -> String {
    let len = s.chars().count();
    if len < MIN_LENGTH {
        format!("{}{}", ".".repeat(MIN_LENGTH - len), s)
    } else if len > MAX_LENGTH {
        s.chars().take(MAX_LENGTH).collect()
    } else {
        s.to_owned()
    }
}

/// Check that a segment meets the length and alphabet rules.
fn validate(input: &str) -> Result<(), String> {
    if input.len() < MIN_LENGTH || input.len() > MAX_LENGTH {
        return Err("length must be between 3 and 64 characters inclusive".to_owned());
    }
    if !NAME_PATTERN.is_match(input) {
        return Err(r"must match the pattern ^[A-Za-z0-9_\-.]{3,64}$".to_owned());
    }
    Ok(())
}

fn looks_like_url(input: &str) -> bool {
    let has_protocol = input.starts_with("http://") || input.starts_with("https://");
    has_protocol && !input.contains(FORBIDDEN_URL_CHARS)
}
