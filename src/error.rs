//! Error types for the guard layer.
//!
//! Three families, kept apart on purpose:
//! - [`ConfigError`]: invalid construction input; fatal at startup.
//! - [`StoreError`]: a backend failed; propagated, never swallowed or retried here.
//! - [`GuardError`]: what the middleware hands back to the transport adapter.
//!
//! A denied rate-limit check or an invalid CSRF token is *not* an error at the component level;
//! those come back as negative results and only become [`GuardError::Rejected`] in middleware.
use crate::response::Rejection;
use std::fmt;

/// Boxed error produced by an external key-value client.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Invalid configuration detected while building a component.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// A limit must admit at least one request.
    #[error("{scope}: max_requests must be > 0 (got {provided})")]
    InvalidMaxRequests { scope: String, provided: u32 },
    /// A limit window must be non-empty.
    #[error("{scope}: window_ms must be > 0 (got {provided})")]
    InvalidWindow { scope: String, provided: u64 },
    /// An explicit refill rate must be finite and positive.
    #[error("{scope}: refill_rate must be finite and > 0 (got {provided})")]
    InvalidRefillRate { scope: String, provided: f64 },
    /// The distributed store was built without a backing client.
    #[error("distributed store requires a key-value client")]
    MissingClient,
    /// An empty key prefix would make `clear` and `size` cover the whole backend.
    #[error("distributed store prefix must not be empty")]
    EmptyPrefix,
    /// The CSRF store needs a signing secret.
    #[error("csrf secret must not be empty")]
    EmptySecret,
    /// A duration that must be non-zero was zero.
    #[error("{field} must be > 0")]
    ZeroDuration { field: &'static str },
    /// A capacity that must be non-zero was zero.
    #[error("{field} must be > 0")]
    ZeroCapacity { field: &'static str },
}

/// Failure talking to, or decoding data from, a rate-limit store.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// The backend could not be reached or rejected the command.
    #[error("store backend error: {0}")]
    Backend(#[source] BoxError),
    /// A value could not be encoded for storage.
    #[error("failed to encode bucket state: {0}")]
    Encode(#[source] serde_json::Error),
    /// A stored value was unreadable or violated bucket invariants.
    #[error("corrupt bucket state under '{key}': {detail}")]
    Corrupt { key: String, detail: String },
}

impl StoreError {
    /// Wrap a client error.
    pub fn backend<E>(err: E) -> Self
    where
        E: Into<BoxError>,
    {
        StoreError::Backend(err.into())
    }

    /// Whether this came from the backend rather than from decoding.
    pub fn is_backend(&self) -> bool {
        matches!(self, StoreError::Backend(_))
    }
}

/// Error returned by [`crate::middleware::ActionGuardService`].
#[derive(Debug)]
pub enum GuardError<E> {
    /// The call was refused (CSRF or rate limit) and must not reach the dispatcher.
    Rejected(Rejection),
    /// The limiter's store failed; the adapter decides whether to fail open or closed.
    Store(StoreError),
    /// The wrapped dispatcher failed.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for GuardError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected(rejection) => {
                write!(f, "{} ({}): {}", rejection.code(), rejection.status(), rejection.message())
            }
            Self::Store(e) => write!(f, "rate limit store unavailable: {}", e),
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for GuardError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            Self::Store(e) => Some(e),
            Self::Rejected(_) => None,
        }
    }
}

impl<E> GuardError<E> {
    /// Refused by the rate limiter.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::Rejected(Rejection::RateLimited(_)))
    }
    /// Refused by CSRF validation.
    pub fn is_csrf_invalid(&self) -> bool {
        matches!(self, Self::Rejected(Rejection::CsrfInvalid(_)))
    }
    /// The store failed.
    pub fn is_store(&self) -> bool {
        matches!(self, Self::Store(_))
    }
    pub fn is_inner(&self) -> bool {
        matches!(self, Self::Inner(_))
    }
    /// Borrow the rejection, if any.
    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Self::Rejected(r) => Some(r),
            _ => None,
        }
    }
    /// Extract the dispatcher error.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}
