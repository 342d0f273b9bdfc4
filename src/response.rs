//! What a transport adapter sends back when a call is refused.
//!
//! The guard itself is transport-agnostic; this module renders its decisions into status
//! codes, error codes, and header pairs an HTTP (or RPC) adapter can copy verbatim.

use crate::csrf::CsrfValidation;
use crate::rate_limit::RateLimitResult;
use chrono::{DateTime, SecondsFormat};
use std::fmt;
use std::time::Duration;

pub const RATE_LIMIT_EXCEEDED: &str = "RATE_LIMIT_EXCEEDED";
pub const CSRF_INVALID: &str = "CSRF_INVALID";

pub const STATUS_TOO_MANY_REQUESTS: u16 = 429;
pub const STATUS_FORBIDDEN: u16 = 403;

pub const RETRY_AFTER: &str = "Retry-After";
pub const X_RATELIMIT_LIMIT: &str = "X-RateLimit-Limit";
pub const X_RATELIMIT_REMAINING: &str = "X-RateLimit-Remaining";
pub const X_RATELIMIT_RESET: &str = "X-RateLimit-Reset";
pub const X_CSRF_TOKEN: &str = "X-CSRF-Token";
pub const CSRF_COOKIE_NAME: &str = "csrf_token";

/// A refused call.
#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    RateLimited(RateLimitResult),
    CsrfInvalid(CsrfValidation),
}

impl Rejection {
    pub fn status(&self) -> u16 {
        match self {
            Rejection::RateLimited(_) => STATUS_TOO_MANY_REQUESTS,
            Rejection::CsrfInvalid(_) => STATUS_FORBIDDEN,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Rejection::RateLimited(_) => RATE_LIMIT_EXCEEDED,
            Rejection::CsrfInvalid(_) => CSRF_INVALID,
        }
    }

    /// Human-readable message for the response body.
    pub fn message(&self) -> String {
        match self {
            Rejection::RateLimited(result) => {
                result.reason.clone().unwrap_or_else(|| "Rate limit exceeded".to_string())
            }
            Rejection::CsrfInvalid(validation) => match validation.reason {
                Some(reason) => format!("Invalid CSRF token: {reason}"),
                None => "Invalid CSRF token".to_string(),
            },
        }
    }

    /// Headers to attach to the refusal.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        match self {
            Rejection::RateLimited(result) => rate_limit_headers(result),
            Rejection::CsrfInvalid(_) => Vec::new(),
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code(), self.message())
    }
}

/// `Retry-After` and `X-RateLimit-*` headers for a limiter decision.
///
/// Fields the decision does not carry are skipped, so an unconditional admit yields no headers.
/// `Retry-After` is whole seconds rounded up; `X-RateLimit-Reset` is ISO-8601 UTC.
pub fn rate_limit_headers(result: &RateLimitResult) -> Vec<(&'static str, String)> {
    let mut headers = Vec::with_capacity(4);
    if !result.allowed {
        if let Some(secs) = result.retry_after_secs() {
            headers.push((RETRY_AFTER, secs.to_string()));
        }
    }
    if let Some(limit) = result.limit {
        headers.push((X_RATELIMIT_LIMIT, limit.to_string()));
    }
    if let Some(remaining) = result.remaining {
        headers.push((X_RATELIMIT_REMAINING, remaining.to_string()));
    }
    if let Some(reset) = result.reset_at.and_then(iso8601_millis) {
        headers.push((X_RATELIMIT_RESET, reset));
    }
    headers
}

fn iso8601_millis(epoch_ms: u64) -> Option<String> {
    let ms = i64::try_from(epoch_ms).ok()?;
    DateTime::from_timestamp_millis(ms).map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// Double-submit cookie carrying a CSRF token.
///
/// Not `HttpOnly`: client script must read it back into the `X-CSRF-Token` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsrfCookie {
    pub token: String,
    pub secure: bool,
    pub max_age: Option<Duration>,
    pub path: String,
}

impl CsrfCookie {
    /// `secure` should be true in production.
    pub fn new(token: impl Into<String>, secure: bool) -> Self {
        Self { token: token.into(), secure, max_age: None, path: "/".to_string() }
    }

    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Value for a `Set-Cookie` header.
    pub fn to_header_value(&self) -> String {
        let mut value = format!("{CSRF_COOKIE_NAME}={}; Path={}; SameSite=Strict", self.token, self.path);
        if let Some(max_age) = self.max_age {
            value.push_str(&format!("; Max-Age={}", max_age.as_secs()));
        }
        if self.secure {
            value.push_str("; Secure");
        }
        value
    }
}

/// Headers that hand a freshly rotated token back to the client.
pub fn rotated_token_headers(cookie: &CsrfCookie) -> Vec<(&'static str, String)> {
    vec![(X_CSRF_TOKEN, cookie.token.clone()), ("Set-Cookie", cookie.to_header_value())]
}
