//! Scoped token-bucket rate limiting.
//!
//! - [`RateLimiter`]: checks the global, per-user, and per-action scopes in that order.
//! - [`TokenBucket`]: the refill/consume math for one bucket key.
//! - [`RateLimitStore`]: where bucket state lives between calls ([`MemoryStore`] in-process,
//!   [`DistributedStore`] over any shared key-value backend).
//!
//! # Architecture
//!
//! - **Orchestration**: `RateLimiter` resolves a request to bucket keys and runs one critical
//!   section per key (`"global"`, `"user:<id>"`, `"action:<action>:<id>"`).
//! - **Logic**: `TokenBucket` only does arithmetic; it never touches I/O.
//! - **Storage**: stores keep JSON bucket state with a TTL of twice the scope window, so a
//!   bucket is never evicted while it is still refilling.

use crate::error::ConfigError;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;

pub mod bucket;
pub mod distributed;
pub mod limiter;
pub mod store;

pub use bucket::{ConsumeResult, TokenBucket};
pub use distributed::{sanitize_key, DistributedStore, DistributedStoreBuilder, KeyValueClient};
pub use limiter::{Identify, RateLimiter, RateLimiterBuilder, RateLimiterStats};
pub use store::{MemoryStore, MemoryStoreBuilder, RateLimitStore};

/// Fallback identity when the request carries nothing identifying.
pub const ANONYMOUS: &str = "anonymous";

/// Per-action limit used when an action has no entry of its own.
pub const DEFAULT_ACTION: &str = "default";

/// Which limit produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Global,
    User,
    Action,
}

impl Scope {
    pub fn as_str(self) -> &'static str {
        match self {
            Scope::Global => "global",
            Scope::User => "user",
            Scope::Action => "action",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One limit definition: `max_requests` per `window_ms`.
///
/// Unless `refill_rate` is given, the bucket refills at `max_requests / window` tokens per
/// second, which caps steady-state throughput at the configured rate.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitConfig {
    pub max_requests: u32,
    pub window_ms: u64,
    #[serde(default)]
    pub refill_rate: Option<f64>,
}

impl LimitConfig {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window_ms: u64::try_from(window.as_millis()).unwrap_or(u64::MAX),
            refill_rate: None,
        }
    }

    /// Override the refill rate in tokens per second.
    pub fn with_refill_rate(mut self, tokens_per_sec: f64) -> Self {
        self.refill_rate = Some(tokens_per_sec);
        self
    }

    /// Reject limits that would make the bucket math meaningless.
    pub fn validate(&self, scope: &str) -> Result<(), ConfigError> {
        if self.max_requests == 0 {
            return Err(ConfigError::InvalidMaxRequests {
                scope: scope.to_string(),
                provided: self.max_requests,
            });
        }
        if self.window_ms == 0 {
            return Err(ConfigError::InvalidWindow { scope: scope.to_string(), provided: 0 });
        }
        if let Some(rate) = self.refill_rate {
            if !rate.is_finite() || rate <= 0.0 {
                return Err(ConfigError::InvalidRefillRate {
                    scope: scope.to_string(),
                    provided: rate,
                });
            }
        }
        Ok(())
    }

    /// Tokens added per second.
    pub fn effective_refill_rate(&self) -> f64 {
        self.refill_rate
            .unwrap_or_else(|| f64::from(self.max_requests) / (self.window_ms as f64 / 1000.0))
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Store TTL for buckets of this scope.
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.window_ms.saturating_mul(2))
    }
}

/// Limits for every scope plus the trusted-identity allowlist.
///
/// Deserializes from the camelCase shape deployments already use:
///
/// ```rust
/// use actionguard::rate_limit::RateLimiterConfig;
///
/// let cfg: RateLimiterConfig = serde_json::from_str(r#"{
///     "global": { "maxRequests": 1000, "windowMs": 60000 },
///     "perAction": { "default": { "maxRequests": 30, "windowMs": 60000 } },
///     "trusted": ["10.0.0.1"]
/// }"#).unwrap();
/// cfg.validate().unwrap();
/// assert!(cfg.per_user.is_none());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimiterConfig {
    #[serde(default)]
    pub global: Option<LimitConfig>,
    #[serde(default)]
    pub per_user: Option<LimitConfig>,
    #[serde(default)]
    pub per_action: HashMap<String, LimitConfig>,
    #[serde(default)]
    pub trusted: HashSet<String>,
}

impl RateLimiterConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(global) = &self.global {
            global.validate("global")?;
        }
        if let Some(user) = &self.per_user {
            user.validate("perUser")?;
        }
        for (action, limit) in &self.per_action {
            limit.validate(&format!("perAction.{action}"))?;
        }
        Ok(())
    }

    /// Limit for `action_id`, falling back to the `"default"` entry.
    pub fn action_limit(&self, action_id: &str) -> Option<&LimitConfig> {
        self.per_action.get(action_id).or_else(|| self.per_action.get(DEFAULT_ACTION))
    }
}

/// What the transport adapter knows about an inbound action call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub action_id: Option<String>,
    pub ip: Option<String>,
    pub user_id: Option<String>,
    /// Adapter-defined extras available to custom identify functions.
    pub attributes: HashMap<String, String>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn action(mut self, action_id: impl Into<String>) -> Self {
        self.action_id = Some(action_id.into());
        self
    }

    pub fn ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// Outcome of [`RateLimiter::check`].
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitResult {
    pub allowed: bool,
    /// Human-readable denial reason, e.g. `"User rate limit exceeded"`.
    pub reason: Option<String>,
    /// Scope that decided the outcome; `None` when no scope applied.
    pub scope: Option<Scope>,
    /// How long to wait before retrying. Set on denial only.
    pub retry_after: Option<Duration>,
    /// Whole tokens left in the deciding bucket.
    pub remaining: Option<u32>,
    /// Epoch millis at which the deciding bucket recovers.
    pub reset_at: Option<u64>,
    /// `max_requests` of the deciding scope.
    pub limit: Option<u32>,
}

impl RateLimitResult {
    /// Success with no limit attached (trusted caller, or nothing configured).
    pub fn unconditional() -> Self {
        Self {
            allowed: true,
            reason: None,
            scope: None,
            retry_after: None,
            remaining: None,
            reset_at: None,
            limit: None,
        }
    }

    pub fn allowed(scope: Scope, remaining: u32, reset_at: u64, limit: u32) -> Self {
        Self {
            allowed: true,
            reason: None,
            scope: Some(scope),
            retry_after: None,
            remaining: Some(remaining),
            reset_at: Some(reset_at),
            limit: Some(limit),
        }
    }

    pub fn denied(
        reason: impl Into<String>,
        scope: Scope,
        retry_after: Duration,
        reset_at: u64,
        limit: u32,
    ) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
            scope: Some(scope),
            retry_after: Some(retry_after),
            remaining: Some(0),
            reset_at: Some(reset_at),
            limit: Some(limit),
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.allowed
    }

    /// `retry_after` rounded up to whole seconds, as sent in `Retry-After`.
    pub fn retry_after_secs(&self) -> Option<u64> {
        self.retry_after.map(|d| d.as_secs() + u64::from(d.subsec_nanos() > 0))
    }
}
