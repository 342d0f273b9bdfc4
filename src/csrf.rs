//! Signed, time-limited CSRF tokens.
//!
//! A token is `<timestamp_ms>.<random>.<signature>` where `random` is 128 bits of hex and
//! `signature` is hex `HMAC-SHA256(secret, "<timestamp_ms>.<random>")`. The store remembers
//! every token it issued along with whether it has been used, so tokens can be made single-use.
//!
//! # Timing
//!
//! [`CsrfTokenStore::validate`] runs every check on every call: the signature is recomputed
//! and compared in constant time even for malformed or expired input, and the store lookup
//! always happens. Only after all checks have run is the first failing one picked as the
//! reason, so response time does not reveal which check failed.
//!
//! ```rust
//! use actionguard::csrf::{CsrfTokenStore, GenerateOptions, ValidateOptions};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let store = CsrfTokenStore::builder("a-secret-of-at-least-thirty-two-bytes!!")
//!     .single_use(true)
//!     .build()
//!     .unwrap();
//! let token = store.generate(GenerateOptions::default()).await;
//! assert!(store.validate(&token, ValidateOptions::default()).await.valid);
//! assert!(!store.validate(&token, ValidateOptions::default()).await.valid);
//! # });
//! ```

use crate::clock::{Clock, SystemClock};
use crate::error::ConfigError;
use crate::sweep::{self, SweepHandle};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::Deserialize;
use sha2::Sha256;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio::sync::Mutex;
use tracing::{debug, warn};

type HmacSha256 = Hmac<Sha256>;

/// Secrets shorter than this are accepted but logged.
pub const RECOMMENDED_SECRET_LEN: usize = 32;
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_MAX_TOKENS: usize = 10_000;

const RANDOM_BYTES: usize = 16;

/// Why a token was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CsrfFailure {
    MissingToken,
    InvalidFormat,
    Expired,
    InvalidSignature,
    UnknownToken,
    TokenAlreadyUsed,
}

impl CsrfFailure {
    /// Machine-readable reason code.
    pub fn as_str(self) -> &'static str {
        match self {
            CsrfFailure::MissingToken => "MISSING_TOKEN",
            CsrfFailure::InvalidFormat => "INVALID_FORMAT",
            CsrfFailure::Expired => "EXPIRED",
            CsrfFailure::InvalidSignature => "INVALID_SIGNATURE",
            CsrfFailure::UnknownToken => "UNKNOWN_TOKEN",
            CsrfFailure::TokenAlreadyUsed => "TOKEN_ALREADY_USED",
        }
    }
}

impl fmt::Display for CsrfFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of [`CsrfTokenStore::validate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CsrfValidation {
    pub valid: bool,
    pub reason: Option<CsrfFailure>,
    /// Set when the token was rejected for age.
    pub expired: bool,
}

impl CsrfValidation {
    pub fn ok() -> Self {
        Self { valid: true, reason: None, expired: false }
    }

    pub fn invalid(reason: CsrfFailure) -> Self {
        Self { valid: false, reason: Some(reason), expired: reason == CsrfFailure::Expired }
    }
}

/// Per-call options for [`CsrfTokenStore::generate`].
#[derive(Debug, Clone, Copy, Default)]
pub struct GenerateOptions {
    /// Lifetime of this token; defaults to the store's configured lifetime.
    pub expires_in: Option<Duration>,
}

/// Per-call options for [`CsrfTokenStore::validate`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidateOptions {
    /// Enforce single use for this call; defaults to the store's `single_use` setting.
    pub rotate_on_use: Option<bool>,
}

/// CSRF store settings, loadable from configuration files.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CsrfConfig {
    pub secret: String,
    #[serde(default = "default_expires_in_ms")]
    pub expires_in_ms: u64,
    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    /// Reject a token's second successful use.
    #[serde(default)]
    pub single_use: bool,
}

fn default_expires_in_ms() -> u64 {
    DEFAULT_TOKEN_TTL.as_millis() as u64
}

fn default_cleanup_interval_ms() -> u64 {
    DEFAULT_CLEANUP_INTERVAL.as_millis() as u64
}

fn default_max_tokens() -> usize {
    DEFAULT_MAX_TOKENS
}

impl fmt::Debug for CsrfConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CsrfConfig")
            .field("secret", &"<redacted>")
            .field("expires_in_ms", &self.expires_in_ms)
            .field("cleanup_interval_ms", &self.cleanup_interval_ms)
            .field("max_tokens", &self.max_tokens)
            .field("single_use", &self.single_use)
            .finish()
    }
}

impl CsrfConfig {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            expires_in_ms: default_expires_in_ms(),
            cleanup_interval_ms: default_cleanup_interval_ms(),
            max_tokens: DEFAULT_MAX_TOKENS,
            single_use: false,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.secret.is_empty() {
            return Err(ConfigError::EmptySecret);
        }
        if self.expires_in_ms == 0 {
            return Err(ConfigError::ZeroDuration { field: "expires_in" });
        }
        if self.cleanup_interval_ms == 0 {
            return Err(ConfigError::ZeroDuration { field: "cleanup_interval" });
        }
        if self.max_tokens == 0 {
            return Err(ConfigError::ZeroCapacity { field: "max_tokens" });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct TokenMeta {
    timestamp: u64,
    used: bool,
    expires_in: u64,
}

impl TokenMeta {
    fn is_stale(&self, now: u64) -> bool {
        now.saturating_sub(self.timestamp) > self.expires_in
    }
}

struct CsrfInner {
    mac: HmacSha256,
    tokens: Mutex<HashMap<String, TokenMeta>>,
    clock: Arc<dyn Clock>,
    expires_in: u64,
    max_tokens: usize,
    single_use: bool,
}

impl CsrfInner {
    fn sign(&self, payload: &str) -> String {
        let mut mac = self.mac.clone();
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    async fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let mut tokens = self.tokens.lock().await;
        let before = tokens.len();
        tokens.retain(|_, meta| !meta.is_stale(now));
        before - tokens.len()
    }
}

/// Issues and validates CSRF tokens.
pub struct CsrfTokenStore {
    inner: Arc<CsrfInner>,
    sweeper: Mutex<Option<SweepHandle>>,
}

impl fmt::Debug for CsrfTokenStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CsrfTokenStore")
            .field("expires_in_ms", &self.inner.expires_in)
            .field("max_tokens", &self.inner.max_tokens)
            .field("single_use", &self.inner.single_use)
            .finish_non_exhaustive()
    }
}

impl CsrfTokenStore {
    pub fn builder(secret: impl Into<String>) -> CsrfTokenStoreBuilder {
        CsrfTokenStoreBuilder::new(CsrfConfig::new(secret))
    }

    /// Store on the system clock.
    pub fn new(config: CsrfConfig) -> Result<Self, ConfigError> {
        CsrfTokenStoreBuilder::new(config).build()
    }

    /// Issue and remember a new token.
    pub async fn generate(&self, options: GenerateOptions) -> String {
        let now = self.inner.clock.now_millis();
        let mut random = [0u8; RANDOM_BYTES];
        rand::rng().fill_bytes(&mut random);
        let payload = format!("{now}.{}", hex::encode(random));
        let token = format!("{payload}.{}", self.inner.sign(&payload));

        let expires_in = options
            .expires_in
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(self.inner.expires_in);

        let mut tokens = self.inner.tokens.lock().await;
        tokens.insert(token.clone(), TokenMeta { timestamp: now, used: false, expires_in });
        if tokens.len() > self.inner.max_tokens {
            Self::enforce_capacity(&mut tokens, now, self.inner.max_tokens);
        }
        token
    }

    /// Purge stale tokens, then evict the oldest until the store fits `max_tokens`.
    fn enforce_capacity(tokens: &mut HashMap<String, TokenMeta>, now: u64, max_tokens: usize) {
        tokens.retain(|_, meta| !meta.is_stale(now));
        if tokens.len() <= max_tokens {
            return;
        }
        let excess = tokens.len() - max_tokens;
        let mut by_age: Vec<(u64, String)> =
            tokens.iter().map(|(token, meta)| (meta.timestamp, token.clone())).collect();
        by_age.sort_unstable();
        for (_, token) in by_age.into_iter().take(excess) {
            tokens.remove(&token);
        }
        warn!(target: "actionguard::csrf", evicted = excess, max_tokens, "csrf token store over capacity; evicted oldest tokens");
    }

    /// Check `token`. Never returns early: see the module docs.
    pub async fn validate(&self, token: &str, options: ValidateOptions) -> CsrfValidation {
        let now = self.inner.clock.now_millis();
        let missing = token.is_empty();

        let parts: Vec<&str> = token.split('.').collect();
        let well_formed = parts.len() == 3;
        let (timestamp_part, random_part, signature_part) =
            if well_formed { (parts[0], parts[1], parts[2]) } else { ("", "", "") };
        let timestamp = timestamp_part.parse::<u64>().ok();

        let expected = self.inner.sign(&format!("{timestamp_part}.{random_part}"));
        let signature_ok: bool = expected.as_bytes().ct_eq(signature_part.as_bytes()).into();

        let mut tokens = self.inner.tokens.lock().await;
        let stored = tokens.get(token).copied();

        let expires_in = stored.map_or(self.inner.expires_in, |meta| meta.expires_in);
        // An unparseable timestamp has infinite age.
        let expired = timestamp.map_or(true, |ts| now.saturating_sub(ts) > expires_in);
        let single_use = options.rotate_on_use.unwrap_or(self.inner.single_use);
        let already_used = single_use && stored.is_some_and(|meta| meta.used);

        let failure = if missing {
            Some(CsrfFailure::MissingToken)
        } else if !well_formed || timestamp.is_none() {
            Some(CsrfFailure::InvalidFormat)
        } else if expired {
            Some(CsrfFailure::Expired)
        } else if !signature_ok {
            Some(CsrfFailure::InvalidSignature)
        } else if stored.is_none() {
            Some(CsrfFailure::UnknownToken)
        } else if already_used {
            Some(CsrfFailure::TokenAlreadyUsed)
        } else {
            None
        };

        match failure {
            Some(reason) => {
                if reason == CsrfFailure::Expired {
                    tokens.remove(token);
                }
                debug!(target: "actionguard::csrf", reason = %reason, "csrf token rejected");
                CsrfValidation::invalid(reason)
            }
            None => {
                if let Some(meta) = tokens.get_mut(token) {
                    meta.used = true;
                }
                CsrfValidation::ok()
            }
        }
    }

    /// Forget `token`; returns whether it was known.
    pub async fn invalidate(&self, token: &str) -> bool {
        self.inner.tokens.lock().await.remove(token).is_some()
    }

    /// Invalidate `token` and issue its replacement.
    pub async fn rotate(&self, token: &str, options: GenerateOptions) -> String {
        self.invalidate(token).await;
        self.generate(options).await
    }

    pub async fn clear(&self) {
        self.inner.tokens.lock().await.clear();
    }

    /// Tokens currently remembered, including any not yet swept.
    pub async fn len(&self) -> usize {
        self.inner.tokens.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drop stale tokens now; returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        self.inner.purge_expired().await
    }

    /// Stop the background sweep.
    pub async fn dispose(&self) {
        if let Some(mut handle) = self.sweeper.lock().await.take() {
            handle.cancel();
        }
    }
}

/// Builder for [`CsrfTokenStore`].
pub struct CsrfTokenStoreBuilder {
    config: CsrfConfig,
    clock: Arc<dyn Clock>,
}

impl CsrfTokenStoreBuilder {
    pub fn new(config: CsrfConfig) -> Self {
        Self { config, clock: Arc::new(SystemClock) }
    }

    pub fn expires_in(mut self, ttl: Duration) -> Self {
        self.config.expires_in_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.config.cleanup_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn max_tokens(mut self, max: usize) -> Self {
        self.config.max_tokens = max;
        self
    }

    pub fn single_use(mut self, enabled: bool) -> Self {
        self.config.single_use = enabled;
        self
    }

    /// Override the clock (useful for deterministic tests).
    pub fn clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn build(self) -> Result<CsrfTokenStore, ConfigError> {
        let config = self.config;
        config.validate()?;
        if config.secret.len() < RECOMMENDED_SECRET_LEN {
            warn!(
                target: "actionguard::csrf",
                len = config.secret.len(),
                recommended = RECOMMENDED_SECRET_LEN,
                "csrf secret is shorter than recommended"
            );
        }
        // HMAC accepts keys of any length; the error arm is unreachable in practice.
        let mac = <HmacSha256 as Mac>::new_from_slice(config.secret.as_bytes())
            .map_err(|_| ConfigError::EmptySecret)?;

        let inner = Arc::new(CsrfInner {
            mac,
            tokens: Mutex::new(HashMap::new()),
            clock: self.clock,
            expires_in: config.expires_in_ms,
            max_tokens: config.max_tokens,
            single_use: config.single_use,
        });
        let sweeper = sweep::spawn(
            Arc::downgrade(&inner),
            Duration::from_millis(config.cleanup_interval_ms),
            |inner| async move {
                let purged = inner.purge_expired().await;
                if purged > 0 {
                    debug!(target: "actionguard::csrf", purged, "swept expired csrf tokens");
                }
            },
        );
        Ok(CsrfTokenStore { inner, sweeper: Mutex::new(sweeper) })
    }
}
