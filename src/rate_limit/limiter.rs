use crate::clock::{Clock, SystemClock};
use crate::dynamic::DynamicConfig;
use crate::error::{ConfigError, StoreError};
use crate::mutex::KeyedLocks;
use crate::rate_limit::store::DEFAULT_SWEEP_INTERVAL;
use crate::rate_limit::{
    ConsumeResult, LimitConfig, MemoryStore, RateLimitResult, RateLimitStore, RateLimiterConfig,
    RequestContext, Scope, TokenBucket, ANONYMOUS,
};
use crate::sweep::{self, SweepHandle};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

/// Maps a request to the identity its user/action buckets are keyed on.
pub type Identify = Arc<dyn Fn(&RequestContext) -> String + Send + Sync>;

/// Bucket key of the global scope.
pub const GLOBAL_KEY: &str = "global";

/// Default identity: the caller's IP, else [`ANONYMOUS`].
pub fn identify_by_ip(ctx: &RequestContext) -> String {
    ctx.ip.clone().filter(|ip| !ip.is_empty()).unwrap_or_else(|| ANONYMOUS.to_string())
}

/// Snapshot returned by [`RateLimiter::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimiterStats {
    /// Buckets cached in this process.
    pub active_buckets: usize,
    /// Per-key mutexes alive in this process.
    pub active_locks: usize,
    /// Entries reported by the store.
    pub store_size: usize,
}

/// A cached bucket and the epoch millis after which its store entry has lapsed.
#[derive(Debug, Clone, Copy)]
struct CachedBucket {
    bucket: TokenBucket,
    expires_at: u64,
}

/// Per-process bucket cache and lock registry, shared with the eviction sweeper.
#[derive(Debug, Default)]
struct LocalState {
    locks: KeyedLocks,
    buckets: RwLock<HashMap<String, CachedBucket>>,
}

impl LocalState {
    /// Forget buckets whose store TTL has passed, then every lock left without a bucket.
    async fn evict_expired(&self, now: u64) -> usize {
        let evicted = {
            let mut buckets = self.buckets.write().await;
            let before = buckets.len();
            buckets.retain(|_, cached| cached.expires_at > now);
            before - buckets.len()
        };
        let buckets = self.buckets.read().await;
        self.locks.prune_idle(|key| buckets.contains_key(key)).await;
        evicted
    }

    async fn clear(&self) {
        self.buckets.write().await.clear();
        self.locks.clear().await;
    }
}

/// Hierarchical token-bucket limiter.
///
/// Scopes are checked global → per-user → per-action and the first refusal wins. Each scope
/// check is one critical section under that bucket key's mutex: load (cache, then store, then a
/// fresh bucket), consume one token, persist with a TTL of twice the window. Concurrent calls on
/// the same key therefore never over-admit; calls on different keys run in parallel.
///
/// A refused call keeps the tokens it already took from earlier scopes.
///
/// Cached buckets and their mutexes are dropped once the bucket's store TTL has passed, either
/// by a background sweep (started when built inside a tokio runtime) or by
/// [`evict_expired`](Self::evict_expired).
pub struct RateLimiter {
    config: RateLimiterConfig,
    trusted: DynamicConfig<HashSet<String>>,
    identify: Identify,
    store: Arc<dyn RateLimitStore>,
    clock: Arc<dyn Clock>,
    local: Arc<LocalState>,
    sweeper: Mutex<Option<SweepHandle>>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("global", &self.config.global)
            .field("per_user", &self.config.per_user)
            .field("per_action", &self.config.per_action)
            .field("store", &self.store)
            .field("identify", &"<fn>")
            .finish()
    }
}

impl RateLimiter {
    pub fn builder() -> RateLimiterBuilder {
        RateLimiterBuilder::new()
    }

    /// Limiter over an in-memory store with IP-based identity.
    pub fn new(config: RateLimiterConfig) -> Result<Self, ConfigError> {
        Self::builder().config(config).build()
    }

    /// Decide whether the call described by `ctx` may proceed.
    pub async fn check(&self, ctx: &RequestContext) -> Result<RateLimitResult, StoreError> {
        let identity = (self.identify)(ctx);
        if self.trusted.get().contains(&identity) {
            debug!(target: "actionguard::rate_limit", identity = %identity, "trusted identity bypass");
            return Ok(RateLimitResult::unconditional());
        }

        let mut most_specific = None;

        if let Some(limit) = &self.config.global {
            let outcome = self.check_bucket(GLOBAL_KEY, limit).await?;
            if !outcome.allowed {
                return Ok(self.refuse("Global rate limit exceeded", Scope::Global, limit, outcome));
            }
            most_specific = Some(self.admit(Scope::Global, limit, outcome));
        }

        if let Some(limit) = &self.config.per_user {
            let key = format!("user:{identity}");
            let outcome = self.check_bucket(&key, limit).await?;
            if !outcome.allowed {
                return Ok(self.refuse("User rate limit exceeded", Scope::User, limit, outcome));
            }
            most_specific = Some(self.admit(Scope::User, limit, outcome));
        }

        if let Some(action_id) = ctx.action_id.as_deref() {
            if let Some(limit) = self.config.action_limit(action_id) {
                let key = format!("action:{action_id}:{identity}");
                let outcome = self.check_bucket(&key, limit).await?;
                if !outcome.allowed {
                    let reason = format!("Rate limit exceeded for action '{action_id}'");
                    return Ok(self.refuse(reason, Scope::Action, limit, outcome));
                }
                return Ok(self.admit(Scope::Action, limit, outcome));
            }
        }

        Ok(most_specific.unwrap_or_else(RateLimitResult::unconditional))
    }

    /// One atomic read-decide-mutate-persist cycle for `key`.
    async fn check_bucket(
        &self,
        key: &str,
        limit: &LimitConfig,
    ) -> Result<ConsumeResult, StoreError> {
        let lock = self.local.locks.get_or_create(key).await;
        lock.lock(|| async {
            let now = self.clock.now_millis();
            let cached = self.local.buckets.read().await.get(key).map(|c| c.bucket);
            let mut bucket = match cached {
                Some(bucket) => bucket,
                None => self.load_bucket(key, limit, now).await?,
            };

            let outcome = bucket.consume(1, now);
            let ttl = limit.ttl();
            self.store.set(key, bucket.to_json()?, Some(ttl)).await?;
            let expires_at = now.saturating_add(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX));
            self.local
                .buckets
                .write()
                .await
                .insert(key.to_string(), CachedBucket { bucket, expires_at });
            Ok::<_, StoreError>(outcome)
        })
        .await
    }

    async fn load_bucket(
        &self,
        key: &str,
        limit: &LimitConfig,
        now: u64,
    ) -> Result<TokenBucket, StoreError> {
        match self.store.get(key).await? {
            None => Ok(TokenBucket::from_limit(limit, now)),
            Some(raw) => match TokenBucket::from_json(key, &raw) {
                Ok(bucket) => Ok(bucket),
                Err(err) => {
                    warn!(target: "actionguard::rate_limit", key = %key, error = %err, "discarding unreadable bucket state");
                    Ok(TokenBucket::from_limit(limit, now))
                }
            },
        }
    }

    fn admit(&self, scope: Scope, limit: &LimitConfig, outcome: ConsumeResult) -> RateLimitResult {
        RateLimitResult::allowed(scope, outcome.remaining, outcome.reset_at, limit.max_requests)
    }

    fn refuse(
        &self,
        reason: impl Into<String>,
        scope: Scope,
        limit: &LimitConfig,
        outcome: ConsumeResult,
    ) -> RateLimitResult {
        let wait_ms = outcome.reset_at.saturating_sub(self.clock.now_millis());
        let reason = reason.into();
        debug!(target: "actionguard::rate_limit", scope = %scope, reason = %reason, wait_ms, "request refused");
        RateLimitResult::denied(
            reason,
            scope,
            Duration::from_millis(wait_ms),
            outcome.reset_at,
            limit.max_requests,
        )
    }

    /// Forget one bucket (e.g. `"user:10.0.0.1"`) locally and in the store.
    pub async fn reset(&self, key: &str) -> Result<(), StoreError> {
        self.local.buckets.write().await.remove(key);
        self.local.locks.remove(key).await;
        self.store.delete(key).await
    }

    /// Forget every bucket.
    pub async fn clear(&self) -> Result<(), StoreError> {
        self.local.clear().await;
        self.store.clear().await
    }

    /// Drop cached buckets whose store TTL has passed, with their idle mutexes. Returns how
    /// many buckets were dropped.
    pub async fn evict_expired(&self) -> usize {
        self.local.evict_expired(self.clock.now_millis()).await
    }

    pub async fn stats(&self) -> Result<RateLimiterStats, StoreError> {
        Ok(RateLimiterStats {
            active_buckets: self.local.buckets.read().await.len(),
            active_locks: self.local.locks.len().await,
            store_size: self.store.size().await?,
        })
    }

    /// Whether the background cache sweep is active.
    pub async fn is_sweeping(&self) -> bool {
        self.sweeper.lock().await.as_ref().is_some_and(SweepHandle::is_running)
    }

    /// Stop the cache sweep, drop cached state and dispose the store.
    pub async fn dispose(&self) -> Result<(), StoreError> {
        if let Some(mut handle) = self.sweeper.lock().await.take() {
            handle.cancel();
        }
        self.local.clear().await;
        self.store.dispose().await
    }

    /// Live handle on the trusted-identity allowlist.
    pub fn trusted(&self) -> DynamicConfig<HashSet<String>> {
        self.trusted.clone()
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }
}

/// Builder for [`RateLimiter`].
pub struct RateLimiterBuilder {
    config: RateLimiterConfig,
    identify: Identify,
    store: Option<Arc<dyn RateLimitStore>>,
    clock: Arc<dyn Clock>,
    sweep_interval: Duration,
}

impl Default for RateLimiterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiterBuilder {
    pub fn new() -> Self {
        Self {
            config: RateLimiterConfig::default(),
            identify: Arc::new(identify_by_ip),
            store: None,
            clock: Arc::new(SystemClock),
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }

    /// Replace all scope settings at once.
    pub fn config(mut self, config: RateLimiterConfig) -> Self {
        self.config = config;
        self
    }

    pub fn global(mut self, limit: LimitConfig) -> Self {
        self.config.global = Some(limit);
        self
    }

    pub fn per_user(mut self, limit: LimitConfig) -> Self {
        self.config.per_user = Some(limit);
        self
    }

    /// Limit for one action id; use [`DEFAULT_ACTION`](crate::rate_limit::DEFAULT_ACTION) for the
    /// fallback.
    pub fn per_action(mut self, action_id: impl Into<String>, limit: LimitConfig) -> Self {
        self.config.per_action.insert(action_id.into(), limit);
        self
    }

    pub fn trust<I, S>(mut self, identities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.trusted.extend(identities.into_iter().map(Into::into));
        self
    }

    /// Custom identity extraction (defaults to [`identify_by_ip`]).
    pub fn identify<F>(mut self, f: F) -> Self
    where
        F: Fn(&RequestContext) -> String + Send + Sync + 'static,
    {
        self.identify = Arc::new(f);
        self
    }

    /// Persist buckets somewhere other than a private in-memory store.
    pub fn store(mut self, store: Arc<dyn RateLimitStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Override the clock (useful for deterministic tests).
    pub fn clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// How often expired buckets are dropped from the in-process cache.
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn build(self) -> Result<RateLimiter, ConfigError> {
        self.config.validate()?;
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::ZeroDuration { field: "sweep_interval" });
        }
        let store: Arc<dyn RateLimitStore> = match self.store {
            Some(store) => store,
            None => Arc::new(
                MemoryStore::builder()
                    .shared_clock(self.clock.clone())
                    .sweep_interval(self.sweep_interval)
                    .build()?,
            ),
        };
        let trusted = DynamicConfig::new(self.config.trusted.clone());
        let local = Arc::new(LocalState::default());
        let clock = self.clock.clone();
        let sweeper = sweep::spawn(Arc::downgrade(&local), self.sweep_interval, move |local| {
            let now = clock.now_millis();
            async move {
                let evicted = local.evict_expired(now).await;
                if evicted > 0 {
                    debug!(target: "actionguard::rate_limit", evicted, "evicted expired buckets");
                }
            }
        });
        Ok(RateLimiter {
            config: self.config,
            trusted,
            identify: self.identify,
            store,
            clock: self.clock,
            local,
            sweeper: Mutex::new(sweeper),
        })
    }
}
