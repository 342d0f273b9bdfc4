use crate::clock::{Clock, SystemClock};
use crate::error::{ConfigError, StoreError};
use crate::sweep::{self, SweepHandle};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

/// Abstract storage interface for rate limit state.
///
/// Values are serialized [`TokenBucket`](crate::rate_limit::TokenBucket) JSON. Backends may be
/// in-process or remote; every call may suspend, and backend failures come back as
/// [`StoreError`] rather than being masked.
#[async_trait]
pub trait RateLimitStore: Send + Sync + std::fmt::Debug {
    /// Fetch the value for `key`, or `None` if absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write `value` under `key`. `ttl` of `None` means no expiry.
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Remove every entry this store owns.
    async fn clear(&self) -> Result<(), StoreError>;

    /// Number of live entries.
    async fn size(&self) -> Result<usize, StoreError>;

    /// Release background tasks and connections. The store must not be used afterwards.
    async fn dispose(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Default interval between expiry sweeps of a [`MemoryStore`].
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<u64>,
}

impl Entry {
    fn is_expired(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

#[derive(Debug)]
struct MemoryInner {
    entries: RwLock<HashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
}

impl MemoryInner {
    async fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        before - entries.len()
    }
}

/// In-process store with lazily checked expiry and a periodic sweep.
///
/// Expired entries are never returned from [`get`](RateLimitStore::get). A background sweep,
/// started when the store is built inside a tokio runtime, reclaims entries nobody reads again.
#[derive(Debug)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
    sweeper: Mutex<Option<SweepHandle>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Store on the system clock with the default sweep interval.
    pub fn new() -> Self {
        Self::from_parts(Arc::new(SystemClock), DEFAULT_SWEEP_INTERVAL)
    }

    pub fn builder() -> MemoryStoreBuilder {
        MemoryStoreBuilder::new()
    }

    fn from_parts(clock: Arc<dyn Clock>, sweep_interval: Duration) -> Self {
        let inner = Arc::new(MemoryInner { entries: RwLock::new(HashMap::new()), clock });
        let sweeper = sweep::spawn(Arc::downgrade(&inner), sweep_interval, |inner| async move {
            let purged = inner.purge_expired().await;
            if purged > 0 {
                debug!(target: "actionguard::store", purged, "swept expired rate limit entries");
            }
        });
        Self { inner, sweeper: Mutex::new(sweeper) }
    }

    /// Drop every expired entry now; returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        self.inner.purge_expired().await
    }

    /// Whether a background sweeper is active.
    pub async fn is_sweeping(&self) -> bool {
        self.sweeper.lock().await.as_ref().is_some_and(SweepHandle::is_running)
    }
}

#[async_trait]
impl RateLimitStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = self.inner.clock.now_millis();
        {
            let entries = self.inner.entries.read().await;
            match entries.get(key) {
                None => return Ok(None),
                Some(entry) if !entry.is_expired(now) => return Ok(Some(entry.value.clone())),
                Some(_) => {}
            }
        }
        // Expired: evict unless a writer refreshed it in between.
        let mut entries = self.inner.entries.write().await;
        if entries.get(key).is_some_and(|e| e.is_expired(now)) {
            entries.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), StoreError> {
        let expires_at = ttl.map(|ttl| {
            let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
            self.inner.clock.now_millis().saturating_add(ttl_ms)
        });
        self.inner.entries.write().await.insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.inner.entries.write().await.remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.inner.entries.write().await.clear();
        Ok(())
    }

    async fn size(&self) -> Result<usize, StoreError> {
        let now = self.inner.clock.now_millis();
        let entries = self.inner.entries.read().await;
        Ok(entries.values().filter(|e| !e.is_expired(now)).count())
    }

    async fn dispose(&self) -> Result<(), StoreError> {
        if let Some(mut handle) = self.sweeper.lock().await.take() {
            handle.cancel();
        }
        self.inner.entries.write().await.clear();
        Ok(())
    }
}

/// Builder for [`MemoryStore`].
#[derive(Debug)]
pub struct MemoryStoreBuilder {
    clock: Arc<dyn Clock>,
    sweep_interval: Duration,
}

impl Default for MemoryStoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStoreBuilder {
    pub fn new() -> Self {
        Self { clock: Arc::new(SystemClock), sweep_interval: DEFAULT_SWEEP_INTERVAL }
    }

    /// Override the clock (useful for deterministic tests).
    pub fn clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Share an existing clock handle.
    pub fn shared_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn build(self) -> Result<MemoryStore, ConfigError> {
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::ZeroDuration { field: "sweep_interval" });
        }
        Ok(MemoryStore::from_parts(self.clock, self.sweep_interval))
    }
}
