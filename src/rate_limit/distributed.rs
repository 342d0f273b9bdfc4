//! Rate-limit store over a shared key-value service (bring your own client).
//!
//! [`DistributedStore`] adapts any [`KeyValueClient`] (Redis, etcd, a sidecar cache) to the
//! [`RateLimitStore`] interface. Keys come partly from untrusted input (caller identity, action
//! ids), so every key and the configured prefix are passed through [`sanitize_key`] before
//! they reach the backend.

use crate::error::{BoxError, ConfigError, StoreError};
use crate::rate_limit::RateLimitStore;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Prefix applied to every key unless overridden.
pub const DEFAULT_PREFIX: &str = "actionguard:rl:";

/// Minimal client surface the distributed store needs.
#[async_trait]
pub trait KeyValueClient: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, BoxError>;

    /// Write a value; `ttl_secs` of `None` means no expiry.
    async fn set_with_ttl(&self, key: &str, value: &str, ttl_secs: Option<u64>)
        -> Result<(), BoxError>;

    async fn delete(&self, key: &str) -> Result<(), BoxError>;

    /// Every key that starts with `prefix`.
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, BoxError>;

    async fn delete_many(&self, keys: &[String]) -> Result<(), BoxError>;

    /// Close connections; called from [`RateLimitStore::dispose`].
    async fn close(&self) -> Result<(), BoxError> {
        Ok(())
    }
}

/// Replace every character outside `[A-Za-z0-9:_-]` with `_`.
///
/// The result is never empty and sanitizing it again returns it unchanged.
pub fn sanitize_key(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, ':' | '_' | '-') { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

/// Whole seconds for a backend TTL, rounded up so an entry never expires early.
pub fn ttl_secs(ttl: Duration) -> u64 {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    secs.max(1)
}

/// [`RateLimitStore`] backed by an external key-value service.
#[derive(Clone)]
pub struct DistributedStore {
    client: Arc<dyn KeyValueClient>,
    prefix: String,
}

impl std::fmt::Debug for DistributedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedStore")
            .field("prefix", &self.prefix)
            .field("client", &"<KeyValueClient>")
            .finish()
    }
}

impl DistributedStore {
    pub fn builder() -> DistributedStoreBuilder {
        DistributedStoreBuilder::default()
    }

    /// Store with the default prefix.
    pub fn new(client: Arc<dyn KeyValueClient>) -> Self {
        Self { client, prefix: DEFAULT_PREFIX.to_string() }
    }

    /// Sanitized prefix actually used on the backend.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Backend key for a logical bucket key.
    pub fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, sanitize_key(key))
    }
}

#[async_trait]
impl RateLimitStore for DistributedStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.client.get(&self.full_key(key)).await.map_err(StoreError::Backend)
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.client
            .set_with_ttl(&self.full_key(key), &value, ttl.map(ttl_secs))
            .await
            .map_err(StoreError::Backend)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.client.delete(&self.full_key(key)).await.map_err(StoreError::Backend)
    }

    async fn clear(&self) -> Result<(), StoreError> {
        let keys = self.client.keys_with_prefix(&self.prefix).await.map_err(StoreError::Backend)?;
        if keys.is_empty() {
            return Ok(());
        }
        self.client.delete_many(&keys).await.map_err(StoreError::Backend)
    }

    async fn size(&self) -> Result<usize, StoreError> {
        let keys = self.client.keys_with_prefix(&self.prefix).await.map_err(StoreError::Backend)?;
        Ok(keys.len())
    }

    async fn dispose(&self) -> Result<(), StoreError> {
        self.client.close().await.map_err(StoreError::Backend)
    }
}

/// Builder for [`DistributedStore`]; a client is mandatory.
#[derive(Default)]
pub struct DistributedStoreBuilder {
    client: Option<Arc<dyn KeyValueClient>>,
    prefix: Option<String>,
}

impl DistributedStoreBuilder {
    pub fn client(mut self, client: Arc<dyn KeyValueClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Key prefix; sanitized like any other key. Must not be empty.
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn build(self) -> Result<DistributedStore, ConfigError> {
        let client = self.client.ok_or(ConfigError::MissingClient)?;
        let prefix = match self.prefix {
            Some(p) if p.is_empty() => return Err(ConfigError::EmptyPrefix),
            Some(p) => sanitize_key(&p),
            None => DEFAULT_PREFIX.to_string(),
        };
        Ok(DistributedStore { client, prefix })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingClient {
        data: Mutex<HashMap<String, (String, Option<u64>)>>,
        fail: bool,
    }

    #[async_trait]
    impl KeyValueClient for RecordingClient {
        async fn get(&self, key: &str) -> Result<Option<String>, BoxError> {
            if self.fail {
                return Err("connection refused".into());
            }
            Ok(self.data.lock().unwrap().get(key).map(|(v, _)| v.clone()))
        }
        async fn set_with_ttl(&self, key: &str, value: &str, ttl: Option<u64>) -> Result<(), BoxError> {
            self.data.lock().unwrap().insert(key.to_string(), (value.to_string(), ttl));
            Ok(())
        }
        async fn delete(&self, key: &str) -> Result<(), BoxError> {
            self.data.lock().unwrap().remove(key);
            Ok(())
        }
        async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, BoxError> {
            Ok(self.data.lock().unwrap().keys().filter(|k| k.starts_with(prefix)).cloned().collect())
        }
        async fn delete_many(&self, keys: &[String]) -> Result<(), BoxError> {
            let mut data = self.data.lock().unwrap();
            for k in keys {
                data.remove(k);
            }
            Ok(())
        }
    }

    #[test]
    fn sanitize_replaces_unsafe_characters() {
        assert_eq!(sanitize_key("user:1.2.3.4"), "user:1_2_3_4");
        assert_eq!(sanitize_key("a b\r\nSET x y"), "a_b__SET_x_y");
        assert_eq!(sanitize_key("é*?"), "___");
        assert_eq!(sanitize_key(""), "_");
        assert_eq!(sanitize_key("action:createUser:anonymous"), "action:createUser:anonymous");
    }

    #[test]
    fn ttl_rounds_up_to_whole_seconds() {
        assert_eq!(ttl_secs(Duration::from_millis(2000)), 2);
        assert_eq!(ttl_secs(Duration::from_millis(2001)), 3);
        assert_eq!(ttl_secs(Duration::from_millis(1)), 1);
        assert_eq!(ttl_secs(Duration::ZERO), 1);
    }

    #[test]
    fn builder_requires_client() {
        assert_eq!(DistributedStore::builder().build().unwrap_err(), ConfigError::MissingClient);
    }

    #[test]
    fn builder_rejects_empty_prefix() {
        let err = DistributedStore::builder()
            .client(Arc::new(RecordingClient::default()))
            .prefix("")
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigError::EmptyPrefix);
    }

    #[tokio::test]
    async fn keys_are_prefixed_and_sanitized() {
        let client = Arc::new(RecordingClient::default());
        let store = DistributedStore::builder()
            .client(client.clone())
            .prefix("app rl/")
            .build()
            .unwrap();
        assert_eq!(store.prefix(), "app_rl_");

        store
            .set("user:10.0.0.1\r\nFLUSHALL", "{}".into(), Some(Duration::from_millis(1500)))
            .await
            .unwrap();
        let data = client.data.lock().unwrap().clone();
        let (key, (_, ttl)) = data.iter().next().unwrap();
        assert_eq!(key, "app_rl_user:10_0_0_1__FLUSHALL");
        assert_eq!(*ttl, Some(2));
    }

    #[tokio::test]
    async fn clear_and_size_only_touch_prefixed_keys() {
        let client = Arc::new(RecordingClient::default());
        client.data.lock().unwrap().insert("other:key".into(), ("x".into(), None));
        let store = DistributedStore::new(client.clone());
        store.set("global", "{}".into(), None).await.unwrap();
        store.set("user:a", "{}".into(), None).await.unwrap();
        assert_eq!(store.size().await.unwrap(), 2);

        store.clear().await.unwrap();
        assert_eq!(store.size().await.unwrap(), 0);
        assert!(client.data.lock().unwrap().contains_key("other:key"));
    }

    #[tokio::test]
    async fn backend_failures_propagate() {
        let client = Arc::new(RecordingClient { fail: true, ..Default::default() });
        let store = DistributedStore::new(client);
        let err = store.get("global").await.unwrap_err();
        assert!(err.is_backend());
    }
}
