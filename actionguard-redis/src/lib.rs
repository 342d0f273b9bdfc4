//! Redis client for `actionguard`'s distributed rate-limit store (companion crate).
//! Bring your own `redis::aio::ConnectionManager`; buckets are stored as JSON strings with `EX`.

/// Keys deleted per `DEL` command when clearing a prefix.
pub const DELETE_BATCH: usize = 500;

/// Keys requested per `SCAN` round trip.
pub const SCAN_COUNT: usize = 200;

/// `SCAN MATCH` pattern selecting every key under `prefix`.
///
/// Glob metacharacters in the prefix are escaped so they match literally.
pub fn prefix_pattern(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('*');
    pattern
}

#[cfg(feature = "client")]
mod client {
    use super::{prefix_pattern, DELETE_BATCH, SCAN_COUNT};
    use actionguard::error::BoxError;
    use actionguard::rate_limit::KeyValueClient;
    use async_trait::async_trait;
    use redis::aio::ConnectionManager;

    /// [`KeyValueClient`] over a multiplexed, auto-reconnecting Redis connection.
    #[derive(Clone)]
    pub struct RedisKeyValueClient {
        conn: ConnectionManager,
    }

    impl std::fmt::Debug for RedisKeyValueClient {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("RedisKeyValueClient")
                .field("conn", &"<redis::aio::ConnectionManager>")
                .finish()
        }
    }

    impl RedisKeyValueClient {
        /// Wrap an existing connection manager.
        pub fn new(conn: ConnectionManager) -> Self {
            Self { conn }
        }

        /// Open a connection manager for `url` (e.g. `redis://127.0.0.1/`).
        ///
        /// # Errors
        /// Returns the redis error if the URL is invalid or the first connection fails.
        pub async fn connect(url: &str) -> Result<Self, redis::RedisError> {
            let client = redis::Client::open(url)?;
            let conn = ConnectionManager::new(client).await?;
            Ok(Self { conn })
        }
    }

    #[async_trait]
    impl KeyValueClient for RedisKeyValueClient {
        async fn get(&self, key: &str) -> Result<Option<String>, BoxError> {
            let mut conn = self.conn.clone();
            let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
            Ok(value)
        }

        async fn set_with_ttl(
            &self,
            key: &str,
            value: &str,
            ttl_secs: Option<u64>,
        ) -> Result<(), BoxError> {
            let mut conn = self.conn.clone();
            let mut cmd = redis::cmd("SET");
            cmd.arg(key).arg(value);
            if let Some(secs) = ttl_secs {
                cmd.arg("EX").arg(secs);
            }
            let _: () = cmd.query_async(&mut conn).await?;
            Ok(())
        }

        async fn delete(&self, key: &str) -> Result<(), BoxError> {
            let mut conn = self.conn.clone();
            let _: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
            Ok(())
        }

        async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, BoxError> {
            let mut conn = self.conn.clone();
            let pattern = prefix_pattern(prefix);
            let mut keys = Vec::new();
            let mut cursor: u64 = 0;
            loop {
                let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&pattern)
                    .arg("COUNT")
                    .arg(SCAN_COUNT)
                    .query_async(&mut conn)
                    .await?;
                keys.extend(batch);
                if next == 0 {
                    break;
                }
                cursor = next;
            }
            // SCAN may return a key more than once.
            keys.sort_unstable();
            keys.dedup();
            Ok(keys)
        }

        async fn delete_many(&self, keys: &[String]) -> Result<(), BoxError> {
            let mut conn = self.conn.clone();
            let mut deleted = 0i64;
            for chunk in keys.chunks(DELETE_BATCH) {
                let n: i64 = redis::cmd("DEL").arg(chunk).query_async(&mut conn).await?;
                deleted += n;
            }
            tracing::debug!(
                target: "actionguard::redis",
                requested = keys.len(),
                deleted,
                "deleted rate limit keys"
            );
            Ok(())
        }

        async fn close(&self) -> Result<(), BoxError> {
            // The manager closes its connection when the last clone drops.
            tracing::debug!(target: "actionguard::redis", "redis client released");
            Ok(())
        }
    }
}

#[cfg(feature = "client")]
pub use client::RedisKeyValueClient;

#[cfg(test)]
mod tests {
    use super::prefix_pattern;

    #[test]
    fn pattern_matches_everything_under_prefix() {
        assert_eq!(prefix_pattern("actionguard:rl:"), "actionguard:rl:*");
        assert_eq!(prefix_pattern(""), "*");
    }

    #[test]
    fn glob_metacharacters_are_escaped() {
        assert_eq!(prefix_pattern("a*b?[c]\\"), "a\\*b\\?\\[c\\]\\\\*");
    }
}
