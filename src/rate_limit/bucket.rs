use crate::error::StoreError;
use crate::rate_limit::LimitConfig;
use serde::{Deserialize, Serialize};

/// Longest gap credited to a single refill (30 days).
pub const MAX_ELAPSED_MS: u64 = 30 * 24 * 60 * 60 * 1000;

/// Most tokens a single refill may add.
pub const MAX_REFILL_TOKENS: f64 = 1_000_000.0;

/// A token bucket for one rate-limit key.
///
/// Tokens drain by one per admitted request and refill continuously at `refill_rate` per
/// second, up to `max_tokens`. Fractional tokens are tracked; callers only ever see floored
/// counts. Time is passed in as epoch millis so the bucket stays pure and serializable.
///
/// The JSON form (`tokens`, `maxTokens`, `refillRate`, `lastRefill`) is what distributed stores
/// share between processes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenBucket {
    tokens: f64,
    max_tokens: f64,
    refill_rate: f64,
    last_refill: u64,
}

/// Result of [`TokenBucket::consume`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumeResult {
    pub allowed: bool,
    /// Whole tokens left after this call.
    pub remaining: u32,
    /// When admitted: epoch millis at which the bucket is full again.
    /// When refused: epoch millis at which enough tokens exist.
    pub reset_at: u64,
}

impl TokenBucket {
    /// A full bucket.
    pub fn new(max_tokens: f64, refill_rate: f64, now: u64) -> Self {
        Self { tokens: max_tokens, max_tokens, refill_rate, last_refill: now }
    }

    /// A full bucket sized for `limit`.
    pub fn from_limit(limit: &LimitConfig, now: u64) -> Self {
        Self::new(f64::from(limit.max_requests), limit.effective_refill_rate(), now)
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    pub fn max_tokens(&self) -> f64 {
        self.max_tokens
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    pub fn last_refill(&self) -> u64 {
        self.last_refill
    }

    /// Credit tokens for the time since the last refill.
    ///
    /// `last_refill` only moves forward: a reading older than it credits nothing and leaves it
    /// alone, so the same span is never credited twice. Elapsed time and the credited amount are
    /// both capped so that huge jumps cannot overflow or produce non-finite values.
    fn refill(&mut self, now: u64) {
        if now <= self.last_refill {
            return;
        }
        let elapsed_ms = (now - self.last_refill).min(MAX_ELAPSED_MS);
        let added = ((elapsed_ms as f64 / 1000.0) * self.refill_rate).min(MAX_REFILL_TOKENS);
        if added.is_finite() && added > 0.0 {
            self.tokens = (self.tokens + added).min(self.max_tokens);
        }
        self.last_refill = now;
    }

    /// Refill, then try to take `n` tokens.
    pub fn consume(&mut self, n: u32, now: u64) -> ConsumeResult {
        self.refill(now);
        let cost = f64::from(n);

        if self.tokens >= cost {
            self.tokens = (self.tokens - cost).max(0.0);
            ConsumeResult {
                allowed: true,
                remaining: self.whole_tokens(),
                reset_at: now.saturating_add(self.millis_to_accumulate(self.max_tokens - self.tokens)),
            }
        } else {
            ConsumeResult {
                allowed: false,
                remaining: self.whole_tokens(),
                reset_at: now.saturating_add(self.millis_to_accumulate(cost - self.tokens)),
            }
        }
    }

    fn whole_tokens(&self) -> u32 {
        // Float-to-int `as` saturates and maps NaN to zero.
        self.tokens.floor().max(0.0) as u32
    }

    fn millis_to_accumulate(&self, deficit: f64) -> u64 {
        if deficit <= 0.0 {
            return 0;
        }
        (deficit * 1000.0 / self.refill_rate).ceil() as u64
    }

    pub fn to_json(&self) -> Result<String, StoreError> {
        serde_json::to_string(self).map_err(StoreError::Encode)
    }

    /// Decode state read from a store under `key`, rejecting values that break the bucket
    /// invariants.
    pub fn from_json(key: &str, raw: &str) -> Result<Self, StoreError> {
        let bucket: TokenBucket = serde_json::from_str(raw)
            .map_err(|e| StoreError::Corrupt { key: key.to_string(), detail: e.to_string() })?;
        bucket.check_invariants().map_err(|detail| StoreError::Corrupt {
            key: key.to_string(),
            detail: detail.to_string(),
        })?;
        Ok(bucket)
    }

    fn check_invariants(&self) -> Result<(), &'static str> {
        if !self.max_tokens.is_finite() || self.max_tokens <= 0.0 {
            return Err("maxTokens must be finite and positive");
        }
        if !self.refill_rate.is_finite() || self.refill_rate <= 0.0 {
            return Err("refillRate must be finite and positive");
        }
        if !self.tokens.is_finite() || self.tokens < 0.0 || self.tokens > self.max_tokens {
            return Err("tokens must lie within [0, maxTokens]");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const T0: u64 = 1_700_000_000_000;

    #[test]
    fn drains_then_refuses_with_wait_estimate() {
        // 10 per second.
        let mut bucket = TokenBucket::from_limit(&LimitConfig::new(10, Duration::from_secs(1)), T0);
        for i in 0..10 {
            let r = bucket.consume(1, T0);
            assert!(r.allowed, "call {i} should pass");
            assert_eq!(r.remaining, 9 - i);
        }
        let refused = bucket.consume(1, T0);
        assert!(!refused.allowed);
        assert_eq!(refused.remaining, 0);
        // One token at 10/s takes 100ms.
        assert_eq!(refused.reset_at, T0 + 100);
    }

    #[test]
    fn admitted_reset_at_is_time_until_full() {
        let mut bucket = TokenBucket::new(4.0, 2.0, T0);
        let r = bucket.consume(1, T0);
        assert!(r.allowed);
        assert_eq!(r.remaining, 3);
        assert_eq!(r.reset_at, T0 + 500);
    }

    #[test]
    fn refill_is_proportional_and_capped_at_max() {
        let mut bucket = TokenBucket::new(10.0, 10.0, T0);
        for _ in 0..10 {
            bucket.consume(1, T0);
        }
        let r = bucket.consume(1, T0 + 250);
        assert!(r.allowed);
        assert_eq!(r.remaining, 1);

        let r = bucket.consume(1, T0 + 60_000);
        assert!(r.allowed);
        assert_eq!(r.remaining, 9);
        assert!(bucket.tokens() <= bucket.max_tokens());
    }

    #[test]
    fn fractional_tokens_are_kept_but_floored_in_output() {
        let mut bucket = TokenBucket::new(2.0, 1.0, T0);
        bucket.consume(2, T0);
        let r = bucket.consume(1, T0 + 500);
        assert!(!r.allowed);
        assert_eq!(r.remaining, 0);
        assert!((bucket.tokens() - 0.5).abs() < 1e-9);
        assert_eq!(r.reset_at, T0 + 500 + 500);
    }

    #[test]
    fn decades_long_jump_stays_within_bounds() {
        let mut bucket = TokenBucket::new(5.0, 1e9, T0);
        bucket.consume(5, T0);
        let fifty_years = T0 + 50 * 365 * 24 * 60 * 60 * 1000;
        let r = bucket.consume(1, fifty_years);
        assert!(r.allowed);
        assert!(bucket.tokens() <= bucket.max_tokens());
        assert!(bucket.tokens().is_finite());
        assert_eq!(r.remaining, 4);

        let r = bucket.consume(1, u64::MAX);
        assert!(r.allowed);
        assert!(bucket.tokens().is_finite());
    }

    #[test]
    fn backwards_clock_adds_nothing() {
        let mut bucket = TokenBucket::new(3.0, 1.0, T0);
        bucket.consume(3, T0);
        let r = bucket.consume(1, T0 - 10_000);
        assert!(!r.allowed);
        assert_eq!(bucket.tokens(), 0.0);
        assert_eq!(bucket.last_refill(), T0);
    }

    #[test]
    fn stale_reading_does_not_let_a_span_be_credited_twice() {
        let mut bucket = TokenBucket::new(10.0, 10.0, T0);
        for _ in 0..10 {
            assert!(bucket.consume(1, T0).allowed);
        }
        assert!(!bucket.consume(1, T0 - 1_000).allowed);

        let admitted = (0..20).filter(|_| bucket.consume(1, T0).allowed).count();
        assert_eq!(admitted, 0);

        // Time that really passed is still credited once.
        assert_eq!(bucket.consume(1, T0 + 100).remaining, 0);
        assert!(!bucket.consume(1, T0 + 100).allowed);
    }

    #[test]
    fn json_round_trip_is_exact() {
        let mut bucket = TokenBucket::new(7.0, 0.3, T0);
        bucket.consume(2, T0 + 1234);
        let json = bucket.to_json().unwrap();
        assert!(json.contains("\"maxTokens\""));
        assert!(json.contains("\"lastRefill\""));
        assert_eq!(TokenBucket::from_json("k", &json).unwrap(), bucket);
    }

    #[test]
    fn from_json_rejects_corrupt_state() {
        let over_full = r#"{"tokens":11,"maxTokens":10,"refillRate":1,"lastRefill":0}"#;
        assert!(matches!(
            TokenBucket::from_json("user:a", over_full),
            Err(StoreError::Corrupt { key, .. }) if key == "user:a"
        ));
        let zero_rate = r#"{"tokens":1,"maxTokens":10,"refillRate":0,"lastRefill":0}"#;
        assert!(TokenBucket::from_json("k", zero_rate).is_err());
        assert!(TokenBucket::from_json("k", "not json").is_err());
    }
}
