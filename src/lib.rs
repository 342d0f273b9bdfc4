#![forbid(unsafe_code)]

//! # ActionGuard
//!
//! Rate limiting and CSRF protection for RPC-style server actions.
//!
//! ## Features
//!
//! - **Hierarchical token buckets**: global, per-user, and per-action limits checked in order
//! - **Exact admission under concurrency** via per-key FIFO mutexes
//! - **Pluggable stores**: in-memory with background sweep, or any key-value service
//! - **Signed CSRF tokens** with expiry, optional single use, and constant-time validation
//! - **Tower middleware** composing both in front of a dispatcher
//!
//! ## Quick Start
//!
//! ```rust
//! use actionguard::{LimitConfig, RateLimiter, RequestContext};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let limiter = RateLimiter::builder()
//!         .global(LimitConfig::new(1_000, Duration::from_secs(60)))
//!         .per_user(LimitConfig::new(100, Duration::from_secs(60)))
//!         .per_action("createUser", LimitConfig::new(5, Duration::from_secs(60)))
//!         .build()?;
//!
//!     let ctx = RequestContext::new().action("createUser").ip("203.0.113.7");
//!     let decision = limiter.check(&ctx).await?;
//!     assert!(decision.allowed);
//!     assert_eq!(decision.remaining, Some(4));
//!     Ok(())
//! }
//! ```

pub mod clock;
pub mod csrf;
pub mod dynamic;
pub mod error;
pub mod middleware;
pub mod mutex;
pub mod prelude;
pub mod rate_limit;
pub mod response;
pub mod sweep;

// Re-exports
pub use clock::{Clock, ManualClock, SystemClock};
pub use csrf::{
    CsrfConfig, CsrfFailure, CsrfTokenStore, CsrfTokenStoreBuilder, CsrfValidation,
    GenerateOptions, ValidateOptions,
};
pub use dynamic::DynamicConfig;
pub use error::{BoxError, ConfigError, GuardError, StoreError};
pub use middleware::{ActionGuardLayer, ActionGuardService, GuardedRequest};
pub use mutex::{KeyedLocks, Mutex};
pub use rate_limit::{
    DistributedStore, DistributedStoreBuilder, KeyValueClient, LimitConfig, MemoryStore,
    MemoryStoreBuilder, RateLimitResult, RateLimitStore, RateLimiter, RateLimiterBuilder,
    RateLimiterConfig, RateLimiterStats, RequestContext, Scope, TokenBucket,
};
pub use response::{CsrfCookie, Rejection};
