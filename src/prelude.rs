//! Convenient re-exports for common ActionGuard types.
pub use crate::{
    clock::{Clock, ManualClock, SystemClock},
    csrf::{CsrfFailure, CsrfTokenStore, CsrfValidation, GenerateOptions, ValidateOptions},
    error::{ConfigError, GuardError, StoreError},
    middleware::{ActionGuardLayer, GuardedRequest},
    rate_limit::{
        DistributedStore, KeyValueClient, LimitConfig, MemoryStore, RateLimitResult,
        RateLimitStore, RateLimiter, RequestContext, Scope,
    },
    response::{CsrfCookie, Rejection},
};
