//! Tower middleware that guards a dispatcher with CSRF validation and rate limiting.
//!
//! [`ActionGuardLayer`] wraps any `Service<Req>` whose request type implements
//! [`GuardedRequest`]. Each call is checked in order:
//!
//! 1. CSRF token, if a [`CsrfTokenStore`] is attached.
//! 2. [`RateLimiter::check`] on the request's [`RequestContext`].
//!
//! Only a call that passes both reaches the inner service. Refusals surface as
//! [`GuardError::Rejected`] so the adapter can render them with [`crate::response`].

use crate::csrf::{CsrfTokenStore, ValidateOptions};
use crate::error::GuardError;
use crate::rate_limit::{RateLimiter, RequestContext};
use crate::response::Rejection;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;
use tracing::debug;

/// A request the guard can inspect.
pub trait GuardedRequest {
    /// Identity and action of this call.
    fn context(&self) -> RequestContext;

    /// CSRF token submitted with the call, if any.
    fn csrf_token(&self) -> Option<&str>;
}

/// A layer that applies [`ActionGuardService`].
#[derive(Clone, Debug)]
pub struct ActionGuardLayer {
    limiter: Arc<RateLimiter>,
    csrf: Option<Arc<CsrfTokenStore>>,
    validate: ValidateOptions,
}

impl ActionGuardLayer {
    /// Rate limiting only.
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self { limiter, csrf: None, validate: ValidateOptions::default() }
    }

    /// Also require a valid CSRF token on every call.
    pub fn with_csrf(mut self, store: Arc<CsrfTokenStore>) -> Self {
        self.csrf = Some(store);
        self
    }

    /// Options passed to every CSRF validation.
    pub fn validate_options(mut self, options: ValidateOptions) -> Self {
        self.validate = options;
        self
    }
}

impl<S> Layer<S> for ActionGuardLayer {
    type Service = ActionGuardService<S>;

    fn layer(&self, service: S) -> Self::Service {
        ActionGuardService {
            inner: service,
            limiter: self.limiter.clone(),
            csrf: self.csrf.clone(),
            validate: self.validate,
        }
    }
}

/// Middleware service produced by [`ActionGuardLayer`].
#[derive(Clone, Debug)]
pub struct ActionGuardService<S> {
    inner: S,
    limiter: Arc<RateLimiter>,
    csrf: Option<Arc<CsrfTokenStore>>,
    validate: ValidateOptions,
}

impl<S, Req> Service<Req> for ActionGuardService<S>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    Req: GuardedRequest + Send + 'static,
{
    type Response = S::Response;
    type Error = GuardError<S::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(GuardError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let limiter = self.limiter.clone();
        let csrf = self.csrf.clone();
        let validate = self.validate;
        let mut inner = self.inner.clone();

        Box::pin(async move {
            if let Some(store) = csrf {
                // Owned so the future does not borrow `req` across the await.
                let token = req.csrf_token().unwrap_or_default().to_owned();
                let validation = store.validate(&token, validate).await;
                if !validation.valid {
                    return Err(GuardError::Rejected(Rejection::CsrfInvalid(validation)));
                }
            }

            let ctx = req.context();
            let decision = limiter.check(&ctx).await.map_err(GuardError::Store)?;
            if !decision.allowed {
                debug!(
                    target: "actionguard::rate_limit",
                    action = ctx.action_id.as_deref().unwrap_or_default(),
                    reason = decision.reason.as_deref().unwrap_or_default(),
                    "call refused"
                );
                return Err(GuardError::Rejected(Rejection::RateLimited(decision)));
            }

            inner.call(req).await.map_err(GuardError::Inner)
        })
    }
}
