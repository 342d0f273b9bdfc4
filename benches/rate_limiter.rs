use actionguard::csrf::{CsrfTokenStore, GenerateOptions, ValidateOptions};
use actionguard::middleware::{ActionGuardLayer, GuardedRequest};
use actionguard::{LimitConfig, RateLimiter, RequestContext};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use futures::future::Ready;
use std::sync::Arc;
use std::time::Duration;
use tower::{Service, ServiceBuilder};

struct Call(&'static str);

impl GuardedRequest for Call {
    fn context(&self) -> RequestContext {
        RequestContext::new().action(self.0).ip("203.0.113.1")
    }

    fn csrf_token(&self) -> Option<&str> {
        None
    }
}

// Dispatcher that does nothing, so only the guard is measured.
#[derive(Clone)]
struct NoopDispatch;

impl Service<Call> for NoopDispatch {
    type Response = ();
    type Error = std::io::Error;
    type Future = Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut std::task::Context<'_>) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, _req: Call) -> Self::Future {
        futures::future::ready(Ok(()))
    }
}

// Budgets large enough that every iteration is admitted.
fn roomy_limiter() -> RateLimiter {
    RateLimiter::builder()
        .global(LimitConfig::new(u32::MAX, Duration::from_secs(1)))
        .per_user(LimitConfig::new(u32::MAX, Duration::from_secs(1)))
        .per_action("createUser", LimitConfig::new(u32::MAX, Duration::from_secs(1)))
        .build()
        .unwrap()
}

fn limiter_check_three_scopes(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let limiter = rt.block_on(async { roomy_limiter() });
    let ctx = RequestContext::new().action("createUser").ip("203.0.113.1");

    c.bench_function("limiter_check_three_scopes", |b| {
        b.to_async(&rt).iter(|| async {
            let _ = black_box(limiter.check(black_box(&ctx)).await);
        });
    });
}

fn limiter_check_denied(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let limiter = rt.block_on(async {
        RateLimiter::builder()
            .per_user(LimitConfig::new(1, Duration::from_secs(3600)))
            .build()
            .unwrap()
    });
    let ctx = RequestContext::new().ip("203.0.113.2");

    c.bench_function("limiter_check_denied", |b| {
        b.to_async(&rt).iter(|| async {
            let _ = black_box(limiter.check(black_box(&ctx)).await);
        });
    });
}

fn guard_layer_overhead(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let limiter = Arc::new(rt.block_on(async { roomy_limiter() }));
    let svc = ServiceBuilder::new().layer(ActionGuardLayer::new(limiter)).service(NoopDispatch);

    c.bench_function("guard_layer_overhead", |b| {
        b.to_async(&rt).iter(|| async {
            let mut local_svc = svc.clone();
            let _ = black_box(local_svc.call(black_box(Call("createUser")))).await;
        });
    });
}

fn csrf_generate_and_validate(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = rt.block_on(async {
        CsrfTokenStore::builder("bench-secret-bench-secret-bench-secret").build().unwrap()
    });

    c.bench_function("csrf_generate_and_validate", |b| {
        b.to_async(&rt).iter(|| async {
            let token = store.generate(GenerateOptions::default()).await;
            let _ = black_box(store.validate(&token, ValidateOptions::default()).await);
            store.invalidate(&token).await;
        });
    });
}

criterion_group!(
    benches,
    limiter_check_three_scopes,
    limiter_check_denied,
    guard_layer_overhead,
    csrf_generate_and_validate
);
criterion_main!(benches);
