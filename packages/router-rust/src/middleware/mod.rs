//! Middleware pipeline for handler invocations.
//!
//! A middleware turns the next handler in the chain into a new handler. The
//! standard middlewares are Tower layers; anything implementing
//! `Layer<HandlerService>` with a suitable service is a [`Middleware`].
//!
//! - [`correlation`]: copies the inbound correlation id onto outputs
//! - [`timeout`]: abandons invocations that exceed a deadline
//! - [`throttle`]: sliding-window rate limit shared by every user of one instance
//! - [`retry`]: re-invokes the handler after failures, with optional backoff
//! - [`recoverer`]: turns panics into [`HandlerError::Panicked`]

pub mod correlation;
pub mod recoverer;
pub mod retry;
pub mod throttle;
pub mod timeout;

use std::future::Future;
use std::sync::Arc;
use std::task::{Context, Poll};

use courier_core::Message;
use tower::util::BoxCloneService;
use tower::{Layer, Service};

pub use correlation::{message_correlation_id, set_correlation_id, CorrelationLayer, CORRELATION_ID_KEY};
pub use recoverer::RecovererLayer;
pub use retry::{RetryLayer, RetryPolicy};
pub use throttle::ThrottleLayer;
pub use timeout::TimeoutLayer;

use crate::config::MiddlewareConfig;
use crate::error::HandlerError;
use crate::handler::{HandlerFuture, HandlerService};
use crate::metrics::RouterMetrics;

// ---------------------------------------------------------------------------
// Middleware trait
// ---------------------------------------------------------------------------

/// Wraps the next handler in the chain, producing the handler to call instead.
pub trait Middleware: Send + Sync {
    fn wrap(&self, next: HandlerService) -> HandlerService;
}

impl<L> Middleware for L
where
    L: Layer<HandlerService> + Send + Sync,
    L::Service: Service<Message, Response = Vec<Message>, Error = HandlerError> + Clone + Send + 'static,
    <L::Service as Service<Message>>::Future: Send + 'static,
{
    fn wrap(&self, next: HandlerService) -> HandlerService {
        BoxCloneService::new(self.layer(next))
    }
}

/// Composes `chain` around `handler`.
///
/// The first middleware is the outermost call and the handler is the
/// innermost, so execution order follows declaration order.
pub fn compose<'a>(
    handler: HandlerService,
    chain: impl DoubleEndedIterator<Item = &'a Arc<dyn Middleware>>,
) -> HandlerService {
    chain.rev().fold(handler, |next, middleware| middleware.wrap(next))
}

/// Builds the standard router-level chain, outermost first:
/// correlation, timeout, throttle, retry, recoverer.
///
/// Timeouts, retries and recovered panics are counted in `metrics`, per
/// handler.
#[must_use]
pub fn standard_chain(config: &MiddlewareConfig, metrics: &Arc<RouterMetrics>) -> Vec<Arc<dyn Middleware>> {
    let timeouts = Arc::clone(metrics);
    let timeout = TimeoutLayer::new(config.timeout).on_timeout(move |handler| timeouts.record_timed_out(handler));
    let retries = Arc::clone(metrics);
    let retry = RetryLayer::new(config.retry_policy())
        .on_retry(move |handler, _attempt, _err| retries.record_retry(handler));
    let panics = Arc::clone(metrics);
    let recoverer = RecovererLayer::new().on_panic(move |handler| panics.record_panicked(handler));
    vec![
        Arc::new(CorrelationLayer) as Arc<dyn Middleware>,
        Arc::new(timeout),
        Arc::new(ThrottleLayer::new(config.throttle_count, config.throttle_interval)),
        Arc::new(retry),
        Arc::new(recoverer),
    ]
}

// ---------------------------------------------------------------------------
// Closure middlewares
// ---------------------------------------------------------------------------

/// Builds a middleware from an async closure receiving the message and the
/// next handler.
///
/// ```rust,ignore
/// handle.add_middleware(middleware_fn(|msg, next| async move {
///     tracing::info!(message_uuid = %msg.uuid(), "before");
///     next.oneshot(msg).await
/// }));
/// ```
pub fn middleware_fn<F, Fut>(f: F) -> FnMiddleware<F>
where
    F: Fn(Message, HandlerService) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<Message>, HandlerError>> + Send + 'static,
{
    FnMiddleware { f }
}

#[derive(Clone)]
pub struct FnMiddleware<F> {
    f: F,
}

impl<F, Fut> Layer<HandlerService> for FnMiddleware<F>
where
    F: Fn(Message, HandlerService) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<Message>, HandlerError>> + Send + 'static,
{
    type Service = FnMiddlewareService<F>;

    fn layer(&self, inner: HandlerService) -> Self::Service {
        FnMiddlewareService {
            f: self.f.clone(),
            inner,
        }
    }
}

#[derive(Clone)]
pub struct FnMiddlewareService<F> {
    f: F,
    inner: HandlerService,
}

impl<F, Fut> Service<Message> for FnMiddlewareService<F>
where
    F: Fn(Message, HandlerService) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<Message>, HandlerError>> + Send + 'static,
{
    type Response = Vec<Message>;
    type Error = HandlerError;
    type Future = HandlerFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // `next` is driven to readiness by the closure (e.g. via `oneshot`).
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, msg: Message) -> Self::Future {
        Box::pin((self.f)(msg, self.inner.clone()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use courier_core::Metadata;
    use parking_lot::Mutex;
    use tower::ServiceExt;

    use super::*;

    type Trace = Arc<Mutex<Vec<String>>>;

    fn recording(label: &'static str, trace: &Trace) -> Arc<dyn Middleware> {
        let trace = Arc::clone(trace);
        Arc::new(middleware_fn(move |msg: Message, next: HandlerService| {
            let trace = Arc::clone(&trace);
            async move {
                trace.lock().push(format!("{label}:before"));
                let out = next.oneshot(msg).await;
                trace.lock().push(format!("{label}:after"));
                out
            }
        }))
    }

    fn tracing_handler(trace: &Trace) -> HandlerService {
        let trace = Arc::clone(trace);
        BoxCloneService::new(tower::service_fn(move |_msg: Message| {
            let trace = Arc::clone(&trace);
            async move {
                trace.lock().push("handler".to_string());
                Ok::<_, HandlerError>(Vec::new())
            }
        }))
    }

    #[tokio::test]
    async fn compose_runs_in_declaration_order() {
        let trace: Trace = Arc::new(Mutex::new(Vec::new()));
        let chain = vec![
            recording("global-1", &trace),
            recording("global-2", &trace),
            recording("local", &trace),
        ];

        let svc = compose(tracing_handler(&trace), chain.iter());
        svc.oneshot(Message::new("x", Metadata::new())).await.unwrap();

        assert_eq!(
            *trace.lock(),
            vec![
                "global-1:before",
                "global-2:before",
                "local:before",
                "handler",
                "local:after",
                "global-2:after",
                "global-1:after",
            ]
        );
    }

    #[tokio::test]
    async fn empty_chain_calls_handler_directly() {
        let trace: Trace = Arc::new(Mutex::new(Vec::new()));
        let svc = compose(tracing_handler(&trace), std::iter::empty());
        svc.oneshot(Message::new("x", Metadata::new())).await.unwrap();
        assert_eq!(*trace.lock(), vec!["handler"]);
    }

    #[tokio::test]
    async fn closure_middleware_can_short_circuit() {
        let trace: Trace = Arc::new(Mutex::new(Vec::new()));
        let gate: Arc<dyn Middleware> =
            Arc::new(middleware_fn(|_msg: Message, _next: HandlerService| async {
                Err(HandlerError::Failed(anyhow::anyhow!("rejected")))
            }));

        let svc = compose(tracing_handler(&trace), [gate].iter());
        let err = svc.oneshot(Message::new("x", Metadata::new())).await.unwrap_err();
        assert!(matches!(err, HandlerError::Failed(_)));
        assert!(trace.lock().is_empty());
    }

    #[test]
    fn standard_chain_has_five_layers() {
        let metrics = Arc::new(RouterMetrics::new());
        let chain = standard_chain(&MiddlewareConfig::default(), &metrics);
        assert_eq!(chain.len(), 5);
    }
}
