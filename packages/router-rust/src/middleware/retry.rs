//! Retry middleware.
//!
//! Re-invokes the wrapped handler after a failure, up to
//! [`RetryPolicy::max_retries`] additional attempts, with optional exponential
//! backoff between attempts. The first success wins; if every attempt fails
//! the last error is returned.

use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use courier_core::Message;
use tokio::time::Instant;
use tower::{Layer, Service, ServiceExt};
use tracing::warn;

use crate::error::HandlerError;
use crate::handler::{message_handler_name, HandlerFuture};

type RetryHook = Arc<dyn Fn(&str, u32, &HandlerError) + Send + Sync>;

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// How many times to retry and how long to wait in between.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Additional attempts after the first failure. Zero disables retrying.
    pub max_retries: u32,
    /// Delay before the first retry. Zero means retries run back to back.
    pub initial_interval: Duration,
    /// Cap for a single delay. Zero means uncapped.
    pub max_interval: Duration,
    /// Growth factor applied to the delay after each retry.
    pub multiplier: f64,
    /// Relative jitter in `[0, 1]`: a delay `d` becomes a random value in
    /// `[d * (1 - f), d * (1 + f)]`.
    pub randomization_factor: f64,
    /// Give up once this much time has passed since the first attempt.
    pub max_elapsed: Option<Duration>,
}

impl RetryPolicy {
    /// Retries up to `max_retries` times without any delay.
    #[must_use]
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            multiplier: 1.0,
            randomization_factor: 0.0,
            max_elapsed: None,
        }
    }

    /// Delay before retry number `retry` (1-based), without jitter.
    #[must_use]
    pub fn base_delay(&self, retry: u32) -> Duration {
        if self.initial_interval.is_zero() {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.initial_interval.as_secs_f64() * self.multiplier.powi(exponent);
        let delay = Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX);
        if self.max_interval.is_zero() {
            delay
        } else {
            delay.min(self.max_interval)
        }
    }

    fn jittered_delay(&self, retry: u32) -> Duration {
        let base = self.base_delay(retry);
        if base.is_zero() || self.randomization_factor <= 0.0 {
            return base;
        }
        let spread = self.randomization_factor.min(1.0);
        let scale = 1.0 - spread + 2.0 * spread * rand::random::<f64>();
        Duration::try_from_secs_f64(base.as_secs_f64() * scale).unwrap_or(base)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::immediate(0)
    }
}

// ---------------------------------------------------------------------------
// RetryLayer
// ---------------------------------------------------------------------------

/// Tower layer that retries failed invocations according to a [`RetryPolicy`].
#[derive(Clone)]
pub struct RetryLayer {
    policy: RetryPolicy,
    on_retry: Option<RetryHook>,
}

impl RetryLayer {
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            on_retry: None,
        }
    }

    /// Registers a callback invoked before every retry with the handler name,
    /// the retry number (starting at 1) and the error that triggered it.
    #[must_use]
    pub fn on_retry(mut self, hook: impl Fn(&str, u32, &HandlerError) + Send + Sync + 'static) -> Self {
        self.on_retry = Some(Arc::new(hook));
        self
    }
}

impl fmt::Debug for RetryLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryLayer")
            .field("policy", &self.policy)
            .field("on_retry", &self.on_retry.is_some())
            .finish()
    }
}

impl<S> Layer<S> for RetryLayer {
    type Service = RetryService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RetryService {
            inner,
            policy: self.policy.clone(),
            on_retry: self.on_retry.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// RetryService
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct RetryService<S> {
    inner: S,
    policy: RetryPolicy,
    on_retry: Option<RetryHook>,
}

impl<S> Service<Message> for RetryService<S>
where
    S: Service<Message, Response = Vec<Message>, Error = HandlerError> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Vec<Message>;
    type Error = HandlerError;
    type Future = HandlerFuture;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, msg: Message) -> Self::Future {
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let policy = self.policy.clone();
        let on_retry = self.on_retry.clone();

        Box::pin(async move {
            let started = Instant::now();
            let mut result = inner.call(msg.clone()).await;
            let mut retry = 0;

            while let Err(err) = &result {
                if retry >= policy.max_retries || msg.context().is_cancelled() {
                    break;
                }
                retry += 1;

                let delay = policy.jittered_delay(retry);
                if let Some(max_elapsed) = policy.max_elapsed {
                    if started.elapsed() + delay > max_elapsed {
                        warn!(
                            message_uuid = %msg.uuid(),
                            elapsed_ms = started.elapsed().as_millis(),
                            "retry budget exhausted"
                        );
                        break;
                    }
                }

                warn!(
                    message_uuid = %msg.uuid(),
                    retry,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis(),
                    error = %err,
                    "handler failed, retrying"
                );
                if let Some(hook) = &on_retry {
                    hook(message_handler_name(&msg).unwrap_or_default(), retry, err);
                }

                if !delay.is_zero() {
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = msg.context().cancelled() => break,
                    }
                }

                result = match inner.ready().await {
                    Ok(svc) => svc.call(msg.clone()).await,
                    Err(err) => Err(err),
                };
            }
            result
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
