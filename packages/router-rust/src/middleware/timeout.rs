//! Timeout middleware for handler invocations.
//!
//! Gives each invocation a child cancellation context bound to a deadline and
//! returns `HandlerError::DeadlineExceeded` once the deadline passes. The
//! abandoned invocation's result, if any, is discarded.

use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use courier_core::Message;
use tower::{Layer, Service};

use crate::error::HandlerError;
use crate::handler::{message_handler_name, HandlerFuture};

type TimeoutHook = Arc<dyn Fn(&str) + Send + Sync>;

// ---------------------------------------------------------------------------
// TimeoutLayer
// ---------------------------------------------------------------------------

/// Tower layer that bounds every invocation by a fixed deadline.
#[derive(Clone)]
pub struct TimeoutLayer {
    timeout: Duration,
    on_timeout: Option<TimeoutHook>,
}

impl TimeoutLayer {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            on_timeout: None,
        }
    }

    /// Registers a callback invoked with the handler name whenever an
    /// invocation misses its deadline.
    #[must_use]
    pub fn on_timeout(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_timeout = Some(Arc::new(hook));
        self
    }
}

impl fmt::Debug for TimeoutLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutLayer")
            .field("timeout", &self.timeout)
            .field("on_timeout", &self.on_timeout.is_some())
            .finish()
    }
}

impl<S> Layer<S> for TimeoutLayer {
    type Service = TimeoutService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TimeoutService {
            inner,
            timeout: self.timeout,
            on_timeout: self.on_timeout.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// TimeoutService
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct TimeoutService<S> {
    inner: S,
    timeout: Duration,
    on_timeout: Option<TimeoutHook>,
}

impl<S> Service<Message> for TimeoutService<S>
where
    S: Service<Message, Response = Vec<Message>, Error = HandlerError> + Send,
    S::Future: Send + 'static,
{
    type Response = Vec<Message>;
    type Error = HandlerError;
    type Future = HandlerFuture;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut msg: Message) -> Self::Future {
        let timeout = self.timeout;
        let on_timeout = self.on_timeout.clone();
        let handler = message_handler_name(&msg).unwrap_or_default().to_owned();
        let ctx = msg.context().child_token();
        msg.set_context(ctx.clone());
        let fut = self.inner.call(msg);
        Box::pin(async move {
            // Cancel the child context however this call ends.
            let _cancel_on_exit = ctx.clone().drop_guard();
            tokio::select! {
                result = fut => result,
                () = tokio::time::sleep(timeout) => {
                    if let Some(hook) = &on_timeout {
                        hook(&handler);
                    }
                    Err(HandlerError::DeadlineExceeded { timeout })
                }
                () = ctx.cancelled() => Err(HandlerError::Cancelled),
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
