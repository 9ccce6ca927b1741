//! Throttle middleware.
//!
//! Limits how many handler invocations may start within any window of
//! `interval`. Every service produced by one [`ThrottleLayer`] shares the same
//! window, so the limit applies across all handlers the layer wraps. Calls over
//! the limit wait for a free slot instead of failing.

use std::collections::VecDeque;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use courier_core::Message;
use parking_lot::Mutex;
use tokio::time::Instant;
use tower::{Layer, Service};

use crate::error::HandlerError;
use crate::handler::HandlerFuture;

// ---------------------------------------------------------------------------
// SlidingWindow
// ---------------------------------------------------------------------------

/// Start instants of the invocations admitted during the last `window`.
#[derive(Debug)]
struct SlidingWindow {
    limit: usize,
    window: Duration,
    starts: VecDeque<Instant>,
}

impl SlidingWindow {
    fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit: limit.max(1),
            window,
            starts: VecDeque::with_capacity(limit.max(1)),
        }
    }

    /// Admits a start at `now`, or returns how long to wait before retrying.
    fn try_admit(&mut self, now: Instant) -> Result<(), Duration> {
        while let Some(&front) = self.starts.front() {
            if now.saturating_duration_since(front) >= self.window {
                self.starts.pop_front();
            } else {
                break;
            }
        }
        if self.starts.len() < self.limit {
            self.starts.push_back(now);
            return Ok(());
        }
        // Full: the oldest start leaves the window first.
        let oldest = self.starts.front().copied().unwrap_or(now);
        Err((oldest + self.window).saturating_duration_since(now))
    }
}

// ---------------------------------------------------------------------------
// ThrottleLayer
// ---------------------------------------------------------------------------

/// Tower layer admitting at most `count` invocation starts per `interval`.
#[derive(Debug, Clone)]
pub struct ThrottleLayer {
    window: Arc<Mutex<SlidingWindow>>,
}

impl ThrottleLayer {
    /// A `count` of zero is treated as one.
    #[must_use]
    pub fn new(count: usize, interval: Duration) -> Self {
        Self {
            window: Arc::new(Mutex::new(SlidingWindow::new(count, interval))),
        }
    }
}

impl<S> Layer<S> for ThrottleLayer {
    type Service = ThrottleService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ThrottleService {
            inner,
            window: Arc::clone(&self.window),
        }
    }
}

// ---------------------------------------------------------------------------
// ThrottleService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ThrottleService<S> {
    inner: S,
    window: Arc<Mutex<SlidingWindow>>,
}

impl<S> Service<Message> for ThrottleService<S>
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
        // Keep the instance that was driven to readiness.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let window = Arc::clone(&self.window);
        Box::pin(async move {
            loop {
                let admitted = window.lock().try_admit(Instant::now());
                match admitted {
                    Ok(()) => break,
                    Err(wait) => {
                        tokio::select! {
                            () = tokio::time::sleep(wait) => {}
                            () = msg.context().cancelled() => return Err(HandlerError::Cancelled),
                        }
                    }
                }
            }
            inner.call(msg).await
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
