//! Panic recovery middleware.
//!
//! Converts a panic raised by the wrapped handler, either while building its
//! future or while polling it, into [`HandlerError::Panicked`].

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::task::{Context, Poll};

use courier_core::Message;
use futures_util::FutureExt;
use tower::{Layer, Service};
use tracing::error;

use crate::error::HandlerError;
use crate::handler::{message_handler_name, HandlerFuture};

type PanicHook = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Clone, Default)]
pub struct RecovererLayer {
    on_panic: Option<PanicHook>,
}

impl RecovererLayer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a callback invoked with the handler name for every recovered
    /// panic.
    #[must_use]
    pub fn on_panic(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_panic = Some(Arc::new(hook));
        self
    }
}

impl fmt::Debug for RecovererLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecovererLayer")
            .field("on_panic", &self.on_panic.is_some())
            .finish()
    }
}

impl<S> Layer<S> for RecovererLayer {
    type Service = RecovererService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RecovererService {
            inner,
            on_panic: self.on_panic.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RecovererService<S> {
    inner: S,
    on_panic: Option<PanicHook>,
}

impl<S> Service<Message> for RecovererService<S>
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

    fn call(&mut self, msg: Message) -> Self::Future {
        let uuid = msg.uuid().to_owned();
        let handler = message_handler_name(&msg).unwrap_or_default().to_owned();
        let on_panic = self.on_panic.clone();
        let fut = match std::panic::catch_unwind(AssertUnwindSafe(|| self.inner.call(msg))) {
            Ok(fut) => fut,
            Err(payload) => {
                let err = panicked(&uuid, &handler, on_panic.as_ref(), payload.as_ref());
                return Box::pin(async move { Err(err) });
            }
        };
        Box::pin(async move {
            match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(result) => result,
                Err(payload) => Err(panicked(&uuid, &handler, on_panic.as_ref(), payload.as_ref())),
            }
        })
    }
}

fn panicked(uuid: &str, handler: &str, on_panic: Option<&PanicHook>, payload: &(dyn Any + Send)) -> HandlerError {
    let message = if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    };
    error!(message_uuid = %uuid, handler, panic = %message, "handler panicked");
    if let Some(hook) = on_panic {
        hook(handler);
    }
    HandlerError::Panicked { message }
}
