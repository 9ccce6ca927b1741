//! Handler functions and their registrations.
//!
//! A handler is an async function from one inbound [`Message`] to zero or more
//! output messages. Every handler is adapted into a [`HandlerService`] (a boxed
//! `tower::Service`) so middlewares can wrap it uniformly.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use courier_core::{Message, Publisher, Subscriber};
use futures_util::future::BoxFuture;
use tower::util::BoxCloneService;

use crate::error::HandlerError;
use crate::middleware::{compose, Middleware};

// ---------------------------------------------------------------------------
// Service types
// ---------------------------------------------------------------------------

/// Future returned by every handler-shaped service.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Vec<Message>, HandlerError>> + Send>>;

/// Type-erased, cloneable handler service: the unit middlewares operate on.
pub type HandlerService = BoxCloneService<Message, Vec<Message>, HandlerError>;

/// Metadata key the dispatch loop sets to the name of the handler processing
/// an inbound message.
pub const HANDLER_NAME_KEY: &str = "handler_name";

/// Name of the handler processing `msg`, if it came from a dispatch loop.
#[must_use]
pub fn message_handler_name(msg: &Message) -> Option<&str> {
    msg.metadata().get(HANDLER_NAME_KEY)
}

pub(crate) type HandlerFn = Arc<dyn Fn(Message) -> BoxFuture<'static, anyhow::Result<Vec<Message>>> + Send + Sync>;

/// Adapts a publishing handler closure into the shared function shape.
pub(crate) fn publishing<F, Fut>(handler: F) -> HandlerFn
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Vec<Message>>> + Send + 'static,
{
    Arc::new(move |msg| -> BoxFuture<'static, anyhow::Result<Vec<Message>>> {
        Box::pin(handler(msg))
    })
}

/// Adapts an observer closure; it can never produce output messages.
pub(crate) fn observing<F, Fut>(handler: F) -> HandlerFn
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |msg| -> BoxFuture<'static, anyhow::Result<Vec<Message>>> {
        let fut = handler(msg);
        Box::pin(async move { fut.await.map(|()| Vec::new()) })
    })
}

// ---------------------------------------------------------------------------
// HandlerRegistration
// ---------------------------------------------------------------------------

/// Where a handler publishes its output messages.
#[derive(Clone)]
pub(crate) struct Output {
    pub topic: String,
    pub publisher: Arc<dyn Publisher>,
}

/// A named handler bound to an input topic and, optionally, an output topic.
pub(crate) struct HandlerRegistration {
    pub name: String,
    pub subscribe_topic: String,
    pub subscriber: Arc<dyn Subscriber>,
    pub output: Option<Output>,
    handler: HandlerFn,
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl HandlerRegistration {
    pub fn new(
        name: String,
        subscribe_topic: String,
        subscriber: Arc<dyn Subscriber>,
        output: Option<Output>,
        handler: HandlerFn,
    ) -> Self {
        Self {
            name,
            subscribe_topic,
            subscriber,
            output,
            handler,
            middlewares: Vec::new(),
        }
    }

    /// Builds the effective handler: `global` wraps handler-level middlewares,
    /// which wrap the raw handler function.
    pub fn build_service(&self, global: &[Arc<dyn Middleware>]) -> HandlerService {
        let handler = Arc::clone(&self.handler);
        let raw = tower::service_fn(move |msg: Message| {
            let fut = handler(msg);
            async move { fut.await.map_err(HandlerError::Failed) }
        });
        compose(
            BoxCloneService::new(raw),
            global.iter().chain(self.middlewares.iter()),
        )
    }
}

// ---------------------------------------------------------------------------
// HandlerHandle
// ---------------------------------------------------------------------------

/// Returned by handler registration; adds handler-level middlewares.
pub struct HandlerHandle<'a> {
    registration: &'a mut HandlerRegistration,
}

impl<'a> HandlerHandle<'a> {
    pub(crate) fn new(registration: &'a mut HandlerRegistration) -> Self {
        Self { registration }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.registration.name
    }

    /// Adds a middleware that runs only for this handler, inside every
    /// router-level middleware. Later additions wrap the handler more tightly.
    pub fn add_middleware(&mut self, middleware: impl Middleware + 'static) -> &mut Self {
        self.registration.middlewares.push(Arc::new(middleware));
        self
    }
}
