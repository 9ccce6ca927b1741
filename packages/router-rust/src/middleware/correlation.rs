//! Correlation id propagation.
//!
//! Copies the correlation id of the inbound message onto every message the
//! handler produces, so a chain of handlers can be traced end to end.

use std::task::{Context, Poll};

use courier_core::Message;
use tower::{Layer, Service};

use crate::error::HandlerError;
use crate::handler::HandlerFuture;

/// Metadata key holding the correlation id.
pub const CORRELATION_ID_KEY: &str = "correlation_id";

/// Sets the correlation id of `msg` unless it already has one.
pub fn set_correlation_id(id: &str, msg: &mut Message) {
    if message_correlation_id(msg).is_none() {
        msg.metadata_mut().set(CORRELATION_ID_KEY, id);
    }
}

/// Returns the correlation id of `msg`, if present.
#[must_use]
pub fn message_correlation_id(msg: &Message) -> Option<&str> {
    msg.metadata().get(CORRELATION_ID_KEY)
}

// ---------------------------------------------------------------------------
// CorrelationLayer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct CorrelationLayer;

impl<S> Layer<S> for CorrelationLayer {
    type Service = CorrelationService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CorrelationService { inner }
    }
}

// ---------------------------------------------------------------------------
// CorrelationService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CorrelationService<S> {
    inner: S,
}

impl<S> Service<Message> for CorrelationService<S>
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
        let correlation_id = message_correlation_id(&msg).map(str::to_owned);
        let fut = self.inner.call(msg);
        Box::pin(async move {
            let mut outputs = fut.await?;
            // Outputs always carry the inbound id, even if the handler set another.
            if let Some(id) = correlation_id {
                for out in &mut outputs {
                    out.metadata_mut().set(CORRELATION_ID_KEY, id.as_str());
                }
            }
            Ok(outputs)
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use courier_core::Metadata;
    use tower::ServiceExt;

    use super::*;

    /// Produces `count` outputs, one of them pre-tagged with a foreign id.
    #[derive(Clone)]
    struct FanOut {
        count: usize,
    }

    impl Service<Message> for FanOut {
        type Response = Vec<Message>;
        type Error = HandlerError;
        type Future = HandlerFuture;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, _msg: Message) -> Self::Future {
            let count = self.count;
            Box::pin(async move {
                let mut outputs: Vec<Message> =
                    (0..count).map(|_| Message::new("out", Metadata::new())).collect();
                if let Some(first) = outputs.first_mut() {
                    first.metadata_mut().set(CORRELATION_ID_KEY, "foreign");
                }
                Ok(outputs)
            })
        }
    }

    #[test]
    fn set_correlation_id_does_not_overwrite() {
        let mut msg = Message::new("x", Metadata::new());
        assert_eq!(message_correlation_id(&msg), None);

        set_correlation_id("first", &mut msg);
        set_correlation_id("second", &mut msg);
        assert_eq!(message_correlation_id(&msg), Some("first"));
    }

    #[tokio::test]
    async fn copies_id_to_every_output() {
        let svc = CorrelationLayer.layer(FanOut { count: 3 });
        let mut input = Message::new("in", Metadata::new());
        set_correlation_id("corr-1", &mut input);

        let outputs = svc.oneshot(input).await.unwrap();
        assert_eq!(outputs.len(), 3);
        for out in &outputs {
            assert_eq!(message_correlation_id(out), Some("corr-1"));
        }
    }

    #[tokio::test]
    async fn never_invents_an_id() {
        let svc = CorrelationLayer.layer(FanOut { count: 2 });
        let outputs = svc.oneshot(Message::new("in", Metadata::new())).await.unwrap();

        assert_eq!(message_correlation_id(&outputs[0]), Some("foreign"));
        assert_eq!(message_correlation_id(&outputs[1]), None);
    }
}
