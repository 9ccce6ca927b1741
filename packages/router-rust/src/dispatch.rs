//! Per-handler dispatch loop.
//!
//! Pulls messages from the handler's subscription, runs them through the
//! handler's middleware-wrapped service, publishes the outputs and resolves
//! the delivery. Handler failures never stop the loop; only the transport
//! ending the subscription does.

use std::sync::Arc;
use std::time::Instant;

use courier_core::{Message, MessageStream};
use tokio_util::sync::CancellationToken;
use tower::{Service, ServiceExt};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::error::{HandlerError, RouterError};
use crate::handler::{HandlerRegistration, HandlerService, Output, HANDLER_NAME_KEY};
use crate::metrics::RouterMetrics;

/// Opens the subscription a handler loop will consume, bound to `ctx`.
pub(crate) async fn subscribe(
    registration: &HandlerRegistration,
    ctx: &CancellationToken,
) -> Result<MessageStream, RouterError> {
    registration
        .subscriber
        .subscribe(&registration.subscribe_topic, ctx.child_token())
        .await
        .map_err(|source| RouterError::Subscribe {
            handler: registration.name.clone(),
            topic: registration.subscribe_topic.clone(),
            source,
        })
}

pub(crate) struct HandlerLoop {
    name: String,
    topic: String,
    output: Option<Output>,
    service: HandlerService,
    metrics: Arc<RouterMetrics>,
}

impl HandlerLoop {
    pub fn new(registration: &HandlerRegistration, service: HandlerService, metrics: Arc<RouterMetrics>) -> Self {
        Self {
            name: registration.name.clone(),
            topic: registration.subscribe_topic.clone(),
            output: registration.output.clone(),
            service,
            metrics,
        }
    }

    /// Runs until `ctx` is cancelled (clean exit) or the transport ends
    /// `stream` (error).
    pub async fn run(mut self, mut stream: MessageStream, ctx: CancellationToken) -> Result<(), RouterError> {
        info!(handler = %self.name, topic = %self.topic, "handler loop started");

        loop {
            let next = tokio::select! {
                biased;
                () = ctx.cancelled() => break,
                next = stream.recv() => next,
            };
            let Some(msg) = next else {
                if ctx.is_cancelled() {
                    break;
                }
                warn!(handler = %self.name, topic = %self.topic, "subscription closed by transport");
                return Err(RouterError::SubscriptionClosed {
                    handler: self.name.clone(),
                    topic: self.topic.clone(),
                });
            };
            self.handle_message(msg, &ctx).await;
        }

        info!(handler = %self.name, topic = %self.topic, "handler loop stopped");
        Ok(())
    }

    async fn handle_message(&mut self, msg: Message, ctx: &CancellationToken) {
        self.metrics.record_received(&self.name);

        let mut invocation = msg.clone();
        invocation.set_context(ctx.child_token());
        invocation.metadata_mut().set(HANDLER_NAME_KEY, self.name.as_str());

        let span = info_span!(
            "handle_message",
            handler = %self.name,
            message_uuid = %msg.uuid(),
            topic = %self.topic,
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        async {
            let start = Instant::now();
            let result = match self.invoke(invocation).await {
                Ok(outputs) => self.publish(outputs).await,
                Err(err) => Err(err),
            };

            #[allow(clippy::cast_possible_truncation)]
            let duration_ms = start.elapsed().as_millis() as u64;
            let span = tracing::Span::current();
            span.record("duration_ms", duration_ms);

            match result {
                Ok(()) => {
                    span.record("outcome", "acked");
                    if msg.ack().is_ok() {
                        self.metrics.record_acked(&self.name);
                    }
                    debug!(duration_ms, "message acked");
                }
                Err(err) => {
                    span.record("outcome", "nacked");
                    warn!(
                        error = %err,
                        kind = err.kind(),
                        metadata = %msg.metadata(),
                        duration_ms,
                        "message handling failed, nacking"
                    );
                    if msg.nack().is_ok() {
                        self.metrics.record_nacked(&self.name, &err);
                    }
                }
            }
        }
        .instrument(span)
        .await;
    }

    async fn invoke(&mut self, msg: Message) -> Result<Vec<Message>, HandlerError> {
        let service = self.service.ready().await?;
        service.call(msg).await
    }

    async fn publish(&mut self, outputs: Vec<Message>) -> Result<(), HandlerError> {
        let Some(output) = &self.output else {
            if !outputs.is_empty() {
                debug!(discarded = outputs.len(), "observer handler produced messages, discarding");
            }
            return Ok(());
        };
        if outputs.is_empty() {
            return Ok(());
        }

        let count = outputs.len();
        output
            .publisher
            .publish(&output.topic, outputs)
            .await
            .map_err(|source| HandlerError::PublishFailed {
                topic: output.topic.clone(),
                source,
            })?;
        self.metrics.record_published(&self.name, count);
        debug!(count, output_topic = %output.topic, "published handler output");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
