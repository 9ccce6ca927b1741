//! Transport contracts: anything that can publish to or subscribe from topics.
//!
//! The router only talks to transports through these two traits. Concrete
//! brokers (in-process channels, network brokers) implement one or both.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::message::Message;

/// Stream of deliveries for one subscription.
///
/// The stream ends when the subscription context is cancelled or the
/// transport is closed. Every received message must be acked or nacked.
pub type MessageStream = mpsc::Receiver<Message>;

/// Errors reported by transports.
#[derive(Debug, thiserror::Error)]
pub enum PubSubError {
    #[error("pub/sub is closed")]
    Closed,
    #[error("topic `{topic}` rejected the publish: {reason}")]
    Rejected { topic: String, reason: String },
    #[error("transport error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Publishes messages to named topics.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publishes `messages` to `topic` in order.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport cannot accept the messages (for
    /// example because it was closed).
    async fn publish(&self, topic: &str, messages: Vec<Message>) -> Result<(), PubSubError>;

    /// Releases publisher resources. Publishing afterwards fails.
    async fn close(&self) -> Result<(), PubSubError>;
}

/// Subscribes to named topics.
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Opens a subscription on `topic` that lives until `ctx` is cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error if the subscription cannot be established.
    async fn subscribe(
        &self,
        topic: &str,
        ctx: CancellationToken,
    ) -> Result<MessageStream, PubSubError>;

    /// Ends every open subscription and releases subscriber resources.
    async fn close(&self) -> Result<(), PubSubError>;
}
