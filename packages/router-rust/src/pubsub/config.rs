//! Configuration for the in-process transport.

use serde::Deserialize;

/// What a subscription does after its consumer nacks a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RedeliveryPolicy {
    /// A nack is final; the subscription moves on to the next message.
    #[default]
    None,
    /// Resend a fresh copy right away, at most `max_attempts` times.
    Immediate { max_attempts: u32 },
}

/// Settings for [`ChannelPubSub`](super::ChannelPubSub).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Capacity of each subscription's output stream. Deliveries that do not
    /// fit wait in that subscription's own queue; they never hold back
    /// `publish` or other subscriptions.
    pub output_channel_buffer: usize,
    /// Keep every published message and replay it to later subscribers.
    pub persistent: bool,
    /// Make `publish` return only after every subscriber resolved each message.
    pub block_publish_until_subscriber_ack: bool,
    pub redelivery: RedeliveryPolicy,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            output_channel_buffer: 64,
            persistent: false,
            block_publish_until_subscriber_ack: false,
            redelivery: RedeliveryPolicy::None,
        }
    }
}
