//! In-process pub/sub transport.
//!
//! [`ChannelPubSub`] implements both [`Publisher`](courier_core::Publisher) and
//! [`Subscriber`](courier_core::Subscriber) on top of bounded tokio channels.
//! Each subscription owns a delivery worker that hands out one message at a
//! time and waits for it to be acked or nacked before moving on.

mod channel;
mod config;

pub use channel::ChannelPubSub;
pub use config::{ChannelConfig, RedeliveryPolicy};
