//! Channel-backed topics, subscriptions and their delivery workers.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use courier_core::{AckState, Message, MessageStream, PubSubError, Publisher, Subscriber};
use dashmap::DashMap;
use futures_util::future::join_all;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use super::config::{ChannelConfig, RedeliveryPolicy};

/// A message queued for one subscription, with an optional completion signal
/// for publishers that wait for the subscriber's verdict.
struct Delivery {
    msg: Message,
    done: Option<oneshot::Sender<()>>,
}

/// Publisher-side view of a subscription.
///
/// The inbox is unbounded so staging never waits on a slow consumer; the
/// subscription's worker drains it into the bounded output channel.
#[derive(Clone)]
struct SubscriptionHandle {
    id: u64,
    inbox: mpsc::UnboundedSender<Delivery>,
    token: CancellationToken,
}

impl SubscriptionHandle {
    /// Queues `msg` behind everything staged earlier. Returns `false` once the
    /// subscription has ended.
    fn stage(&self, msg: Message, done: Option<oneshot::Sender<()>>) -> bool {
        !self.token.is_cancelled() && self.inbox.send(Delivery { msg, done }).is_ok()
    }
}

#[derive(Default)]
struct TopicState {
    subscribers: Vec<SubscriptionHandle>,
    history: Vec<Message>,
}

struct Inner {
    config: ChannelConfig,
    topics: DashMap<String, TopicState>,
    closing: CancellationToken,
    closed: AtomicBool,
    tasks: TaskTracker,
    next_id: AtomicU64,
}

// ---------------------------------------------------------------------------
// ChannelPubSub
// ---------------------------------------------------------------------------

/// In-process transport. Cheap to clone; clones share topics and subscriptions.
#[derive(Clone)]
pub struct ChannelPubSub {
    inner: Arc<Inner>,
}

impl ChannelPubSub {
    #[must_use]
    pub fn new(config: ChannelConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                topics: DashMap::new(),
                closing: CancellationToken::new(),
                closed: AtomicBool::new(false),
                tasks: TaskTracker::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Number of live subscriptions on `topic`.
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner
            .topics
            .get(topic)
            .map_or(0, |state| state.subscribers.len())
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Ends every subscription and waits for all delivery workers to exit.
    ///
    /// Idempotent. Publishing and subscribing fail afterwards.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            self.inner.tasks.wait().await;
            return;
        }
        debug!("closing in-process pub/sub");
        self.inner.closing.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        self.inner.topics.clear();
    }

    /// Waits until the subscription behind `token` has resolved a delivery,
    /// or has ended.
    async fn wait_for_verdict(&self, token: CancellationToken, done: oneshot::Receiver<()>) {
        tokio::select! {
            _ = done => {}
            () = token.cancelled() => {}
            () = self.inner.closing.cancelled() => {}
        }
    }
}

impl Default for ChannelPubSub {
    fn default() -> Self {
        Self::new(ChannelConfig::default())
    }
}

#[async_trait]
impl Publisher for ChannelPubSub {
    async fn publish(&self, topic: &str, messages: Vec<Message>) -> Result<(), PubSubError> {
        if self.is_closed() {
            return Err(PubSubError::Closed);
        }
        let persistent = self.inner.config.persistent;
        let wait_for_ack = self.inner.config.block_publish_until_subscriber_ack;

        for msg in messages {
            let mut verdicts = Vec::new();
            // Staging happens under the entry guard, so history and every
            // subscription see one order per topic. The guard is released
            // before any await.
            let staged = {
                let mut state = self.inner.topics.entry(topic.to_string()).or_default();
                if persistent {
                    state.history.push(msg.copy());
                }
                let mut staged = 0_usize;
                for sub in &state.subscribers {
                    let (done, verdict) = if wait_for_ack {
                        let (tx, rx) = oneshot::channel();
                        (Some(tx), Some((sub.token.clone(), rx)))
                    } else {
                        (None, None)
                    };
                    if sub.stage(msg.copy(), done) {
                        staged += 1;
                        verdicts.extend(verdict);
                    } else {
                        debug!(topic, subscription = sub.id, "subscription gone, skipping delivery");
                    }
                }
                staged
            };
            if staged == 0 {
                debug!(topic, message_uuid = %msg.uuid(), persistent, "no subscribers for message");
                continue;
            }
            if !verdicts.is_empty() {
                join_all(
                    verdicts
                        .into_iter()
                        .map(|(token, done)| self.wait_for_verdict(token, done)),
                )
                .await;
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), PubSubError> {
        ChannelPubSub::close(self).await;
        Ok(())
    }
}

#[async_trait]
impl Subscriber for ChannelPubSub {
    async fn subscribe(&self, topic: &str, ctx: CancellationToken) -> Result<MessageStream, PubSubError> {
        if self.is_closed() {
            return Err(PubSubError::Closed);
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let token = ctx.child_token();
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (output_tx, output_rx) = mpsc::channel(self.inner.config.output_channel_buffer.max(1));

        // Registration and history snapshot happen under one guard, so every
        // message is either replayed or delivered live, never both.
        let replay = {
            let mut state = self.inner.topics.entry(topic.to_string()).or_default();
            state.subscribers.push(SubscriptionHandle {
                id,
                inbox: inbox_tx,
                token: token.clone(),
            });
            state.history.iter().map(Message::copy).collect::<Vec<_>>()
        };
        debug!(topic, subscription = id, replayed = replay.len(), "subscribed");

        let worker = DeliveryWorker {
            id,
            topic: topic.to_string(),
            pubsub: Arc::downgrade(&self.inner),
            token,
            closing: self.inner.closing.clone(),
            redelivery: self.inner.config.redelivery,
            inbox: inbox_rx,
            output: output_tx,
        };
        self.inner.tasks.spawn(worker.run(replay));
        Ok(output_rx)
    }

    async fn close(&self) -> Result<(), PubSubError> {
        ChannelPubSub::close(self).await;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// DeliveryWorker
// ---------------------------------------------------------------------------

/// Feeds one subscription: replayed history first, then live messages, one at
/// a time, waiting for each to be resolved.
struct DeliveryWorker {
    id: u64,
    topic: String,
    pubsub: Weak<Inner>,
    token: CancellationToken,
    closing: CancellationToken,
    redelivery: RedeliveryPolicy,
    inbox: mpsc::UnboundedReceiver<Delivery>,
    output: mpsc::Sender<Message>,
}

impl DeliveryWorker {
    async fn run(mut self, replay: Vec<Message>) {
        let mut open = true;
        for msg in replay {
            if !self.deliver(&msg).await {
                open = false;
                break;
            }
        }

        while open {
            let delivery = tokio::select! {
                biased;
                () = self.token.cancelled() => break,
                () = self.closing.cancelled() => break,
                delivery = self.inbox.recv() => match delivery {
                    Some(delivery) => delivery,
                    None => break,
                },
            };
            open = self.deliver(&delivery.msg).await;
            if let Some(done) = delivery.done {
                let _ = done.send(());
            }
        }

        self.token.cancel();
        if let Some(inner) = self.pubsub.upgrade() {
            if let Some(mut state) = inner.topics.get_mut(&self.topic) {
                state.subscribers.retain(|sub| sub.id != self.id);
            }
        }
        debug!(topic = %self.topic, subscription = self.id, "subscription ended");
    }

    /// Hands `msg` to the consumer until it is resolved. Returns `false` once
    /// the subscription should stop.
    async fn deliver(&self, msg: &Message) -> bool {
        let mut redeliveries = 0;
        loop {
            let mut attempt = msg.copy();
            attempt.set_context(self.token.child_token());
            let mut watcher = attempt.ack_watcher();

            let sent = tokio::select! {
                biased;
                () = self.token.cancelled() => false,
                () = self.closing.cancelled() => false,
                result = self.output.send(attempt) => result.is_ok(),
            };
            if !sent {
                return false;
            }

            let outcome = tokio::select! {
                biased;
                () = self.token.cancelled() => return false,
                () = self.closing.cancelled() => return false,
                outcome = watcher.wait() => outcome,
            };

            match (outcome, self.redelivery) {
                (Some(AckState::Acked), _) => return true,
                (Some(AckState::Nacked), RedeliveryPolicy::Immediate { max_attempts })
                    if redeliveries < max_attempts =>
                {
                    redeliveries += 1;
                    debug!(
                        topic = %self.topic,
                        message_uuid = %msg.uuid(),
                        redeliveries,
                        "message nacked, redelivering"
                    );
                }
                (Some(_), _) => {
                    warn!(topic = %self.topic, message_uuid = %msg.uuid(), "message nacked, not redelivered");
                    return true;
                }
                (None, _) => {
                    debug!(topic = %self.topic, message_uuid = %msg.uuid(), "delivery abandoned by consumer");
                    return true;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
