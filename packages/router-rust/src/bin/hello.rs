//! `courier-hello`: publishes a greeting on a timer and routes it through a
//! handler that answers on another topic, with observers logging both topics.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use bytes::Bytes;
use clap::Parser;
use courier_core::{Message, Metadata, Publisher};
use courier_router::middleware::{middleware_fn, set_correlation_id, standard_chain};
use courier_router::{
    ChannelConfig, ChannelPubSub, HandlerService, MiddlewareConfig, Router, RouterConfig, RouterHandle,
    SignalsHandler,
};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const INCOMING_TOPIC: &str = "incoming_topic";
const OUTGOING_TOPIC: &str = "outgoing_topic";
const HELLO: &[u8] = b"Hello, watermill!";
const GREETING: &[u8] = b"greet from helloHandler";

#[derive(Debug, Parser)]
#[command(name = "courier-hello", about = "Route a greeting between two in-process topics")]
struct Args {
    /// Delay between published greetings, in milliseconds.
    #[arg(long, env = "COURIER_INTERVAL_MS", default_value_t = 3000)]
    interval_ms: u64,
    /// Stop publishing after this many messages.
    #[arg(long)]
    count: Option<u64>,
    /// Only deliver messages published after a handler subscribed.
    #[arg(long)]
    non_persistent: bool,
    /// Emit logs as JSON lines.
    #[arg(long, env = "COURIER_JSON_LOGS")]
    json_logs: bool,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    let pubsub = ChannelPubSub::new(ChannelConfig {
        persistent: !args.non_persistent,
        ..ChannelConfig::default()
    });

    let mut router = Router::new(RouterConfig::default())?;
    router.add_plugin(SignalsHandler);
    let middleware_config = MiddlewareConfig::default();
    middleware_config.validate()?;
    let chain = standard_chain(&middleware_config, router.metrics());
    router.add_middlewares(chain);

    router.add_no_publisher_handler(
        "incoming_topic_handler",
        INCOMING_TOPIC,
        Arc::new(pubsub.clone()),
        |msg: Message| async move {
            info!(message_uuid = %msg.uuid(), payload = %String::from_utf8_lossy(msg.payload()), "received on incoming topic");
            Ok(())
        },
    )?;

    router
        .add_handler(
            "hello_handler",
            INCOMING_TOPIC,
            Arc::new(pubsub.clone()),
            OUTGOING_TOPIC,
            Arc::new(pubsub.clone()),
            |msg: Message| async move {
                info!(message_uuid = %msg.uuid(), "hello_handler received message");
                Ok(vec![Message::new(Bytes::from_static(GREETING), Metadata::new())])
            },
        )?
        .add_middleware(middleware_fn(|msg: Message, next: HandlerService| async move {
            info!(message_uuid = %msg.uuid(), "executing hello_handler specific middleware");
            next.oneshot(msg).await
        }));

    router.add_no_publisher_handler(
        "outgoing_topic_handler",
        OUTGOING_TOPIC,
        Arc::new(pubsub.clone()),
        |msg: Message| async move {
            info!(message_uuid = %msg.uuid(), payload = %String::from_utf8_lossy(msg.payload()), "received on outgoing topic");
            Ok(())
        },
    )?;

    let handle = router.handle();
    let publisher = tokio::spawn(publish_messages(
        pubsub.clone(),
        handle.clone(),
        Duration::from_millis(args.interval_ms),
        args.count,
    ));

    let run_result = router.run(CancellationToken::new()).await;
    handle.close();
    publisher.await.context("publisher task panicked")?;
    pubsub.close().await;

    let snapshot = handle.metrics().snapshot();
    info!(
        received = snapshot.received,
        acked = snapshot.acked,
        nacked = snapshot.nacked,
        retried = snapshot.retried,
        published = snapshot.published,
        "router finished"
    );
    run_result.context("router failed")
}

/// Publishes a greeting every `interval` until the router stops or `count`
/// messages were sent.
async fn publish_messages(pubsub: ChannelPubSub, router: RouterHandle, interval: Duration, count: Option<u64>) {
    router.running().await;
    let shutdown = router.shutdown_token();
    let mut ticker = tokio::time::interval(interval);
    let mut sent = 0_u64;

    loop {
        if count.is_some_and(|limit| sent >= limit) {
            info!(sent, "publish limit reached");
            return;
        }
        tokio::select! {
            () = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let mut msg = Message::new(Bytes::from_static(HELLO), Metadata::new());
        set_correlation_id(&courier_core::new_uuid(), &mut msg);
        if let Err(err) = pubsub.publish(INCOMING_TOPIC, vec![msg]).await {
            warn!(error = %err, "could not publish greeting");
            return;
        }
        sent += 1;
    }
}
