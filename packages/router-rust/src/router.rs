//! The message router: handler registry, global middlewares, plugins and the
//! supervision of every handler loop.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use courier_core::{Message, Publisher, Subscriber};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RouterConfig;
use crate::dispatch::{self, HandlerLoop};
use crate::error::{ConfigError, RouterError};
use crate::handler::{observing, publishing, HandlerFn, HandlerHandle, HandlerRegistration, Output};
use crate::lifecycle::{LifecycleController, RouterState};
use crate::metrics::RouterMetrics;
use crate::middleware::Middleware;
use crate::plugin::RouterPlugin;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Routes messages from subscribed topics through handlers.
///
/// Configure it with global middlewares, plugins and handlers, then call
/// [`Router::run`]. Registration is rejected once the router has started.
pub struct Router {
    config: RouterConfig,
    handlers: Vec<HandlerRegistration>,
    names: HashSet<String>,
    middlewares: Vec<Arc<dyn Middleware>>,
    plugins: Vec<Box<dyn RouterPlugin>>,
    lifecycle: Arc<LifecycleController>,
    metrics: Arc<RouterMetrics>,
}

impl Router {
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` if `config` fails validation.
    pub fn new(config: RouterConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            handlers: Vec::new(),
            names: HashSet::new(),
            middlewares: Vec::new(),
            plugins: Vec::new(),
            lifecycle: Arc::new(LifecycleController::new()),
            metrics: Arc::new(RouterMetrics::new()),
        })
    }

    /// Adds a middleware wrapping every handler. Middlewares added first run
    /// outermost.
    pub fn add_middleware(&mut self, middleware: impl Middleware + 'static) -> &mut Self {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    /// Appends already-built middlewares, such as
    /// [`standard_chain`](crate::middleware::standard_chain).
    pub fn add_middlewares(&mut self, middlewares: impl IntoIterator<Item = Arc<dyn Middleware>>) -> &mut Self {
        self.middlewares.extend(middlewares);
        self
    }

    pub fn add_plugin(&mut self, plugin: impl RouterPlugin + 'static) -> &mut Self {
        self.plugins.push(Box::new(plugin));
        self
    }

    /// Registers a handler consuming `subscribe_topic` and publishing its
    /// outputs to `publish_topic`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::DuplicateHandler` if `name` is taken and
    /// `ConfigError::RouterAlreadyStarted` once the router has been run.
    pub fn add_handler<F, Fut>(
        &mut self,
        name: impl Into<String>,
        subscribe_topic: impl Into<String>,
        subscriber: Arc<dyn Subscriber>,
        publish_topic: impl Into<String>,
        publisher: Arc<dyn Publisher>,
        handler: F,
    ) -> Result<HandlerHandle<'_>, ConfigError>
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Vec<Message>>> + Send + 'static,
    {
        let output = Output {
            topic: publish_topic.into(),
            publisher,
        };
        self.register(
            name.into(),
            subscribe_topic.into(),
            subscriber,
            Some(output),
            publishing(handler),
        )
    }

    /// Registers an observer: a handler that consumes `subscribe_topic` and
    /// never publishes.
    ///
    /// # Errors
    ///
    /// Same as [`Router::add_handler`].
    pub fn add_no_publisher_handler<F, Fut>(
        &mut self,
        name: impl Into<String>,
        subscribe_topic: impl Into<String>,
        subscriber: Arc<dyn Subscriber>,
        handler: F,
    ) -> Result<HandlerHandle<'_>, ConfigError>
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.register(name.into(), subscribe_topic.into(), subscriber, None, observing(handler))
    }

    fn register(
        &mut self,
        name: String,
        subscribe_topic: String,
        subscriber: Arc<dyn Subscriber>,
        output: Option<Output>,
        handler: HandlerFn,
    ) -> Result<HandlerHandle<'_>, ConfigError> {
        if self.lifecycle.state() != RouterState::NotStarted {
            return Err(ConfigError::RouterAlreadyStarted);
        }
        if !self.names.insert(name.clone()) {
            return Err(ConfigError::DuplicateHandler { name });
        }
        debug!(handler = %name, topic = %subscribe_topic, publishes = output.is_some(), "handler registered");

        let index = self.handlers.len();
        self.handlers
            .push(HandlerRegistration::new(name, subscribe_topic, subscriber, output, handler));
        Ok(HandlerHandle::new(&mut self.handlers[index]))
    }

    #[must_use]
    pub fn handle(&self) -> RouterHandle {
        RouterHandle {
            lifecycle: Arc::clone(&self.lifecycle),
            metrics: Arc::clone(&self.metrics),
        }
    }

    #[must_use]
    pub fn metrics(&self) -> &Arc<RouterMetrics> {
        &self.metrics
    }

    /// Runs every handler until `ctx` is cancelled or the router is closed
    /// through a [`RouterHandle`], then waits for all handler loops to exit.
    ///
    /// Plugins run first, then every handler subscribes, then the router
    /// reports `Running`. There is no deadline on shutdown: in-flight messages
    /// are always finished.
    ///
    /// # Errors
    ///
    /// Returns the first fatal error: a failed plugin, a failed subscription,
    /// or a subscription closed by its transport. Handler errors are never
    /// fatal.
    pub async fn run(&mut self, ctx: CancellationToken) -> Result<(), RouterError> {
        if self.lifecycle.state() != RouterState::NotStarted {
            return Err(ConfigError::RouterAlreadyStarted.into());
        }
        info!(router = %self.config.name, handlers = self.handlers.len(), "starting router");

        for plugin in &self.plugins {
            debug!(plugin = plugin.name(), "starting plugin");
            if let Err(source) = plugin.on_start(self.handle()).await {
                error!(plugin = plugin.name(), error = %source, "plugin failed to start");
                self.lifecycle.mark_stopped();
                return Err(RouterError::Plugin {
                    plugin: plugin.name(),
                    source,
                });
            }
        }

        let token = self.lifecycle.shutdown_token().clone();
        let mut loops = JoinSet::new();
        for registration in &self.handlers {
            let stream = match dispatch::subscribe(registration, &token).await {
                Ok(stream) => stream,
                Err(err) => {
                    error!(handler = %registration.name, error = %err, "handler could not subscribe");
                    self.lifecycle.begin_stop();
                    while loops.join_next().await.is_some() {}
                    self.lifecycle.mark_stopped();
                    return Err(err);
                }
            };
            let service = registration.build_service(&self.middlewares);
            let handler_loop = HandlerLoop::new(registration, service, Arc::clone(&self.metrics));
            let name = registration.name.clone();
            let token = token.clone();
            loops.spawn(async move { (name, handler_loop.run(stream, token).await) });
        }

        self.lifecycle.mark_running();
        info!(router = %self.config.name, "router running");

        let result = self.supervise(loops, &ctx).await;

        self.lifecycle.mark_stopped();
        info!(router = %self.config.name, "router stopped");
        result
    }

    /// Waits for a stop request, then for every loop to exit. Returns the
    /// first loop error.
    async fn supervise(
        &self,
        mut loops: JoinSet<(String, Result<(), RouterError>)>,
        ctx: &CancellationToken,
    ) -> Result<(), RouterError> {
        let token = self.lifecycle.shutdown_token();
        let mut first_error = None;
        let mut stopping = false;
        let mut warn_ticker = tokio::time::interval(self.config.shutdown_warn_interval);

        loop {
            if stopping && loops.is_empty() {
                break;
            }
            tokio::select! {
                () = ctx.cancelled(), if !stopping => {
                    info!(router = %self.config.name, "context cancelled, stopping router");
                    self.lifecycle.begin_stop();
                    stopping = true;
                    warn_ticker.reset();
                }
                () = token.cancelled(), if !stopping => {
                    info!(router = %self.config.name, "router closed, stopping handlers");
                    self.lifecycle.begin_stop();
                    stopping = true;
                    warn_ticker.reset();
                }
                Some(joined) = loops.join_next(), if !loops.is_empty() => {
                    let err = match joined {
                        Ok((name, Ok(()))) => {
                            debug!(handler = %name, "handler loop exited");
                            None
                        }
                        Ok((name, Err(err))) => {
                            error!(handler = %name, error = %err, "handler loop failed");
                            Some(err)
                        }
                        Err(join_err) => {
                            error!(error = %join_err, "handler loop aborted");
                            Some(RouterError::LoopAborted {
                                reason: join_err.to_string(),
                            })
                        }
                    };
                    if first_error.is_none() {
                        first_error = err;
                    }
                    if loops.is_empty() && !stopping {
                        info!(router = %self.config.name, "no handler loops left, stopping router");
                        self.lifecycle.begin_stop();
                        stopping = true;
                    }
                }
                _ = warn_ticker.tick(), if stopping => {
                    warn!(remaining = loops.len(), "still waiting for handler loops to stop");
                }
            }
        }

        first_error.map_or(Ok(()), Err)
    }
}

// ---------------------------------------------------------------------------
// RouterHandle
// ---------------------------------------------------------------------------

/// Cheap, cloneable view of a router used to observe and stop it from other tasks.
#[derive(Debug, Clone)]
pub struct RouterHandle {
    lifecycle: Arc<LifecycleController>,
    metrics: Arc<RouterMetrics>,
}

impl RouterHandle {
    /// Requests a graceful stop. Idempotent; also valid before the router runs,
    /// in which case `run` stops right after starting.
    pub fn close(&self) {
        self.lifecycle.begin_stop();
    }

    #[must_use]
    pub fn state(&self) -> RouterState {
        self.lifecycle.state()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == RouterState::Running
    }

    /// `true` once a stop was requested or the router has stopped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lifecycle.shutdown_token().is_cancelled() || self.state() == RouterState::Stopped
    }

    /// Resolves once every handler has subscribed, or once the router gave up
    /// starting.
    pub async fn running(&self) {
        self.lifecycle.wait_for(|state| state != RouterState::NotStarted).await;
    }

    /// Resolves once every handler loop has exited.
    pub async fn stopped(&self) {
        self.lifecycle.wait_for(|state| state == RouterState::Stopped).await;
    }

    /// A token cancelled when the router starts stopping.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.lifecycle.shutdown_token().child_token()
    }

    #[must_use]
    pub fn metrics(&self) -> &Arc<RouterMetrics> {
        &self.metrics
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use courier_core::Metadata;
    use parking_lot::Mutex;
    use tokio::task::JoinHandle;
    use tower::ServiceExt;

    use super::*;
    use crate::handler::HandlerService;
    use crate::metrics::MetricsSnapshot;
    use crate::middleware::{
        message_correlation_id, middleware_fn, set_correlation_id, standard_chain, RecovererLayer, RetryLayer,
        RetryPolicy, TimeoutLayer,
    };
    use crate::config::MiddlewareConfig;
    use crate::pubsub::{ChannelConfig, ChannelPubSub};

    fn persistent() -> ChannelPubSub {
        ChannelPubSub::new(ChannelConfig {
            persistent: true,
            ..ChannelConfig::default()
        })
    }

    fn router() -> Router {
        Router::new(RouterConfig::default()).unwrap()
    }

    async fn start(mut router: Router) -> (RouterHandle, JoinHandle<Result<(), RouterError>>) {
        let handle = router.handle();
        let run = tokio::spawn(async move { router.run(CancellationToken::new()).await });
        handle.running().await;
        (handle, run)
    }

    async fn wait_for(handle: &RouterHandle, done: impl Fn(&MetricsSnapshot) -> bool) -> MetricsSnapshot {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let snapshot = handle.metrics().snapshot();
                if done(&snapshot) {
                    return snapshot;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached")
    }

    fn collector(into: &Arc<Mutex<Vec<Message>>>) -> impl Fn(Message) -> futures_util::future::Ready<anyhow::Result<()>> {
        let into = Arc::clone(into);
        move |msg| {
            into.lock().push(msg);
            futures_util::future::ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn hello_scenario_acks_everything_and_greets_once() {
        let pubsub = persistent();
        let mut router = router();
        let config = MiddlewareConfig {
            timeout: Duration::from_secs(2),
            throttle_count: 100,
            ..MiddlewareConfig::default()
        };
        let chain = standard_chain(&config, router.metrics());
        router.add_middlewares(chain);

        let incoming = Arc::new(Mutex::new(Vec::new()));
        let outgoing = Arc::new(Mutex::new(Vec::new()));
        router
            .add_no_publisher_handler("incoming_topic_handler", "incoming_topic", Arc::new(pubsub.clone()), collector(&incoming))
            .unwrap();
        router
            .add_handler(
                "hello_handler",
                "incoming_topic",
                Arc::new(pubsub.clone()),
                "outgoing_topic",
                Arc::new(pubsub.clone()),
                |_msg: Message| async {
                    Ok(vec![Message::new("greet from helloHandler", Metadata::new())])
                },
            )
            .unwrap();
        router
            .add_no_publisher_handler("outgoing_topic_handler", "outgoing_topic", Arc::new(pubsub.clone()), collector(&outgoing))
            .unwrap();

        let (handle, run) = start(router).await;

        let mut hello = Message::new("Hello, watermill!", Metadata::new());
        set_correlation_id("corr-42", &mut hello);
        pubsub.publish("incoming_topic", vec![hello.clone()]).await.unwrap();

        let snapshot = wait_for(&handle, |s| s.acked == 3).await;
        assert_eq!(snapshot.nacked, 0);
        assert_eq!(snapshot.published, 1);

        handle.close();
        run.await.unwrap().unwrap();
        assert_eq!(handle.state(), RouterState::Stopped);

        let incoming = incoming.lock();
        assert_eq!(incoming.len(), 1);
        assert_eq!(incoming[0], hello);

        let outgoing = outgoing.lock();
        assert_eq!(outgoing.len(), 1);
        assert_eq!(outgoing[0].payload().as_ref(), b"greet from helloHandler");
        assert_eq!(message_correlation_id(&outgoing[0]), Some("corr-42"));
    }

    #[tokio::test]
    async fn always_failing_handler_is_called_six_times_then_nacked() {
        let pubsub = persistent();
        let calls = Arc::new(AtomicU32::new(0));
        let mut router = router();
        router.add_middleware(RetryLayer::new(RetryPolicy::immediate(5)));
        let counter = Arc::clone(&calls);
        router
            .add_handler(
                "doomed",
                "in",
                Arc::new(pubsub.clone()),
                "out",
                Arc::new(pubsub.clone()),
                move |_msg: Message| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Err(anyhow::anyhow!("always broken")) }
                },
            )
            .unwrap();

        let (handle, run) = start(router).await;
        pubsub.publish("in", vec![Message::new("x", Metadata::new())]).await.unwrap();

        let snapshot = wait_for(&handle, |s| s.nacked == 1).await;
        assert_eq!(calls.load(Ordering::SeqCst), 6);
        assert_eq!(snapshot.published, 0);
        assert_eq!(snapshot.acked, 0);

        handle.close();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn retry_success_publishes_exactly_once() {
        let pubsub = persistent();
        let calls = Arc::new(AtomicU32::new(0));
        let mut router = router();
        let metrics = Arc::clone(router.metrics());
        router.add_middleware(RetryLayer::new(RetryPolicy::immediate(5)).on_retry(move |handler, _, _| metrics.record_retry(handler)));
        let counter = Arc::clone(&calls);
        router
            .add_handler(
                "flaky",
                "in",
                Arc::new(pubsub.clone()),
                "out",
                Arc::new(pubsub.clone()),
                move |msg: Message| {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n < 3 {
                            anyhow::bail!("transient failure {n}");
                        }
                        Ok(vec![Message::new(msg.payload().clone(), Metadata::new())])
                    }
                },
            )
            .unwrap();

        let (handle, run) = start(router).await;
        pubsub.publish("in", vec![Message::new("x", Metadata::new())]).await.unwrap();

        let snapshot = wait_for(&handle, |s| s.acked == 1).await;
        assert_eq!(snapshot.published, 1);
        assert_eq!(snapshot.retried, 3);
        assert_eq!(snapshot.nacked, 0);

        handle.close();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn late_handler_sees_persistent_history_in_order() {
        let pubsub = persistent();
        for payload in ["1", "2", "3"] {
            pubsub.publish("events", vec![Message::new(payload, Metadata::new())]).await.unwrap();
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut router = router();
        router
            .add_no_publisher_handler("late", "events", Arc::new(pubsub.clone()), collector(&seen))
            .unwrap();
        let (handle, run) = start(router).await;

        wait_for(&handle, |s| s.acked == 3).await;
        handle.close();
        run.await.unwrap().unwrap();

        let payloads: Vec<_> = seen.lock().iter().map(|m| m.payload().clone()).collect();
        assert_eq!(payloads, ["1", "2", "3"]);
    }

    #[tokio::test]
    async fn slow_handler_times_out_and_is_nacked() {
        let pubsub = persistent();
        let mut router = router();
        let metrics = Arc::clone(router.metrics());
        router.add_middleware(
            TimeoutLayer::new(Duration::from_millis(50)).on_timeout(move |handler| metrics.record_timed_out(handler)),
        );
        router
            .add_no_publisher_handler("sleepy", "in", Arc::new(pubsub.clone()), |_msg: Message| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            })
            .unwrap();

        let (handle, run) = start(router).await;
        pubsub.publish("in", vec![Message::new("x", Metadata::new())]).await.unwrap();

        let snapshot = wait_for(&handle, |s| s.nacked == 1).await;
        assert_eq!(snapshot.timed_out, 1);

        handle.close();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn panicking_handler_is_recovered_and_loop_continues() {
        let pubsub = persistent();
        let mut router = router();
        let metrics = Arc::clone(router.metrics());
        router.add_middleware(RecovererLayer::new().on_panic(move |handler| metrics.record_panicked(handler)));
        router
            .add_no_publisher_handler("fragile", "in", Arc::new(pubsub.clone()), |msg: Message| async move {
                assert!(msg.payload().as_ref() != b"boom", "cannot handle boom");
                Ok(())
            })
            .unwrap();

        let (handle, run) = start(router).await;
        pubsub
            .publish("in", vec![Message::new("boom", Metadata::new()), Message::new("fine", Metadata::new())])
            .await
            .unwrap();

        let snapshot = wait_for(&handle, |s| s.nacked + s.acked == 2).await;
        assert_eq!(snapshot.panicked, 1);
        assert_eq!(snapshot.acked, 1);

        handle.close();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn panic_retried_to_success_is_still_counted() {
        let pubsub = persistent();
        let calls = Arc::new(AtomicU32::new(0));
        let mut router = router();
        let config = MiddlewareConfig {
            max_retries: 2,
            retry_initial_interval: Duration::ZERO,
            ..MiddlewareConfig::default()
        };
        let chain = standard_chain(&config, router.metrics());
        router.add_middlewares(chain);
        let counter = Arc::clone(&calls);
        router
            .add_no_publisher_handler("shaky", "in", Arc::new(pubsub.clone()), move |_msg: Message| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    assert!(n > 0, "first attempt explodes");
                    Ok(())
                }
            })
            .unwrap();

        let (handle, run) = start(router).await;
        pubsub.publish("in", vec![Message::new("x", Metadata::new())]).await.unwrap();

        let snapshot = wait_for(&handle, |s| s.acked == 1).await;
        assert_eq!(snapshot.panicked, 1);
        assert_eq!(snapshot.retried, 1);
        assert_eq!(snapshot.nacked, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        handle.close();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn handler_middleware_runs_inside_global_middleware() {
        let pubsub = persistent();
        let trace = Arc::new(Mutex::new(Vec::new()));
        let mut router = router();

        let global_trace = Arc::clone(&trace);
        router.add_middleware(middleware_fn(move |msg: Message, next: HandlerService| {
            let trace = Arc::clone(&global_trace);
            async move {
                trace.lock().push("global");
                next.oneshot(msg).await
            }
        }));
        let local_trace = Arc::clone(&trace);
        router
            .add_no_publisher_handler("traced", "in", Arc::new(pubsub.clone()), |_msg: Message| async { Ok(()) })
            .unwrap()
            .add_middleware(middleware_fn(move |msg: Message, next: HandlerService| {
                let trace = Arc::clone(&local_trace);
                async move {
                    trace.lock().push("local");
                    next.oneshot(msg).await
                }
            }));

        let (handle, run) = start(router).await;
        pubsub.publish("in", vec![Message::new("x", Metadata::new())]).await.unwrap();
        wait_for(&handle, |s| s.acked == 1).await;
        handle.close();
        run.await.unwrap().unwrap();

        assert_eq!(*trace.lock(), vec!["global", "local"]);
    }

    #[test]
    fn duplicate_handler_name_is_rejected() {
        let pubsub = ChannelPubSub::default();
        let mut router = router();
        router
            .add_no_publisher_handler("same", "a", Arc::new(pubsub.clone()), |_msg: Message| async { Ok(()) })
            .unwrap();
        let err = router
            .add_no_publisher_handler("same", "b", Arc::new(pubsub), |_msg: Message| async { Ok(()) })
            .err()
            .unwrap();
        assert!(matches!(err, ConfigError::DuplicateHandler { ref name } if name == "same"));
    }

    #[tokio::test]
    async fn registration_and_rerun_after_start_are_rejected() {
        let pubsub = ChannelPubSub::default();
        let mut router = router();
        router.handle().close();
        router.run(CancellationToken::new()).await.unwrap();

        let err = router
            .add_no_publisher_handler("late", "a", Arc::new(pubsub), |_msg: Message| async { Ok(()) })
            .err()
            .unwrap();
        assert!(matches!(err, ConfigError::RouterAlreadyStarted));

        let err = router.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, RouterError::Configuration(ConfigError::RouterAlreadyStarted)));
    }

    #[tokio::test]
    async fn cancelling_the_context_stops_the_router() {
        let pubsub = ChannelPubSub::default();
        let mut router = router();
        router
            .add_no_publisher_handler("idle", "in", Arc::new(pubsub), |_msg: Message| async { Ok(()) })
            .unwrap();
        let handle = router.handle();
        let ctx = CancellationToken::new();

        let run = {
            let ctx = ctx.clone();
            tokio::spawn(async move { router.run(ctx).await })
        };
        handle.running().await;
        assert!(handle.is_running());
        assert!(!handle.is_closed());

        ctx.cancel();
        handle.stopped().await;
        run.await.unwrap().unwrap();
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn transport_closing_a_subscription_fails_the_run() {
        let pubsub = ChannelPubSub::default();
        let mut router = router();
        router
            .add_no_publisher_handler("orphan", "in", Arc::new(pubsub.clone()), |_msg: Message| async { Ok(()) })
            .unwrap();
        let (handle, run) = start(router).await;

        pubsub.close().await;

        let err = run.await.unwrap().unwrap_err();
        assert!(matches!(err, RouterError::SubscriptionClosed { ref handler, .. } if handler == "orphan"));
        assert_eq!(handle.state(), RouterState::Stopped);
    }
}
