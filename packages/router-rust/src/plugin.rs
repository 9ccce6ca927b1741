//! Router plugins: hooks that run once before any handler starts.

use async_trait::async_trait;
use tokio::signal;
use tracing::info;

use crate::router::RouterHandle;

/// Extension point invoked by [`Router::run`](crate::Router::run) before the
/// handler loops are started.
///
/// A plugin that returns an error aborts the run.
#[async_trait]
pub trait RouterPlugin: Send + Sync {
    /// Name used in logs and in [`RouterError::Plugin`](crate::RouterError::Plugin).
    fn name(&self) -> &'static str;

    async fn on_start(&self, router: RouterHandle) -> anyhow::Result<()>;
}

/// Closes the router on Ctrl-C, or SIGTERM on unix.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignalsHandler;

#[async_trait]
impl RouterPlugin for SignalsHandler {
    fn name(&self) -> &'static str {
        "signals"
    }

    async fn on_start(&self, router: RouterHandle) -> anyhow::Result<()> {
        #[cfg(unix)]
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

        tokio::spawn(async move {
            #[cfg(unix)]
            let received = tokio::select! {
                result = signal::ctrl_c() => result.ok().map(|()| "SIGINT"),
                _ = sigterm.recv() => Some("SIGTERM"),
                () = router.stopped() => None,
            };
            #[cfg(not(unix))]
            let received = tokio::select! {
                result = signal::ctrl_c() => result.ok().map(|()| "SIGINT"),
                () = router.stopped() => None,
            };

            if let Some(signal) = received {
                info!(signal, "received shutdown signal, closing router");
                router.close();
            }
        });
        Ok(())
    }
}
