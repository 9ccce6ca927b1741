//! Router lifecycle state machine and shutdown signalling.
//!
//! Uses `ArcSwap` for lock-free state reads and guarded transitions, a
//! `watch` channel so callers can await transitions, and a
//! `CancellationToken` from which every dispatch loop context is derived.

use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Router lifecycle state.
///
/// State machine: `NotStarted -> Running -> Stopping -> Stopped`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterState {
    /// Handlers may still be registered; no loop runs yet.
    NotStarted,
    /// Every dispatch loop has been started.
    Running,
    /// Shutdown was requested; loops are unwinding.
    Stopping,
    /// Every dispatch loop has exited. Terminal.
    Stopped,
}

/// Owns the router state and the root cancellation token.
#[derive(Debug)]
pub struct LifecycleController {
    state: ArcSwap<RouterState>,
    transitions: watch::Sender<RouterState>,
    shutdown: CancellationToken,
}

impl LifecycleController {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(RouterState::NotStarted);
        Self {
            state: ArcSwap::from_pointee(RouterState::NotStarted),
            transitions: tx,
            shutdown: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn state(&self) -> RouterState {
        **self.state.load()
    }

    /// Moves from `from` to `to` only if the current state is `from`.
    fn transition(&self, from: RouterState, to: RouterState) -> bool {
        let mut moved = false;
        self.state.rcu(|current| {
            moved = **current == from;
            if moved {
                Arc::new(to)
            } else {
                Arc::clone(current)
            }
        });
        if moved {
            self.transitions.send_replace(to);
        }
        moved
    }

    /// `NotStarted -> Running`. Returns `false` if the router was started before.
    pub fn mark_running(&self) -> bool {
        self.transition(RouterState::NotStarted, RouterState::Running)
    }

    /// Cancels the root token and moves `Running -> Stopping`.
    ///
    /// Safe to call any number of times and from any state.
    pub fn begin_stop(&self) {
        self.shutdown.cancel();
        self.transition(RouterState::Running, RouterState::Stopping);
    }

    /// Enters the terminal `Stopped` state.
    pub fn mark_stopped(&self) {
        self.shutdown.cancel();
        self.state.store(Arc::new(RouterState::Stopped));
        self.transitions.send_replace(RouterState::Stopped);
    }

    /// Root token; dispatch loops run on children of it.
    #[must_use]
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Waits until the state satisfies `pred` and returns that state.
    pub async fn wait_for(&self, pred: impl Fn(RouterState) -> bool) -> RouterState {
        let mut rx = self.transitions.subscribe();
        let reached = rx.wait_for(|state| pred(*state)).await.map(|s| *s);
        // `self` owns the sender, so the channel stays open while we wait.
        reached.unwrap_or_else(|_| self.state())
    }
}

impl Default for LifecycleController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn initial_state_is_not_started() {
        let lifecycle = LifecycleController::new();
        assert_eq!(lifecycle.state(), RouterState::NotStarted);
        assert!(!lifecycle.shutdown_token().is_cancelled());
    }

    #[test]
    fn full_state_machine() {
        let lifecycle = LifecycleController::new();

        assert!(lifecycle.mark_running());
        assert_eq!(lifecycle.state(), RouterState::Running);

        lifecycle.begin_stop();
        assert_eq!(lifecycle.state(), RouterState::Stopping);
        assert!(lifecycle.shutdown_token().is_cancelled());

        lifecycle.mark_stopped();
        assert_eq!(lifecycle.state(), RouterState::Stopped);
    }

    #[test]
    fn cannot_start_twice() {
        let lifecycle = LifecycleController::new();
        assert!(lifecycle.mark_running());
        assert!(!lifecycle.mark_running());

        lifecycle.mark_stopped();
        assert!(!lifecycle.mark_running());
        assert_eq!(lifecycle.state(), RouterState::Stopped);
    }

    #[test]
    fn stop_before_start_only_cancels() {
        let lifecycle = LifecycleController::new();
        lifecycle.begin_stop();
        assert_eq!(lifecycle.state(), RouterState::NotStarted);
        assert!(lifecycle.shutdown_token().is_cancelled());
    }

    #[tokio::test]
    async fn wait_for_observes_transition() {
        let lifecycle = Arc::new(LifecycleController::new());
        let waiter = {
            let lifecycle = Arc::clone(&lifecycle);
            tokio::spawn(async move { lifecycle.wait_for(|s| s == RouterState::Running).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        lifecycle.mark_running();

        assert_eq!(waiter.await.unwrap(), RouterState::Running);
    }

    #[tokio::test]
    async fn wait_for_returns_immediately_when_satisfied() {
        let lifecycle = LifecycleController::new();
        lifecycle.mark_running();
        lifecycle.mark_stopped();
        let state = lifecycle.wait_for(|s| s != RouterState::NotStarted).await;
        assert_eq!(state, RouterState::Stopped);
    }
}
