//! Error types for handler invocation, router configuration, and router runs.

use std::time::Duration;

use courier_core::PubSubError;

/// Errors produced while handling a single message.
///
/// Every variant resolves to a nack of the inbound message; none of them stop
/// the dispatch loop.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("handler failed: {0}")]
    Failed(#[from] anyhow::Error),
    #[error("handler panicked: {message}")]
    Panicked { message: String },
    #[error("handler did not finish within {timeout:?}")]
    DeadlineExceeded { timeout: Duration },
    #[error("handling was cancelled")]
    Cancelled,
    #[error("publishing to `{topic}` failed: {source}")]
    PublishFailed {
        topic: String,
        #[source]
        source: PubSubError,
    },
}

impl HandlerError {
    /// Short machine-readable label used in logs and metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            HandlerError::Failed(_) => "failed",
            HandlerError::Panicked { .. } => "panicked",
            HandlerError::DeadlineExceeded { .. } => "deadline_exceeded",
            HandlerError::Cancelled => "cancelled",
            HandlerError::PublishFailed { .. } => "publish_failed",
        }
    }
}

/// Configuration mistakes detected while building a router. Fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("handler `{name}` is already registered")]
    DuplicateHandler { name: String },
    #[error("router has already been started")]
    RouterAlreadyStarted,
    #[error("invalid configuration for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Errors surfaced by [`Router::run`](crate::Router::run).
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error(transparent)]
    Configuration(#[from] ConfigError),
    #[error("handler `{handler}` could not subscribe to `{topic}`: {source}")]
    Subscribe {
        handler: String,
        topic: String,
        #[source]
        source: PubSubError,
    },
    #[error("subscription of handler `{handler}` to `{topic}` was closed by the transport")]
    SubscriptionClosed { handler: String, topic: String },
    #[error("plugin `{plugin}` failed: {source}")]
    Plugin {
        plugin: &'static str,
        #[source]
        source: anyhow::Error,
    },
    #[error("handler loop aborted: {reason}")]
    LoopAborted { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_error_kinds() {
        assert_eq!(HandlerError::from(anyhow::anyhow!("boom")).kind(), "failed");
        assert_eq!(
            HandlerError::DeadlineExceeded {
                timeout: Duration::from_millis(5)
            }
            .kind(),
            "deadline_exceeded"
        );
        let publish = HandlerError::PublishFailed {
            topic: "out".to_string(),
            source: PubSubError::Closed,
        };
        assert_eq!(publish.kind(), "publish_failed");
        assert_eq!(publish.to_string(), "publishing to `out` failed: pub/sub is closed");
    }

    #[test]
    fn config_error_converts_into_router_error() {
        let err: RouterError = ConfigError::DuplicateHandler {
            name: "h".to_string(),
        }
        .into();
        assert_eq!(err.to_string(), "handler `h` is already registered");
    }
}
