//! Message envelope and the per-delivery acknowledgment state machine.
//!
//! A [`Message`] is identity + payload + metadata plus a shared acknowledgment
//! cell. Clones of a message share that cell: whichever clone resolves it first
//! decides the outcome of the delivery. [`Message::copy`] starts a fresh
//! delivery of the same identity with its own cell.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::metadata::Metadata;

// ---------------------------------------------------------------------------
// AckState / AckError
// ---------------------------------------------------------------------------

/// Acknowledgment state of a single delivery attempt.
///
/// State machine: `Pending -> Acked` or `Pending -> Nacked`. Both outcomes are
/// terminal for the attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckState {
    Pending,
    Acked,
    Nacked,
}

impl AckState {
    #[must_use]
    pub fn is_resolved(self) -> bool {
        self != AckState::Pending
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            AckState::Pending => "pending",
            AckState::Acked => "acked",
            AckState::Nacked => "nacked",
        }
    }
}

/// Returned when a delivery that is already resolved is acked or nacked again.
///
/// The second call never changes the recorded outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AckError {
    #[error("message was already acked")]
    DuplicateAck,
    #[error("message was already nacked")]
    DuplicateNack,
    #[error("cannot ack a message that was already nacked")]
    AckAfterNack,
    #[error("cannot nack a message that was already acked")]
    NackAfterAck,
}

impl AckError {
    fn for_transition(current: AckState, attempted: AckState) -> Self {
        match (current, attempted) {
            (AckState::Nacked, AckState::Acked) => AckError::AckAfterNack,
            (AckState::Acked, AckState::Nacked) => AckError::NackAfterAck,
            (_, AckState::Nacked) => AckError::DuplicateNack,
            _ => AckError::DuplicateAck,
        }
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A unit of data moving through topics, handlers and middlewares.
#[derive(Clone)]
pub struct Message {
    uuid: String,
    payload: Bytes,
    metadata: Metadata,
    ack: Arc<watch::Sender<AckState>>,
    ctx: CancellationToken,
}

impl Message {
    /// Creates a message with a freshly generated identifier in the `Pending` state.
    #[must_use]
    pub fn new(payload: impl Into<Bytes>, metadata: Metadata) -> Self {
        Self::with_uuid(crate::new_uuid(), payload, metadata)
    }

    /// Creates a message with an explicit identifier.
    #[must_use]
    pub fn with_uuid(uuid: impl Into<String>, payload: impl Into<Bytes>, metadata: Metadata) -> Self {
        let (tx, _rx) = watch::channel(AckState::Pending);
        Self {
            uuid: uuid.into(),
            payload: payload.into(),
            metadata,
            ack: Arc::new(tx),
            ctx: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    #[must_use]
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Mutable access to metadata, used by middlewares before delegating.
    pub fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    /// Cancellation context of the current handling attempt.
    #[must_use]
    pub fn context(&self) -> &CancellationToken {
        &self.ctx
    }

    /// Replaces the cancellation context (e.g. with a deadline-bound child token).
    pub fn set_context(&mut self, ctx: CancellationToken) {
        self.ctx = ctx;
    }

    /// Starts a new logical delivery of the same message.
    ///
    /// Identity, payload and metadata are kept; acknowledgment state is reset
    /// to `Pending` and the cancellation context is fresh.
    #[must_use]
    pub fn copy(&self) -> Self {
        let (tx, _rx) = watch::channel(AckState::Pending);
        Self {
            uuid: self.uuid.clone(),
            payload: self.payload.clone(),
            metadata: self.metadata.clone(),
            ack: Arc::new(tx),
            ctx: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn ack_state(&self) -> AckState {
        *self.ack.borrow()
    }

    /// Marks this delivery as successfully handled.
    ///
    /// # Errors
    ///
    /// Returns an [`AckError`] if the delivery was already resolved. The
    /// recorded outcome is left unchanged.
    pub fn ack(&self) -> Result<(), AckError> {
        self.resolve(AckState::Acked)
    }

    /// Marks this delivery as failed.
    ///
    /// # Errors
    ///
    /// Returns an [`AckError`] if the delivery was already resolved. The
    /// recorded outcome is left unchanged.
    pub fn nack(&self) -> Result<(), AckError> {
        self.resolve(AckState::Nacked)
    }

    fn resolve(&self, target: AckState) -> Result<(), AckError> {
        let mut current = AckState::Pending;
        let changed = self.ack.send_if_modified(|state| {
            current = *state;
            if *state == AckState::Pending {
                *state = target;
                true
            } else {
                false
            }
        });
        if changed {
            return Ok(());
        }
        let err = AckError::for_transition(current, target);
        warn!(
            message_uuid = %self.uuid,
            current = current.as_str(),
            attempted = target.as_str(),
            "ignoring repeated acknowledgment: {err}"
        );
        Err(err)
    }

    /// Waits until this delivery is acked or nacked and returns the outcome.
    pub async fn resolved(&self) -> AckState {
        let mut rx = self.ack.subscribe();
        let outcome = rx.wait_for(|state| state.is_resolved()).await.map(|s| *s);
        // The sender lives in `self`, so the channel cannot close while we wait.
        outcome.unwrap_or(AckState::Pending)
    }

    /// Resolves to `true` once the delivery is acked, `false` if it is nacked.
    pub async fn acked(&self) -> bool {
        self.resolved().await == AckState::Acked
    }

    /// Resolves to `true` once the delivery is nacked, `false` if it is acked.
    pub async fn nacked(&self) -> bool {
        self.resolved().await == AckState::Nacked
    }

    /// Returns a watcher that observes the outcome without keeping the message alive.
    #[must_use]
    pub fn ack_watcher(&self) -> AckWatcher {
        AckWatcher {
            rx: self.ack.subscribe(),
        }
    }
}

impl PartialEq for Message {
    /// Two messages are equal when identity, payload and metadata match.
    /// Acknowledgment state and context are per-delivery and not compared.
    fn eq(&self, other: &Self) -> bool {
        self.uuid == other.uuid && self.payload == other.payload && self.metadata == other.metadata
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("uuid", &self.uuid)
            .field("payload_len", &self.payload.len())
            .field("metadata", &self.metadata)
            .field("ack_state", &self.ack_state())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// AckWatcher
// ---------------------------------------------------------------------------

/// Observes the acknowledgment outcome of one delivery.
///
/// Held by transports that need to know when a consumer finished with a
/// message. Does not keep the message itself alive.
#[derive(Debug)]
pub struct AckWatcher {
    rx: watch::Receiver<AckState>,
}

impl AckWatcher {
    /// Waits for the delivery to be resolved.
    ///
    /// Returns `None` if every clone of the message was dropped while still
    /// `Pending` (the consumer abandoned it).
    pub async fn wait(&mut self) -> Option<AckState> {
        self.rx.wait_for(|state| state.is_resolved()).await.ok().map(|s| *s)
    }

    #[must_use]
    pub fn current(&self) -> AckState {
        *self.rx.borrow()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
