//! `Courier` Core — message envelope, acknowledgment state machine, and pub/sub contracts.

pub mod message;
pub mod metadata;
pub mod pubsub;

pub use message::{AckError, AckState, AckWatcher, Message};
pub use metadata::Metadata;
pub use pubsub::{MessageStream, PubSubError, Publisher, Subscriber};

/// Generates a random message identifier (UUID v4, hyphenated).
#[must_use]
pub fn new_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }

    #[test]
    fn uuids_are_unique() {
        assert_ne!(super::new_uuid(), super::new_uuid());
        assert_eq!(super::new_uuid().len(), 36);
    }
}
