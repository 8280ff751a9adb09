//! Outbox events: records, domain payloads, and the publisher seam.

pub mod message;
pub mod outbox;
pub mod payloads;
pub mod publisher;

pub use message::{EventMessage, MessageError};
pub use outbox::{
    DEFAULT_MAX_OUTBOX_RETRIES, EventId, EventSent, OutboxEvent, OutboxEventType, OutboxStatus,
};
pub use publisher::{EventPublisher, InMemoryPublisher, PublishError};
