//! Event publishing abstraction (mechanics only).
//!
//! A publisher delivers one [`EventMessage`] to an external transport
//! (broker, webhook fan-out, ...). The outbox relay decides what to do with
//! the outcome; publishers only classify failures.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;

use crate::message::EventMessage;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// Worth retrying (network, broker unavailable).
    #[error("transient publish failure: {0}")]
    Transient(String),

    /// Will never succeed for this message (rejected, malformed).
    #[error("permanent publish failure: {0}")]
    Permanent(String),
}

impl PublishError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, PublishError::Transient(_))
    }
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, message: &EventMessage) -> Result<(), PublishError>;
}

/// In-memory publisher for tests/dev.
///
/// Records delivered messages; failures can be scripted per idempotency key.
#[derive(Debug, Default)]
pub struct InMemoryPublisher {
    published: Mutex<Vec<EventMessage>>,
    scripted_failures: Mutex<HashMap<String, VecDeque<PublishError>>>,
}

impl InMemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next publish of `idempotency_key` with `error`.
    pub fn fail_next(&self, idempotency_key: impl Into<String>, error: PublishError) {
        if let Ok(mut failures) = self.scripted_failures.lock() {
            failures
                .entry(idempotency_key.into())
                .or_default()
                .push_back(error);
        }
    }

    /// Fail the next `times` publishes of `idempotency_key`.
    pub fn fail_times(&self, idempotency_key: &str, times: usize, error: PublishError) {
        for _ in 0..times {
            self.fail_next(idempotency_key, error.clone());
        }
    }

    pub fn published(&self) -> Vec<EventMessage> {
        self.published
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl EventPublisher for InMemoryPublisher {
    async fn publish(&self, message: &EventMessage) -> Result<(), PublishError> {
        let scripted = self
            .scripted_failures
            .lock()
            .map_err(|_| PublishError::Transient("lock poisoned".to_string()))?
            .get_mut(message.idempotency_key())
            .and_then(VecDeque::pop_front);
        if let Some(err) = scripted {
            return Err(err);
        }

        self.published
            .lock()
            .map_err(|_| PublishError::Transient("lock poisoned".to_string()))?
            .push(message.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::{EventId, OutboxEvent, OutboxEventType};
    use chrono::Utc;

    fn test_message(key: &str) -> EventMessage {
        let event = OutboxEvent::pending(
            EventId::new(key, None),
            OutboxEventType::PaymentSaved,
            "p",
            serde_json::json!({}),
            Utc::now(),
        );
        EventMessage::from_outbox(&event).unwrap()
    }

    #[tokio::test]
    async fn scripted_failures_are_consumed_in_order() {
        let publisher = InMemoryPublisher::new();
        publisher.fail_times("a", 2, PublishError::Transient("down".to_string()));

        assert!(publisher.publish(&test_message("a")).await.is_err());
        assert!(publisher.publish(&test_message("a")).await.is_err());
        assert!(publisher.publish(&test_message("a")).await.is_ok());
        assert!(publisher.publish(&test_message("b")).await.is_ok());
        assert_eq!(publisher.published().len(), 2);
    }
}
