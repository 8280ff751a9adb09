use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use paystate_core::ConnectorId;

use crate::outbox::{OutboxEvent, OutboxEventType};

/// Envelope for an outbox event, as handed to a publisher.
///
/// Consumers dedupe on `idempotency_key` (+ `connector_id`): delivery is
/// at-least-once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMessage {
    idempotency_key: String,
    #[serde(rename = "connectorID", skip_serializing_if = "Option::is_none")]
    connector_id: Option<ConnectorId>,
    #[serde(rename = "type")]
    event_type: OutboxEventType,
    entity_id: String,
    date: DateTime<Utc>,
    payload: serde_json::Value,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("unknown event type {0:?}")]
    UnknownEventType(String),

    #[error("payload of {0} is not a JSON object")]
    InvalidPayload(String),
}

impl EventMessage {
    pub fn from_outbox(event: &OutboxEvent) -> Result<Self, MessageError> {
        let event_type = event
            .known_type()
            .ok_or_else(|| MessageError::UnknownEventType(event.event_type.clone()))?;
        if !event.payload.is_object() {
            return Err(MessageError::InvalidPayload(event.id.to_string()));
        }

        Ok(Self {
            idempotency_key: event.id.idempotency_key.clone(),
            connector_id: event.id.connector_id,
            event_type,
            entity_id: event.entity_id.clone(),
            date: event.created_at,
            payload: event.payload.clone(),
        })
    }

    pub fn idempotency_key(&self) -> &str {
        &self.idempotency_key
    }

    pub fn connector_id(&self) -> Option<ConnectorId> {
        self.connector_id
    }

    pub fn event_type(&self) -> OutboxEventType {
        self.event_type
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn date(&self) -> DateTime<Utc> {
        self.date
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::EventId;

    #[test]
    fn unknown_type_is_rejected() {
        let mut event = OutboxEvent::pending(
            EventId::new("k", None),
            OutboxEventType::BalanceSaved,
            "acc",
            serde_json::json!({"balance": "1"}),
            Utc::now(),
        );
        assert!(EventMessage::from_outbox(&event).is_ok());

        event.event_type = "LEGACY_THING".to_string();
        assert_eq!(
            EventMessage::from_outbox(&event),
            Err(MessageError::UnknownEventType("LEGACY_THING".to_string()))
        );
    }

    #[test]
    fn non_object_payload_is_rejected() {
        let event = OutboxEvent::pending(
            EventId::new("k", None),
            OutboxEventType::BalanceSaved,
            "acc",
            serde_json::json!([1, 2]),
            Utc::now(),
        );
        assert!(matches!(
            EventMessage::from_outbox(&event),
            Err(MessageError::InvalidPayload(_))
        ));
    }
}
