//! Outbox records.
//!
//! An [`OutboxEvent`] is staged in the same transaction as the domain write
//! it announces. Once delivered it is deleted and replaced by an
//! [`EventSent`] row in a single transaction, so every event lives in exactly
//! one of the two tables.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use paystate_core::ConnectorId;
use paystate_core::time::normalize;

/// Retries before an event is dead-lettered, unless configured otherwise.
pub const DEFAULT_MAX_OUTBOX_RETRIES: u32 = 5;

/// Identity of an event: caller-chosen idempotency key, scoped by connector.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId {
    pub idempotency_key: String,
    pub connector_id: Option<ConnectorId>,
}

impl EventId {
    pub fn new(idempotency_key: impl Into<String>, connector_id: Option<ConnectorId>) -> Self {
        Self {
            idempotency_key: idempotency_key.into(),
            connector_id,
        }
    }

    /// Primary key used by both `outbox_events` and `events_sent`.
    pub fn storage_key(&self) -> String {
        match self.connector_id {
            Some(connector_id) => format!("{}:{}", connector_id, self.idempotency_key),
            None => self.idempotency_key.clone(),
        }
    }
}

impl core::fmt::Display for EventId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.storage_key())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    Pending,
    /// Dead-lettered: excluded from polling until an operator requeues it.
    Failed,
}

impl OutboxStatus {
    pub fn code(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "PENDING",
            OutboxStatus::Failed => "FAILED",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "PENDING" => Some(OutboxStatus::Pending),
            "FAILED" => Some(OutboxStatus::Failed),
            _ => None,
        }
    }

    /// Status after a delivery attempt failed `retry_count` times in total.
    pub fn after_failure(retry_count: u32, max_retries: u32) -> Self {
        if retry_count >= max_retries {
            OutboxStatus::Failed
        } else {
            OutboxStatus::Pending
        }
    }
}

/// Catalogue of event types this system emits.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxEventType {
    PaymentSaved,
    PaymentDeleted,
    OrderSaved,
    BalanceSaved,
}

impl OutboxEventType {
    pub fn code(&self) -> &'static str {
        match self {
            OutboxEventType::PaymentSaved => "PAYMENT_SAVED",
            OutboxEventType::PaymentDeleted => "PAYMENT_DELETED",
            OutboxEventType::OrderSaved => "ORDER_SAVED",
            OutboxEventType::BalanceSaved => "BALANCE_SAVED",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "PAYMENT_SAVED" => Some(OutboxEventType::PaymentSaved),
            "PAYMENT_DELETED" => Some(OutboxEventType::PaymentDeleted),
            "ORDER_SAVED" => Some(OutboxEventType::OrderSaved),
            "BALANCE_SAVED" => Some(OutboxEventType::BalanceSaved),
            _ => None,
        }
    }
}

/// Durable staging record for one downstream event.
///
/// `event_type` is kept as the stored code: rows written by other versions
/// of the system may carry types this build does not know.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: EventId,
    pub event_type: String,
    pub entity_id: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub status: OutboxStatus,
    pub connector_id: Option<ConnectorId>,
    pub retry_count: u32,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl OutboxEvent {
    pub fn pending(
        id: EventId,
        event_type: OutboxEventType,
        entity_id: impl Into<String>,
        payload: serde_json::Value,
        created_at: DateTime<Utc>,
    ) -> Self {
        let connector_id = id.connector_id;
        Self {
            id,
            event_type: event_type.code().to_string(),
            entity_id: entity_id.into(),
            payload,
            created_at: normalize(created_at),
            status: OutboxStatus::Pending,
            connector_id,
            retry_count: 0,
            last_retry_at: None,
            error: None,
        }
    }

    pub fn known_type(&self) -> Option<OutboxEventType> {
        OutboxEventType::from_code(&self.event_type)
    }

    /// Record a failed delivery attempt; returns whether it was recorded.
    ///
    /// A dead-lettered event is left untouched until it is requeued.
    pub fn record_failure(
        &mut self,
        retry_count: u32,
        error: impl Into<String>,
        at: DateTime<Utc>,
        max_retries: u32,
    ) -> bool {
        if self.status == OutboxStatus::Failed {
            return false;
        }
        self.retry_count = retry_count;
        self.error = Some(error.into());
        self.last_retry_at = Some(normalize(at));
        self.status = OutboxStatus::after_failure(retry_count, max_retries);
        true
    }
}

/// Proof of delivery, keyed by the event's idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSent {
    pub id: EventId,
    pub connector_id: Option<ConnectorId>,
    pub sent_at: DateTime<Utc>,
}

impl EventSent {
    pub fn new(id: EventId, sent_at: DateTime<Utc>) -> Self {
        let connector_id = id.connector_id;
        Self {
            id,
            connector_id,
            sent_at: normalize(sent_at),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn test_event() -> OutboxEvent {
        OutboxEvent::pending(
            EventId::new("key-1", Some(ConnectorId::from_uuid(Uuid::from_u128(3)))),
            OutboxEventType::PaymentSaved,
            "entity",
            serde_json::json!({}),
            Utc::now(),
        )
    }

    #[test]
    fn failure_escalates_to_failed_at_max_retries() {
        let mut event = test_event();
        for attempt in 1..DEFAULT_MAX_OUTBOX_RETRIES {
            assert!(event.record_failure(attempt, "boom", Utc::now(), DEFAULT_MAX_OUTBOX_RETRIES));
            assert_eq!(event.status, OutboxStatus::Pending);
        }
        assert!(event.record_failure(
            DEFAULT_MAX_OUTBOX_RETRIES,
            "boom",
            Utc::now(),
            DEFAULT_MAX_OUTBOX_RETRIES,
        ));
        assert_eq!(event.status, OutboxStatus::Failed);
        assert_eq!(event.retry_count, DEFAULT_MAX_OUTBOX_RETRIES);
        assert_eq!(event.error.as_deref(), Some("boom"));
        assert!(event.last_retry_at.is_some());
    }

    #[test]
    fn dead_lettered_event_ignores_late_failures() {
        let mut event = test_event();
        event.record_failure(2, "broker down", Utc::now(), 2);
        assert_eq!(event.status, OutboxStatus::Failed);

        assert!(!event.record_failure(1, "late", Utc::now(), 2));
        assert_eq!(event.status, OutboxStatus::Failed);
        assert_eq!(event.retry_count, 2);
        assert_eq!(event.error.as_deref(), Some("broker down"));
    }

    #[test]
    fn storage_key_is_scoped_by_connector() {
        let scoped = EventId::new("k", Some(ConnectorId::from_uuid(Uuid::from_u128(3))));
        let global = EventId::new("k", None);
        assert_ne!(scoped.storage_key(), global.storage_key());
        assert_eq!(global.storage_key(), "k");
    }

    #[test]
    fn event_type_codes_are_stable() {
        for t in [
            OutboxEventType::PaymentSaved,
            OutboxEventType::PaymentDeleted,
            OutboxEventType::OrderSaved,
            OutboxEventType::BalanceSaved,
        ] {
            assert_eq!(OutboxEventType::from_code(t.code()), Some(t));
            assert_eq!(serde_json::to_value(t).unwrap(), serde_json::json!(t.code()));
        }
        assert_eq!(OutboxEventType::from_code("ACCOUNT_SAVED"), None);
    }
}
