//! Outbox events for domain writes.
//!
//! Each builder fixes the idempotency key of the event it produces:
//!
//! | event | idempotency key |
//! |-------|-----------------|
//! | `PAYMENT_SAVED` | adjustment id |
//! | `ORDER_SAVED` | adjustment id |
//! | `PAYMENT_DELETED` | `delete:<payment id>` |
//! | `BALANCE_SAVED` | `balance:<account>:<asset>:<created_at>:<value>` |

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use paystate_core::{Balance, Order, OrderAdjustment, Payment, PaymentAdjustment};

use crate::outbox::{EventId, OutboxEvent, OutboxEventType};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PaymentPayload<'a> {
    id: String,
    #[serde(rename = "connectorID")]
    connector_id: String,
    reference: &'a str,
    #[serde(rename = "type")]
    payment_type: &'static str,
    status: &'static str,
    initial_amount: Decimal,
    amount: Decimal,
    scheme: &'static str,
    asset: &'a str,
    created_at: DateTime<Utc>,
    #[serde(rename = "sourceAccountID", skip_serializing_if = "Option::is_none")]
    source_account_id: Option<String>,
    #[serde(rename = "destinationAccountID", skip_serializing_if = "Option::is_none")]
    destination_account_id: Option<String>,
    #[serde(rename = "adjustmentID")]
    adjustment_id: String,
    raw_data: &'a serde_json::Value,
    metadata: &'a BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OrderPayload<'a> {
    id: String,
    #[serde(rename = "connectorID")]
    connector_id: String,
    reference: &'a str,
    direction: &'static str,
    source_asset: &'a str,
    target_asset: &'a str,
    #[serde(rename = "type")]
    order_type: &'static str,
    status: &'static str,
    base_quantity_ordered: Decimal,
    fill: Option<Decimal>,
    created_at: DateTime<Utc>,
    #[serde(rename = "adjustmentID")]
    adjustment_id: String,
    raw_data: &'a serde_json::Value,
    metadata: &'a BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BalancePayload<'a> {
    #[serde(rename = "accountID")]
    account_id: String,
    #[serde(rename = "connectorID")]
    connector_id: String,
    asset: &'a str,
    balance: Decimal,
    created_at: DateTime<Utc>,
    last_updated_at: DateTime<Utc>,
}

fn to_value<T: Serialize>(payload: &T) -> serde_json::Value {
    // Payload structs hold only strings, decimals, timestamps and JSON maps.
    serde_json::to_value(payload).unwrap_or(serde_json::Value::Null)
}

/// `PAYMENT_SAVED` for a newly recorded adjustment of `payment`.
pub fn payment_saved(
    payment: &Payment,
    adjustment: &PaymentAdjustment,
    now: DateTime<Utc>,
) -> OutboxEvent {
    let payload = PaymentPayload {
        id: payment.id.to_string(),
        connector_id: payment.connector_id.to_string(),
        reference: &payment.reference,
        payment_type: payment.payment_type.code(),
        status: adjustment.status.code(),
        initial_amount: payment.initial_amount,
        amount: payment.amount,
        scheme: payment.scheme.code(),
        asset: &payment.asset,
        created_at: payment.created_at,
        source_account_id: payment.source_account_id.map(|id| id.to_string()),
        destination_account_id: payment.destination_account_id.map(|id| id.to_string()),
        adjustment_id: adjustment.id.to_string(),
        raw_data: &adjustment.raw,
        metadata: &payment.metadata,
    };

    OutboxEvent::pending(
        EventId::new(adjustment.id.to_string(), Some(payment.connector_id)),
        OutboxEventType::PaymentSaved,
        payment.id.to_string(),
        to_value(&payload),
        now,
    )
}

/// `PAYMENT_DELETED` for a payment removed by reference.
pub fn payment_deleted(payment: &Payment, now: DateTime<Utc>) -> OutboxEvent {
    let payload = serde_json::json!({
        "id": payment.id.to_string(),
        "connectorID": payment.connector_id.to_string(),
        "reference": payment.reference,
        "type": payment.payment_type.code(),
    });

    OutboxEvent::pending(
        EventId::new(format!("delete:{}", payment.id), Some(payment.connector_id)),
        OutboxEventType::PaymentDeleted,
        payment.id.to_string(),
        payload,
        now,
    )
}

/// `ORDER_SAVED` for a newly recorded adjustment of `order`.
pub fn order_saved(order: &Order, adjustment: &OrderAdjustment, now: DateTime<Utc>) -> OutboxEvent {
    let payload = OrderPayload {
        id: order.id.to_string(),
        connector_id: order.connector_id.to_string(),
        reference: &order.reference,
        direction: order.direction.code(),
        source_asset: &order.source_asset,
        target_asset: &order.target_asset,
        order_type: order.order_type.code(),
        status: adjustment.status.code(),
        base_quantity_ordered: order.initial_amount,
        fill: adjustment.amount,
        created_at: order.created_at,
        adjustment_id: adjustment.id.to_string(),
        raw_data: &adjustment.raw,
        metadata: &order.metadata,
    };

    OutboxEvent::pending(
        EventId::new(adjustment.id.to_string(), Some(order.connector_id)),
        OutboxEventType::OrderSaved,
        order.id.to_string(),
        to_value(&payload),
        now,
    )
}

/// `BALANCE_SAVED` for a stored balance value.
pub fn balance_saved(balance: &Balance, now: DateTime<Utc>) -> OutboxEvent {
    let payload = BalancePayload {
        account_id: balance.account_id.to_string(),
        connector_id: balance.connector_id.to_string(),
        asset: &balance.asset,
        balance: balance.balance,
        created_at: balance.created_at,
        last_updated_at: balance.last_updated_at,
    };
    let key = format!(
        "balance:{}:{}:{}:{}",
        balance.account_id,
        balance.asset,
        balance.created_at.timestamp_micros(),
        balance.balance.normalize()
    );

    OutboxEvent::pending(
        EventId::new(key, Some(balance.connector_id)),
        OutboxEventType::BalanceSaved,
        balance.account_id.to_string(),
        to_value(&payload),
        now,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use paystate_core::{AccountId, ConnectorId, PaymentScheme, PaymentStatus, PaymentType};
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn test_payment() -> Payment {
        Payment::new(
            ConnectorId::from_uuid(Uuid::from_u128(5)),
            PaymentType::PayIn,
            "py_1",
            Utc.with_ymd_and_hms(2024, 2, 2, 0, 0, 0).unwrap(),
            dec!(100),
            "EUR/2",
            PaymentScheme::SepaCredit,
        )
        .with_adjustment(
            "py_1",
            Utc.with_ymd_and_hms(2024, 2, 2, 0, 0, 0).unwrap(),
            PaymentStatus::Succeeded,
            Some(dec!(100)),
        )
    }

    #[test]
    fn payment_saved_is_keyed_by_adjustment() {
        let payment = test_payment();
        let adjustment = &payment.adjustments[0];
        let event = payment_saved(&payment, adjustment, Utc::now());

        assert_eq!(event.id.idempotency_key, adjustment.id.to_string());
        assert_eq!(event.connector_id, Some(payment.connector_id));
        assert_eq!(event.known_type(), Some(OutboxEventType::PaymentSaved));
        assert_eq!(event.payload["status"], "SUCCEEDED");
        assert_eq!(event.payload["type"], "PAY-IN");
        assert_eq!(event.payload["amount"], "100");
        assert_eq!(event.payload["connectorID"], payment.connector_id.to_string());
    }

    #[test]
    fn payment_deleted_uses_delete_prefix() {
        let payment = test_payment();
        let event = payment_deleted(&payment, Utc::now());
        assert_eq!(event.id.idempotency_key, format!("delete:{}", payment.id));
        assert_eq!(event.entity_id, payment.id.to_string());
    }

    #[test]
    fn balance_key_ignores_decimal_scale() {
        let connector = ConnectorId::from_uuid(Uuid::from_u128(5));
        let account = AccountId::derive(connector, "acc");
        let at = Utc.with_ymd_and_hms(2024, 2, 2, 0, 0, 0).unwrap();
        let a = Balance::observed(account, connector, "USD/2", dec!(100), at);
        let b = Balance::observed(account, connector, "USD/2", dec!(100.00), at);

        assert_eq!(
            balance_saved(&a, Utc::now()).id,
            balance_saved(&b, Utc::now()).id
        );
    }
}
