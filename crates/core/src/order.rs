//! Orders (exchange trades), the mirror of payments.
//!
//! `initial_amount` is the base quantity ordered, `amount` the quantity
//! filled so far. Fill adjustments carry the fill delta and credit `amount`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::adjustment::{AdjustedEntity, Adjustment, AdjustmentStatus, AmountEffect, EntityState};
use crate::codes::wire_enum;
use crate::error::{DomainError, DomainResult};
use crate::id::{AdjustmentId, ConnectorId, OrderId, is_valid_reference};
use crate::time::normalize;

wire_enum! {
    pub enum OrderDirection {
        Unknown => "UNKNOWN",
        Buy => "BUY",
        Sell => "SELL",
    }
}

wire_enum! {
    pub enum OrderType {
        Unknown => "UNKNOWN",
        Market => "MARKET",
        Limit => "LIMIT",
    }
}

wire_enum! {
    pub enum OrderStatus {
        Unknown => "UNKNOWN",
        Pending => "PENDING",
        Open => "OPEN",
        PartiallyFilled => "PARTIALLY_FILLED",
        Filled => "FILLED",
        Cancelled => "CANCELLED",
        Expired => "EXPIRED",
        Failed => "FAILED",
    }
}

impl AdjustmentStatus for OrderStatus {
    const INITIAL: Self = OrderStatus::Pending;

    fn effect(&self) -> AmountEffect {
        match self {
            OrderStatus::PartiallyFilled | OrderStatus::Filled => AmountEffect::Credit,
            _ => AmountEffect::None,
        }
    }

    fn code(&self) -> &'static str {
        OrderStatus::code(self)
    }

    fn from_code(code: &str) -> DomainResult<Self> {
        OrderStatus::from_code(code)
    }
}

pub type OrderAdjustment = Adjustment<OrderStatus>;

pub type OrderState = EntityState<Order>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub connector_id: ConnectorId,
    pub reference: String,
    pub created_at: DateTime<Utc>,
    pub direction: OrderDirection,
    pub source_asset: String,
    pub target_asset: String,
    pub order_type: OrderType,
    pub limit_price: Option<Decimal>,
    pub initial_amount: Decimal,
    pub amount: Decimal,
    pub metadata: BTreeMap<String, String>,
    pub adjustments: Vec<OrderAdjustment>,
}

/// One provider observation of an order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderObservation {
    pub connector_id: ConnectorId,
    pub reference: String,
    pub created_at: DateTime<Utc>,
    pub direction: OrderDirection,
    pub source_asset: String,
    pub target_asset: String,
    pub order_type: OrderType,
    pub limit_price: Option<Decimal>,
    pub status: OrderStatus,
    pub quantity_ordered: Decimal,
    /// Quantity filled by this observation. Required for fill statuses.
    pub fill: Option<Decimal>,
    pub metadata: BTreeMap<String, String>,
    pub raw: serde_json::Value,
}

impl Order {
    pub fn observed(obs: OrderObservation) -> Self {
        let id = OrderId::derive(obs.connector_id, obs.order_type.code(), &obs.reference);
        let adjustment = OrderAdjustment::new(
            id.as_uuid(),
            obs.reference.clone(),
            obs.created_at,
            obs.status,
            obs.fill,
            Some(obs.source_asset.clone()),
            obs.raw,
        )
        .with_metadata(obs.metadata.clone());

        Self {
            id,
            connector_id: obs.connector_id,
            reference: obs.reference,
            created_at: normalize(obs.created_at),
            direction: obs.direction,
            source_asset: obs.source_asset,
            target_asset: obs.target_asset,
            order_type: obs.order_type,
            limit_price: obs.limit_price,
            initial_amount: obs.quantity_ordered,
            amount: Decimal::ZERO,
            metadata: obs.metadata,
            adjustments: vec![adjustment],
        }
    }

    /// Synthetic adjustment moving the order to `status` at `at`.
    pub fn status_update(&self, status: OrderStatus, at: DateTime<Utc>) -> OrderAdjustment {
        let at = normalize(at);
        OrderAdjustment::new(
            self.id.as_uuid(),
            format!("status-update-{}", at.timestamp_micros()),
            at,
            status,
            None,
            None,
            serde_json::json!({"source": "paystate"}),
        )
    }
}

impl AdjustedEntity for Order {
    type Status = OrderStatus;

    fn entity_uuid(&self) -> Uuid {
        *self.id.as_uuid()
    }

    fn connector_id(&self) -> ConnectorId {
        self.connector_id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn adjustments(&self) -> &[OrderAdjustment] {
        &self.adjustments
    }

    fn set_adjustments(&mut self, adjustments: Vec<OrderAdjustment>) {
        self.adjustments = adjustments;
    }

    fn amounts_mut(&mut self) -> (&mut Decimal, &mut Decimal) {
        (&mut self.initial_amount, &mut self.amount)
    }

    fn validate(&self) -> DomainResult<()> {
        if !is_valid_reference(&self.reference) {
            return Err(DomainError::validation(format!(
                "order {}: invalid reference",
                self.id
            )));
        }
        if self.direction == OrderDirection::Unknown {
            return Err(DomainError::validation(format!(
                "order {}: missing direction",
                self.id
            )));
        }
        if self.source_asset.trim().is_empty() || self.target_asset.trim().is_empty() {
            return Err(DomainError::validation(format!(
                "order {}: missing asset",
                self.id
            )));
        }
        if self.initial_amount.is_sign_negative() {
            return Err(DomainError::validation(format!(
                "order {}: quantity ordered must not be negative",
                self.id
            )));
        }
        if self.id != OrderId::derive(self.connector_id, self.order_type.code(), &self.reference) {
            return Err(DomainError::invariant(format!(
                "order {} does not match its (connector, type, reference) identity",
                self.id
            )));
        }
        for adjustment in &self.adjustments {
            adjustment.validate()?;
            let expected = AdjustmentId::derive(
                self.id.as_uuid(),
                &adjustment.reference,
                adjustment.created_at,
                adjustment.status.code(),
            );
            if adjustment.id != expected {
                return Err(DomainError::invariant(format!(
                    "adjustment {} does not belong to order {}",
                    adjustment.id, self.id
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adjustment::BatchEffect;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    fn test_observation(status: OrderStatus, fill: Option<Decimal>, offset_secs: i64) -> OrderObservation {
        OrderObservation {
            connector_id: ConnectorId::from_uuid(Uuid::from_u128(9)),
            reference: "ord_1".to_string(),
            created_at: Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap() + Duration::seconds(offset_secs),
            direction: OrderDirection::Buy,
            source_asset: "USD/2".to_string(),
            target_asset: "BTC/8".to_string(),
            order_type: OrderType::Limit,
            limit_price: Some(dec!(42000)),
            status,
            quantity_ordered: dec!(10),
            fill,
            metadata: BTreeMap::new(),
            raw: serde_json::json!({}),
        }
    }

    #[test]
    fn fills_accumulate_into_amount() {
        let mut order = Order::observed(test_observation(OrderStatus::Open, None, 0));
        assert_eq!(order.amount, dec!(0));
        assert_eq!(order.initial_amount, dec!(10));
        assert!(order.validate().is_ok());

        let partial = Order::observed(test_observation(OrderStatus::PartiallyFilled, Some(dec!(4)), 1));
        let filled = Order::observed(test_observation(OrderStatus::Filled, Some(dec!(6)), 2));
        let fills: Vec<_> = partial.adjustments.iter().chain(filled.adjustments.iter()).collect();

        order.apply_effect(&BatchEffect::fold(fills));
        assert_eq!(order.amount, dec!(10));
    }

    #[test]
    fn fill_without_quantity_is_rejected() {
        let order = Order::observed(test_observation(OrderStatus::Filled, None, 0));
        assert!(matches!(order.validate(), Err(DomainError::Validation(_))));
    }

    #[test]
    fn status_update_is_a_synthetic_adjustment() {
        let order = Order::observed(test_observation(OrderStatus::Open, None, 0));
        let at = Utc.with_ymd_and_hms(2024, 1, 3, 0, 0, 0).unwrap();
        let adjustment = order.status_update(OrderStatus::Cancelled, at);

        assert_eq!(adjustment.status, OrderStatus::Cancelled);
        assert!(adjustment.reference.starts_with("status-update-"));
        assert!(adjustment.validate().is_ok());
    }
}
