//! Strongly-typed identifiers used across the domain.
//!
//! Connectors get random, time-ordered ids. Everything a connector reports
//! (accounts, payments, orders, adjustments) gets a deterministic UUIDv5
//! derived from its natural key, so replaying the same observation always
//! lands on the same row.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;
use crate::time::normalize;

/// Namespace for every derived identifier.
const NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2d9e_4b7a_5c30_9e21_8d4f_a6b3_c7e5);

/// Separator between natural-key parts. Cannot appear in provider references
/// that survive validation.
const KEY_SEPARATOR: char = '\u{1f}';

/// Identifier of a connector (one provider integration).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectorId(Uuid);

/// Identifier of an account held at a provider.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(Uuid);

/// Identifier of a payment.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PaymentId(Uuid);

/// Identifier of an order.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(Uuid);

/// Identifier of a payment or order adjustment.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AdjustmentId(Uuid);

macro_rules! impl_uuid_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<Uuid> for $t {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl From<$t> for Uuid {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let uuid = Uuid::from_str(s)
                    .map_err(|e| DomainError::invalid_id(format!("{}: {}", $name, e)))?;
                Ok(Self(uuid))
            }
        }
    };
}

impl_uuid_newtype!(ConnectorId, "ConnectorId");
impl_uuid_newtype!(AccountId, "AccountId");
impl_uuid_newtype!(PaymentId, "PaymentId");
impl_uuid_newtype!(OrderId, "OrderId");
impl_uuid_newtype!(AdjustmentId, "AdjustmentId");

impl ConnectorId {
    /// Create a new connector identifier.
    ///
    /// Uses UUIDv7 (time-ordered). Prefer passing IDs explicitly in tests
    /// for determinism.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ConnectorId {
    fn default() -> Self {
        Self::new()
    }
}

impl AccountId {
    pub fn derive(connector_id: ConnectorId, reference: &str) -> Self {
        Self(derive_uuid("account", &[&connector_id.to_string(), reference]))
    }
}

impl PaymentId {
    /// `type_code` is the wire code of the payment type.
    pub fn derive(connector_id: ConnectorId, type_code: &str, reference: &str) -> Self {
        Self(derive_uuid(
            "payment",
            &[&connector_id.to_string(), type_code, reference],
        ))
    }
}

impl OrderId {
    /// `type_code` is the wire code of the order type.
    pub fn derive(connector_id: ConnectorId, type_code: &str, reference: &str) -> Self {
        Self(derive_uuid(
            "order",
            &[&connector_id.to_string(), type_code, reference],
        ))
    }
}

impl AdjustmentId {
    /// Identity of an adjustment: owning entity, reference, creation instant
    /// (microsecond precision) and status code.
    pub fn derive(
        entity_id: &Uuid,
        reference: &str,
        created_at: DateTime<Utc>,
        status_code: &str,
    ) -> Self {
        let created_at = normalize(created_at).timestamp_micros().to_string();
        Self(derive_uuid(
            "adjustment",
            &[&entity_id.to_string(), reference, &created_at, status_code],
        ))
    }
}

fn derive_uuid(kind: &str, parts: &[&str]) -> Uuid {
    let mut name = String::from(kind);
    for part in parts {
        name.push(KEY_SEPARATOR);
        name.push_str(part);
    }
    Uuid::new_v5(&NAMESPACE, name.as_bytes())
}

/// Whether `value` can be used as part of a natural key.
pub(crate) fn is_valid_reference(value: &str) -> bool {
    !value.trim().is_empty() && !value.contains(KEY_SEPARATOR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn derived_ids_are_stable() {
        let connector = ConnectorId::from_uuid(Uuid::nil());
        assert_eq!(
            PaymentId::derive(connector, "PAYOUT", "po_1"),
            PaymentId::derive(connector, "PAYOUT", "po_1")
        );
        assert_ne!(
            PaymentId::derive(connector, "PAYOUT", "po_1"),
            PaymentId::derive(connector, "PAY-IN", "po_1")
        );
    }

    #[test]
    fn adjustment_id_ignores_sub_microsecond_noise() {
        let entity = Uuid::nil();
        let a = Utc.timestamp_opt(1_700_000_000, 123_456_000).unwrap();
        let b = Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap();
        assert_eq!(
            AdjustmentId::derive(&entity, "ref", a, "SUCCEEDED"),
            AdjustmentId::derive(&entity, "ref", b, "SUCCEEDED")
        );
    }

    #[test]
    fn parts_cannot_be_shifted_across_separators() {
        let connector = ConnectorId::from_uuid(Uuid::nil());
        assert_ne!(
            AccountId::derive(connector, "ab"),
            AccountId::derive(connector, "a\u{1f}b")
        );
        assert!(!is_valid_reference("a\u{1f}b"));
        assert!(!is_valid_reference("  "));
    }

    #[test]
    fn parse_rejects_garbage() {
        let err = "nope".parse::<PaymentId>().unwrap_err();
        assert!(matches!(err, DomainError::InvalidId(msg) if msg.starts_with("PaymentId")));
    }
}
