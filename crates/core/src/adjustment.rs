//! Adjustments and the amount fold.
//!
//! An adjustment is an immutable, timestamped state transition reported by a
//! provider for a payment or an order. Entities never have their status or
//! amounts written directly: both are derived from the adjustment stream.
//!
//! The numeric effect of a batch is pre-aggregated per entity so that storage
//! applies at most one relative statement per outcome class:
//!
//! - [`AmountEffect::ResetInitial`] replaces `initial_amount` (last one wins)
//! - [`AmountEffect::Debit`] subtracts the summed amounts from `amount`
//! - [`AmountEffect::Credit`] adds the summed amounts to `amount`

use std::collections::BTreeMap;
use std::fmt::Debug;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DomainError, DomainResult};
use crate::id::{AdjustmentId, ConnectorId, is_valid_reference};
use crate::time::normalize;

/// Numeric outcome class of an adjustment status.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AmountEffect {
    /// Stored and eligible as current status, no numeric effect.
    None,
    /// Replace `initial_amount` with the adjustment amount.
    ResetInitial,
    /// `amount += adjustment.amount`
    Credit,
    /// `amount -= adjustment.amount`
    Debit,
}

impl AmountEffect {
    pub fn requires_amount(&self) -> bool {
        !matches!(self, AmountEffect::None)
    }
}

/// Status vocabulary of an adjusted entity.
pub trait AdjustmentStatus:
    Copy + Eq + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Status reported when an entity has no adjustment yet.
    const INITIAL: Self;

    fn effect(&self) -> AmountEffect;

    /// Wire/storage code.
    fn code(&self) -> &'static str;

    fn from_code(code: &str) -> DomainResult<Self>;
}

/// An append-only state transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Adjustment<S> {
    pub id: AdjustmentId,
    pub reference: String,
    pub created_at: DateTime<Utc>,
    pub status: S,
    pub amount: Option<Decimal>,
    pub asset: Option<String>,
    /// Opaque provider payload.
    pub raw: serde_json::Value,
    pub metadata: BTreeMap<String, String>,
}

impl<S: AdjustmentStatus> Adjustment<S> {
    /// Build an adjustment for `entity_id`, deriving its identity.
    pub fn new(
        entity_id: &Uuid,
        reference: impl Into<String>,
        created_at: DateTime<Utc>,
        status: S,
        amount: Option<Decimal>,
        asset: Option<String>,
        raw: serde_json::Value,
    ) -> Self {
        let reference = reference.into();
        let created_at = normalize(created_at);
        Self {
            id: AdjustmentId::derive(entity_id, &reference, created_at, status.code()),
            reference,
            created_at,
            status,
            amount,
            asset,
            raw,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn effect(&self) -> AmountEffect {
        self.status.effect()
    }

    pub fn validate(&self) -> DomainResult<()> {
        if !is_valid_reference(&self.reference) {
            return Err(DomainError::validation(format!(
                "adjustment {}: invalid reference",
                self.id
            )));
        }
        match self.amount {
            None if self.effect().requires_amount() => Err(DomainError::validation(format!(
                "adjustment {} with status {} requires an amount",
                self.id,
                self.status.code()
            ))),
            Some(amount) if amount.is_sign_negative() => Err(DomainError::validation(format!(
                "adjustment {}: amount must not be negative",
                self.id
            ))),
            _ => Ok(()),
        }
    }
}

/// Pre-aggregated numeric effect of a set of adjustments on one entity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchEffect {
    /// Last `ResetInitial` amount seen, in iteration order.
    pub initial_amount: Option<Decimal>,
    pub credit: Decimal,
    pub debit: Decimal,
}

impl BatchEffect {
    pub fn fold<'a, S: AdjustmentStatus>(
        adjustments: impl IntoIterator<Item = &'a Adjustment<S>>,
    ) -> Self {
        let mut effect = Self::default();
        for adjustment in adjustments {
            let Some(amount) = adjustment.amount else {
                continue;
            };
            match adjustment.effect() {
                AmountEffect::None => {}
                AmountEffect::ResetInitial => effect.initial_amount = Some(amount),
                AmountEffect::Credit => effect.credit += amount,
                AmountEffect::Debit => effect.debit += amount,
            }
        }
        effect
    }

    pub fn is_empty(&self) -> bool {
        self.initial_amount.is_none() && self.credit.is_zero() && self.debit.is_zero()
    }

    /// Apply to in-memory amounts. Storage backends use relative statements instead.
    pub fn apply(&self, initial_amount: &mut Decimal, amount: &mut Decimal) {
        if let Some(initial) = self.initial_amount {
            *initial_amount = initial;
        }
        *amount = *amount - self.debit + self.credit;
    }
}

/// Status of the adjustment with the greatest `(created_at, sequence)`.
///
/// `sequence` is the storage insertion order, used as tie-break.
pub fn latest_status<'a, S: AdjustmentStatus>(
    adjustments: impl IntoIterator<Item = (i64, &'a Adjustment<S>)>,
) -> Option<S> {
    adjustments
        .into_iter()
        .max_by_key(|(sequence, adjustment)| (adjustment.created_at, *sequence))
        .map(|(_, adjustment)| adjustment.status)
}

/// An entity whose status and amounts are folded from adjustments.
pub trait AdjustedEntity: Clone + Debug + Send + Sync + 'static {
    type Status: AdjustmentStatus;

    fn entity_uuid(&self) -> Uuid;

    fn connector_id(&self) -> ConnectorId;

    fn created_at(&self) -> DateTime<Utc>;

    fn adjustments(&self) -> &[Adjustment<Self::Status>];

    fn set_adjustments(&mut self, adjustments: Vec<Adjustment<Self::Status>>);

    fn amounts_mut(&mut self) -> (&mut Decimal, &mut Decimal);

    fn validate(&self) -> DomainResult<()>;

    fn apply_effect(&mut self, effect: &BatchEffect) {
        let (initial_amount, amount) = self.amounts_mut();
        effect.apply(initial_amount, amount);
    }
}

/// An entity as read back from storage, with its derived status.
///
/// `entity.adjustments()` are ordered newest first.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityState<E: AdjustedEntity> {
    pub entity: E,
    pub status: E::Status,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payment::PaymentStatus;
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn test_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn test_adjustment(
        reference: &str,
        offset_secs: i64,
        status: PaymentStatus,
        amount: Option<Decimal>,
    ) -> Adjustment<PaymentStatus> {
        Adjustment::new(
            &Uuid::nil(),
            reference,
            test_time() + Duration::seconds(offset_secs),
            status,
            amount,
            Some("USD/2".to_string()),
            serde_json::json!({}),
        )
    }

    #[test]
    fn fold_sums_debits_and_credits_per_class() {
        let adjustments = vec![
            test_adjustment("r1", 1, PaymentStatus::Refunded, Some(dec!(10))),
            test_adjustment("r2", 2, PaymentStatus::Refunded, Some(dec!(10))),
            test_adjustment("c1", 3, PaymentStatus::Capture, Some(dec!(5))),
            test_adjustment("rr", 4, PaymentStatus::RefundReversed, Some(dec!(2))),
            test_adjustment("s", 5, PaymentStatus::Succeeded, Some(dec!(999))),
        ];

        let effect = BatchEffect::fold(&adjustments);
        assert_eq!(effect.debit, dec!(20));
        assert_eq!(effect.credit, dec!(7));
        assert_eq!(effect.initial_amount, None);

        let mut initial = dec!(100);
        let mut amount = dec!(100);
        effect.apply(&mut initial, &mut amount);
        assert_eq!(amount, dec!(87));
        assert_eq!(initial, dec!(100));
    }

    #[test]
    fn amount_adjustment_replaces_initial_last_wins() {
        let adjustments = vec![
            test_adjustment("a1", 1, PaymentStatus::AmountAdjustment, Some(dec!(150))),
            test_adjustment("a2", 2, PaymentStatus::AmountAdjustment, Some(dec!(120))),
        ];

        let effect = BatchEffect::fold(&adjustments);
        assert_eq!(effect.initial_amount, Some(dec!(120)));
        assert!(effect.credit.is_zero());
        assert!(effect.debit.is_zero());
    }

    #[test]
    fn effectful_status_without_amount_is_rejected() {
        let adjustment = test_adjustment("r1", 0, PaymentStatus::Refunded, None);
        assert!(matches!(
            adjustment.validate(),
            Err(DomainError::Validation(msg)) if msg.contains("requires an amount")
        ));

        let pending = test_adjustment("p", 0, PaymentStatus::Pending, None);
        assert!(pending.validate().is_ok());
    }

    #[test]
    fn latest_status_breaks_timestamp_ties_by_sequence() {
        let a = test_adjustment("a", 10, PaymentStatus::Pending, None);
        let b = test_adjustment("b", 10, PaymentStatus::Succeeded, None);
        let older = test_adjustment("c", 0, PaymentStatus::Failed, None);

        assert_eq!(
            latest_status([(2, &older), (0, &a), (1, &b)]),
            Some(PaymentStatus::Succeeded)
        );
        assert_eq!(
            latest_status([(1, &a), (0, &b)]),
            Some(PaymentStatus::Pending)
        );
        assert_eq!(latest_status::<PaymentStatus>([]), None);
    }

    fn effect_strategy() -> impl Strategy<Value = (PaymentStatus, i64)> {
        (
            prop_oneof![
                Just(PaymentStatus::Refunded),
                Just(PaymentStatus::Capture),
                Just(PaymentStatus::RefundReversed),
                Just(PaymentStatus::Succeeded),
            ],
            1i64..10_000i64,
        )
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: the final amount does not depend on how adjustments are
        /// split into batches.
        #[test]
        fn amount_is_independent_of_batching(
            items in prop::collection::vec(effect_strategy(), 1..20),
            split in 0usize..20,
        ) {
            let adjustments: Vec<_> = items
                .iter()
                .enumerate()
                .map(|(i, (status, amount))| {
                    test_adjustment(&format!("r{i}"), i as i64, *status, Some(Decimal::from(*amount)))
                })
                .collect();
            let split = split.min(adjustments.len());

            let mut initial_one = dec!(1000);
            let mut amount_one = dec!(1000);
            BatchEffect::fold(&adjustments).apply(&mut initial_one, &mut amount_one);

            let mut initial_two = dec!(1000);
            let mut amount_two = dec!(1000);
            BatchEffect::fold(&adjustments[..split]).apply(&mut initial_two, &mut amount_two);
            BatchEffect::fold(&adjustments[split..]).apply(&mut initial_two, &mut amount_two);

            prop_assert_eq!(amount_one, amount_two);
            prop_assert_eq!(initial_one, initial_two);
        }
    }
}
