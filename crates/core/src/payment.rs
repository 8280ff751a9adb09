//! Payments.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::adjustment::{AdjustedEntity, Adjustment, AdjustmentStatus, AmountEffect, EntityState};
use crate::codes::wire_enum;
use crate::error::{DomainError, DomainResult};
use crate::id::{AccountId, ConnectorId, PaymentId, is_valid_reference};
use crate::time::normalize;

wire_enum! {
    /// Direction of money movement.
    pub enum PaymentType {
        Unknown => "UNKNOWN",
        PayIn => "PAY-IN",
        Payout => "PAYOUT",
        Transfer => "TRANSFER",
        Other => "OTHER",
    }
}

wire_enum! {
    pub enum PaymentScheme {
        Unknown => "UNKNOWN",
        CardVisa => "CARD_VISA",
        CardMastercard => "CARD_MASTERCARD",
        CardAmex => "CARD_AMEX",
        CardDiners => "CARD_DINERS",
        CardDiscover => "CARD_DISCOVER",
        CardJcb => "CARD_JCB",
        CardUnionPay => "CARD_UNION_PAY",
        CardAlipay => "CARD_ALIPAY",
        CardCup => "CARD_CUP",
        SepaDebit => "SEPA_DEBIT",
        SepaCredit => "SEPA_CREDIT",
        Sepa => "SEPA",
        GooglePay => "GOOGLE_PAY",
        ApplePay => "APPLE_PAY",
        Doku => "DOKU",
        DragonPay => "DRAGON_PAY",
        Maestro => "MAESTRO",
        MolPay => "MOL_PAY",
        A2a => "A2A",
        AchDebit => "ACH_DEBIT",
        Ach => "ACH",
        Rtp => "RTP",
        Exchange => "EXCHANGE",
        Other => "OTHER",
    }
}

wire_enum! {
    /// Provider-reported payment status, carried by adjustments.
    pub enum PaymentStatus {
        Unknown => "UNKNOWN",
        Pending => "PENDING",
        Succeeded => "SUCCEEDED",
        Cancelled => "CANCELLED",
        Failed => "FAILED",
        Expired => "EXPIRED",
        Refunded => "REFUNDED",
        RefundedFailure => "REFUNDED_FAILURE",
        RefundReversed => "REFUND_REVERSED",
        Dispute => "DISPUTE",
        DisputeWon => "DISPUTE_WON",
        DisputeLost => "DISPUTE_LOST",
        AmountAdjustment => "AMOUNT_ADJUSTMENT",
        Authorisation => "AUTHORISATION",
        Capture => "CAPTURE",
        CaptureFailed => "CAPTURE_FAILED",
        Other => "OTHER",
    }
}

impl AdjustmentStatus for PaymentStatus {
    const INITIAL: Self = PaymentStatus::Pending;

    fn effect(&self) -> AmountEffect {
        match self {
            PaymentStatus::AmountAdjustment => AmountEffect::ResetInitial,
            PaymentStatus::Refunded => AmountEffect::Debit,
            PaymentStatus::Capture | PaymentStatus::RefundReversed => AmountEffect::Credit,
            _ => AmountEffect::None,
        }
    }

    fn code(&self) -> &'static str {
        PaymentStatus::code(self)
    }

    fn from_code(code: &str) -> DomainResult<Self> {
        PaymentStatus::from_code(code)
    }
}

pub type PaymentAdjustment = Adjustment<PaymentStatus>;

pub type PaymentState = EntityState<Payment>;

/// A payment and the adjustments reported for it.
///
/// `initial_amount` and `amount` are only ever changed by folding
/// adjustments; callers set them once, on the first observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub id: PaymentId,
    pub connector_id: ConnectorId,
    pub reference: String,
    pub created_at: DateTime<Utc>,
    pub payment_type: PaymentType,
    pub initial_amount: Decimal,
    pub amount: Decimal,
    /// Asset in `CODE/precision` form, e.g. `USD/2`.
    pub asset: String,
    pub scheme: PaymentScheme,
    pub source_account_id: Option<AccountId>,
    pub destination_account_id: Option<AccountId>,
    pub metadata: BTreeMap<String, String>,
    pub adjustments: Vec<PaymentAdjustment>,
}

/// One provider observation of a payment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentObservation {
    pub connector_id: ConnectorId,
    pub reference: String,
    /// Set when the provider reports this observation as a child of another
    /// payment (e.g. a refund of a charge). The payment is then filed under
    /// the parent's identity.
    pub parent_reference: Option<String>,
    pub created_at: DateTime<Utc>,
    pub payment_type: PaymentType,
    pub amount: Decimal,
    pub asset: String,
    pub scheme: PaymentScheme,
    pub status: PaymentStatus,
    pub source_account_reference: Option<String>,
    pub destination_account_reference: Option<String>,
    pub metadata: BTreeMap<String, String>,
    pub raw: serde_json::Value,
}

/// Amount a payment starts at when first observed with `status`.
///
/// An authorisation has not moved money yet: it starts at zero and is
/// credited by the captures that follow. Every other first status starts at
/// the observed amount, and its own adjustment is folded on top.
pub fn baseline_amount(status: PaymentStatus, observed: Decimal) -> Decimal {
    match status {
        PaymentStatus::Authorisation => Decimal::ZERO,
        _ => observed,
    }
}

impl Payment {
    /// Payment with no adjustments, identity derived from its natural key.
    pub fn new(
        connector_id: ConnectorId,
        payment_type: PaymentType,
        reference: impl Into<String>,
        created_at: DateTime<Utc>,
        initial_amount: Decimal,
        asset: impl Into<String>,
        scheme: PaymentScheme,
    ) -> Self {
        let reference = reference.into();
        Self {
            id: PaymentId::derive(connector_id, payment_type.code(), &reference),
            connector_id,
            reference,
            created_at: normalize(created_at),
            payment_type,
            initial_amount,
            amount: initial_amount,
            asset: asset.into(),
            scheme,
            source_account_id: None,
            destination_account_id: None,
            metadata: BTreeMap::new(),
            adjustments: Vec::new(),
        }
    }

    /// Build the payment row and its adjustment from one observation.
    pub fn observed(obs: PaymentObservation) -> Self {
        let reference = obs
            .parent_reference
            .clone()
            .unwrap_or_else(|| obs.reference.clone());

        let mut payment = Payment::new(
            obs.connector_id,
            obs.payment_type,
            reference,
            obs.created_at,
            obs.amount,
            obs.asset.clone(),
            obs.scheme,
        );
        payment.amount = baseline_amount(obs.status, obs.amount);
        payment.source_account_id = obs
            .source_account_reference
            .as_deref()
            .map(|r| AccountId::derive(obs.connector_id, r));
        payment.destination_account_id = obs
            .destination_account_reference
            .as_deref()
            .map(|r| AccountId::derive(obs.connector_id, r));
        payment.metadata = obs.metadata.clone();

        let adjustment = PaymentAdjustment::new(
            payment.id.as_uuid(),
            obs.reference,
            obs.created_at,
            obs.status,
            Some(obs.amount),
            Some(obs.asset),
            obs.raw,
        )
        .with_metadata(obs.metadata);
        payment.adjustments.push(adjustment);
        payment
    }

    pub fn with_adjustment(
        mut self,
        reference: impl Into<String>,
        created_at: DateTime<Utc>,
        status: PaymentStatus,
        amount: Option<Decimal>,
    ) -> Self {
        let adjustment = PaymentAdjustment::new(
            self.id.as_uuid(),
            reference,
            created_at,
            status,
            amount,
            Some(self.asset.clone()),
            serde_json::json!({}),
        );
        self.adjustments.push(adjustment);
        self
    }
}

impl AdjustedEntity for Payment {
    type Status = PaymentStatus;

    fn entity_uuid(&self) -> Uuid {
        *self.id.as_uuid()
    }

    fn connector_id(&self) -> ConnectorId {
        self.connector_id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn adjustments(&self) -> &[PaymentAdjustment] {
        &self.adjustments
    }

    fn set_adjustments(&mut self, adjustments: Vec<PaymentAdjustment>) {
        self.adjustments = adjustments;
    }

    fn amounts_mut(&mut self) -> (&mut Decimal, &mut Decimal) {
        (&mut self.initial_amount, &mut self.amount)
    }

    fn validate(&self) -> DomainResult<()> {
        if !is_valid_reference(&self.reference) {
            return Err(DomainError::validation(format!(
                "payment {}: invalid reference",
                self.id
            )));
        }
        if self.asset.trim().is_empty() {
            return Err(DomainError::validation(format!(
                "payment {}: missing asset",
                self.id
            )));
        }
        if self.initial_amount.is_sign_negative() {
            return Err(DomainError::validation(format!(
                "payment {}: initial amount must not be negative",
                self.id
            )));
        }
        let expected = PaymentId::derive(self.connector_id, self.payment_type.code(), &self.reference);
        if self.id != expected {
            return Err(DomainError::invariant(format!(
                "payment {} does not match its (connector, type, reference) identity",
                self.id
            )));
        }
        for adjustment in &self.adjustments {
            adjustment.validate()?;
            let expected = crate::id::AdjustmentId::derive(
                self.id.as_uuid(),
                &adjustment.reference,
                adjustment.created_at,
                adjustment.status.code(),
            );
            if adjustment.id != expected {
                return Err(DomainError::invariant(format!(
                    "adjustment {} does not belong to payment {}",
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
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn test_connector() -> ConnectorId {
        ConnectorId::from_uuid(Uuid::from_u128(7))
    }

    fn test_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 10, 8, 30, 0).unwrap()
    }

    fn test_observation(payment_type: PaymentType, status: PaymentStatus) -> PaymentObservation {
        PaymentObservation {
            connector_id: test_connector(),
            reference: "py_1".to_string(),
            parent_reference: None,
            created_at: test_time(),
            payment_type,
            amount: dec!(100),
            asset: "USD/2".to_string(),
            scheme: PaymentScheme::CardVisa,
            status,
            source_account_reference: None,
            destination_account_reference: Some("acc_dest".to_string()),
            metadata: BTreeMap::new(),
            raw: serde_json::json!({"id": "py_1"}),
        }
    }

    /// First observation baseline, per (type, status).
    #[test]
    fn first_observation_baseline_table() {
        let cases = [
            (PaymentType::PayIn, PaymentStatus::Succeeded, dec!(100)),
            (PaymentType::PayIn, PaymentStatus::Pending, dec!(100)),
            (PaymentType::Payout, PaymentStatus::Succeeded, dec!(100)),
            (PaymentType::Payout, PaymentStatus::Pending, dec!(100)),
            (PaymentType::Transfer, PaymentStatus::Succeeded, dec!(100)),
            (PaymentType::Transfer, PaymentStatus::Authorisation, dec!(0)),
            (PaymentType::PayIn, PaymentStatus::Authorisation, dec!(0)),
            (PaymentType::Other, PaymentStatus::Capture, dec!(100)),
            (PaymentType::PayIn, PaymentStatus::RefundReversed, dec!(100)),
        ];

        for (payment_type, status, expected) in cases {
            let payment = Payment::observed(test_observation(payment_type, status));
            assert_eq!(
                payment.amount, expected,
                "{payment_type} first observed as {status}"
            );
            assert_eq!(payment.initial_amount, dec!(100));
        }
    }

    #[test]
    fn child_observation_is_filed_under_parent() {
        let mut obs = test_observation(PaymentType::PayIn, PaymentStatus::Refunded);
        obs.reference = "re_1".to_string();
        obs.parent_reference = Some("py_1".to_string());

        let payment = Payment::observed(obs);
        let parent = Payment::observed(test_observation(PaymentType::PayIn, PaymentStatus::Succeeded));

        assert_eq!(payment.id, parent.id);
        assert_eq!(payment.reference, "py_1");
        assert_eq!(payment.adjustments[0].reference, "re_1");
        assert!(payment.validate().is_ok());
    }

    #[test]
    fn observed_payment_links_accounts() {
        let payment = Payment::observed(test_observation(PaymentType::Payout, PaymentStatus::Pending));
        assert_eq!(payment.source_account_id, None);
        assert_eq!(
            payment.destination_account_id,
            Some(AccountId::derive(test_connector(), "acc_dest"))
        );
    }

    #[test]
    fn tampered_identity_is_rejected() {
        let mut payment = Payment::observed(test_observation(PaymentType::PayIn, PaymentStatus::Pending));
        payment.payment_type = PaymentType::Payout;
        assert!(matches!(
            payment.validate(),
            Err(DomainError::InvariantViolation(_))
        ));
    }

    #[test]
    fn status_codes_round_trip_through_serde() {
        for status in PaymentStatus::ALL {
            let json = serde_json::to_string(status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.code()));
            assert_eq!(PaymentStatus::from_code(status.code()).unwrap(), *status);
        }
        assert_eq!(
            PaymentType::from_code("PAYIN"),
            Err(DomainError::unknown_code("PaymentType", "PAYIN"))
        );
    }
}
