//! `paystate-core`: payment-platform domain primitives.
//!
//! This crate contains **pure domain** logic (no infrastructure concerns):
//! identifiers, payments and orders with their adjustment fold, and the
//! balance version decision.

mod codes;

pub mod adjustment;
pub mod balance;
pub mod error;
pub mod id;
pub mod order;
pub mod payment;
pub mod reference;
pub mod time;

pub use adjustment::{
    AdjustedEntity, Adjustment, AdjustmentStatus, AmountEffect, BatchEffect, EntityState,
    latest_status,
};
pub use balance::{Balance, VersionDecision, version_at};
pub use error::{DomainError, DomainResult};
pub use id::{AccountId, AdjustmentId, ConnectorId, OrderId, PaymentId};
pub use order::{
    Order, OrderAdjustment, OrderDirection, OrderObservation, OrderState, OrderStatus, OrderType,
};
pub use payment::{
    Payment, PaymentAdjustment, PaymentObservation, PaymentScheme, PaymentState, PaymentStatus,
    PaymentType, baseline_amount,
};
pub use reference::{Account, Connector};
