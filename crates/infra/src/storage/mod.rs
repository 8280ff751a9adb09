//! Storage boundary: the ledger, the balance version store and the outbox.
//!
//! Every mutating operation is exactly one transaction. Two backends
//! implement the traits below:
//!
//! - [`InMemoryStore`]: tests/dev, same semantics, no durability
//! - [`PostgresStore`]: production, relative SQL deltas and insert-or-ignore
//!
//! ## Amount consistency
//!
//! Ledger backends never read an amount, change it in memory and write it
//! back across statements. Deltas are applied with
//! `UPDATE … SET amount = amount ± $δ`, so concurrent batches for the same
//! entity compose regardless of commit order.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use paystate_core::{
    Account, AccountId, Balance, Connector, ConnectorId, Order, OrderId, OrderState, OrderStatus,
    Payment, PaymentId, PaymentState,
};
use paystate_events::{EventId, EventSent, OutboxEvent};

use crate::query::{ListQuery, Page};

#[cfg(any(test, feature = "testing"))]
pub mod conformance;
mod error;
mod in_memory;
mod postgres;

pub use error::StorageError;
pub(crate) use error::map_sqlx_error;
pub use in_memory::{InMemoryStore, InMemoryTx};
pub use postgres::PostgresStore;

/// Explicit transaction handle.
///
/// Dropping an uncommitted transaction rolls it back.
#[async_trait]
pub trait UnitOfWork: Send + Sync {
    type Tx: Send;

    async fn begin(&self) -> Result<Self::Tx, StorageError>;

    async fn commit(&self, tx: Self::Tx) -> Result<(), StorageError>;
}

/// Connectors and accounts, kept only so foreign keys can be enforced.
#[async_trait]
pub trait ReferenceRegistry: Send + Sync {
    /// Insert-or-ignore.
    async fn register_connector(&self, connector: &Connector) -> Result<(), StorageError>;

    /// Insert-or-ignore; fails as a whole on an unknown connector.
    async fn register_accounts(&self, accounts: &[Account]) -> Result<(), StorageError>;
}

/// Folds adjustment batches into payment/order summaries.
#[async_trait]
pub trait AdjustmentLedger: Send + Sync {
    /// One transaction per call: entities insert-or-ignore, adjustments
    /// insert-or-ignore, one relative update per outcome class per entity,
    /// one `PAYMENT_SAVED` outbox event per newly recorded adjustment.
    async fn upsert_payments(&self, batch: &[Payment]) -> Result<(), StorageError>;

    /// Same contract as [`upsert_payments`](Self::upsert_payments), with
    /// `ORDER_SAVED` events.
    async fn upsert_orders(&self, batch: &[Order]) -> Result<(), StorageError>;

    async fn get_payment(&self, id: PaymentId) -> Result<PaymentState, StorageError>;

    async fn get_payment_by_reference(
        &self,
        reference: &str,
        connector_id: ConnectorId,
    ) -> Result<PaymentState, StorageError>;

    async fn get_order(&self, id: OrderId) -> Result<OrderState, StorageError>;

    /// Merge `metadata` into the payment's metadata.
    async fn update_payment_metadata(
        &self,
        id: PaymentId,
        metadata: BTreeMap<String, String>,
    ) -> Result<(), StorageError>;

    /// Delete the payment and its adjustments, staging `PAYMENT_DELETED`.
    /// No-op when absent.
    async fn delete_payment_by_reference(
        &self,
        reference: &str,
        connector_id: ConnectorId,
    ) -> Result<(), StorageError>;

    /// Delete one payment with its adjustments. Stages no event.
    ///
    /// Returns the number of payments removed (0 when absent).
    async fn delete_payment(&self, id: PaymentId) -> Result<u64, StorageError>;

    /// Connector uninstall: delete every payment of `connector_id` with its
    /// adjustments. Stages no event.
    async fn delete_payments_by_connector(
        &self,
        connector_id: ConnectorId,
    ) -> Result<u64, StorageError>;

    /// Delete every payment with `account_id` as source or destination,
    /// with its adjustments. Stages no event.
    async fn delete_payments_by_account(&self, account_id: AccountId) -> Result<u64, StorageError>;

    /// Delete one order with its adjustments. Stages no event.
    async fn delete_order(&self, id: OrderId) -> Result<u64, StorageError>;

    /// Connector uninstall: delete every order of `connector_id` with its
    /// adjustments. Stages no event.
    async fn delete_orders_by_connector(
        &self,
        connector_id: ConnectorId,
    ) -> Result<u64, StorageError>;

    /// Append a synthetic adjustment moving the order to `status`.
    async fn update_order_status(
        &self,
        id: OrderId,
        status: OrderStatus,
    ) -> Result<(), StorageError>;

    async fn list_payments(&self, query: &ListQuery) -> Result<Page<PaymentState>, StorageError>;

    async fn list_orders(&self, query: &ListQuery) -> Result<Page<OrderState>, StorageError>;
}

/// Balance listing criteria.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BalanceQuery {
    pub account_id: Option<AccountId>,
    pub asset: Option<String>,
    /// Versions whose window ends at or after `from`.
    pub from: Option<DateTime<Utc>>,
    /// Versions created at or before `to`.
    pub to: Option<DateTime<Utc>>,
    pub page: ListQuery,
}

impl BalanceQuery {
    pub fn for_account(account_id: AccountId) -> Self {
        Self {
            account_id: Some(account_id),
            ..Self::default()
        }
    }

    pub(crate) fn matches(&self, balance: &Balance) -> bool {
        self.account_id.is_none_or(|id| id == balance.account_id)
            && self.asset.as_deref().is_none_or(|asset| asset == balance.asset)
            && self.from.is_none_or(|from| balance.last_updated_at >= from)
            && self.to.is_none_or(|to| balance.created_at <= to)
    }
}

/// Per-(account, asset) balance history with point-in-time lookup.
#[async_trait]
pub trait BalanceVersionStore: Send + Sync {
    /// One transaction per batch. Strictly older observations are no-ops,
    /// equal values extend the latest window, new values open a version.
    async fn upsert_balances(&self, batch: &[Balance]) -> Result<(), StorageError>;

    /// The version of (account, asset) valid at `at`, if any.
    async fn balance_at(
        &self,
        account_id: AccountId,
        asset: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<Balance>, StorageError>;

    /// One version per asset of `account_id` valid at `at`.
    async fn balances_at(
        &self,
        account_id: AccountId,
        at: DateTime<Utc>,
    ) -> Result<Vec<Balance>, StorageError>;

    /// Latest version per asset of `account_id`.
    async fn latest_balances(&self, account_id: AccountId) -> Result<Vec<Balance>, StorageError>;

    async fn list_balances(&self, query: &BalanceQuery) -> Result<Page<Balance>, StorageError>;

    /// Connector uninstall: delete every version of every balance of
    /// `connector_id`. Returns the number of versions removed.
    async fn delete_balances_by_connector(
        &self,
        connector_id: ConnectorId,
    ) -> Result<u64, StorageError>;
}

/// Transactional outbox.
///
/// State machine of one event:
///
/// ```text
/// PENDING --fail, retry < max--> PENDING
/// PENDING --fail, retry >= max--> FAILED            (terminal until requeued)
/// FAILED  --requeue--> PENDING, retry = 0
/// PENDING --delivered--> deleted + EventSent        (terminal)
/// ```
#[async_trait]
pub trait OutboxDispatcher: UnitOfWork {
    /// Stage events inside the caller's transaction. Never commits.
    ///
    /// Events already recorded as sent or already staged are skipped.
    async fn insert(&self, tx: &mut Self::Tx, events: &[OutboxEvent]) -> Result<(), StorageError>;

    /// Stage events in a transaction of their own.
    async fn insert_standalone(&self, events: &[OutboxEvent]) -> Result<(), StorageError>;

    /// Oldest pending events first. FAILED events are never returned.
    async fn poll_pending(&self, limit: usize) -> Result<Vec<OutboxEvent>, StorageError>;

    /// Record a failed delivery; dead-letters once `retry_count` reaches the
    /// configured maximum. `NotFound` unless the event is PENDING.
    async fn mark_failed(
        &self,
        id: &EventId,
        retry_count: u32,
        error: &str,
    ) -> Result<(), StorageError>;

    /// Delete the outbox row and record it as sent, in one transaction.
    ///
    /// Recording an already-sent event again is a no-op; `NotFound` when the
    /// event is neither staged nor sent.
    async fn delete_and_record_sent(
        &self,
        id: &EventId,
        sent: EventSent,
    ) -> Result<(), StorageError>;

    async fn outbox_event(&self, id: &EventId) -> Result<Option<OutboxEvent>, StorageError>;

    async fn events_sent_exists(&self, id: &EventId) -> Result<bool, StorageError>;

    async fn event_sent(&self, id: &EventId) -> Result<Option<EventSent>, StorageError>;

    /// Dead-lettered events, oldest first.
    async fn list_failed(&self, limit: usize) -> Result<Vec<OutboxEvent>, StorageError>;

    /// Operator action: move a FAILED event back to PENDING with a fresh
    /// retry budget.
    async fn requeue_failed(&self, id: &EventId) -> Result<(), StorageError>;

    fn max_retries(&self) -> u32;
}
