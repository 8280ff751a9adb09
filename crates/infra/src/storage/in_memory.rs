use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;
use uuid::Uuid;

use paystate_core::{
    Account, AccountId, AdjustedEntity, Adjustment, AdjustmentId, AdjustmentStatus, Balance,
    BatchEffect, Connector, ConnectorId, EntityState, Order, OrderId, OrderState, OrderStatus,
    Payment, PaymentId, PaymentState, VersionDecision, latest_status, version_at,
};
use paystate_events::{
    DEFAULT_MAX_OUTBOX_RETRIES, EventId, EventSent, OutboxEvent, OutboxStatus, payloads,
};

use crate::query::{
    FieldValue, Filterable, ListQuery, ORDER_SCHEMA, PAYMENT_SCHEMA, Page, QuerySchema, SortKey,
    build_page,
};

use super::{
    AdjustmentLedger, BalanceQuery, BalanceVersionStore, OutboxDispatcher, ReferenceRegistry,
    StorageError, UnitOfWork,
};

/// Rows of one adjusted entity kind.
#[derive(Debug, Clone)]
struct EntityTable<E: AdjustedEntity> {
    /// Entity rows without adjustments, with their sort id.
    rows: HashMap<Uuid, (i64, E)>,
    /// Adjustment rows: (sort id, owning entity, adjustment).
    adjustments: HashMap<AdjustmentId, (i64, Uuid, Adjustment<E::Status>)>,
}

impl<E: AdjustedEntity> Default for EntityTable<E> {
    fn default() -> Self {
        Self {
            rows: HashMap::new(),
            adjustments: HashMap::new(),
        }
    }
}

impl<E: AdjustedEntity> EntityTable<E> {
    /// Entity with its adjustments (newest first) and derived status.
    fn state(&self, id: &Uuid) -> Option<(SortKey, EntityState<E>)> {
        let (sort_id, row) = self.rows.get(id)?;
        let mut adjustments: Vec<(i64, &Adjustment<E::Status>)> = self
            .adjustments
            .values()
            .filter(|(_, owner, _)| owner == id)
            .map(|(seq, _, adjustment)| (*seq, adjustment))
            .collect();
        let status = latest_status(adjustments.iter().copied()).unwrap_or(E::Status::INITIAL);
        adjustments.sort_by_key(|(seq, a)| std::cmp::Reverse((a.created_at, *seq)));

        let mut entity = row.clone();
        entity.set_adjustments(adjustments.into_iter().map(|(_, a)| a.clone()).collect());
        let key = SortKey {
            created_at: entity.created_at(),
            sort_id: *sort_id,
        };
        Some((key, EntityState { entity, status }))
    }

    /// Remove the rows matching `pred` together with their adjustments.
    fn remove_where(&mut self, pred: impl Fn(&E) -> bool) -> u64 {
        let removed: HashSet<Uuid> = self
            .rows
            .iter()
            .filter(|(_, (_, row))| pred(row))
            .map(|(id, _)| *id)
            .collect();
        self.rows.retain(|id, _| !removed.contains(id));
        self.adjustments
            .retain(|_, (_, owner, _)| !removed.contains(owner));
        removed.len() as u64
    }

    fn list(
        &self,
        schema: &QuerySchema,
        query: &ListQuery,
    ) -> Result<Page<EntityState<E>>, StorageError>
    where
        EntityState<E>: Filterable,
    {
        if let Some(filter) = &query.filter {
            schema.validate(filter)?;
        }
        let (cursor, page_size) = query.resolve()?;

        let mut rows = Vec::new();
        for id in self.rows.keys() {
            let Some((key, state)) = self.state(id) else {
                continue;
            };
            if cursor.as_ref().is_some_and(|c| !c.admits(&key)) {
                continue;
            }
            if let Some(filter) = &query.filter {
                if !schema.evaluate(filter, &state)? {
                    continue;
                }
            }
            rows.push((key, state));
        }
        sort_for_page(&mut rows, cursor.as_ref());
        rows.truncate(page_size + 1);
        Ok(build_page(rows, cursor.as_ref(), page_size))
    }
}

fn sort_for_page<T>(rows: &mut [(SortKey, T)], cursor: Option<&crate::query::Cursor>) {
    if matches!(cursor.map(|c| c.direction), Some(crate::query::Direction::Previous)) {
        rows.sort_by_key(|(k, _)| *k);
    } else {
        rows.sort_by_key(|(k, _)| std::cmp::Reverse(*k));
    }
}

#[derive(Debug, Clone, Default)]
struct Tables {
    next_sort_id: i64,
    connectors: HashMap<ConnectorId, Connector>,
    accounts: HashMap<AccountId, Account>,
    payments: EntityTable<Payment>,
    orders: EntityTable<Order>,
    /// Versions per (account, asset), oldest first, with their sort id.
    balances: BTreeMap<(AccountId, String), Vec<(i64, Balance)>>,
    /// Keyed by `EventId::storage_key`.
    outbox: HashMap<String, (i64, OutboxEvent)>,
    events_sent: HashMap<String, EventSent>,
}

fn next_id(seq: &mut i64) -> i64 {
    *seq += 1;
    *seq
}

impl Tables {
    fn stage_events(&mut self, events: &[OutboxEvent]) {
        for event in events {
            let key = event.id.storage_key();
            if self.events_sent.contains_key(&key) || self.outbox.contains_key(&key) {
                continue;
            }
            let sort_id = next_id(&mut self.next_sort_id);
            self.outbox.insert(key, (sort_id, event.clone()));
        }
    }

    fn payment_refs(&self, payment: &Payment) -> Result<(), StorageError> {
        self.connector_ref(payment.connector_id)?;
        for account_id in [payment.source_account_id, payment.destination_account_id]
            .into_iter()
            .flatten()
        {
            if !self.accounts.contains_key(&account_id) {
                return Err(StorageError::foreign_key(format!(
                    "payment {} references unknown account {}",
                    payment.id, account_id
                )));
            }
        }
        Ok(())
    }

    fn connector_ref(&self, connector_id: ConnectorId) -> Result<(), StorageError> {
        if self.connectors.contains_key(&connector_id) {
            Ok(())
        } else {
            Err(StorageError::foreign_key(format!(
                "unknown connector {connector_id}"
            )))
        }
    }

    fn upsert_payments(&mut self, batch: &[Payment], now: DateTime<Utc>) -> Result<(), StorageError> {
        for payment in batch {
            payment.validate()?;
            self.payment_refs(payment)?;
        }
        let events = fold_batch(&mut self.payments, &mut self.next_sort_id, batch, |p, a| {
            payloads::payment_saved(p, a, now)
        });
        self.stage_events(&events);
        Ok(())
    }

    fn upsert_orders(&mut self, batch: &[Order], now: DateTime<Utc>) -> Result<(), StorageError> {
        for order in batch {
            order.validate()?;
            self.connector_ref(order.connector_id)?;
        }
        for order in batch {
            if let Some((_, row)) = self.orders.rows.get_mut(order.id.as_uuid()) {
                row.metadata
                    .extend(order.metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
        }
        let events = fold_batch(&mut self.orders, &mut self.next_sort_id, batch, |o, a| {
            payloads::order_saved(o, a, now)
        });
        self.stage_events(&events);
        Ok(())
    }

    fn upsert_balance(&mut self, observed: &Balance, now: DateTime<Utc>) -> Result<(), StorageError> {
        observed.validate()?;
        self.connector_ref(observed.connector_id)?;
        if !self.accounts.contains_key(&observed.account_id) {
            return Err(StorageError::foreign_key(format!(
                "balance references unknown account {}",
                observed.account_id
            )));
        }

        let versions = self
            .balances
            .entry((observed.account_id, observed.asset.clone()))
            .or_default();
        let decision = VersionDecision::decide(versions.last().map(|(_, b)| b), observed);
        debug!(account_id = %observed.account_id, asset = %observed.asset, ?decision, "balance observation");

        match &decision {
            VersionDecision::Insert => {
                versions.push((next_id(&mut self.next_sort_id), observed.clone()));
            }
            VersionDecision::Discard => {}
            VersionDecision::Extend { last_updated_at } => {
                if let Some((_, latest)) = versions.last_mut() {
                    latest.last_updated_at = *last_updated_at;
                }
            }
            VersionDecision::Supersede { close_at } => {
                if let Some((_, latest)) = versions.last_mut() {
                    latest.last_updated_at = *close_at;
                }
                versions.push((next_id(&mut self.next_sort_id), observed.clone()));
            }
            VersionDecision::Correct => {
                if let Some((_, latest)) = versions.last_mut() {
                    latest.balance = observed.balance;
                }
            }
        }

        if decision.is_announced() {
            self.stage_events(&[payloads::balance_saved(observed, now)]);
        }
        Ok(())
    }
}

/// Insert-or-ignore entities and adjustments, then apply the folded effect of
/// the adjustments this call actually recorded. Returns the events to stage.
fn fold_batch<E: AdjustedEntity>(
    table: &mut EntityTable<E>,
    seq: &mut i64,
    batch: &[E],
    saved: impl Fn(&E, &Adjustment<E::Status>) -> OutboxEvent,
) -> Vec<OutboxEvent> {
    let mut events = Vec::new();

    for entity in batch {
        let id = entity.entity_uuid();
        table.rows.entry(id).or_insert_with(|| {
            let mut row = entity.clone();
            row.set_adjustments(Vec::new());
            (next_id(seq), row)
        });

        let mut recorded = Vec::new();
        for adjustment in entity.adjustments() {
            if table.adjustments.contains_key(&adjustment.id) {
                continue;
            }
            table
                .adjustments
                .insert(adjustment.id, (next_id(seq), id, adjustment.clone()));
            recorded.push(adjustment);
        }

        let effect = BatchEffect::fold(recorded.iter().copied());
        if !effect.is_empty() {
            if let Some((_, row)) = table.rows.get_mut(&id) {
                row.apply_effect(&effect);
            }
        }
        events.extend(recorded.into_iter().map(|a| saved(entity, a)));
    }

    events
}

/// In-memory storage backend.
///
/// Intended for tests/dev. Not optimized for performance. A transaction holds
/// the store's lock and works on a copy of the tables; commit swaps the copy
/// in, drop discards it.
#[derive(Debug, Clone)]
pub struct InMemoryStore {
    state: Arc<Mutex<Tables>>,
    max_retries: u32,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Transaction of [`InMemoryStore`].
pub struct InMemoryTx {
    guard: OwnedMutexGuard<Tables>,
    draft: Tables,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_max_retries(DEFAULT_MAX_OUTBOX_RETRIES)
    }

    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(Tables::default())),
            max_retries,
        }
    }

    /// Run `f` against a draft of the tables; commit only if it succeeds.
    async fn transact<T: Send>(
        &self,
        f: impl FnOnce(&mut Tables) -> Result<T, StorageError> + Send,
    ) -> Result<T, StorageError> {
        let mut tx = self.begin().await?;
        let out = f(&mut tx.draft)?;
        self.commit(tx).await?;
        Ok(out)
    }

    /// Number of stored versions for (account, asset).
    pub async fn balance_version_count(&self, account_id: AccountId, asset: &str) -> usize {
        let state = self.state.lock().await;
        state
            .balances
            .get(&(account_id, asset.to_string()))
            .map_or(0, Vec::len)
    }
}

#[async_trait]
impl UnitOfWork for InMemoryStore {
    type Tx = InMemoryTx;

    async fn begin(&self) -> Result<InMemoryTx, StorageError> {
        let guard = self.state.clone().lock_owned().await;
        let draft = guard.clone();
        Ok(InMemoryTx { guard, draft })
    }

    async fn commit(&self, tx: InMemoryTx) -> Result<(), StorageError> {
        let InMemoryTx { mut guard, draft } = tx;
        *guard = draft;
        Ok(())
    }
}

#[async_trait]
impl ReferenceRegistry for InMemoryStore {
    async fn register_connector(&self, connector: &Connector) -> Result<(), StorageError> {
        let connector = connector.clone();
        self.transact(move |tables| {
            tables.connectors.entry(connector.id).or_insert(connector);
            Ok(())
        })
        .await
    }

    async fn register_accounts(&self, accounts: &[Account]) -> Result<(), StorageError> {
        self.transact(|tables| {
            for account in accounts {
                tables.connector_ref(account.connector_id)?;
                tables
                    .accounts
                    .entry(account.id)
                    .or_insert_with(|| account.clone());
            }
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl AdjustmentLedger for InMemoryStore {
    async fn upsert_payments(&self, batch: &[Payment]) -> Result<(), StorageError> {
        let now = Utc::now();
        self.transact(|tables| tables.upsert_payments(batch, now)).await
    }

    async fn upsert_orders(&self, batch: &[Order]) -> Result<(), StorageError> {
        let now = Utc::now();
        self.transact(|tables| tables.upsert_orders(batch, now)).await
    }

    async fn get_payment(&self, id: PaymentId) -> Result<PaymentState, StorageError> {
        let state = self.state.lock().await;
        state
            .payments
            .state(id.as_uuid())
            .map(|(_, s)| s)
            .ok_or_else(|| StorageError::not_found(format!("payment {id}")))
    }

    async fn get_payment_by_reference(
        &self,
        reference: &str,
        connector_id: ConnectorId,
    ) -> Result<PaymentState, StorageError> {
        let state = self.state.lock().await;
        state
            .payments
            .rows
            .values()
            .filter(|(_, p)| p.reference == reference && p.connector_id == connector_id)
            .max_by_key(|(seq, _)| *seq)
            .and_then(|(_, p)| state.payments.state(p.id.as_uuid()))
            .map(|(_, s)| s)
            .ok_or_else(|| StorageError::not_found(format!("payment with reference {reference}")))
    }

    async fn get_order(&self, id: OrderId) -> Result<OrderState, StorageError> {
        let state = self.state.lock().await;
        state
            .orders
            .state(id.as_uuid())
            .map(|(_, s)| s)
            .ok_or_else(|| StorageError::not_found(format!("order {id}")))
    }

    async fn update_payment_metadata(
        &self,
        id: PaymentId,
        metadata: BTreeMap<String, String>,
    ) -> Result<(), StorageError> {
        self.transact(move |tables| {
            let (_, payment) = tables
                .payments
                .rows
                .get_mut(id.as_uuid())
                .ok_or_else(|| StorageError::not_found(format!("payment {id}")))?;
            payment.metadata.extend(metadata);
            Ok(())
        })
        .await
    }

    async fn delete_payment_by_reference(
        &self,
        reference: &str,
        connector_id: ConnectorId,
    ) -> Result<(), StorageError> {
        let now = Utc::now();
        self.transact(|tables| {
            let ids: Vec<Uuid> = tables
                .payments
                .rows
                .iter()
                .filter(|(_, (_, p))| p.reference == reference && p.connector_id == connector_id)
                .map(|(id, _)| *id)
                .collect();

            let mut events = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some((_, payment)) = tables.payments.rows.remove(&id) {
                    tables.payments.adjustments.retain(|_, (_, owner, _)| *owner != id);
                    events.push(payloads::payment_deleted(&payment, now));
                }
            }
            tables.stage_events(&events);
            Ok(())
        })
        .await
    }

    async fn delete_payment(&self, id: PaymentId) -> Result<u64, StorageError> {
        self.transact(move |tables| Ok(tables.payments.remove_where(|p| p.id == id)))
            .await
    }

    async fn delete_payments_by_connector(
        &self,
        connector_id: ConnectorId,
    ) -> Result<u64, StorageError> {
        self.transact(move |tables| {
            Ok(tables
                .payments
                .remove_where(|p| p.connector_id == connector_id))
        })
        .await
    }

    async fn delete_payments_by_account(&self, account_id: AccountId) -> Result<u64, StorageError> {
        self.transact(move |tables| {
            Ok(tables.payments.remove_where(|p| {
                p.source_account_id == Some(account_id) || p.destination_account_id == Some(account_id)
            }))
        })
        .await
    }

    async fn delete_order(&self, id: OrderId) -> Result<u64, StorageError> {
        self.transact(move |tables| Ok(tables.orders.remove_where(|o| o.id == id)))
            .await
    }

    async fn delete_orders_by_connector(
        &self,
        connector_id: ConnectorId,
    ) -> Result<u64, StorageError> {
        self.transact(move |tables| {
            Ok(tables
                .orders
                .remove_where(|o| o.connector_id == connector_id))
        })
        .await
    }

    async fn update_order_status(
        &self,
        id: OrderId,
        status: OrderStatus,
    ) -> Result<(), StorageError> {
        let now = Utc::now();
        self.transact(move |tables| {
            let (_, row) = tables
                .orders
                .rows
                .get(id.as_uuid())
                .ok_or_else(|| StorageError::not_found(format!("order {id}")))?;
            let mut order = row.clone();
            order.adjustments = vec![order.status_update(status, now)];
            tables.upsert_orders(&[order], now)
        })
        .await
    }

    async fn list_payments(&self, query: &ListQuery) -> Result<Page<PaymentState>, StorageError> {
        let state = self.state.lock().await;
        state.payments.list(&PAYMENT_SCHEMA, query)
    }

    async fn list_orders(&self, query: &ListQuery) -> Result<Page<OrderState>, StorageError> {
        let state = self.state.lock().await;
        state.orders.list(&ORDER_SCHEMA, query)
    }
}

#[async_trait]
impl BalanceVersionStore for InMemoryStore {
    async fn upsert_balances(&self, batch: &[Balance]) -> Result<(), StorageError> {
        let now = Utc::now();
        self.transact(|tables| {
            for observed in batch {
                tables.upsert_balance(observed, now)?;
            }
            Ok(())
        })
        .await
    }

    async fn balance_at(
        &self,
        account_id: AccountId,
        asset: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<Balance>, StorageError> {
        let state = self.state.lock().await;
        let Some(versions) = state.balances.get(&(account_id, asset.to_string())) else {
            return Ok(None);
        };
        let versions: Vec<Balance> = versions.iter().map(|(_, b)| b.clone()).collect();
        Ok(version_at(&versions, at).cloned())
    }

    async fn balances_at(
        &self,
        account_id: AccountId,
        at: DateTime<Utc>,
    ) -> Result<Vec<Balance>, StorageError> {
        let state = self.state.lock().await;
        Ok(state
            .balances
            .iter()
            .filter(|((account, _), _)| *account == account_id)
            .filter_map(|(_, versions)| {
                let versions: Vec<Balance> = versions.iter().map(|(_, b)| b.clone()).collect();
                version_at(&versions, at).cloned()
            })
            .collect())
    }

    async fn latest_balances(&self, account_id: AccountId) -> Result<Vec<Balance>, StorageError> {
        let state = self.state.lock().await;
        Ok(state
            .balances
            .iter()
            .filter(|((account, _), _)| *account == account_id)
            .filter_map(|(_, versions)| versions.last().map(|(_, b)| b.clone()))
            .collect())
    }

    async fn list_balances(&self, query: &BalanceQuery) -> Result<Page<Balance>, StorageError> {
        let (cursor, page_size) = query.page.resolve()?;
        let state = self.state.lock().await;

        let mut rows: Vec<(SortKey, Balance)> = state
            .balances
            .values()
            .flatten()
            .filter(|(_, b)| query.matches(b))
            .map(|(sort_id, b)| {
                let key = SortKey {
                    created_at: b.created_at,
                    sort_id: *sort_id,
                };
                (key, b.clone())
            })
            .filter(|(key, _)| cursor.as_ref().is_none_or(|c| c.admits(key)))
            .collect();
        sort_for_page(&mut rows, cursor.as_ref());
        rows.truncate(page_size + 1);
        Ok(build_page(rows, cursor.as_ref(), page_size))
    }

    async fn delete_balances_by_connector(
        &self,
        connector_id: ConnectorId,
    ) -> Result<u64, StorageError> {
        self.transact(move |tables| {
            let mut removed = 0;
            for versions in tables.balances.values_mut() {
                let before = versions.len();
                versions.retain(|(_, b)| b.connector_id != connector_id);
                removed += (before - versions.len()) as u64;
            }
            tables.balances.retain(|_, versions| !versions.is_empty());
            Ok(removed)
        })
        .await
    }
}

#[async_trait]
impl OutboxDispatcher for InMemoryStore {
    async fn insert(&self, tx: &mut InMemoryTx, events: &[OutboxEvent]) -> Result<(), StorageError> {
        tx.draft.stage_events(events);
        Ok(())
    }

    async fn insert_standalone(&self, events: &[OutboxEvent]) -> Result<(), StorageError> {
        self.transact(|tables| {
            tables.stage_events(events);
            Ok(())
        })
        .await
    }

    async fn poll_pending(&self, limit: usize) -> Result<Vec<OutboxEvent>, StorageError> {
        let state = self.state.lock().await;
        let mut pending: Vec<&(i64, OutboxEvent)> = state
            .outbox
            .values()
            .filter(|(_, e)| e.status == OutboxStatus::Pending)
            .collect();
        pending.sort_by_key(|(seq, e)| (e.created_at, *seq));
        Ok(pending.into_iter().take(limit).map(|(_, e)| e.clone()).collect())
    }

    async fn mark_failed(
        &self,
        id: &EventId,
        retry_count: u32,
        error: &str,
    ) -> Result<(), StorageError> {
        let max_retries = self.max_retries;
        let now = Utc::now();
        self.transact(|tables| {
            let recorded = tables
                .outbox
                .get_mut(&id.storage_key())
                .is_some_and(|(_, event)| event.record_failure(retry_count, error, now, max_retries));
            if !recorded {
                return Err(StorageError::not_found(format!("pending outbox event {id}")));
            }
            Ok(())
        })
        .await
    }

    async fn delete_and_record_sent(
        &self,
        id: &EventId,
        sent: EventSent,
    ) -> Result<(), StorageError> {
        self.transact(|tables| {
            let key = id.storage_key();
            let deleted = tables.outbox.remove(&key).is_some();
            if !deleted && !tables.events_sent.contains_key(&key) {
                return Err(StorageError::not_found(format!("outbox event {id}")));
            }
            tables.events_sent.entry(key).or_insert(sent);
            Ok(())
        })
        .await
    }

    async fn outbox_event(&self, id: &EventId) -> Result<Option<OutboxEvent>, StorageError> {
        let state = self.state.lock().await;
        Ok(state.outbox.get(&id.storage_key()).map(|(_, e)| e.clone()))
    }

    async fn events_sent_exists(&self, id: &EventId) -> Result<bool, StorageError> {
        let state = self.state.lock().await;
        Ok(state.events_sent.contains_key(&id.storage_key()))
    }

    async fn event_sent(&self, id: &EventId) -> Result<Option<EventSent>, StorageError> {
        let state = self.state.lock().await;
        Ok(state.events_sent.get(&id.storage_key()).cloned())
    }

    async fn list_failed(&self, limit: usize) -> Result<Vec<OutboxEvent>, StorageError> {
        let state = self.state.lock().await;
        let mut failed: Vec<&(i64, OutboxEvent)> = state
            .outbox
            .values()
            .filter(|(_, e)| e.status == OutboxStatus::Failed)
            .collect();
        failed.sort_by_key(|(seq, e)| (e.created_at, *seq));
        Ok(failed.into_iter().take(limit).map(|(_, e)| e.clone()).collect())
    }

    async fn requeue_failed(&self, id: &EventId) -> Result<(), StorageError> {
        self.transact(|tables| {
            let (_, event) = tables
                .outbox
                .get_mut(&id.storage_key())
                .filter(|(_, e)| e.status == OutboxStatus::Failed)
                .ok_or_else(|| StorageError::not_found(format!("failed outbox event {id}")))?;
            event.status = OutboxStatus::Pending;
            event.retry_count = 0;
            Ok(())
        })
        .await
    }

    fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

fn text(value: &str) -> Option<FieldValue> {
    Some(FieldValue::Text(value.to_string()))
}

impl Filterable for PaymentState {
    fn field(&self, key: &str) -> Option<FieldValue> {
        let p = &self.entity;
        match key {
            "id" => Some(FieldValue::Uuid(*p.id.as_uuid())),
            "reference" => text(&p.reference),
            "connector_id" => Some(FieldValue::Uuid(*p.connector_id.as_uuid())),
            "type" => text(p.payment_type.code()),
            "asset" => text(&p.asset),
            "scheme" => text(p.scheme.code()),
            "status" => text(AdjustmentStatus::code(&self.status)),
            "source_account_id" => p.source_account_id.map(|id| FieldValue::Uuid(*id.as_uuid())),
            "destination_account_id" => p
                .destination_account_id
                .map(|id| FieldValue::Uuid(*id.as_uuid())),
            "amount" => Some(FieldValue::Decimal(p.amount)),
            "initial_amount" => Some(FieldValue::Decimal(p.initial_amount)),
            _ => None,
        }
    }

    fn metadata(&self, key: &str) -> Option<&str> {
        self.entity.metadata.get(key).map(String::as_str)
    }
}

impl Filterable for OrderState {
    fn field(&self, key: &str) -> Option<FieldValue> {
        let o = &self.entity;
        match key {
            "id" => Some(FieldValue::Uuid(*o.id.as_uuid())),
            "reference" => text(&o.reference),
            "connector_id" => Some(FieldValue::Uuid(*o.connector_id.as_uuid())),
            "type" => text(o.order_type.code()),
            "direction" => text(o.direction.code()),
            "source_asset" => text(&o.source_asset),
            "target_asset" => text(&o.target_asset),
            "status" => text(AdjustmentStatus::code(&self.status)),
            "amount" => Some(FieldValue::Decimal(o.amount)),
            "initial_amount" => Some(FieldValue::Decimal(o.initial_amount)),
            _ => None,
        }
    }

    fn metadata(&self, key: &str) -> Option<&str> {
        self.entity.metadata.get(key).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::conformance;

    #[tokio::test]
    async fn in_memory_conformance() {
        let store = InMemoryStore::with_max_retries(conformance::MAX_RETRIES);
        conformance::run_all(&store).await;
    }

    #[tokio::test]
    async fn dropped_transaction_is_rolled_back() {
        let store = InMemoryStore::new();
        let event = OutboxEvent::pending(
            EventId::new("rollback", None),
            paystate_events::OutboxEventType::BalanceSaved,
            "acc",
            serde_json::json!({}),
            Utc::now(),
        );

        let mut tx = store.begin().await.unwrap();
        store.insert(&mut tx, &[event.clone()]).await.unwrap();
        drop(tx);

        assert_eq!(store.outbox_event(&event.id).await.unwrap(), None);
        assert!(store.poll_pending(10).await.unwrap().is_empty());
    }
}
