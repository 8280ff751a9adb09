//! Postgres-backed storage.
//!
//! ## Ledger writes
//!
//! `upsert_payments` / `upsert_orders` run in one transaction:
//!
//! 1. insert entity rows, `ON CONFLICT (id) DO NOTHING` (orders merge the
//!    observed metadata into the stored one instead)
//! 2. insert adjustments, `ON CONFLICT (id) DO NOTHING RETURNING id`
//! 3. fold only the adjustments that came back from step 2 and apply the
//!    result with relative `UPDATE`s (`amount = amount - $debit + $credit`)
//! 4. stage one outbox event per recorded adjustment
//!
//! Replaying a batch therefore records nothing and moves no amount.
//!
//! ## Balance writes
//!
//! Each observation takes a transaction-scoped advisory lock on its
//! (account, asset) pair before reading the latest version, so concurrent
//! writers of one pair are serialized and windows stay disjoint.
//!
//! ## Thread Safety
//!
//! `PostgresStore` is `Send + Sync` and cheap to clone; all operations go
//! through the SQLx connection pool.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder, Row, Transaction};
use tracing::{Span, debug, instrument, warn};
use uuid::Uuid;

use paystate_core::{
    Account, AccountId, AdjustedEntity, Adjustment, AdjustmentId, AdjustmentStatus, Balance,
    BatchEffect, Connector, ConnectorId, EntityState, Order, OrderDirection, OrderId, OrderState,
    OrderStatus, OrderType, Payment, PaymentId, PaymentScheme, PaymentState, PaymentStatus,
    PaymentType, VersionDecision,
};
use paystate_events::{EventId, EventSent, OutboxEvent, OutboxStatus, payloads};

use crate::config::StoreConfig;
use crate::query::{
    Cursor, Direction, ListQuery, ORDER_SCHEMA, PAYMENT_SCHEMA, Page, QuerySchema, SortKey,
    build_page,
};

use super::{
    AdjustmentLedger, BalanceQuery, BalanceVersionStore, OutboxDispatcher, ReferenceRegistry,
    StorageError, UnitOfWork, map_sqlx_error,
};

type PgTx = Transaction<'static, Postgres>;

/// Table layout of one adjusted entity kind.
struct LedgerTables {
    entity: &'static str,
    adjustments: &'static str,
    /// Foreign key column of `adjustments` pointing at `entity`.
    owner: &'static str,
}

const PAYMENT_TABLES: LedgerTables = LedgerTables {
    entity: "payments",
    adjustments: "payment_adjustments",
    owner: "payment_id",
};

const ORDER_TABLES: LedgerTables = LedgerTables {
    entity: "orders",
    adjustments: "order_adjustments",
    owner: "order_id",
};

const PAYMENT_SELECT: &str = r#"
    SELECT
        p.id,
        p.sort_id,
        p.connector_id,
        p.reference,
        p.created_at,
        p.type,
        p.initial_amount,
        p.amount,
        p.asset,
        p.scheme,
        p.source_account_id,
        p.destination_account_id,
        p.metadata,
        COALESCE(latest.status, 'PENDING') AS status
    FROM payments p
    LEFT JOIN LATERAL (
        SELECT a.status
        FROM payment_adjustments a
        WHERE a.payment_id = p.id
        ORDER BY a.created_at DESC, a.sort_id DESC
        LIMIT 1
    ) latest ON TRUE
"#;

const ORDER_SELECT: &str = r#"
    SELECT
        o.id,
        o.sort_id,
        o.connector_id,
        o.reference,
        o.created_at,
        o.direction,
        o.source_asset,
        o.target_asset,
        o.type,
        o.limit_price,
        o.initial_amount,
        o.amount,
        o.metadata,
        COALESCE(latest.status, 'PENDING') AS status
    FROM orders o
    LEFT JOIN LATERAL (
        SELECT a.status
        FROM order_adjustments a
        WHERE a.order_id = o.id
        ORDER BY a.created_at DESC, a.sort_id DESC
        LIMIT 1
    ) latest ON TRUE
"#;

const BALANCE_SELECT: &str = r#"
    SELECT
        b.account_id,
        b.asset,
        b.connector_id,
        b.balance,
        b.created_at,
        b.last_updated_at,
        b.sort_id,
        NOT EXISTS (
            SELECT 1 FROM balances n
            WHERE n.account_id = b.account_id
              AND n.asset = b.asset
              AND n.created_at > b.created_at
        ) AS is_head
    FROM balances b
"#;

const OUTBOX_COLUMNS: &str = r#"
    id,
    idempotency_key,
    connector_id,
    event_type,
    entity_id,
    payload,
    created_at,
    status,
    retry_count,
    last_retry_at,
    error
"#;

/// Postgres storage backend implementing every storage trait.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: Arc<PgPool>,
    operation_timeout: Duration,
    max_retries: u32,
}

impl PostgresStore {
    pub fn new(pool: PgPool, config: &StoreConfig) -> Self {
        Self {
            pool: Arc::new(pool),
            operation_timeout: config.operation_timeout,
            max_retries: config.max_outbox_retries,
        }
    }

    /// Open a pool sized by `config`.
    pub async fn connect(config: &StoreConfig) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool, config))
    }

    /// Apply the bundled schema migrations.
    pub async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::migrate!("./migrations")
            .run(&*self.pool)
            .await
            .map_err(|e| StorageError::Internal(format!("migration failed: {e}")))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run `operation` under the configured deadline.
    ///
    /// An elapsed deadline drops the future, which rolls back any open
    /// transaction.
    async fn bounded<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = Result<T, StorageError>>,
    ) -> Result<T, StorageError> {
        match tokio::time::timeout(self.operation_timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!(operation, timeout_ms = self.operation_timeout.as_millis() as u64, "storage operation timed out");
                Err(StorageError::Cancelled(format!(
                    "{operation} exceeded {}ms",
                    self.operation_timeout.as_millis()
                )))
            }
        }
    }

    async fn begin_tx(&self) -> Result<PgTx, StorageError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))
    }

    async fn load_payment(&self, row: Option<PgRow>) -> Result<Option<PaymentState>, StorageError> {
        let Some(row) = row else {
            return Ok(None);
        };
        let row = PaymentRow::from_row(&row).map_err(|e| map_sqlx_error("decode_payment", e))?;
        let id = row.id;
        let mut adjustments = load_adjustments(&self.pool, &PAYMENT_TABLES, &[id]).await?;
        let (_, state) = row.into_state(adjustments.remove(&id).unwrap_or_default())?;
        Ok(Some(state))
    }
}

async fn commit_tx(tx: PgTx) -> Result<(), StorageError> {
    tx.commit()
        .await
        .map_err(|e| map_sqlx_error("commit_transaction", e))
}

async fn write_payments(
    tx: &mut PgTx,
    batch: &[Payment],
    now: DateTime<Utc>,
) -> Result<Vec<OutboxEvent>, StorageError> {
    let mut events = Vec::new();

    for payment in batch {
        sqlx::query(
            r#"
            INSERT INTO payments (
                id,
                connector_id,
                reference,
                created_at,
                type,
                initial_amount,
                amount,
                asset,
                scheme,
                source_account_id,
                destination_account_id,
                metadata
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(payment.id.as_uuid())
        .bind(payment.connector_id.as_uuid())
        .bind(&payment.reference)
        .bind(payment.created_at)
        .bind(payment.payment_type.code())
        .bind(payment.initial_amount)
        .bind(payment.amount)
        .bind(&payment.asset)
        .bind(payment.scheme.code())
        .bind(payment.source_account_id.map(|id| *id.as_uuid()))
        .bind(payment.destination_account_id.map(|id| *id.as_uuid()))
        .bind(Json(&payment.metadata))
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("insert_payment", e))?;

        let recorded = record_adjustments(tx, &PAYMENT_TABLES, payment).await?;
        apply_effect(tx, &PAYMENT_TABLES, payment.entity_uuid(), &BatchEffect::fold(recorded.iter().copied())).await?;
        events.extend(recorded.iter().map(|a| payloads::payment_saved(payment, a, now)));
    }

    Ok(events)
}

async fn write_orders(
    tx: &mut PgTx,
    batch: &[Order],
    now: DateTime<Utc>,
) -> Result<Vec<OutboxEvent>, StorageError> {
    let mut events = Vec::new();

    for order in batch {
        sqlx::query(
            r#"
            INSERT INTO orders (
                id,
                connector_id,
                reference,
                created_at,
                direction,
                source_asset,
                target_asset,
                type,
                limit_price,
                initial_amount,
                amount,
                metadata
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (id) DO UPDATE SET metadata = orders.metadata || EXCLUDED.metadata
            "#,
        )
        .bind(order.id.as_uuid())
        .bind(order.connector_id.as_uuid())
        .bind(&order.reference)
        .bind(order.created_at)
        .bind(order.direction.code())
        .bind(&order.source_asset)
        .bind(&order.target_asset)
        .bind(order.order_type.code())
        .bind(order.limit_price)
        .bind(order.initial_amount)
        .bind(order.amount)
        .bind(Json(&order.metadata))
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("insert_order", e))?;

        let recorded = record_adjustments(tx, &ORDER_TABLES, order).await?;
        apply_effect(tx, &ORDER_TABLES, order.entity_uuid(), &BatchEffect::fold(recorded.iter().copied())).await?;
        events.extend(recorded.iter().map(|a| payloads::order_saved(order, a, now)));
    }

    Ok(events)
}

/// Insert-or-ignore the entity's adjustments; returns the ones this call recorded.
async fn record_adjustments<'a, E: AdjustedEntity>(
    tx: &mut PgTx,
    tables: &LedgerTables,
    entity: &'a E,
) -> Result<Vec<&'a Adjustment<E::Status>>, StorageError> {
    let sql = format!(
        r#"
        INSERT INTO {table} (
            id,
            {owner},
            reference,
            created_at,
            status,
            amount,
            asset,
            raw,
            metadata
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ON CONFLICT (id) DO NOTHING
        RETURNING id
        "#,
        table = tables.adjustments,
        owner = tables.owner,
    );

    let mut recorded = Vec::new();
    for adjustment in entity.adjustments() {
        let inserted = sqlx::query(&sql)
            .bind(adjustment.id.as_uuid())
            .bind(entity.entity_uuid())
            .bind(&adjustment.reference)
            .bind(adjustment.created_at)
            .bind(adjustment.status.code())
            .bind(adjustment.amount)
            .bind(adjustment.asset.as_deref())
            .bind(&adjustment.raw)
            .bind(Json(&adjustment.metadata))
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("insert_adjustment", e))?;
        if inserted.is_some() {
            recorded.push(adjustment);
        }
    }

    debug!(
        entity = tables.entity,
        entity_id = %entity.entity_uuid(),
        observed = entity.adjustments().len(),
        recorded = recorded.len(),
        "adjustments recorded"
    );
    Ok(recorded)
}

/// Apply a folded effect with relative statements.
async fn apply_effect(
    tx: &mut PgTx,
    tables: &LedgerTables,
    id: Uuid,
    effect: &BatchEffect,
) -> Result<(), StorageError> {
    if let Some(initial_amount) = effect.initial_amount {
        sqlx::query(&format!(
            "UPDATE {} SET initial_amount = $2 WHERE id = $1",
            tables.entity
        ))
        .bind(id)
        .bind(initial_amount)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("update_initial_amount", e))?;
    }

    if !effect.debit.is_zero() || !effect.credit.is_zero() {
        sqlx::query(&format!(
            "UPDATE {} SET amount = amount - $2 + $3 WHERE id = $1",
            tables.entity
        ))
        .bind(id)
        .bind(effect.debit)
        .bind(effect.credit)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("update_amount", e))?;
    }

    Ok(())
}

/// `retry_count` as stored in the `INTEGER` column.
fn retry_count_column(retry_count: u32) -> Result<i32, StorageError> {
    i32::try_from(retry_count)
        .map_err(|_| StorageError::validation(format!("retry count {retry_count} out of range")))
}

async fn stage_outbox(tx: &mut PgTx, events: &[OutboxEvent]) -> Result<(), StorageError> {
    for event in events {
        sqlx::query(
            r#"
            INSERT INTO outbox_events (
                id,
                idempotency_key,
                connector_id,
                event_type,
                entity_id,
                payload,
                created_at,
                status,
                retry_count,
                last_retry_at,
                error
            )
            SELECT $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11
            WHERE NOT EXISTS (SELECT 1 FROM events_sent WHERE id = $1)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(event.id.storage_key())
        .bind(&event.id.idempotency_key)
        .bind(event.connector_id.map(|id| *id.as_uuid()))
        .bind(&event.event_type)
        .bind(&event.entity_id)
        .bind(&event.payload)
        .bind(event.created_at)
        .bind(event.status.code())
        .bind(retry_count_column(event.retry_count)?)
        .bind(event.last_retry_at)
        .bind(event.error.as_deref())
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("insert_outbox_event", e))?;
    }
    Ok(())
}

/// Delete the entity rows matching `condition` on `$1`. Their adjustments
/// go with them through `ON DELETE CASCADE`.
async fn delete_entities(
    pool: &PgPool,
    tables: &LedgerTables,
    condition: &str,
    key: Uuid,
    operation: &'static str,
) -> Result<u64, StorageError> {
    let deleted = sqlx::query(&format!("DELETE FROM {} WHERE {condition}", tables.entity))
        .bind(key)
        .execute(pool)
        .await
        .map_err(|e| map_sqlx_error(operation, e))?
        .rows_affected();
    Span::current().record("deleted", deleted);
    Ok(deleted)
}

/// Adjustments of `ids`, newest first per owner.
async fn load_adjustments<S: AdjustmentStatus>(
    pool: &PgPool,
    tables: &LedgerTables,
    ids: &[Uuid],
) -> Result<HashMap<Uuid, Vec<Adjustment<S>>>, StorageError> {
    if ids.is_empty() {
        return Ok(HashMap::new());
    }

    let sql = format!(
        r#"
        SELECT
            id,
            {owner} AS owner_id,
            reference,
            created_at,
            status,
            amount,
            asset,
            raw,
            metadata
        FROM {table}
        WHERE {owner} = ANY($1)
        ORDER BY created_at DESC, sort_id DESC
        "#,
        table = tables.adjustments,
        owner = tables.owner,
    );

    let rows = sqlx::query(&sql)
        .bind(ids)
        .fetch_all(pool)
        .await
        .map_err(|e| map_sqlx_error("load_adjustments", e))?;

    let mut grouped: HashMap<Uuid, Vec<Adjustment<S>>> = HashMap::new();
    for row in rows {
        let row = AdjustmentRow::from_row(&row).map_err(|e| map_sqlx_error("decode_adjustment", e))?;
        grouped.entry(row.owner_id).or_default().push(row.into_adjustment()?);
    }
    Ok(grouped)
}

/// Append the keyset condition and ordering of a listing on `alias`.
fn push_keyset(builder: &mut QueryBuilder<'_, Postgres>, alias: &str, cursor: Option<&Cursor>) {
    let backward = matches!(cursor.map(|c| c.direction), Some(Direction::Previous));
    if let Some(cursor) = cursor {
        let op = if backward { ">" } else { "<" };
        builder.push(format!(" AND ({alias}.created_at, {alias}.sort_id) {op} ("));
        builder.push_bind(cursor.boundary.created_at);
        builder.push(", ");
        builder.push_bind(cursor.boundary.sort_id);
        builder.push(")");
    }
    let order = if backward { "ASC" } else { "DESC" };
    builder.push(format!(
        " ORDER BY {alias}.created_at {order}, {alias}.sort_id {order}"
    ));
}

/// Fetch one page worth of rows (`page_size + 1`) of a filtered listing.
async fn fetch_listing(
    pool: &PgPool,
    select: &str,
    alias: &str,
    schema: &QuerySchema,
    query: &ListQuery,
) -> Result<(Vec<PgRow>, Option<Cursor>, usize), StorageError> {
    if let Some(filter) = &query.filter {
        schema.validate(filter)?;
    }
    let (cursor, page_size) = query.resolve()?;

    let mut builder = QueryBuilder::<Postgres>::new(select);
    builder.push(" WHERE TRUE");
    if let Some(filter) = &query.filter {
        builder.push(" AND ");
        schema.push_sql(&mut builder, filter)?;
    }
    push_keyset(&mut builder, alias, cursor.as_ref());
    builder.push(" LIMIT ");
    builder.push_bind((page_size + 1) as i64);

    let rows = builder
        .build()
        .fetch_all(pool)
        .await
        .map_err(|e| map_sqlx_error("list", e))?;
    Ok((rows, cursor, page_size))
}

async fn write_balance(
    tx: &mut PgTx,
    observed: &Balance,
    now: DateTime<Utc>,
) -> Result<Option<OutboxEvent>, StorageError> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
        .bind(format!("balance:{}:{}", observed.account_id, observed.asset))
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("lock_balance", e))?;

    let latest = sqlx::query(&format!(
        "{BALANCE_SELECT} WHERE b.account_id = $1 AND b.asset = $2 ORDER BY b.created_at DESC LIMIT 1"
    ))
    .bind(observed.account_id.as_uuid())
    .bind(&observed.asset)
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("load_latest_balance", e))?
    .map(|row| BalanceRow::from_row(&row))
    .transpose()
    .map_err(|e| map_sqlx_error("decode_balance", e))?
    .map(Balance::from);

    let decision = VersionDecision::decide(latest.as_ref(), observed);
    debug!(
        account_id = %observed.account_id,
        asset = %observed.asset,
        ?decision,
        "balance observation"
    );

    match (&decision, &latest) {
        (VersionDecision::Insert, _) => insert_balance(tx, observed).await?,
        (VersionDecision::Discard, _) => {}
        (VersionDecision::Extend { last_updated_at }, Some(latest)) => {
            set_balance_window_end(tx, latest, *last_updated_at).await?;
        }
        (VersionDecision::Supersede { close_at }, Some(latest)) => {
            set_balance_window_end(tx, latest, *close_at).await?;
            insert_balance(tx, observed).await?;
        }
        (VersionDecision::Correct, Some(latest)) => {
            sqlx::query(
                r#"
                UPDATE balances SET balance = $4
                WHERE account_id = $1 AND asset = $2 AND created_at = $3
                "#,
            )
            .bind(latest.account_id.as_uuid())
            .bind(&latest.asset)
            .bind(latest.created_at)
            .bind(observed.balance)
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("correct_balance", e))?;
        }
        (_, None) => {
            return Err(StorageError::Internal(format!(
                "balance decision {decision:?} without a latest version"
            )));
        }
    }

    Ok(decision
        .is_announced()
        .then(|| payloads::balance_saved(observed, now)))
}

async fn insert_balance(tx: &mut PgTx, balance: &Balance) -> Result<(), StorageError> {
    sqlx::query(
        r#"
        INSERT INTO balances (
            account_id,
            asset,
            created_at,
            connector_id,
            balance,
            last_updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(balance.account_id.as_uuid())
    .bind(&balance.asset)
    .bind(balance.created_at)
    .bind(balance.connector_id.as_uuid())
    .bind(balance.balance)
    .bind(balance.last_updated_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("insert_balance", e))?;
    Ok(())
}

async fn set_balance_window_end(
    tx: &mut PgTx,
    version: &Balance,
    last_updated_at: DateTime<Utc>,
) -> Result<(), StorageError> {
    sqlx::query(
        r#"
        UPDATE balances SET last_updated_at = $4
        WHERE account_id = $1 AND asset = $2 AND created_at = $3
        "#,
    )
    .bind(version.account_id.as_uuid())
    .bind(&version.asset)
    .bind(version.created_at)
    .bind(last_updated_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("update_balance_window", e))?;
    Ok(())
}

#[async_trait]
impl UnitOfWork for PostgresStore {
    type Tx = PgTx;

    async fn begin(&self) -> Result<PgTx, StorageError> {
        self.begin_tx().await
    }

    async fn commit(&self, tx: PgTx) -> Result<(), StorageError> {
        commit_tx(tx).await
    }
}

#[async_trait]
impl ReferenceRegistry for PostgresStore {
    #[instrument(skip(self, connector), fields(connector_id = %connector.id), err)]
    async fn register_connector(&self, connector: &Connector) -> Result<(), StorageError> {
        self.bounded("register_connector", async {
            sqlx::query(
                r#"
                INSERT INTO connectors (id, name, provider, created_at)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (id) DO NOTHING
                "#,
            )
            .bind(connector.id.as_uuid())
            .bind(&connector.name)
            .bind(&connector.provider)
            .bind(connector.created_at)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("register_connector", e))?;
            Ok(())
        })
        .await
    }

    #[instrument(skip(self, accounts), fields(batch_size = accounts.len()), err)]
    async fn register_accounts(&self, accounts: &[Account]) -> Result<(), StorageError> {
        self.bounded("register_accounts", async {
            let mut tx = self.begin_tx().await?;
            for account in accounts {
                sqlx::query(
                    r#"
                    INSERT INTO accounts (id, connector_id, reference, created_at, name, default_asset)
                    VALUES ($1, $2, $3, $4, $5, $6)
                    ON CONFLICT (id) DO NOTHING
                    "#,
                )
                .bind(account.id.as_uuid())
                .bind(account.connector_id.as_uuid())
                .bind(&account.reference)
                .bind(account.created_at)
                .bind(account.name.as_deref())
                .bind(account.default_asset.as_deref())
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("register_account", e))?;
            }
            commit_tx(tx).await
        })
        .await
    }
}

#[async_trait]
impl AdjustmentLedger for PostgresStore {
    #[instrument(skip(self, batch), fields(batch_size = batch.len(), events = tracing::field::Empty), err)]
    async fn upsert_payments(&self, batch: &[Payment]) -> Result<(), StorageError> {
        for payment in batch {
            payment.validate()?;
        }
        let now = Utc::now();

        self.bounded("upsert_payments", async {
            let mut tx = self.begin_tx().await?;
            let events = write_payments(&mut tx, batch, now).await?;
            stage_outbox(&mut tx, &events).await?;
            commit_tx(tx).await?;
            Span::current().record("events", events.len());
            Ok(())
        })
        .await
    }

    #[instrument(skip(self, batch), fields(batch_size = batch.len(), events = tracing::field::Empty), err)]
    async fn upsert_orders(&self, batch: &[Order]) -> Result<(), StorageError> {
        for order in batch {
            order.validate()?;
        }
        let now = Utc::now();

        self.bounded("upsert_orders", async {
            let mut tx = self.begin_tx().await?;
            let events = write_orders(&mut tx, batch, now).await?;
            stage_outbox(&mut tx, &events).await?;
            commit_tx(tx).await?;
            Span::current().record("events", events.len());
            Ok(())
        })
        .await
    }

    #[instrument(skip(self), fields(payment_id = %id), err)]
    async fn get_payment(&self, id: PaymentId) -> Result<PaymentState, StorageError> {
        self.bounded("get_payment", async {
            let row = sqlx::query(&format!("{PAYMENT_SELECT} WHERE p.id = $1"))
                .bind(id.as_uuid())
                .fetch_optional(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("get_payment", e))?;
            self.load_payment(row)
                .await?
                .ok_or_else(|| StorageError::not_found(format!("payment {id}")))
        })
        .await
    }

    #[instrument(skip(self), fields(connector_id = %connector_id), err)]
    async fn get_payment_by_reference(
        &self,
        reference: &str,
        connector_id: ConnectorId,
    ) -> Result<PaymentState, StorageError> {
        self.bounded("get_payment_by_reference", async {
            let row = sqlx::query(&format!(
                "{PAYMENT_SELECT} WHERE p.reference = $1 AND p.connector_id = $2 ORDER BY p.sort_id DESC LIMIT 1"
            ))
            .bind(reference)
            .bind(connector_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_payment_by_reference", e))?;
            self.load_payment(row)
                .await?
                .ok_or_else(|| StorageError::not_found(format!("payment with reference {reference}")))
        })
        .await
    }

    #[instrument(skip(self), fields(order_id = %id), err)]
    async fn get_order(&self, id: OrderId) -> Result<OrderState, StorageError> {
        self.bounded("get_order", async {
            let row = sqlx::query(&format!("{ORDER_SELECT} WHERE o.id = $1"))
                .bind(id.as_uuid())
                .fetch_optional(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("get_order", e))?
                .ok_or_else(|| StorageError::not_found(format!("order {id}")))?;
            let row = OrderRow::from_row(&row).map_err(|e| map_sqlx_error("decode_order", e))?;
            let order_id = row.id;
            let mut adjustments = load_adjustments(&self.pool, &ORDER_TABLES, &[order_id]).await?;
            let (_, state) = row.into_state(adjustments.remove(&order_id).unwrap_or_default())?;
            Ok(state)
        })
        .await
    }

    #[instrument(skip(self, metadata), fields(payment_id = %id), err)]
    async fn update_payment_metadata(
        &self,
        id: PaymentId,
        metadata: BTreeMap<String, String>,
    ) -> Result<(), StorageError> {
        self.bounded("update_payment_metadata", async {
            let result = sqlx::query("UPDATE payments SET metadata = metadata || $2 WHERE id = $1")
                .bind(id.as_uuid())
                .bind(Json(&metadata))
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("update_payment_metadata", e))?;
            if result.rows_affected() == 0 {
                return Err(StorageError::not_found(format!("payment {id}")));
            }
            Ok(())
        })
        .await
    }

    #[instrument(skip(self), fields(connector_id = %connector_id, deleted = tracing::field::Empty), err)]
    async fn delete_payment_by_reference(
        &self,
        reference: &str,
        connector_id: ConnectorId,
    ) -> Result<(), StorageError> {
        let now = Utc::now();
        self.bounded("delete_payment_by_reference", async {
            let mut tx = self.begin_tx().await?;
            let rows = sqlx::query(
                r#"
                DELETE FROM payments p
                WHERE p.reference = $1 AND p.connector_id = $2
                RETURNING
                    p.id,
                    p.sort_id,
                    p.connector_id,
                    p.reference,
                    p.created_at,
                    p.type,
                    p.initial_amount,
                    p.amount,
                    p.asset,
                    p.scheme,
                    p.source_account_id,
                    p.destination_account_id,
                    p.metadata,
                    'PENDING' AS status
                "#,
            )
            .bind(reference)
            .bind(connector_id.as_uuid())
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("delete_payment", e))?;

            let mut events = Vec::with_capacity(rows.len());
            for row in rows {
                let row = PaymentRow::from_row(&row).map_err(|e| map_sqlx_error("decode_payment", e))?;
                let (_, state) = row.into_state(Vec::new())?;
                events.push(payloads::payment_deleted(&state.entity, now));
            }
            stage_outbox(&mut tx, &events).await?;
            commit_tx(tx).await?;
            Span::current().record("deleted", events.len());
            Ok(())
        })
        .await
    }

    #[instrument(skip(self), fields(payment_id = %id, deleted = tracing::field::Empty), err)]
    async fn delete_payment(&self, id: PaymentId) -> Result<u64, StorageError> {
        self.bounded(
            "delete_payment",
            delete_entities(&self.pool, &PAYMENT_TABLES, "id = $1", *id.as_uuid(), "delete_payment"),
        )
        .await
    }

    #[instrument(skip(self), fields(connector_id = %connector_id, deleted = tracing::field::Empty), err)]
    async fn delete_payments_by_connector(
        &self,
        connector_id: ConnectorId,
    ) -> Result<u64, StorageError> {
        self.bounded(
            "delete_payments_by_connector",
            delete_entities(
                &self.pool,
                &PAYMENT_TABLES,
                "connector_id = $1",
                *connector_id.as_uuid(),
                "delete_payments_by_connector",
            ),
        )
        .await
    }

    #[instrument(skip(self), fields(account_id = %account_id, deleted = tracing::field::Empty), err)]
    async fn delete_payments_by_account(&self, account_id: AccountId) -> Result<u64, StorageError> {
        self.bounded(
            "delete_payments_by_account",
            delete_entities(
                &self.pool,
                &PAYMENT_TABLES,
                "source_account_id = $1 OR destination_account_id = $1",
                *account_id.as_uuid(),
                "delete_payments_by_account",
            ),
        )
        .await
    }

    #[instrument(skip(self), fields(order_id = %id, deleted = tracing::field::Empty), err)]
    async fn delete_order(&self, id: OrderId) -> Result<u64, StorageError> {
        self.bounded(
            "delete_order",
            delete_entities(&self.pool, &ORDER_TABLES, "id = $1", *id.as_uuid(), "delete_order"),
        )
        .await
    }

    #[instrument(skip(self), fields(connector_id = %connector_id, deleted = tracing::field::Empty), err)]
    async fn delete_orders_by_connector(
        &self,
        connector_id: ConnectorId,
    ) -> Result<u64, StorageError> {
        self.bounded(
            "delete_orders_by_connector",
            delete_entities(
                &self.pool,
                &ORDER_TABLES,
                "connector_id = $1",
                *connector_id.as_uuid(),
                "delete_orders_by_connector",
            ),
        )
        .await
    }

    #[instrument(skip(self), fields(order_id = %id, status = %status), err)]
    async fn update_order_status(
        &self,
        id: OrderId,
        status: OrderStatus,
    ) -> Result<(), StorageError> {
        let now = Utc::now();
        self.bounded("update_order_status", async {
            let mut tx = self.begin_tx().await?;
            let row = sqlx::query(&format!("{ORDER_SELECT} WHERE o.id = $1 FOR UPDATE OF o"))
                .bind(id.as_uuid())
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("lock_order", e))?
                .ok_or_else(|| StorageError::not_found(format!("order {id}")))?;
            let row = OrderRow::from_row(&row).map_err(|e| map_sqlx_error("decode_order", e))?;
            let (_, state) = row.into_state(Vec::new())?;

            let mut order = state.entity;
            order.adjustments = vec![order.status_update(status, now)];
            let events = write_orders(&mut tx, &[order], now).await?;
            stage_outbox(&mut tx, &events).await?;
            commit_tx(tx).await
        })
        .await
    }

    #[instrument(skip(self, query), fields(page_size = query.page_size), err)]
    async fn list_payments(&self, query: &ListQuery) -> Result<Page<PaymentState>, StorageError> {
        self.bounded("list_payments", async {
            let (rows, cursor, page_size) =
                fetch_listing(&self.pool, PAYMENT_SELECT, "p", &PAYMENT_SCHEMA, query).await?;
            let rows = rows
                .iter()
                .map(PaymentRow::from_row)
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| map_sqlx_error("decode_payment", e))?;

            let ids: Vec<Uuid> = rows.iter().map(|r| r.id).collect();
            let mut adjustments = load_adjustments(&self.pool, &PAYMENT_TABLES, &ids).await?;
            let items = rows
                .into_iter()
                .map(|row| {
                    let owned = adjustments.remove(&row.id).unwrap_or_default();
                    row.into_state(owned)
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(build_page(items, cursor.as_ref(), page_size))
        })
        .await
    }

    #[instrument(skip(self, query), fields(page_size = query.page_size), err)]
    async fn list_orders(&self, query: &ListQuery) -> Result<Page<OrderState>, StorageError> {
        self.bounded("list_orders", async {
            let (rows, cursor, page_size) =
                fetch_listing(&self.pool, ORDER_SELECT, "o", &ORDER_SCHEMA, query).await?;
            let rows = rows
                .iter()
                .map(OrderRow::from_row)
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| map_sqlx_error("decode_order", e))?;

            let ids: Vec<Uuid> = rows.iter().map(|r| r.id).collect();
            let mut adjustments = load_adjustments(&self.pool, &ORDER_TABLES, &ids).await?;
            let items = rows
                .into_iter()
                .map(|row| {
                    let owned = adjustments.remove(&row.id).unwrap_or_default();
                    row.into_state(owned)
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(build_page(items, cursor.as_ref(), page_size))
        })
        .await
    }
}

#[async_trait]
impl BalanceVersionStore for PostgresStore {
    #[instrument(skip(self, batch), fields(batch_size = batch.len(), events = tracing::field::Empty), err)]
    async fn upsert_balances(&self, batch: &[Balance]) -> Result<(), StorageError> {
        for balance in batch {
            balance.validate()?;
        }
        let now = Utc::now();

        self.bounded("upsert_balances", async {
            let mut tx = self.begin_tx().await?;
            let mut events = Vec::new();
            for observed in batch {
                events.extend(write_balance(&mut tx, observed, now).await?);
            }
            stage_outbox(&mut tx, &events).await?;
            commit_tx(tx).await?;
            Span::current().record("events", events.len());
            Ok(())
        })
        .await
    }

    #[instrument(skip(self), fields(account_id = %account_id), err)]
    async fn balance_at(
        &self,
        account_id: AccountId,
        asset: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<Balance>, StorageError> {
        self.bounded("balance_at", async {
            let row = sqlx::query(&format!(
                "{BALANCE_SELECT} WHERE b.account_id = $1 AND b.asset = $2 AND b.created_at <= $3 ORDER BY b.created_at DESC LIMIT 1"
            ))
            .bind(account_id.as_uuid())
            .bind(asset)
            .bind(at)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("balance_at", e))?;

            row.map(|row| BalanceRow::from_row(&row))
                .transpose()
                .map_err(|e| map_sqlx_error("decode_balance", e))
                .map(|row| row.and_then(|row| row.valid_at(at)))
        })
        .await
    }

    #[instrument(skip(self), fields(account_id = %account_id), err)]
    async fn balances_at(
        &self,
        account_id: AccountId,
        at: DateTime<Utc>,
    ) -> Result<Vec<Balance>, StorageError> {
        self.bounded("balances_at", async {
            let rows = sqlx::query(&format!(
                r#"
                SELECT DISTINCT ON (v.asset) v.*
                FROM ({BALANCE_SELECT} WHERE b.account_id = $1 AND b.created_at <= $2) v
                ORDER BY v.asset, v.created_at DESC
                "#
            ))
            .bind(account_id.as_uuid())
            .bind(at)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("balances_at", e))?;

            let rows = rows
                .iter()
                .map(BalanceRow::from_row)
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| map_sqlx_error("decode_balance", e))?;
            Ok(rows.into_iter().filter_map(|row| row.valid_at(at)).collect())
        })
        .await
    }

    #[instrument(skip(self), fields(account_id = %account_id), err)]
    async fn latest_balances(&self, account_id: AccountId) -> Result<Vec<Balance>, StorageError> {
        self.bounded("latest_balances", async {
            let rows = sqlx::query(&format!(
                r#"
                SELECT DISTINCT ON (v.asset) v.*
                FROM ({BALANCE_SELECT} WHERE b.account_id = $1) v
                ORDER BY v.asset, v.created_at DESC
                "#
            ))
            .bind(account_id.as_uuid())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("latest_balances", e))?;

            rows.iter()
                .map(|row| BalanceRow::from_row(row).map(Balance::from))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| map_sqlx_error("decode_balance", e))
        })
        .await
    }

    #[instrument(skip(self, query), err)]
    async fn list_balances(&self, query: &BalanceQuery) -> Result<Page<Balance>, StorageError> {
        self.bounded("list_balances", async {
            let (cursor, page_size) = query.page.resolve()?;

            let mut builder = QueryBuilder::<Postgres>::new(BALANCE_SELECT);
            builder.push(" WHERE TRUE");
            if let Some(account_id) = query.account_id {
                builder.push(" AND b.account_id = ").push_bind(*account_id.as_uuid());
            }
            if let Some(asset) = &query.asset {
                builder.push(" AND b.asset = ").push_bind(asset.clone());
            }
            if let Some(from) = query.from {
                builder.push(" AND b.last_updated_at >= ").push_bind(from);
            }
            if let Some(to) = query.to {
                builder.push(" AND b.created_at <= ").push_bind(to);
            }
            push_keyset(&mut builder, "b", cursor.as_ref());
            builder.push(" LIMIT ").push_bind((page_size + 1) as i64);

            let rows = builder
                .build()
                .fetch_all(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("list_balances", e))?;
            let items = rows
                .iter()
                .map(|row| {
                    BalanceRow::from_row(row).map(|row| {
                        let key = SortKey {
                            created_at: row.created_at,
                            sort_id: row.sort_id,
                        };
                        (key, Balance::from(row))
                    })
                })
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| map_sqlx_error("decode_balance", e))?;
            Ok(build_page(items, cursor.as_ref(), page_size))
        })
        .await
    }

    #[instrument(skip(self), fields(connector_id = %connector_id, deleted = tracing::field::Empty), err)]
    async fn delete_balances_by_connector(
        &self,
        connector_id: ConnectorId,
    ) -> Result<u64, StorageError> {
        self.bounded("delete_balances_by_connector", async {
            let deleted = sqlx::query("DELETE FROM balances WHERE connector_id = $1")
                .bind(connector_id.as_uuid())
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("delete_balances_by_connector", e))?
                .rows_affected();
            Span::current().record("deleted", deleted);
            Ok(deleted)
        })
        .await
    }
}

#[async_trait]
impl OutboxDispatcher for PostgresStore {
    #[instrument(skip(self, tx, events), fields(count = events.len()), err)]
    async fn insert(&self, tx: &mut PgTx, events: &[OutboxEvent]) -> Result<(), StorageError> {
        stage_outbox(tx, events).await
    }

    #[instrument(skip(self, events), fields(count = events.len()), err)]
    async fn insert_standalone(&self, events: &[OutboxEvent]) -> Result<(), StorageError> {
        self.bounded("insert_outbox_events", async {
            let mut tx = self.begin_tx().await?;
            stage_outbox(&mut tx, events).await?;
            commit_tx(tx).await
        })
        .await
    }

    #[instrument(skip(self), fields(polled = tracing::field::Empty), err)]
    async fn poll_pending(&self, limit: usize) -> Result<Vec<OutboxEvent>, StorageError> {
        self.bounded("poll_pending", async {
            let rows = sqlx::query(&format!(
                r#"
                SELECT {OUTBOX_COLUMNS}
                FROM outbox_events
                WHERE status = 'PENDING'
                ORDER BY created_at ASC, sort_id ASC
                LIMIT $1
                "#
            ))
            .bind(limit as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("poll_pending", e))?;

            let events = decode_outbox_rows(&rows)?;
            Span::current().record("polled", events.len());
            Ok(events)
        })
        .await
    }

    #[instrument(skip(self, error), fields(event_id = %id), err)]
    async fn mark_failed(
        &self,
        id: &EventId,
        retry_count: u32,
        error: &str,
    ) -> Result<(), StorageError> {
        let status = OutboxStatus::after_failure(retry_count, self.max_retries);
        let stored_retry_count = retry_count_column(retry_count)?;
        let now = Utc::now();

        self.bounded("mark_failed", async {
            let result = sqlx::query(
                r#"
                UPDATE outbox_events
                SET retry_count = $2, error = $3, last_retry_at = $4, status = $5
                WHERE id = $1 AND status = 'PENDING'
                "#,
            )
            .bind(id.storage_key())
            .bind(stored_retry_count)
            .bind(error)
            .bind(paystate_core::time::normalize(now))
            .bind(status.code())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("mark_failed", e))?;
            if result.rows_affected() == 0 {
                return Err(StorageError::not_found(format!("pending outbox event {id}")));
            }
            Ok(())
        })
        .await
    }

    #[instrument(skip(self, sent), fields(event_id = %id), err)]
    async fn delete_and_record_sent(
        &self,
        id: &EventId,
        sent: EventSent,
    ) -> Result<(), StorageError> {
        self.bounded("delete_and_record_sent", async {
            let mut tx = self.begin_tx().await?;
            let deleted = sqlx::query("DELETE FROM outbox_events WHERE id = $1")
                .bind(id.storage_key())
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("delete_outbox_event", e))?
                .rows_affected();
            if deleted == 0 {
                // A redelivered event is already recorded; anything else is unknown.
                let row = sqlx::query("SELECT EXISTS (SELECT 1 FROM events_sent WHERE id = $1) AS sent")
                    .bind(id.storage_key())
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(|e| map_sqlx_error("events_sent_exists", e))?;
                let already_sent: bool = row
                    .try_get("sent")
                    .map_err(|e| map_sqlx_error("events_sent_exists", e))?;
                if !already_sent {
                    return Err(StorageError::not_found(format!("outbox event {id}")));
                }
            }
            sqlx::query(
                r#"
                INSERT INTO events_sent (id, idempotency_key, connector_id, sent_at)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (id) DO NOTHING
                "#,
            )
            .bind(id.storage_key())
            .bind(&sent.id.idempotency_key)
            .bind(sent.connector_id.map(|c| *c.as_uuid()))
            .bind(sent.sent_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert_event_sent", e))?;
            commit_tx(tx).await
        })
        .await
    }

    #[instrument(skip(self), fields(event_id = %id), err)]
    async fn outbox_event(&self, id: &EventId) -> Result<Option<OutboxEvent>, StorageError> {
        self.bounded("outbox_event", async {
            let row = sqlx::query(&format!("SELECT {OUTBOX_COLUMNS} FROM outbox_events WHERE id = $1"))
                .bind(id.storage_key())
                .fetch_optional(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("outbox_event", e))?;
            Ok(decode_outbox_rows(row.as_slice())?.pop())
        })
        .await
    }

    #[instrument(skip(self), fields(event_id = %id), err)]
    async fn events_sent_exists(&self, id: &EventId) -> Result<bool, StorageError> {
        self.bounded("events_sent_exists", async {
            let row = sqlx::query("SELECT EXISTS (SELECT 1 FROM events_sent WHERE id = $1) AS sent")
                .bind(id.storage_key())
                .fetch_one(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("events_sent_exists", e))?;
            row.try_get("sent").map_err(|e| map_sqlx_error("events_sent_exists", e))
        })
        .await
    }

    #[instrument(skip(self), fields(event_id = %id), err)]
    async fn event_sent(&self, id: &EventId) -> Result<Option<EventSent>, StorageError> {
        self.bounded("event_sent", async {
            let row = sqlx::query(
                "SELECT idempotency_key, connector_id, sent_at FROM events_sent WHERE id = $1",
            )
            .bind(id.storage_key())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("event_sent", e))?;

            row.map(|row| EventSentRow::from_row(&row).map(EventSent::from))
                .transpose()
                .map_err(|e| map_sqlx_error("decode_event_sent", e))
        })
        .await
    }

    #[instrument(skip(self), err)]
    async fn list_failed(&self, limit: usize) -> Result<Vec<OutboxEvent>, StorageError> {
        self.bounded("list_failed", async {
            let rows = sqlx::query(&format!(
                r#"
                SELECT {OUTBOX_COLUMNS}
                FROM outbox_events
                WHERE status = 'FAILED'
                ORDER BY created_at ASC, sort_id ASC
                LIMIT $1
                "#
            ))
            .bind(limit as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_failed", e))?;
            decode_outbox_rows(&rows)
        })
        .await
    }

    #[instrument(skip(self), fields(event_id = %id), err)]
    async fn requeue_failed(&self, id: &EventId) -> Result<(), StorageError> {
        self.bounded("requeue_failed", async {
            let result = sqlx::query(
                r#"
                UPDATE outbox_events
                SET status = 'PENDING', retry_count = 0
                WHERE id = $1 AND status = 'FAILED'
                "#,
            )
            .bind(id.storage_key())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("requeue_failed", e))?;
            if result.rows_affected() == 0 {
                return Err(StorageError::not_found(format!("failed outbox event {id}")));
            }
            Ok(())
        })
        .await
    }

    fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

fn decode_outbox_rows(rows: &[PgRow]) -> Result<Vec<OutboxEvent>, StorageError> {
    rows.iter()
        .map(|row| {
            OutboxRow::from_row(row)
                .map_err(|e| map_sqlx_error("decode_outbox_event", e))
                .and_then(OutboxEvent::try_from)
        })
        .collect()
}

// Internal row types

#[derive(Debug)]
struct PaymentRow {
    id: Uuid,
    sort_id: i64,
    connector_id: Uuid,
    reference: String,
    created_at: DateTime<Utc>,
    payment_type: String,
    initial_amount: Decimal,
    amount: Decimal,
    asset: String,
    scheme: String,
    source_account_id: Option<Uuid>,
    destination_account_id: Option<Uuid>,
    metadata: Json<BTreeMap<String, String>>,
    status: String,
}

impl<'r> FromRow<'r, PgRow> for PaymentRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(PaymentRow {
            id: row.try_get("id")?,
            sort_id: row.try_get("sort_id")?,
            connector_id: row.try_get("connector_id")?,
            reference: row.try_get("reference")?,
            created_at: row.try_get("created_at")?,
            payment_type: row.try_get("type")?,
            initial_amount: row.try_get("initial_amount")?,
            amount: row.try_get("amount")?,
            asset: row.try_get("asset")?,
            scheme: row.try_get("scheme")?,
            source_account_id: row.try_get("source_account_id")?,
            destination_account_id: row.try_get("destination_account_id")?,
            metadata: row.try_get("metadata")?,
            status: row.try_get("status")?,
        })
    }
}

impl PaymentRow {
    fn into_state(
        self,
        adjustments: Vec<Adjustment<PaymentStatus>>,
    ) -> Result<(SortKey, PaymentState), StorageError> {
        let key = SortKey {
            created_at: self.created_at,
            sort_id: self.sort_id,
        };
        let payment = Payment {
            id: PaymentId::from_uuid(self.id),
            connector_id: ConnectorId::from_uuid(self.connector_id),
            reference: self.reference,
            created_at: self.created_at,
            payment_type: PaymentType::from_code(&self.payment_type)?,
            initial_amount: self.initial_amount,
            amount: self.amount,
            asset: self.asset,
            scheme: PaymentScheme::from_code(&self.scheme)?,
            source_account_id: self.source_account_id.map(AccountId::from_uuid),
            destination_account_id: self.destination_account_id.map(AccountId::from_uuid),
            metadata: self.metadata.0,
            adjustments,
        };
        let status = <PaymentStatus as AdjustmentStatus>::from_code(&self.status)?;
        Ok((key, EntityState { entity: payment, status }))
    }
}

#[derive(Debug)]
struct OrderRow {
    id: Uuid,
    sort_id: i64,
    connector_id: Uuid,
    reference: String,
    created_at: DateTime<Utc>,
    direction: String,
    source_asset: String,
    target_asset: String,
    order_type: String,
    limit_price: Option<Decimal>,
    initial_amount: Decimal,
    amount: Decimal,
    metadata: Json<BTreeMap<String, String>>,
    status: String,
}

impl<'r> FromRow<'r, PgRow> for OrderRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(OrderRow {
            id: row.try_get("id")?,
            sort_id: row.try_get("sort_id")?,
            connector_id: row.try_get("connector_id")?,
            reference: row.try_get("reference")?,
            created_at: row.try_get("created_at")?,
            direction: row.try_get("direction")?,
            source_asset: row.try_get("source_asset")?,
            target_asset: row.try_get("target_asset")?,
            order_type: row.try_get("type")?,
            limit_price: row.try_get("limit_price")?,
            initial_amount: row.try_get("initial_amount")?,
            amount: row.try_get("amount")?,
            metadata: row.try_get("metadata")?,
            status: row.try_get("status")?,
        })
    }
}

impl OrderRow {
    fn into_state(
        self,
        adjustments: Vec<Adjustment<OrderStatus>>,
    ) -> Result<(SortKey, OrderState), StorageError> {
        let key = SortKey {
            created_at: self.created_at,
            sort_id: self.sort_id,
        };
        let order = Order {
            id: OrderId::from_uuid(self.id),
            connector_id: ConnectorId::from_uuid(self.connector_id),
            reference: self.reference,
            created_at: self.created_at,
            direction: OrderDirection::from_code(&self.direction)?,
            source_asset: self.source_asset,
            target_asset: self.target_asset,
            order_type: OrderType::from_code(&self.order_type)?,
            limit_price: self.limit_price,
            initial_amount: self.initial_amount,
            amount: self.amount,
            metadata: self.metadata.0,
            adjustments,
        };
        let status = <OrderStatus as AdjustmentStatus>::from_code(&self.status)?;
        Ok((key, EntityState { entity: order, status }))
    }
}

#[derive(Debug)]
struct AdjustmentRow {
    id: Uuid,
    owner_id: Uuid,
    reference: String,
    created_at: DateTime<Utc>,
    status: String,
    amount: Option<Decimal>,
    asset: Option<String>,
    raw: serde_json::Value,
    metadata: Json<BTreeMap<String, String>>,
}

impl<'r> FromRow<'r, PgRow> for AdjustmentRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(AdjustmentRow {
            id: row.try_get("id")?,
            owner_id: row.try_get("owner_id")?,
            reference: row.try_get("reference")?,
            created_at: row.try_get("created_at")?,
            status: row.try_get("status")?,
            amount: row.try_get("amount")?,
            asset: row.try_get("asset")?,
            raw: row.try_get("raw")?,
            metadata: row.try_get("metadata")?,
        })
    }
}

impl AdjustmentRow {
    fn into_adjustment<S: AdjustmentStatus>(self) -> Result<Adjustment<S>, StorageError> {
        Ok(Adjustment {
            id: AdjustmentId::from_uuid(self.id),
            reference: self.reference,
            created_at: self.created_at,
            status: S::from_code(&self.status)?,
            amount: self.amount,
            asset: self.asset,
            raw: self.raw,
            metadata: self.metadata.0,
        })
    }
}

#[derive(Debug)]
struct BalanceRow {
    account_id: Uuid,
    asset: String,
    connector_id: Uuid,
    balance: Decimal,
    created_at: DateTime<Utc>,
    last_updated_at: DateTime<Utc>,
    sort_id: i64,
    is_head: bool,
}

impl<'r> FromRow<'r, PgRow> for BalanceRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(BalanceRow {
            account_id: row.try_get("account_id")?,
            asset: row.try_get("asset")?,
            connector_id: row.try_get("connector_id")?,
            balance: row.try_get("balance")?,
            created_at: row.try_get("created_at")?,
            last_updated_at: row.try_get("last_updated_at")?,
            sort_id: row.try_get("sort_id")?,
            is_head: row.try_get("is_head")?,
        })
    }
}

impl BalanceRow {
    /// The version if it is the one valid at `at`; the row must be the last
    /// version created at or before `at`.
    fn valid_at(self, at: DateTime<Utc>) -> Option<Balance> {
        let is_head = self.is_head;
        let balance = Balance::from(self);
        (is_head || balance.covers(at)).then_some(balance)
    }
}

impl From<BalanceRow> for Balance {
    fn from(row: BalanceRow) -> Self {
        Balance {
            account_id: AccountId::from_uuid(row.account_id),
            asset: row.asset,
            connector_id: ConnectorId::from_uuid(row.connector_id),
            balance: row.balance,
            created_at: row.created_at,
            last_updated_at: row.last_updated_at,
        }
    }
}

#[derive(Debug)]
struct OutboxRow {
    idempotency_key: String,
    connector_id: Option<Uuid>,
    event_type: String,
    entity_id: String,
    payload: serde_json::Value,
    created_at: DateTime<Utc>,
    status: String,
    retry_count: i32,
    last_retry_at: Option<DateTime<Utc>>,
    error: Option<String>,
}

impl<'r> FromRow<'r, PgRow> for OutboxRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(OutboxRow {
            idempotency_key: row.try_get("idempotency_key")?,
            connector_id: row.try_get("connector_id")?,
            event_type: row.try_get("event_type")?,
            entity_id: row.try_get("entity_id")?,
            payload: row.try_get("payload")?,
            created_at: row.try_get("created_at")?,
            status: row.try_get("status")?,
            retry_count: row.try_get("retry_count")?,
            last_retry_at: row.try_get("last_retry_at")?,
            error: row.try_get("error")?,
        })
    }
}

impl TryFrom<OutboxRow> for OutboxEvent {
    type Error = StorageError;

    fn try_from(row: OutboxRow) -> Result<Self, StorageError> {
        let status = OutboxStatus::from_code(&row.status)
            .ok_or_else(|| StorageError::Internal(format!("unknown outbox status {:?}", row.status)))?;
        let connector_id = row.connector_id.map(ConnectorId::from_uuid);
        Ok(OutboxEvent {
            id: EventId::new(row.idempotency_key, connector_id),
            event_type: row.event_type,
            entity_id: row.entity_id,
            payload: row.payload,
            created_at: row.created_at,
            status,
            connector_id,
            retry_count: u32::try_from(row.retry_count).map_err(|_| {
                StorageError::Internal(format!("negative retry count {}", row.retry_count))
            })?,
            last_retry_at: row.last_retry_at,
            error: row.error,
        })
    }
}

#[derive(Debug)]
struct EventSentRow {
    idempotency_key: String,
    connector_id: Option<Uuid>,
    sent_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for EventSentRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(EventSentRow {
            idempotency_key: row.try_get("idempotency_key")?,
            connector_id: row.try_get("connector_id")?,
            sent_at: row.try_get("sent_at")?,
        })
    }
}

impl From<EventSentRow> for EventSent {
    fn from(row: EventSentRow) -> Self {
        EventSent::new(
            EventId::new(row.idempotency_key, row.connector_id.map(ConnectorId::from_uuid)),
            row.sent_at,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Store whose pool never connects unless a query runs.
    fn lazy_store(operation_timeout: Duration) -> PostgresStore {
        let config = StoreConfig {
            operation_timeout,
            ..StoreConfig::new("postgres://paystate@localhost:5432/paystate")
        };
        let pool = PgPoolOptions::new()
            .connect_lazy(&config.database_url)
            .unwrap();
        PostgresStore::new(pool, &config)
    }

    /// Flips its flag when dropped, like a `Transaction` rolling back.
    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn elapsed_deadline_cancels_and_drops_the_operation() {
        let store = lazy_store(Duration::from_millis(20));
        let dropped = Arc::new(AtomicBool::new(false));
        let open_tx = DropFlag(dropped.clone());

        let err = store
            .bounded("upsert_payments", async move {
                let _open_tx = open_tx;
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::Cancelled(ref msg) if msg.contains("upsert_payments")), "{err:?}");
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn operation_within_deadline_returns_its_result() {
        let store = lazy_store(Duration::from_secs(5));
        let value = store.bounded("noop", async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn retry_count_column_rejects_overflow() {
        assert_eq!(retry_count_column(3).unwrap(), 3);
        assert!(matches!(
            retry_count_column(u32::MAX),
            Err(StorageError::Validation(_))
        ));
    }
}
