//! Behavioural scenarios every storage backend must pass.
//!
//! The in-memory backend runs them as unit tests; `tests/postgres.rs` runs
//! them against a live database. Each scenario registers its own connector,
//! so scenarios never observe each other's rows.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use uuid::Uuid;

use paystate_core::{
    Account, AccountId, AdjustmentStatus, Balance, Connector, ConnectorId, Order, OrderDirection,
    OrderId, OrderObservation, OrderStatus, OrderType, Payment, PaymentObservation, PaymentScheme,
    PaymentStatus, PaymentType,
};
use paystate_events::{EventId, EventSent, OutboxEvent, OutboxEventType, OutboxStatus, payloads};

use crate::query::{CompareOp, Filter, ListQuery};

use super::{
    AdjustmentLedger, BalanceQuery, BalanceVersionStore, OutboxDispatcher, ReferenceRegistry,
    StorageError,
};

/// Dead-letter threshold the backend under test must be configured with.
pub const MAX_RETRIES: u32 = 3;

/// Everything a full storage backend implements.
pub trait Backend:
    AdjustmentLedger + BalanceVersionStore + OutboxDispatcher + ReferenceRegistry
{
}

impl<T> Backend for T where
    T: AdjustmentLedger + BalanceVersionStore + OutboxDispatcher + ReferenceRegistry
{
}

pub async fn run_all<S: Backend>(store: &S) {
    payment_upsert_is_idempotent(store).await;
    first_observation_baseline_is_folded(store).await;
    refunds_fold_independently_of_batching(store).await;
    amount_adjustment_replaces_initial_amount(store).await;
    status_follows_latest_adjustment(store).await;
    unknown_references_abort_the_batch(store).await;
    delete_by_reference_stages_deleted_event(store).await;
    metadata_updates_merge(store).await;
    order_status_updates_append_adjustments(store).await;
    order_reobservation_merges_metadata(store).await;
    deletions_remove_adjustments_with_their_entity(store).await;
    balance_versions_follow_observations(store).await;
    same_instant_observation_corrects_value(store).await;
    balance_requires_known_account(store).await;
    outbox_lifecycle(store).await;
    failed_event_stays_failed_until_requeued(store).await;
    delivery_requires_a_known_event(store).await;
    outbox_polls_oldest_first(store).await;
    listing_pages_and_filters(store).await;
}

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

async fn test_connector<S: Backend>(store: &S) -> ConnectorId {
    let connector = Connector::new(ConnectorId::new(), "conformance", "dummypay", base_time());
    store.register_connector(&connector).await.unwrap();
    connector.id
}

async fn test_account<S: Backend>(store: &S, connector_id: ConnectorId, reference: &str) -> AccountId {
    let account = Account::new(connector_id, reference, base_time());
    store.register_accounts(&[account.clone()]).await.unwrap();
    account.id
}

fn test_payment(connector_id: ConnectorId, reference: &str, initial: Decimal) -> Payment {
    Payment::new(
        connector_id,
        PaymentType::PayIn,
        reference,
        base_time(),
        initial,
        "USD/2",
        PaymentScheme::CardVisa,
    )
}

fn saved_event_id(payment: &Payment, index: usize) -> EventId {
    EventId::new(
        payment.adjustments[index].id.to_string(),
        Some(payment.connector_id),
    )
}

pub async fn payment_upsert_is_idempotent<S: Backend>(store: &S) {
    let connector_id = test_connector(store).await;
    let payment = Payment::observed(PaymentObservation {
        connector_id,
        reference: "py_idem".to_string(),
        parent_reference: None,
        created_at: base_time(),
        payment_type: PaymentType::PayIn,
        amount: dec!(100),
        asset: "USD/2".to_string(),
        scheme: PaymentScheme::CardVisa,
        status: PaymentStatus::Succeeded,
        source_account_reference: None,
        destination_account_reference: None,
        metadata: BTreeMap::new(),
        raw: serde_json::json!({"id": "py_idem"}),
    });

    store.upsert_payments(&[payment.clone()]).await.unwrap();
    store.upsert_payments(&[payment.clone()]).await.unwrap();

    let state = store.get_payment(payment.id).await.unwrap();
    assert_eq!(state.entity.amount, dec!(100));
    assert_eq!(state.entity.initial_amount, dec!(100));
    assert_eq!(state.entity.adjustments.len(), 1);
    assert_eq!(state.status, PaymentStatus::Succeeded);
    assert_eq!(state.entity.adjustments[0].raw, serde_json::json!({"id": "py_idem"}));

    let event = store
        .outbox_event(&saved_event_id(&payment, 0))
        .await
        .unwrap()
        .expect("PAYMENT_SAVED staged");
    assert_eq!(event.known_type(), Some(OutboxEventType::PaymentSaved));
    assert_eq!(event.entity_id, payment.id.to_string());

    let by_reference = store
        .get_payment_by_reference("py_idem", connector_id)
        .await
        .unwrap();
    assert_eq!(by_reference.entity.id, payment.id);
}

fn observation(
    connector_id: ConnectorId,
    reference: &str,
    status: PaymentStatus,
    at: DateTime<Utc>,
) -> PaymentObservation {
    PaymentObservation {
        connector_id,
        reference: reference.to_string(),
        parent_reference: None,
        created_at: at,
        payment_type: PaymentType::PayIn,
        amount: dec!(100),
        asset: "USD/2".to_string(),
        scheme: PaymentScheme::CardVisa,
        status,
        source_account_reference: None,
        destination_account_reference: None,
        metadata: BTreeMap::new(),
        raw: serde_json::json!({"id": reference}),
    }
}

pub async fn first_observation_baseline_is_folded<S: Backend>(store: &S) {
    let connector_id = test_connector(store).await;
    let t = base_time();

    // amount = initial_amount - refunds + captures, with the first
    // adjustment folded on top of the baseline.
    let captured = Payment::observed(observation(connector_id, "py_captured", PaymentStatus::Capture, t));
    store.upsert_payments(&[captured.clone()]).await.unwrap();
    let state = store.get_payment(captured.id).await.unwrap();
    assert_eq!(state.entity.initial_amount, dec!(100));
    assert_eq!(state.entity.amount, dec!(200));

    // An authorisation starts at zero until captured.
    let authorised = Payment::observed(observation(connector_id, "py_auth", PaymentStatus::Authorisation, t));
    store.upsert_payments(&[authorised.clone()]).await.unwrap();
    assert_eq!(store.get_payment(authorised.id).await.unwrap().entity.amount, dec!(0));

    let mut capture = observation(connector_id, "py_auth_capture", PaymentStatus::Capture, t + Duration::minutes(1));
    capture.parent_reference = Some("py_auth".to_string());
    store.upsert_payments(&[Payment::observed(capture)]).await.unwrap();
    let state = store.get_payment(authorised.id).await.unwrap();
    assert_eq!(state.entity.initial_amount, dec!(100));
    assert_eq!(state.entity.amount, dec!(100));
    assert_eq!(state.status, PaymentStatus::Capture);
}

pub async fn refunds_fold_independently_of_batching<S: Backend>(store: &S) {
    let connector_id = test_connector(store).await;
    let t = base_time();

    let together = test_payment(connector_id, "py_together", dec!(100))
        .with_adjustment("py_together", t, PaymentStatus::Succeeded, Some(dec!(100)));
    let apart = test_payment(connector_id, "py_apart", dec!(100))
        .with_adjustment("py_apart", t, PaymentStatus::Succeeded, Some(dec!(100)));
    store.upsert_payments(&[together.clone(), apart.clone()]).await.unwrap();

    let refunds = |p: &Payment| {
        let mut p = p.clone();
        p.adjustments.clear();
        p.with_adjustment("re_1", t + Duration::minutes(1), PaymentStatus::Refunded, Some(dec!(10)))
            .with_adjustment("re_2", t + Duration::minutes(2), PaymentStatus::Refunded, Some(dec!(10)))
    };

    store.upsert_payments(&[refunds(&together)]).await.unwrap();

    let apart_refunds = refunds(&apart);
    for adjustment in &apart_refunds.adjustments {
        let mut single = apart_refunds.clone();
        single.adjustments = vec![adjustment.clone()];
        store.upsert_payments(&[single]).await.unwrap();
    }
    // Replays move nothing.
    store.upsert_payments(&[apart_refunds]).await.unwrap();

    let together = store.get_payment(together.id).await.unwrap();
    let apart = store.get_payment(apart.id).await.unwrap();
    assert_eq!(together.entity.amount, dec!(80));
    assert_eq!(apart.entity.amount, dec!(80));
    assert_eq!(together.status, PaymentStatus::Refunded);
    assert_eq!(apart.entity.adjustments.len(), 3);
}

pub async fn amount_adjustment_replaces_initial_amount<S: Backend>(store: &S) {
    let connector_id = test_connector(store).await;
    let t = base_time();
    let payment = test_payment(connector_id, "py_adjust", dec!(100))
        .with_adjustment("py_adjust", t, PaymentStatus::Pending, None)
        .with_adjustment("adj_1", t + Duration::minutes(1), PaymentStatus::AmountAdjustment, Some(dec!(90)))
        .with_adjustment("adj_2", t + Duration::minutes(2), PaymentStatus::AmountAdjustment, Some(dec!(95)));

    store.upsert_payments(&[payment.clone()]).await.unwrap();

    let state = store.get_payment(payment.id).await.unwrap();
    assert_eq!(state.entity.initial_amount, dec!(95));
    assert_eq!(state.entity.amount, dec!(100));
    assert_eq!(state.status, PaymentStatus::AmountAdjustment);
}

pub async fn status_follows_latest_adjustment<S: Backend>(store: &S) {
    let connector_id = test_connector(store).await;
    let t = base_time();
    let payment = test_payment(connector_id, "py_status", dec!(50));

    let later = payment
        .clone()
        .with_adjustment("py_status", t + Duration::minutes(2), PaymentStatus::Succeeded, None);
    let earlier = payment
        .clone()
        .with_adjustment("py_status", t + Duration::minutes(1), PaymentStatus::Pending, None);
    store.upsert_payments(&[later]).await.unwrap();
    store.upsert_payments(&[earlier]).await.unwrap();

    let state = store.get_payment(payment.id).await.unwrap();
    assert_eq!(state.status, PaymentStatus::Succeeded);
    // Newest first.
    assert_eq!(state.entity.adjustments[0].status, PaymentStatus::Succeeded);
    assert_eq!(state.entity.adjustments[1].status, PaymentStatus::Pending);

    // Same timestamp: the later insertion wins.
    let tie = payment
        .clone()
        .with_adjustment("py_status", t + Duration::minutes(2), PaymentStatus::Dispute, None);
    store.upsert_payments(&[tie]).await.unwrap();
    let state = store.get_payment(payment.id).await.unwrap();
    assert_eq!(state.status, PaymentStatus::Dispute);
    assert_eq!(state.status.code(), "DISPUTE");
}

pub async fn unknown_references_abort_the_batch<S: Backend>(store: &S) {
    let connector_id = test_connector(store).await;
    let t = base_time();
    let good = test_payment(connector_id, "py_good", dec!(10))
        .with_adjustment("py_good", t, PaymentStatus::Succeeded, None);
    let mut bad = test_payment(connector_id, "py_bad", dec!(10))
        .with_adjustment("py_bad", t, PaymentStatus::Succeeded, None);
    bad.source_account_id = Some(AccountId::derive(connector_id, "ghost"));

    let err = store.upsert_payments(&[good.clone(), bad]).await.unwrap_err();
    assert!(matches!(err, StorageError::ForeignKeyViolation(_)), "{err:?}");

    assert!(store.get_payment(good.id).await.unwrap_err().is_not_found());
    assert_eq!(store.outbox_event(&saved_event_id(&good, 0)).await.unwrap(), None);

    let orphan = test_payment(ConnectorId::new(), "py_orphan", dec!(1))
        .with_adjustment("py_orphan", t, PaymentStatus::Pending, None);
    let err = store.upsert_payments(&[orphan]).await.unwrap_err();
    assert!(matches!(err, StorageError::ForeignKeyViolation(_)), "{err:?}");

    let account_id = test_account(store, connector_id, "known").await;
    let mut known = good.clone();
    known.destination_account_id = Some(account_id);
    store.upsert_payments(&[known]).await.unwrap();
    let state = store.get_payment(good.id).await.unwrap();
    assert_eq!(state.entity.destination_account_id, Some(account_id));
}

pub async fn delete_by_reference_stages_deleted_event<S: Backend>(store: &S) {
    let connector_id = test_connector(store).await;
    let payment = test_payment(connector_id, "py_delete", dec!(10))
        .with_adjustment("py_delete", base_time(), PaymentStatus::Succeeded, None);
    store.upsert_payments(&[payment.clone()]).await.unwrap();

    store
        .delete_payment_by_reference("py_delete", connector_id)
        .await
        .unwrap();
    assert!(store.get_payment(payment.id).await.unwrap_err().is_not_found());

    let deleted = payloads::payment_deleted(&payment, Utc::now());
    let event = store.outbox_event(&deleted.id).await.unwrap().expect("PAYMENT_DELETED staged");
    assert_eq!(event.known_type(), Some(OutboxEventType::PaymentDeleted));

    // Absent payments are a no-op.
    store
        .delete_payment_by_reference("py_delete", connector_id)
        .await
        .unwrap();
}

pub async fn metadata_updates_merge<S: Backend>(store: &S) {
    let connector_id = test_connector(store).await;
    let mut payment = test_payment(connector_id, "py_meta", dec!(10));
    payment.metadata = BTreeMap::from([
        ("a".to_string(), "1".to_string()),
        ("c".to_string(), "x".to_string()),
    ]);
    store.upsert_payments(&[payment.clone()]).await.unwrap();

    store
        .update_payment_metadata(
            payment.id,
            BTreeMap::from([
                ("a".to_string(), "2".to_string()),
                ("b".to_string(), "3".to_string()),
            ]),
        )
        .await
        .unwrap();

    let state = store.get_payment(payment.id).await.unwrap();
    assert_eq!(
        state.entity.metadata,
        BTreeMap::from([
            ("a".to_string(), "2".to_string()),
            ("b".to_string(), "3".to_string()),
            ("c".to_string(), "x".to_string()),
        ])
    );
    // No adjustments yet: initial status.
    assert_eq!(state.status, PaymentStatus::INITIAL);

    let missing = test_payment(connector_id, "py_missing", dec!(1));
    let err = store
        .update_payment_metadata(missing.id, BTreeMap::new())
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

fn test_order(connector_id: ConnectorId, status: OrderStatus, fill: Option<Decimal>, at: DateTime<Utc>) -> Order {
    Order::observed(OrderObservation {
        connector_id,
        reference: "ord_1".to_string(),
        created_at: at,
        direction: OrderDirection::Buy,
        source_asset: "USD/2".to_string(),
        target_asset: "BTC/8".to_string(),
        order_type: OrderType::Limit,
        limit_price: Some(dec!(65000)),
        status,
        quantity_ordered: dec!(10),
        fill,
        metadata: BTreeMap::new(),
        raw: serde_json::json!({}),
    })
}

pub async fn order_status_updates_append_adjustments<S: Backend>(store: &S) {
    let connector_id = test_connector(store).await;
    let t = base_time();
    let open = test_order(connector_id, OrderStatus::Open, None, t);
    let fill = test_order(connector_id, OrderStatus::PartiallyFilled, Some(dec!(4)), t + Duration::minutes(1));
    store.upsert_orders(&[open.clone()]).await.unwrap();
    store.upsert_orders(&[fill]).await.unwrap();

    let state = store.get_order(open.id).await.unwrap();
    assert_eq!(state.status, OrderStatus::PartiallyFilled);
    assert_eq!(state.entity.amount, dec!(4));
    assert_eq!(state.entity.initial_amount, dec!(10));

    store.update_order_status(open.id, OrderStatus::Cancelled).await.unwrap();
    let state = store.get_order(open.id).await.unwrap();
    assert_eq!(state.status, OrderStatus::Cancelled);
    assert_eq!(state.entity.adjustments.len(), 3);
    assert_eq!(state.entity.amount, dec!(4));

    let synthetic = &state.entity.adjustments[0];
    assert!(synthetic.reference.starts_with("status-update-"));
    let event = store
        .outbox_event(&EventId::new(synthetic.id.to_string(), Some(connector_id)))
        .await
        .unwrap()
        .expect("ORDER_SAVED staged");
    assert_eq!(event.known_type(), Some(OutboxEventType::OrderSaved));

    let missing = OrderId::derive(connector_id, OrderType::Market.code(), "ord_missing");
    let err = store
        .update_order_status(missing, OrderStatus::Cancelled)
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

pub async fn order_reobservation_merges_metadata<S: Backend>(store: &S) {
    let connector_id = test_connector(store).await;
    let t = base_time();
    let mut first = test_order(connector_id, OrderStatus::Open, None, t);
    first.metadata = BTreeMap::from([
        ("desk".to_string(), "emea".to_string()),
        ("tier".to_string(), "1".to_string()),
    ]);
    let mut second = test_order(connector_id, OrderStatus::PartiallyFilled, Some(dec!(2)), t + Duration::minutes(1));
    second.metadata = BTreeMap::from([
        ("tier".to_string(), "2".to_string()),
        ("venue".to_string(), "x".to_string()),
    ]);

    store.upsert_orders(&[first.clone()]).await.unwrap();
    store.upsert_orders(&[second]).await.unwrap();

    let state = store.get_order(first.id).await.unwrap();
    assert_eq!(
        state.entity.metadata,
        BTreeMap::from([
            ("desk".to_string(), "emea".to_string()),
            ("tier".to_string(), "2".to_string()),
            ("venue".to_string(), "x".to_string()),
        ])
    );
    assert_eq!(state.entity.amount, dec!(2));
}

pub async fn deletions_remove_adjustments_with_their_entity<S: Backend>(store: &S) {
    let connector_id = test_connector(store).await;
    let other_connector = test_connector(store).await;
    let account_id = test_account(store, connector_id, "acc_cleanup").await;
    let t = base_time();

    let refunded = |connector_id: ConnectorId, reference: &str| {
        test_payment(connector_id, reference, dec!(100))
            .with_adjustment(reference, t, PaymentStatus::Succeeded, None)
            .with_adjustment("re_cleanup", t + Duration::minutes(1), PaymentStatus::Refunded, Some(dec!(30)))
    };
    let single = refunded(connector_id, "py_single");
    let mut linked = refunded(connector_id, "py_linked");
    linked.source_account_id = Some(account_id);
    let remaining = refunded(connector_id, "py_remaining");
    let elsewhere = refunded(other_connector, "py_elsewhere");
    store
        .upsert_payments(&[single.clone(), linked.clone(), remaining.clone(), elsewhere.clone()])
        .await
        .unwrap();

    assert_eq!(store.delete_payment(single.id).await.unwrap(), 1);
    assert_eq!(store.delete_payment(single.id).await.unwrap(), 0);
    assert!(store.get_payment(single.id).await.unwrap_err().is_not_found());

    // Adjustments went with the row: observing it again folds from scratch.
    store.upsert_payments(&[single.clone()]).await.unwrap();
    let state = store.get_payment(single.id).await.unwrap();
    assert_eq!(state.entity.adjustments.len(), 2);
    assert_eq!(state.entity.amount, dec!(70));

    assert_eq!(store.delete_payments_by_account(account_id).await.unwrap(), 1);
    assert!(store.get_payment(linked.id).await.unwrap_err().is_not_found());
    assert!(store.get_payment(remaining.id).await.is_ok());

    assert_eq!(store.delete_payments_by_connector(connector_id).await.unwrap(), 2);
    assert!(store.get_payment(remaining.id).await.unwrap_err().is_not_found());
    assert!(store.get_payment(elsewhere.id).await.is_ok());

    let order = test_order(connector_id, OrderStatus::Open, None, t);
    let other_order = test_order(other_connector, OrderStatus::Open, None, t);
    store.upsert_orders(&[order.clone(), other_order.clone()]).await.unwrap();
    assert_eq!(store.delete_order(order.id).await.unwrap(), 1);
    assert!(store.get_order(order.id).await.unwrap_err().is_not_found());

    store.upsert_orders(&[order.clone()]).await.unwrap();
    assert_eq!(store.get_order(order.id).await.unwrap().entity.adjustments.len(), 1);
    assert_eq!(store.delete_orders_by_connector(connector_id).await.unwrap(), 1);
    assert!(store.get_order(order.id).await.unwrap_err().is_not_found());
    assert!(store.get_order(other_order.id).await.is_ok());

    let other_account = test_account(store, other_connector, "acc_cleanup_other").await;
    store
        .upsert_balances(&[
            Balance::observed(account_id, connector_id, "USD/2", dec!(1), t),
            Balance::observed(account_id, connector_id, "USD/2", dec!(2), t + Duration::minutes(1)),
            Balance::observed(account_id, connector_id, "EUR/2", dec!(3), t),
            Balance::observed(other_account, other_connector, "USD/2", dec!(4), t),
        ])
        .await
        .unwrap();
    assert_eq!(store.delete_balances_by_connector(connector_id).await.unwrap(), 3);
    assert!(store.latest_balances(account_id).await.unwrap().is_empty());
    assert_eq!(store.latest_balances(other_account).await.unwrap().len(), 1);
}

pub async fn balance_versions_follow_observations<S: Backend>(store: &S) {
    let connector_id = test_connector(store).await;
    let account_id = test_account(store, connector_id, "acc_versions").await;
    let t0 = base_time();
    let t1 = t0 + Duration::minutes(10);
    let t2 = t0 + Duration::minutes(20);
    let observe = |balance: Decimal, at: DateTime<Utc>| {
        Balance::observed(account_id, connector_id, "USD/2", balance, at)
    };

    store.upsert_balances(&[observe(dec!(100), t0)]).await.unwrap();
    store.upsert_balances(&[observe(dec!(100), t1)]).await.unwrap();
    store.upsert_balances(&[observe(dec!(200), t2)]).await.unwrap();
    // Strictly older than the latest version: discarded.
    store
        .upsert_balances(&[observe(dec!(150), t1 + Duration::minutes(5))])
        .await
        .unwrap();

    let at_t1 = store.balance_at(account_id, "USD/2", t1).await.unwrap().unwrap();
    assert_eq!(at_t1.balance, dec!(100));
    assert_eq!(at_t1.created_at, t0);
    assert_eq!(at_t1.last_updated_at, t2);

    let after = store
        .balance_at(account_id, "USD/2", t2 + Duration::seconds(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(after.balance, dec!(200));
    assert_eq!(
        store.balance_at(account_id, "USD/2", t0 - Duration::seconds(1)).await.unwrap(),
        None
    );

    let versions = store
        .list_balances(&BalanceQuery::for_account(account_id))
        .await
        .unwrap();
    let values: Vec<Decimal> = versions.data.iter().map(|b| b.balance).collect();
    assert_eq!(values, vec![dec!(200), dec!(100)]);

    // Every stored observation is announced, including the one that only
    // extended a window. The discarded one is not.
    let now = Utc::now();
    for (observed, staged) in [
        (observe(dec!(100), t0), true),
        (observe(dec!(100), t1), true),
        (observe(dec!(200), t2), true),
        (observe(dec!(150), t1 + Duration::minutes(5)), false),
    ] {
        let id = payloads::balance_saved(&observed, now).id;
        assert_eq!(store.outbox_event(&id).await.unwrap().is_some(), staged, "{id}");
    }

    let eur = Balance::observed(account_id, connector_id, "EUR/2", dec!(5), t1);
    store.upsert_balances(&[eur]).await.unwrap();
    let mut at = store
        .balances_at(account_id, t1 + Duration::seconds(1))
        .await
        .unwrap();
    at.sort_by(|a, b| a.asset.cmp(&b.asset));
    let summary: Vec<(&str, Decimal)> = at.iter().map(|b| (b.asset.as_str(), b.balance)).collect();
    assert_eq!(summary, vec![("EUR/2", dec!(5)), ("USD/2", dec!(100))]);

    let mut latest = store.latest_balances(account_id).await.unwrap();
    latest.sort_by(|a, b| a.asset.cmp(&b.asset));
    let summary: Vec<(&str, Decimal)> = latest.iter().map(|b| (b.asset.as_str(), b.balance)).collect();
    assert_eq!(summary, vec![("EUR/2", dec!(5)), ("USD/2", dec!(200))]);
}

pub async fn same_instant_observation_corrects_value<S: Backend>(store: &S) {
    let connector_id = test_connector(store).await;
    let account_id = test_account(store, connector_id, "acc_correct").await;
    let t0 = base_time();

    store
        .upsert_balances(&[
            Balance::observed(account_id, connector_id, "USD/2", dec!(100), t0),
            Balance::observed(account_id, connector_id, "USD/2", dec!(120), t0),
        ])
        .await
        .unwrap();

    let at = store.balance_at(account_id, "USD/2", t0).await.unwrap().unwrap();
    assert_eq!(at.balance, dec!(120));
    let versions = store
        .list_balances(&BalanceQuery::for_account(account_id))
        .await
        .unwrap();
    assert_eq!(versions.data.len(), 1);
}

pub async fn balance_requires_known_account<S: Backend>(store: &S) {
    let connector_id = test_connector(store).await;
    let ghost = AccountId::derive(connector_id, "ghost");
    let err = store
        .upsert_balances(&[Balance::observed(ghost, connector_id, "USD/2", dec!(1), base_time())])
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::ForeignKeyViolation(_)), "{err:?}");
    assert_eq!(store.balance_at(ghost, "USD/2", base_time()).await.unwrap(), None);
}

fn test_event(connector_id: ConnectorId, created_at: DateTime<Utc>) -> OutboxEvent {
    OutboxEvent::pending(
        EventId::new(format!("conformance-{}", Uuid::now_v7()), Some(connector_id)),
        OutboxEventType::BalanceSaved,
        "entity",
        serde_json::json!({"source": "conformance"}),
        created_at,
    )
}

pub async fn outbox_lifecycle<S: Backend>(store: &S) {
    let connector_id = test_connector(store).await;
    let committed = test_event(connector_id, Utc::now());
    let rolled_back = test_event(connector_id, Utc::now());

    let mut tx = store.begin().await.unwrap();
    store.insert(&mut tx, &[committed.clone()]).await.unwrap();
    store.commit(tx).await.unwrap();

    let mut tx = store.begin().await.unwrap();
    store.insert(&mut tx, &[rolled_back.clone()]).await.unwrap();
    drop(tx);

    assert_eq!(store.outbox_event(&rolled_back.id).await.unwrap(), None);
    let stored = store.outbox_event(&committed.id).await.unwrap().expect("committed");
    assert_eq!(stored, committed);

    store.mark_failed(&committed.id, 1, "broker down").await.unwrap();
    let stored = store.outbox_event(&committed.id).await.unwrap().unwrap();
    assert_eq!(stored.status, OutboxStatus::Pending);
    assert_eq!(stored.retry_count, 1);
    assert_eq!(stored.error.as_deref(), Some("broker down"));
    assert!(stored.last_retry_at.is_some());

    store.mark_failed(&committed.id, MAX_RETRIES, "broker down").await.unwrap();
    let stored = store.outbox_event(&committed.id).await.unwrap().unwrap();
    assert_eq!(stored.status, OutboxStatus::Failed);
    let pending = store.poll_pending(1000).await.unwrap();
    assert!(pending.iter().all(|e| e.id != committed.id));
    let failed = store.list_failed(1000).await.unwrap();
    assert!(failed.iter().any(|e| e.id == committed.id));

    store.requeue_failed(&committed.id).await.unwrap();
    let stored = store.outbox_event(&committed.id).await.unwrap().unwrap();
    assert_eq!((stored.status, stored.retry_count), (OutboxStatus::Pending, 0));

    let sent_at = Utc::now();
    store
        .delete_and_record_sent(&committed.id, EventSent::new(committed.id.clone(), sent_at))
        .await
        .unwrap();
    assert_eq!(store.outbox_event(&committed.id).await.unwrap(), None);
    assert!(store.events_sent_exists(&committed.id).await.unwrap());
    let sent = store.event_sent(&committed.id).await.unwrap().unwrap();
    assert_eq!(sent, EventSent::new(committed.id.clone(), sent_at));

    // Delivered keys are never staged again.
    store.insert_standalone(&[committed.clone()]).await.unwrap();
    assert_eq!(store.outbox_event(&committed.id).await.unwrap(), None);

    assert!(store.requeue_failed(&committed.id).await.unwrap_err().is_not_found());
    assert!(store.mark_failed(&rolled_back.id, 1, "x").await.unwrap_err().is_not_found());
    assert!(!store.events_sent_exists(&rolled_back.id).await.unwrap());
}

pub async fn failed_event_stays_failed_until_requeued<S: Backend>(store: &S) {
    let connector_id = test_connector(store).await;
    let event = test_event(connector_id, Utc::now());
    store.insert_standalone(&[event.clone()]).await.unwrap();

    store.mark_failed(&event.id, MAX_RETRIES, "broker down").await.unwrap();
    // A late failure report cannot revive a dead-lettered event.
    let err = store.mark_failed(&event.id, 1, "late").await.unwrap_err();
    assert!(err.is_not_found(), "{err:?}");

    let stored = store.outbox_event(&event.id).await.unwrap().unwrap();
    assert_eq!(stored.status, OutboxStatus::Failed);
    assert_eq!(stored.retry_count, MAX_RETRIES);
    assert_eq!(stored.error.as_deref(), Some("broker down"));
    let pending = store.poll_pending(10_000).await.unwrap();
    assert!(pending.iter().all(|e| e.id != event.id));

    store.requeue_failed(&event.id).await.unwrap();
    store.mark_failed(&event.id, 1, "after requeue").await.unwrap();
    let stored = store.outbox_event(&event.id).await.unwrap().unwrap();
    assert_eq!((stored.status, stored.retry_count), (OutboxStatus::Pending, 1));
    assert!(store.poll_pending(10_000).await.unwrap().iter().any(|e| e.id == event.id));
}

pub async fn delivery_requires_a_known_event<S: Backend>(store: &S) {
    let connector_id = test_connector(store).await;
    let unknown = EventId::new(format!("conformance-{}", Uuid::now_v7()), Some(connector_id));
    let err = store
        .delete_and_record_sent(&unknown, EventSent::new(unknown.clone(), Utc::now()))
        .await
        .unwrap_err();
    assert!(err.is_not_found(), "{err:?}");
    assert!(!store.events_sent_exists(&unknown).await.unwrap());

    // Redelivery of an event already recorded as sent is a no-op.
    let event = test_event(connector_id, Utc::now());
    store.insert_standalone(&[event.clone()]).await.unwrap();
    let first = EventSent::new(event.id.clone(), Utc::now());
    store.delete_and_record_sent(&event.id, first.clone()).await.unwrap();
    store
        .delete_and_record_sent(&event.id, EventSent::new(event.id.clone(), Utc::now() + Duration::seconds(5)))
        .await
        .unwrap();
    assert_eq!(store.event_sent(&event.id).await.unwrap(), Some(first));
}

pub async fn outbox_polls_oldest_first<S: Backend>(store: &S) {
    let connector_id = test_connector(store).await;
    let now = Utc::now();
    let events: Vec<OutboxEvent> = (0..3)
        .map(|i| test_event(connector_id, now + Duration::milliseconds(i)))
        .collect();
    let mut reversed = events.clone();
    reversed.reverse();
    store.insert_standalone(&reversed).await.unwrap();
    // Staging twice keeps one row per key.
    store.insert_standalone(&events).await.unwrap();

    let polled: Vec<EventId> = store
        .poll_pending(10_000)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.connector_id == Some(connector_id))
        .map(|e| e.id)
        .collect();
    let expected: Vec<EventId> = events.iter().map(|e| e.id.clone()).collect();
    assert_eq!(polled, expected);
}

pub async fn listing_pages_and_filters<S: Backend>(store: &S) {
    let connector_id = test_connector(store).await;
    let t = base_time();
    let payments: Vec<Payment> = (0..5i64)
        .map(|i| {
            let reference = format!("py_list_{i}");
            let mut payment = Payment::new(
                connector_id,
                PaymentType::Payout,
                &reference,
                t + Duration::minutes(i),
                Decimal::from(10 * (i + 1)),
                "EUR/2",
                PaymentScheme::Sepa,
            )
            .with_adjustment(&reference, t + Duration::minutes(i), PaymentStatus::Succeeded, None);
            let parity = if i % 2 == 0 { "even" } else { "odd" };
            payment.metadata = BTreeMap::from([("parity".to_string(), parity.to_string())]);
            payment
        })
        .collect();
    store.upsert_payments(&payments).await.unwrap();

    let references = |data: &[paystate_core::PaymentState]| -> Vec<String> {
        data.iter().map(|s| s.entity.reference.clone()).collect()
    };
    let mine = Filter::matching("connector_id", connector_id.to_string());

    let first = store
        .list_payments(&ListQuery::with_filter(mine.clone()).page_size(2))
        .await
        .unwrap();
    assert_eq!(references(&first.data), vec!["py_list_4", "py_list_3"]);
    assert!(first.has_more);
    assert!(first.previous.is_none());

    let second = store
        .list_payments(&ListQuery::with_filter(mine.clone()).after(first.next.clone().unwrap()))
        .await
        .unwrap();
    assert_eq!(references(&second.data), vec!["py_list_2", "py_list_1"]);

    let third = store
        .list_payments(&ListQuery::with_filter(mine.clone()).after(second.next.clone().unwrap()))
        .await
        .unwrap();
    assert_eq!(references(&third.data), vec!["py_list_0"]);
    assert!(third.next.is_none());

    let back = store
        .list_payments(&ListQuery::with_filter(mine.clone()).after(third.previous.clone().unwrap()))
        .await
        .unwrap();
    assert_eq!(references(&back.data), vec!["py_list_2", "py_list_1"]);

    let even = store
        .list_payments(&ListQuery::with_filter(Filter::And(vec![
            mine.clone(),
            Filter::matching("metadata[parity]", "even"),
        ])))
        .await
        .unwrap();
    assert_eq!(references(&even.data), vec!["py_list_4", "py_list_2", "py_list_0"]);

    let large = store
        .list_payments(&ListQuery::with_filter(Filter::And(vec![
            mine.clone(),
            Filter::compare("amount", CompareOp::Gte, "30"),
            Filter::Not(Box::new(Filter::matching("reference", "py_list_3"))),
        ])))
        .await
        .unwrap();
    assert_eq!(references(&large.data), vec!["py_list_4", "py_list_2"]);

    let succeeded = store
        .list_payments(&ListQuery::with_filter(Filter::And(vec![
            mine.clone(),
            Filter::matching("status", "SUCCEEDED"),
        ])))
        .await
        .unwrap();
    assert_eq!(succeeded.data.len(), 5);

    let err = store
        .list_payments(&ListQuery::with_filter(Filter::matching("nope", "x")))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::Validation(_)), "{err:?}");

    let orders = store
        .list_orders(&ListQuery::with_filter(Filter::matching("connector_id", connector_id.to_string())))
        .await
        .unwrap();
    assert!(orders.data.is_empty());
    assert!(!orders.has_more);
}
