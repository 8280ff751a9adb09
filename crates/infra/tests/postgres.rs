//! Runs the backend conformance scenarios against a live Postgres.
//!
//! Skipped unless `PAYSTATE_TEST_DATABASE_URL` points at a disposable
//! database: tables are truncated before the run, so everything runs from a
//! single test function.

use std::sync::Arc;

use paystate_infra::relay::OutboxRelay;
use paystate_infra::storage::conformance;
use paystate_infra::{OutboxConfig, OutboxDispatcher, PostgresStore, StoreConfig};
use paystate_events::{EventId, InMemoryPublisher, OutboxEvent, OutboxEventType};

const TEST_DATABASE_URL: &str = "PAYSTATE_TEST_DATABASE_URL";

async fn test_store() -> anyhow::Result<Option<PostgresStore>> {
    let Ok(url) = std::env::var(TEST_DATABASE_URL) else {
        eprintln!("{TEST_DATABASE_URL} not set; skipping postgres tests");
        return Ok(None);
    };
    paystate_observability::init_for_tests();

    let config = StoreConfig {
        max_outbox_retries: conformance::MAX_RETRIES,
        ..StoreConfig::new(url)
    };
    let store = PostgresStore::connect(&config).await?;
    store.migrate().await?;
    sqlx::query(
        "TRUNCATE events_sent, outbox_events, balances, order_adjustments, orders, \
         payment_adjustments, payments, accounts, connectors",
    )
    .execute(store.pool())
    .await?;
    Ok(Some(store))
}

#[tokio::test]
async fn postgres_backend_conformance() -> anyhow::Result<()> {
    let Some(store) = test_store().await? else {
        return Ok(());
    };
    conformance::run_all(&store).await;
    relay_drains_outbox(Arc::new(store)).await
}

async fn relay_drains_outbox(store: Arc<PostgresStore>) -> anyhow::Result<()> {
    let publisher = Arc::new(InMemoryPublisher::new());
    let event = OutboxEvent::pending(
        EventId::new(format!("relay-{}", uuid::Uuid::now_v7()), None),
        OutboxEventType::PaymentSaved,
        "payment",
        serde_json::json!({"id": "relay"}),
        chrono::Utc::now(),
    );
    store.insert_standalone(&[event.clone()]).await?;

    // Everything the scenarios staged is drained along with it.
    let config = OutboxConfig {
        poll_limit: 10_000,
        ..OutboxConfig::default()
    };
    let relay = OutboxRelay::new(store.clone(), publisher.clone(), config);
    let report = relay.run_once().await?;

    assert_eq!(report.delivered, report.polled);
    assert!(store.poll_pending(10).await?.is_empty());
    assert!(store.events_sent_exists(&event.id).await?);
    assert!(publisher.published().iter().any(|m| m.idempotency_key() == event.id.idempotency_key));
    Ok(())
}
