//! Outbox relay: drains pending outbox events into an [`EventPublisher`].
//!
//! Each cycle polls up to `poll_limit` pending events, oldest first, and
//! handles them one by one:
//!
//! - published: the row is deleted and recorded in `events_sent`
//! - transient failure: `retry_count + 1` is recorded; the dispatcher
//!   dead-letters the row once the count reaches its maximum
//! - permanent failure or unknown event type: dead-lettered immediately
//!
//! A failing event never aborts the cycle. Delivery is at-least-once: a crash
//! between publishing and recording the delivery republishes the event.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use paystate_events::{EventMessage, EventPublisher, EventSent, OutboxEvent, PublishError};

use crate::config::OutboxConfig;
use crate::storage::{OutboxDispatcher, StorageError};

/// Counters of one relay cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayReport {
    pub polled: usize,
    pub delivered: usize,
    /// Failed, still pending.
    pub retried: usize,
    /// Moved to FAILED during this cycle.
    pub dead_lettered: usize,
    /// Bookkeeping writes that failed; the event stays as it was.
    pub errors: usize,
}

enum Outcome {
    Delivered,
    Retried,
    DeadLettered,
}

pub struct OutboxRelay<D, P> {
    dispatcher: Arc<D>,
    publisher: Arc<P>,
    config: OutboxConfig,
}

impl<D, P> OutboxRelay<D, P>
where
    D: OutboxDispatcher + 'static,
    P: EventPublisher + 'static,
{
    pub fn new(dispatcher: Arc<D>, publisher: Arc<P>, config: OutboxConfig) -> Self {
        Self {
            dispatcher,
            publisher,
            config,
        }
    }

    /// Run one poll/publish cycle.
    #[instrument(skip(self), fields(poll_limit = self.config.poll_limit), err)]
    pub async fn run_once(&self) -> Result<RelayReport, StorageError> {
        let events = self.dispatcher.poll_pending(self.config.poll_limit).await?;
        let mut report = RelayReport {
            polled: events.len(),
            ..RelayReport::default()
        };

        for event in &events {
            match self.relay(event).await {
                Ok(Outcome::Delivered) => report.delivered += 1,
                Ok(Outcome::Retried) => report.retried += 1,
                Ok(Outcome::DeadLettered) => report.dead_lettered += 1,
                Err(err) => {
                    error!(event_id = %event.id, error = %err, "outbox bookkeeping failed");
                    report.errors += 1;
                }
            }
        }

        if report.polled > 0 {
            info!(
                polled = report.polled,
                delivered = report.delivered,
                retried = report.retried,
                dead_lettered = report.dead_lettered,
                "outbox cycle complete"
            );
        }
        Ok(report)
    }

    async fn relay(&self, event: &OutboxEvent) -> Result<Outcome, StorageError> {
        let max_retries = self.dispatcher.max_retries();

        let message = match EventMessage::from_outbox(event) {
            Ok(message) => message,
            Err(err) => {
                warn!(event_id = %event.id, error = %err, "undeliverable outbox event");
                self.dispatcher
                    .mark_failed(&event.id, max_retries, &err.to_string())
                    .await?;
                return Ok(Outcome::DeadLettered);
            }
        };

        match self.publisher.publish(&message).await {
            Ok(()) => {
                let sent = EventSent::new(event.id.clone(), Utc::now());
                self.dispatcher.delete_and_record_sent(&event.id, sent).await?;
                debug!(event_id = %event.id, event_type = %event.event_type, "outbox event delivered");
                Ok(Outcome::Delivered)
            }
            Err(err) => {
                let retry_count = next_retry_count(event.retry_count, &err, max_retries);
                self.dispatcher
                    .mark_failed(&event.id, retry_count, &err.to_string())
                    .await?;

                if retry_count >= max_retries {
                    error!(event_id = %event.id, retry_count, error = %err, "outbox event dead-lettered");
                    Ok(Outcome::DeadLettered)
                } else {
                    warn!(event_id = %event.id, retry_count, error = %err, "outbox publish failed, will retry");
                    Ok(Outcome::Retried)
                }
            }
        }
    }

    /// Run cycles every `poll_interval` until shut down.
    pub fn spawn(self) -> RelayHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let interval = self.config.poll_interval;

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = self.run_once().await {
                            warn!(error = %err, "outbox poll failed");
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("outbox relay stopped");
        });

        RelayHandle {
            shutdown: shutdown_tx,
            join,
        }
    }
}

fn next_retry_count(current: u32, err: &PublishError, max_retries: u32) -> u32 {
    if err.is_retryable() {
        current.saturating_add(1)
    } else {
        max_retries.max(current.saturating_add(1))
    }
}

/// Handle to a spawned relay.
pub struct RelayHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl RelayHandle {
    /// Request shutdown and wait for the current cycle to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.join.await {
            warn!(error = %err, "outbox relay task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use paystate_events::{EventId, InMemoryPublisher, OutboxEventType, OutboxStatus};

    use crate::storage::InMemoryStore;

    fn test_event(key: &str) -> OutboxEvent {
        OutboxEvent::pending(
            EventId::new(key, None),
            OutboxEventType::PaymentSaved,
            "payment",
            serde_json::json!({"id": key}),
            Utc::now(),
        )
    }

    fn test_relay(max_retries: u32) -> (Arc<InMemoryStore>, Arc<InMemoryPublisher>, OutboxRelay<InMemoryStore, InMemoryPublisher>) {
        let store = Arc::new(InMemoryStore::with_max_retries(max_retries));
        let publisher = Arc::new(InMemoryPublisher::new());
        let relay = OutboxRelay::new(store.clone(), publisher.clone(), OutboxConfig::default());
        (store, publisher, relay)
    }

    #[tokio::test]
    async fn delivers_and_records_sent() {
        let (store, publisher, relay) = test_relay(3);
        let event = test_event("a");
        store.insert_standalone(&[event.clone()]).await.unwrap();

        let report = relay.run_once().await.unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(publisher.published().len(), 1);
        assert!(store.events_sent_exists(&event.id).await.unwrap());
        assert_eq!(store.outbox_event(&event.id).await.unwrap(), None);

        // A re-staged event with a delivered key is skipped.
        store.insert_standalone(&[event.clone()]).await.unwrap();
        assert!(store.poll_pending(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn transient_failures_escalate_to_failed() {
        let (store, publisher, relay) = test_relay(3);
        let poison = test_event("poison");
        let healthy = test_event("healthy");
        store.insert_standalone(&[poison.clone(), healthy.clone()]).await.unwrap();
        publisher.fail_times("poison", 10, PublishError::Transient("broker down".to_string()));

        let first = relay.run_once().await.unwrap();
        assert_eq!((first.delivered, first.retried), (1, 1));

        relay.run_once().await.unwrap();
        let last = relay.run_once().await.unwrap();
        assert_eq!(last.dead_lettered, 1);

        let stored = store.outbox_event(&poison.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OutboxStatus::Failed);
        assert_eq!(stored.retry_count, 3);
        assert!(stored.error.as_deref().unwrap_or_default().contains("broker down"));

        // FAILED rows are no longer polled.
        assert_eq!(relay.run_once().await.unwrap().polled, 0);
        assert!(store.events_sent_exists(&healthy.id).await.unwrap());
    }

    #[tokio::test]
    async fn permanent_failure_and_unknown_type_dead_letter_at_once() {
        let (store, publisher, relay) = test_relay(5);
        let rejected = test_event("rejected");
        let mut unknown = test_event("unknown");
        unknown.event_type = "SOMETHING_ELSE".to_string();
        store.insert_standalone(&[rejected.clone(), unknown.clone()]).await.unwrap();
        publisher.fail_next("rejected", PublishError::Permanent("schema mismatch".to_string()));

        let report = relay.run_once().await.unwrap();
        assert_eq!(report.dead_lettered, 2);
        assert_eq!(store.list_failed(10).await.unwrap().len(), 2);

        store.requeue_failed(&rejected.id).await.unwrap();
        let report = relay.run_once().await.unwrap();
        assert_eq!(report.delivered, 1);
        assert!(store.events_sent_exists(&rejected.id).await.unwrap());
    }

    #[tokio::test]
    async fn spawned_relay_drains_and_shuts_down() {
        let store = Arc::new(InMemoryStore::new());
        let publisher = Arc::new(InMemoryPublisher::new());
        let config = OutboxConfig {
            poll_interval: Duration::from_millis(10),
            ..OutboxConfig::default()
        };
        let event = test_event("spawned");
        store.insert_standalone(&[event.clone()]).await.unwrap();

        let handle = OutboxRelay::new(store.clone(), publisher.clone(), config).spawn();
        for _ in 0..100 {
            if store.events_sent_exists(&event.id).await.unwrap() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.shutdown().await;

        assert!(store.events_sent_exists(&event.id).await.unwrap());
        assert_eq!(publisher.published().len(), 1);
    }

    #[test]
    fn permanent_errors_jump_to_max() {
        let permanent = PublishError::Permanent("no".to_string());
        let transient = PublishError::Transient("later".to_string());
        assert_eq!(next_retry_count(0, &permanent, 5), 5);
        assert_eq!(next_retry_count(0, &transient, 5), 1);
        assert_eq!(next_retry_count(7, &permanent, 5), 8);
    }
}
