//! Durable leg of the topic fan-out.
//!
//! A dedicated consumer group (`persistence` by default) drains the same
//! topic the stats consumer reads and appends every valid event to the
//! activity log. The cursor is committed only after the whole batch is
//! appended, so a store failure replays the batch on the next poll
//! (at-least-once).

use crate::broker::BrokerClient;
use crate::store::ActivityLogStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::interval;

#[derive(Debug, Clone)]
pub struct StoreSinkConfig {
    pub topic: String,
    pub group: String,
    pub poll_interval_ms: u64,
    pub poll_batch_size: usize,
    pub failure_backoff_ms: u64,
}

impl Default for StoreSinkConfig {
    fn default() -> Self {
        Self {
            topic: "user_events".to_string(),
            group: "persistence".to_string(),
            poll_interval_ms: 100,
            poll_batch_size: 256,
            failure_backoff_ms: 500,
        }
    }
}

/// Run the sink until the shutdown signal flips. Poison events are skipped
/// here too; they are counted by the stats consumer and have no durable
/// representation.
pub async fn store_sink_task(
    broker: Arc<dyn BrokerClient>,
    store: Arc<dyn ActivityLogStore>,
    config: StoreSinkConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    log::info!(
        "🚀 Starting store sink: topic '{}', group '{}'",
        config.topic,
        config.group
    );

    if let Err(e) = broker.resubscribe(&config.topic, &config.group).await {
        log::warn!("⚠️  Store sink resubscribe failed: {}", e);
    }

    let mut tick = interval(Duration::from_millis(config.poll_interval_ms));
    let mut appended: u64 = 0;

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = tick.tick() => {
                let batch = match broker
                    .poll(&config.topic, &config.group, config.poll_batch_size)
                    .await
                {
                    Ok(batch) => batch,
                    Err(e) => {
                        log::warn!("⚠️  Store sink poll failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(config.failure_backoff_ms)).await;
                        continue;
                    }
                };
                if batch.is_empty() {
                    continue;
                }

                let mut batch_ok = true;
                for polled in &batch {
                    if polled.event.validate().is_err() {
                        continue;
                    }
                    if let Err(e) = store.append(&polled.event).await {
                        // Leave the cursor unmoved; the batch replays after
                        // backoff. Duplicate appends for the already-written
                        // prefix are accepted (at-least-once).
                        log::error!("❌ Durable append failed, will replay batch: {}", e);
                        batch_ok = false;
                        break;
                    }
                    appended += 1;
                }

                if batch_ok {
                    if let Err(e) = broker.commit(&config.topic, &config.group).await {
                        log::warn!("⚠️  Store sink commit failed: {}", e);
                    }
                } else {
                    if let Err(e) = broker.resubscribe(&config.topic, &config.group).await {
                        log::warn!("⚠️  Store sink rewind failed: {}", e);
                    }
                    tokio::time::sleep(Duration::from_millis(config.failure_backoff_ms)).await;
                }
            }
        }
    }

    log::info!("✅ Store sink stopped ({} events appended)", appended);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerClient, InMemoryBroker};
    use crate::event::{Event, EventOrigin, EventType};
    use crate::store::{ActivityLogStore, MemoryActivityStore};
    use serde_json::json;

    fn fast_config() -> StoreSinkConfig {
        StoreSinkConfig {
            poll_interval_ms: 5,
            failure_backoff_ms: 5,
            ..Default::default()
        }
    }

    async fn wait_for_count(store: &Arc<MemoryActivityStore>, expected: u64) {
        for _ in 0..200 {
            if store.count().await.unwrap() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("store never reached {} rows", expected);
    }

    #[tokio::test]
    async fn test_sink_persists_events() {
        let broker = Arc::new(InMemoryBroker::new(4));
        let store = Arc::new(MemoryActivityStore::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(store_sink_task(
            broker.clone(),
            store.clone(),
            fast_config(),
            shutdown_rx,
        ));

        for ts in 1..=3 {
            let event = Event::new(
                EventType::UserLogin,
                json!({"n": ts}),
                1_700_000_000 + ts,
                EventOrigin::user("a"),
            );
            broker.publish("user_events", event).await.unwrap();
        }

        wait_for_count(&store, 3).await;

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_poison_events_are_not_persisted() {
        let broker = Arc::new(InMemoryBroker::new(4));
        let store = Arc::new(MemoryActivityStore::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(store_sink_task(
            broker.clone(),
            store.clone(),
            fast_config(),
            shutdown_rx,
        ));

        let poison = Event::new(
            EventType::ApiCall,
            json!("bad"),
            1_700_000_000,
            EventOrigin::user("p"),
        );
        broker.publish("user_events", poison).await.unwrap();
        let good = Event::new(
            EventType::ApiCall,
            json!({}),
            1_700_000_001,
            EventOrigin::user("g"),
        );
        broker.publish("user_events", good).await.unwrap();

        wait_for_count(&store, 1).await;
        let rows = store.recent(10).await.unwrap();
        assert_eq!(rows[0].user_id.as_deref(), Some("g"));

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_store_failure_replays_batch() {
        let broker = Arc::new(InMemoryBroker::new(4));
        let store = Arc::new(MemoryActivityStore::new());
        store.fail_next_appends(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(store_sink_task(
            broker.clone(),
            store.clone(),
            fast_config(),
            shutdown_rx,
        ));

        let event = Event::new(
            EventType::ApiCall,
            json!({}),
            1_700_000_000,
            EventOrigin::user("b"),
        );
        broker.publish("user_events", event).await.unwrap();

        // First attempt fails, the batch replays, the second succeeds.
        wait_for_count(&store, 1).await;

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
