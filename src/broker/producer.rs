//! Event ingress: the `record_event` path called by the request-handling
//! layer.
//!
//! Publish is bounded in both retries and wall-clock time so the caller is
//! never stalled. When retries are exhausted the event falls back to a
//! direct durable write (at-least-once, not exactly-once); only a failure of
//! BOTH legs surfaces an error, and the event is never silently dropped.

use super::{BrokerClient, BrokerError, PublishAck};
use crate::backoff::ExponentialBackoff;
use crate::event::{Event, EventOrigin, EventType};
use crate::store::{ActivityLogStore, StoreError};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

#[derive(Debug, Clone)]
pub struct ProducerConfig {
    pub topic: String,
    /// Publish attempts before declaring delivery failed (first try included).
    pub max_attempts: u32,
    pub retry_initial_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Overall bound on the publish leg, retries included.
    pub publish_timeout_ms: u64,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            topic: "user_events".to_string(),
            max_attempts: 3,
            retry_initial_delay_ms: 20,
            retry_max_delay_ms: 500,
            publish_timeout_ms: 2_000,
        }
    }
}

/// How a recorded event reached durability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Accepted by the broker; the store sink will persist it downstream.
    Published(PublishAck),
    /// Broker delivery failed; the event was appended straight to the
    /// activity log (row id returned).
    StoredDirect(i64),
}

pub struct EventProducer {
    broker: Arc<dyn BrokerClient>,
    store: Arc<dyn ActivityLogStore>,
    config: ProducerConfig,
    now_fn: Box<dyn Fn() -> i64 + Send + Sync>,
}

impl EventProducer {
    pub fn new(
        broker: Arc<dyn BrokerClient>,
        store: Arc<dyn ActivityLogStore>,
        config: ProducerConfig,
    ) -> Self {
        Self::new_with_timestamp_fn(
            broker,
            store,
            config,
            Box::new(|| chrono::Utc::now().timestamp()),
        )
    }

    pub fn new_with_timestamp_fn(
        broker: Arc<dyn BrokerClient>,
        store: Arc<dyn ActivityLogStore>,
        config: ProducerConfig,
        now_fn: Box<dyn Fn() -> i64 + Send + Sync>,
    ) -> Self {
        Self {
            broker,
            store,
            config,
            now_fn,
        }
    }

    /// Record one activity event, stamping it with the producer clock.
    pub async fn record_event(
        &self,
        event_type: EventType,
        payload: Value,
        origin: EventOrigin,
    ) -> Result<RecordOutcome, StoreError> {
        let event = Event::new(event_type, payload, (self.now_fn)(), origin);
        self.record(event).await
    }

    /// Record a pre-built event (timestamp already set by the caller).
    pub async fn record(&self, event: Event) -> Result<RecordOutcome, StoreError> {
        match self.publish_with_retry(&event).await {
            Ok(ack) => Ok(RecordOutcome::Published(ack)),
            Err(err) => {
                log::warn!(
                    "⚠️  Broker delivery failed ({}), falling back to direct store write",
                    err
                );
                let id = self.store.append(&event).await?;
                Ok(RecordOutcome::StoredDirect(id))
            }
        }
    }

    /// Bounded-retry publish under an overall timeout.
    async fn publish_with_retry(&self, event: &Event) -> Result<PublishAck, BrokerError> {
        let overall = Duration::from_millis(self.config.publish_timeout_ms);
        match timeout(overall, self.publish_attempts(event)).await {
            Ok(result) => result,
            Err(_) => Err(BrokerError::Timeout {
                timeout_ms: self.config.publish_timeout_ms,
            }),
        }
    }

    async fn publish_attempts(&self, event: &Event) -> Result<PublishAck, BrokerError> {
        let mut backoff = ExponentialBackoff::new(
            self.config.retry_initial_delay_ms,
            self.config.retry_max_delay_ms,
            self.config.max_attempts.saturating_sub(1),
        );
        let mut attempts = 0;

        loop {
            attempts += 1;
            match self.broker.publish(&self.config.topic, event.clone()).await {
                Ok(ack) => return Ok(ack),
                Err(BrokerError::Transient(reason)) => {
                    log::debug!(
                        "Publish attempt {} to '{}' failed: {}",
                        attempts,
                        self.config.topic,
                        reason
                    );
                    if backoff.sleep().await.is_err() {
                        return Err(BrokerError::DeliveryFailed {
                            topic: self.config.topic.clone(),
                            attempts,
                        });
                    }
                }
                Err(other) => return Err(other),
            }
        }
    }
}
