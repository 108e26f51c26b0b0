//! Topic broker client.
//!
//! Producers publish events to named topics; background consumers pull them
//! in partition order. The broker is a capability seam: the runtime wires the
//! in-memory implementation, and an external broker can be dropped in behind
//! the same trait without touching consumers.
//!
//! Delivery contract:
//! - FIFO within a partition, no ordering across partitions
//! - per-(topic, consumer-group) cursor, committed explicitly; a restarted
//!   consumer resumes from the last committed offset unless reset
//! - publish is fire-and-forget with bounded retry; exhausted retries surface
//!   `DeliveryFailed` and the caller decides on a durable-store fallback

pub mod memory;
pub mod producer;

pub use memory::InMemoryBroker;
pub use producer::{EventProducer, ProducerConfig, RecordOutcome};

use crate::event::Event;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug)]
pub enum BrokerError {
    /// Retryable: broker momentarily unreachable or overloaded.
    Transient(String),
    /// Publish retries exhausted; the event was not accepted.
    DeliveryFailed { topic: String, attempts: u32 },
    /// The bounded publish timeout elapsed.
    Timeout { timeout_ms: u64 },
}

impl std::fmt::Display for BrokerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrokerError::Transient(reason) => write!(f, "Transient broker error: {}", reason),
            BrokerError::DeliveryFailed { topic, attempts } => write!(
                f,
                "Delivery to topic '{}' failed after {} attempts",
                topic, attempts
            ),
            BrokerError::Timeout { timeout_ms } => {
                write!(f, "Broker publish timed out after {}ms", timeout_ms)
            }
        }
    }
}

impl std::error::Error for BrokerError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishAck {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
}

/// One delivered event plus its position, for commit bookkeeping upstream.
#[derive(Debug, Clone)]
pub struct PolledEvent {
    pub partition: u32,
    pub offset: u64,
    pub event: Event,
}

#[derive(Debug, Clone, Serialize)]
pub struct BrokerHealth {
    pub reachable: bool,
    /// Uncommitted backlog per topic: log end minus committed cursor,
    /// summed over partitions, max across consumer groups.
    pub lag_per_topic: HashMap<String, u64>,
}

/// Capability interface over the broker: publish, subscribe (pull), cursor
/// commit, health. One in-memory implementation ships with the crate for
/// deterministic tests and single-process deployments.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Append an event to the topic, choosing a partition from the event's
    /// partition key. Topics are created on first use.
    async fn publish(&self, topic: &str, event: Event) -> Result<PublishAck, BrokerError>;

    /// Pull up to `max_events` events for a consumer group, round-robin over
    /// partitions, advancing the group's pending position. Events within one
    /// partition arrive in order.
    async fn poll(
        &self,
        topic: &str,
        group: &str,
        max_events: usize,
    ) -> Result<Vec<PolledEvent>, BrokerError>;

    /// Promote the group's pending position to committed. Uncommitted events
    /// are redelivered to a fresh subscription after a restart.
    async fn commit(&self, topic: &str, group: &str) -> Result<(), BrokerError>;

    /// Begin (or resume) a subscription: the group's read position rewinds
    /// to its last committed cursor, redelivering anything polled but never
    /// committed. Called by a consumer task on startup.
    async fn resubscribe(&self, topic: &str, group: &str) -> Result<(), BrokerError>;

    /// Rewind the group to the beginning of the topic for explicit
    /// reprocessing.
    async fn reset_cursor(&self, topic: &str, group: &str) -> Result<(), BrokerError>;

    async fn health(&self) -> BrokerHealth;
}
