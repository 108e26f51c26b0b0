//! In-memory partitioned broker.
//!
//! The deterministic implementation behind [`BrokerClient`]: fixed partition
//! count per topic, offset = index into the partition log, per-group
//! pending/committed cursors. Fault-injection counters let tests exercise
//! the transient-failure and delivery-failure paths without a live broker.

use super::{BrokerClient, BrokerError, BrokerHealth, PolledEvent, PublishAck};
use crate::event::Event;
use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

struct GroupCursor {
    committed: Vec<u64>,
    pending: Vec<u64>,
}

impl GroupCursor {
    fn new(partitions: usize) -> Self {
        Self {
            committed: vec![0; partitions],
            pending: vec![0; partitions],
        }
    }
}

struct TopicState {
    partitions: Vec<Vec<Event>>,
    cursors: HashMap<String, GroupCursor>,
}

impl TopicState {
    fn new(partition_count: u32) -> Self {
        Self {
            partitions: (0..partition_count).map(|_| Vec::new()).collect(),
            cursors: HashMap::new(),
        }
    }

    fn log_end_total(&self) -> u64 {
        self.partitions.iter().map(|p| p.len() as u64).sum()
    }
}

pub struct InMemoryBroker {
    topics: Mutex<HashMap<String, TopicState>>,
    partition_count: u32,
    reachable: AtomicBool,
    fail_publishes: AtomicU32,
    fail_polls: AtomicU32,
}

impl InMemoryBroker {
    pub fn new(partition_count: u32) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            partition_count: partition_count.max(1),
            reachable: AtomicBool::new(true),
            fail_publishes: AtomicU32::new(0),
            fail_polls: AtomicU32::new(0),
        }
    }

    /// Make the next `n` publishes fail with a transient error.
    pub fn fail_next_publishes(&self, n: u32) {
        self.fail_publishes.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` polls fail with a transient error.
    pub fn fail_next_polls(&self, n: u32) {
        self.fail_polls.store(n, Ordering::SeqCst);
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    fn partition_for(&self, key: &str) -> u32 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.partition_count as u64) as u32
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(4)
    }
}

#[async_trait]
impl BrokerClient for InMemoryBroker {
    async fn publish(&self, topic: &str, event: Event) -> Result<PublishAck, BrokerError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(BrokerError::Transient("broker unreachable".to_string()));
        }
        if Self::take_failure(&self.fail_publishes) {
            return Err(BrokerError::Transient("injected publish failure".to_string()));
        }

        let partition = self.partition_for(&event.partition_key());

        let mut topics = self.topics.lock().unwrap();
        let state = topics
            .entry(topic.to_string())
            .or_insert_with(|| TopicState::new(self.partition_count));

        let log = &mut state.partitions[partition as usize];
        let offset = log.len() as u64;
        log.push(event);

        Ok(PublishAck {
            topic: topic.to_string(),
            partition,
            offset,
        })
    }

    async fn poll(
        &self,
        topic: &str,
        group: &str,
        max_events: usize,
    ) -> Result<Vec<PolledEvent>, BrokerError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(BrokerError::Transient("broker unreachable".to_string()));
        }
        if Self::take_failure(&self.fail_polls) {
            return Err(BrokerError::Transient("injected poll failure".to_string()));
        }

        let partition_count = self.partition_count as usize;
        let mut topics = self.topics.lock().unwrap();
        let state = topics
            .entry(topic.to_string())
            .or_insert_with(|| TopicState::new(self.partition_count));

        // Split borrows: the cursor advances while partitions are read.
        let TopicState {
            partitions,
            cursors,
        } = state;
        let cursor = cursors
            .entry(group.to_string())
            .or_insert_with(|| GroupCursor::new(partition_count));

        // Round-robin across partitions so one hot partition cannot starve
        // the rest of the batch.
        let mut delivered = Vec::new();
        let mut exhausted = false;
        while delivered.len() < max_events && !exhausted {
            exhausted = true;
            for partition in 0..partition_count {
                if delivered.len() >= max_events {
                    break;
                }
                let position = cursor.pending[partition] as usize;
                if let Some(event) = partitions[partition].get(position) {
                    delivered.push(PolledEvent {
                        partition: partition as u32,
                        offset: position as u64,
                        event: event.clone(),
                    });
                    cursor.pending[partition] += 1;
                    exhausted = false;
                }
            }
        }

        Ok(delivered)
    }

    async fn commit(&self, topic: &str, group: &str) -> Result<(), BrokerError> {
        let mut topics = self.topics.lock().unwrap();
        if let Some(state) = topics.get_mut(topic) {
            if let Some(cursor) = state.cursors.get_mut(group) {
                cursor.committed = cursor.pending.clone();
            }
        }
        Ok(())
    }

    async fn resubscribe(&self, topic: &str, group: &str) -> Result<(), BrokerError> {
        let mut topics = self.topics.lock().unwrap();
        let state = topics
            .entry(topic.to_string())
            .or_insert_with(|| TopicState::new(self.partition_count));
        let partitions = state.partitions.len();
        let cursor = state
            .cursors
            .entry(group.to_string())
            .or_insert_with(|| GroupCursor::new(partitions));
        cursor.pending = cursor.committed.clone();
        Ok(())
    }

    async fn reset_cursor(&self, topic: &str, group: &str) -> Result<(), BrokerError> {
        let mut topics = self.topics.lock().unwrap();
        if let Some(state) = topics.get_mut(topic) {
            let partitions = state.partitions.len();
            state
                .cursors
                .insert(group.to_string(), GroupCursor::new(partitions));
        }
        Ok(())
    }

    async fn health(&self) -> BrokerHealth {
        let topics = self.topics.lock().unwrap();
        let mut lag_per_topic = HashMap::new();

        for (name, state) in topics.iter() {
            let log_end = state.log_end_total();
            // Max backlog across groups; a topic nobody subscribes to counts
            // everything as lag.
            let lag = if state.cursors.is_empty() {
                log_end
            } else {
                state
                    .cursors
                    .values()
                    .map(|c| log_end - c.committed.iter().sum::<u64>())
                    .max()
                    .unwrap_or(0)
            };
            lag_per_topic.insert(name.clone(), lag);
        }

        BrokerHealth {
            reachable: self.reachable.load(Ordering::SeqCst),
            lag_per_topic,
        }
    }
}
