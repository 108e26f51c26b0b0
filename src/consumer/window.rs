//! Rolling time window over recently consumed events.
//!
//! Owned exclusively by one consumer task. Readers never touch the live
//! window; after each processed batch the consumer swaps in a fresh
//! immutable [`WindowSnapshot`] behind an `Arc`, so a concurrent reader sees
//! either the previous or the next complete view, never a half-updated one.
//! The window is advisory: it is rebuilt empty on restart and exact counts
//! must be recomputed from the activity log.

use crate::event::Event;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};

#[derive(Debug)]
pub struct StreamingWindow {
    horizon_secs: i64,
    max_events: usize,
    events: VecDeque<Event>,
    counts_by_type: HashMap<String, u64>,
    counts_by_origin: HashMap<String, u64>,
}

impl StreamingWindow {
    pub fn new(horizon_secs: i64, max_events: usize) -> Self {
        Self {
            horizon_secs,
            max_events,
            events: VecDeque::new(),
            counts_by_type: HashMap::new(),
            counts_by_origin: HashMap::new(),
        }
    }

    pub fn add_event(&mut self, event: Event) {
        *self
            .counts_by_type
            .entry(event.event_type.as_str().to_string())
            .or_insert(0) += 1;
        *self
            .counts_by_origin
            .entry(event.origin.key())
            .or_insert(0) += 1;
        self.events.push_back(event);

        if self.events.len() > self.max_events {
            self.events.pop_front();
            self.recalculate();
        }
    }

    /// Drop events older than the horizon, measured from `now`.
    pub fn evict_older_than(&mut self, now: i64) {
        let cutoff = now - self.horizon_secs;
        let before = self.events.len();
        self.events.retain(|e| e.timestamp > cutoff);
        if self.events.len() != before {
            self.recalculate();
        }
    }

    fn recalculate(&mut self) {
        self.counts_by_type.clear();
        self.counts_by_origin.clear();
        for event in &self.events {
            *self
                .counts_by_type
                .entry(event.event_type.as_str().to_string())
                .or_insert(0) += 1;
            *self
                .counts_by_origin
                .entry(event.origin.key())
                .or_insert(0) += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Build an immutable point-in-time copy for readers.
    pub fn snapshot(&self, now: i64, poison_count: u64) -> WindowSnapshot {
        WindowSnapshot {
            counts_by_type: self.counts_by_type.clone(),
            counts_by_origin: self.counts_by_origin.clone(),
            window_start: now - self.horizon_secs,
            window_end: now,
            total_events: self.events.len() as u64,
            poison_count,
            events: self.events.iter().cloned().collect(),
        }
    }
}

/// Immutable view of the window at one instant.
#[derive(Debug, Clone, Serialize)]
pub struct WindowSnapshot {
    pub counts_by_type: HashMap<String, u64>,
    pub counts_by_origin: HashMap<String, u64>,
    pub window_start: i64,
    pub window_end: i64,
    pub total_events: u64,
    pub poison_count: u64,
    /// Events currently inside the window, oldest first.
    pub events: Vec<Event>,
}

impl WindowSnapshot {
    pub fn empty() -> Self {
        Self {
            counts_by_type: HashMap::new(),
            counts_by_origin: HashMap::new(),
            window_start: 0,
            window_end: 0,
            total_events: 0,
            poison_count: 0,
            events: Vec::new(),
        }
    }

    /// Most recent events first, bounded by `limit`.
    pub fn recent_events(&self, limit: usize) -> Vec<Event> {
        let mut events: Vec<Event> = self.events.clone();
        events.sort_by_key(|e| std::cmp::Reverse(e.timestamp));
        events.truncate(limit);
        events
    }
}

/// Shared handle readers use to fetch the latest snapshot. The consumer task
/// swaps the inner `Arc` whole; readers clone it and drop the lock.
pub type SharedSnapshot = Arc<RwLock<Arc<WindowSnapshot>>>;

pub fn new_shared_snapshot() -> SharedSnapshot {
    Arc::new(RwLock::new(Arc::new(WindowSnapshot::empty())))
}

pub fn publish_snapshot(shared: &SharedSnapshot, snapshot: WindowSnapshot) {
    *shared.write().unwrap() = Arc::new(snapshot);
}

pub fn read_snapshot(shared: &SharedSnapshot) -> Arc<WindowSnapshot> {
    shared.read().unwrap().clone()
}
