//! In-memory activity log for deterministic tests and as the durable-write
//! fault-injection point.

use super::{ActivityLogRow, ActivityLogStore, StoreError};
use crate::event::Event;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

pub struct MemoryActivityStore {
    rows: Mutex<Vec<ActivityLogRow>>,
    next_id: AtomicU64,
    fail_appends: AtomicU32,
    now_fn: Box<dyn Fn() -> i64 + Send + Sync>,
}

impl Default for MemoryActivityStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryActivityStore {
    pub fn new() -> Self {
        Self::new_with_timestamp_fn(Box::new(|| chrono::Utc::now().timestamp()))
    }

    pub fn new_with_timestamp_fn(now_fn: Box<dyn Fn() -> i64 + Send + Sync>) -> Self {
        Self {
            rows: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            fail_appends: AtomicU32::new(0),
            now_fn,
        }
    }

    /// Make the next `n` appends fail with `StoreError::Unavailable`.
    pub fn fail_next_appends(&self, n: u32) {
        self.fail_appends.store(n, Ordering::SeqCst);
    }

    fn take_failure(&self) -> bool {
        self.fail_appends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ActivityLogStore for MemoryActivityStore {
    async fn append(&self, event: &Event) -> Result<i64, StoreError> {
        if self.take_failure() {
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) as i64;
        let row = ActivityLogRow::from_event(id, event, (self.now_fn)());
        self.rows.lock().unwrap().push(row);
        Ok(id)
    }

    async fn query_range(
        &self,
        start_ts: i64,
        end_ts: i64,
    ) -> Result<Vec<ActivityLogRow>, StoreError> {
        let mut rows: Vec<ActivityLogRow> = self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.timestamp >= start_ts && r.timestamp < end_ts)
            .cloned()
            .collect();
        rows.sort_by_key(|r| (r.timestamp, r.id));
        Ok(rows)
    }

    async fn query_by_user(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<ActivityLogRow>, StoreError> {
        let mut rows: Vec<ActivityLogRow> = self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.user_id.as_deref() == Some(user_id))
            .cloned()
            .collect();
        rows.sort_by_key(|r| (std::cmp::Reverse(r.timestamp), std::cmp::Reverse(r.id)));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn recent(&self, limit: usize) -> Result<Vec<ActivityLogRow>, StoreError> {
        let mut rows: Vec<ActivityLogRow> = self.rows.lock().unwrap().clone();
        rows.sort_by_key(|r| (std::cmp::Reverse(r.timestamp), std::cmp::Reverse(r.id)));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn count(&self) -> Result<u64, StoreError> {
        Ok(self.rows.lock().unwrap().len() as u64)
    }
}
