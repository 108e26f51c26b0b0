//! Durable append-only activity log.
//!
//! Every event that survives the broker fan-out lands here exactly once per
//! delivery (at-least-once overall). Rows are never mutated after insert;
//! the ETL engine reads bounded slices via indexed range scans.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryActivityStore;
pub use sqlite::SqliteActivityStore;

use crate::event::{Event, EventOrigin, EventType};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Durable projection of an [`Event`] plus surrogate id and ingestion time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityLogRow {
    pub id: i64,
    pub event_type: EventType,
    pub user_id: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub payload: Value,
    /// Event time as reported by the producer (unix seconds, UTC).
    pub timestamp: i64,
    /// Wall-clock time the row was appended (unix seconds, UTC).
    pub ingested_at: i64,
}

impl ActivityLogRow {
    pub fn from_event(id: i64, event: &Event, ingested_at: i64) -> Self {
        Self {
            id,
            event_type: event.event_type,
            user_id: event.origin.user_id.clone(),
            ip_address: event.origin.ip_address.clone(),
            user_agent: event.origin.user_agent.clone(),
            payload: event.payload.clone(),
            timestamp: event.timestamp,
            ingested_at,
        }
    }

    pub fn origin(&self) -> EventOrigin {
        EventOrigin {
            user_id: self.user_id.clone(),
            ip_address: self.ip_address.clone(),
            user_agent: self.user_agent.clone(),
        }
    }

    /// Stable identity used by the ETL stages: user id, else IP fallback.
    pub fn user_key(&self) -> String {
        if let Some(user_id) = &self.user_id {
            format!("user:{}", user_id)
        } else if let Some(ip) = &self.ip_address {
            format!("anon:{}", ip)
        } else {
            "anon:unknown".to_string()
        }
    }
}

#[derive(Debug)]
pub enum StoreError {
    /// Durable write or read failed. The event handed to `append` is NOT
    /// silently lost; the caller decides retry or drop.
    Unavailable(String),
    Serialization(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Unavailable(reason) => write!(f, "Activity store unavailable: {}", reason),
            StoreError::Serialization(reason) => {
                write!(f, "Activity row serialization failed: {}", reason)
            }
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// Capability trait over the durable activity log.
///
/// Backed by SQLite in the runtime and by a Vec in deterministic tests.
#[async_trait]
pub trait ActivityLogStore: Send + Sync {
    /// Append one event, returning the surrogate row id.
    async fn append(&self, event: &Event) -> Result<i64, StoreError>;

    /// Rows with `start_ts <= timestamp < end_ts`, ascending by timestamp.
    async fn query_range(&self, start_ts: i64, end_ts: i64)
        -> Result<Vec<ActivityLogRow>, StoreError>;

    /// Recent rows for one user, most recent first.
    async fn query_by_user(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<ActivityLogRow>, StoreError>;

    /// Most recent rows across all origins, most recent first.
    async fn recent(&self, limit: usize) -> Result<Vec<ActivityLogRow>, StoreError>;

    async fn count(&self) -> Result<u64, StoreError>;
}
