//! Canonical event model shared by producers, the broker, and the store.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of activity event flowing through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    UserRegistered,
    UserLogin,
    LoginFailed,
    Logout,
    ApiCall,
    SystemEvent,
    #[serde(other)]
    Unknown,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::UserRegistered => "user_registered",
            EventType::UserLogin => "user_login",
            EventType::LoginFailed => "login_failed",
            EventType::Logout => "logout",
            EventType::ApiCall => "api_call",
            EventType::SystemEvent => "system_event",
            EventType::Unknown => "unknown",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "user_registered" => Some(EventType::UserRegistered),
            "user_login" => Some(EventType::UserLogin),
            "login_failed" => Some(EventType::LoginFailed),
            "logout" => Some(EventType::Logout),
            "api_call" => Some(EventType::ApiCall),
            "system_event" => Some(EventType::SystemEvent),
            _ => None,
        }
    }

    pub fn all() -> [EventType; 6] {
        [
            EventType::UserRegistered,
            EventType::UserLogin,
            EventType::LoginFailed,
            EventType::Logout,
            EventType::ApiCall,
            EventType::SystemEvent,
        ]
    }

    /// Engagement weight used by the ETL monetary/engagement proxy.
    ///
    /// Registration and successful logins weigh more than background API
    /// traffic; failed logins contribute nothing.
    pub fn engagement_weight(&self) -> f64 {
        match self {
            EventType::UserRegistered => 2.0,
            EventType::UserLogin => 1.0,
            EventType::Logout => 0.5,
            EventType::ApiCall => 0.25,
            EventType::SystemEvent => 0.1,
            EventType::LoginFailed | EventType::Unknown => 0.0,
        }
    }
}

/// Identity of the producer that emitted an event.
///
/// At least one of the fields is expected to be present; `key()` collapses
/// the origin into a stable string used for partitioning and per-origin
/// counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventOrigin {
    pub user_id: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl EventOrigin {
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Default::default()
        }
    }

    pub fn anonymous(ip_address: impl Into<String>) -> Self {
        Self {
            ip_address: Some(ip_address.into()),
            ..Default::default()
        }
    }

    /// Stable identity string: user id wins over IP address.
    pub fn key(&self) -> String {
        if let Some(user_id) = &self.user_id {
            format!("user:{}", user_id)
        } else if let Some(ip) = &self.ip_address {
            format!("ip:{}", ip)
        } else {
            "unknown".to_string()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.user_id.is_none() && self.ip_address.is_none() && self.user_agent.is_none()
    }
}

/// Immutable activity event.
///
/// Timestamps are unix seconds (UTC) and are monotonic non-decreasing per
/// producer, but NOT globally ordered across producers. Consumers evict by
/// event timestamp, so bounded arrival skew is tolerated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_type: EventType,
    /// Arbitrary JSON object with event-specific fields.
    pub payload: Value,
    pub timestamp: i64,
    pub origin: EventOrigin,
}

/// Why an event was rejected as poison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoisonReason {
    PayloadNotObject,
    NonPositiveTimestamp,
    UnknownEventType,
}

impl std::fmt::Display for PoisonReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoisonReason::PayloadNotObject => write!(f, "payload is not a JSON object"),
            PoisonReason::NonPositiveTimestamp => write!(f, "timestamp is not positive"),
            PoisonReason::UnknownEventType => write!(f, "unknown event type"),
        }
    }
}

impl Event {
    pub fn new(event_type: EventType, payload: Value, timestamp: i64, origin: EventOrigin) -> Self {
        Self {
            event_type,
            payload,
            timestamp,
            origin,
        }
    }

    /// Partition key: events from the same origin stay in one partition,
    /// preserving their relative order.
    pub fn partition_key(&self) -> String {
        self.origin.key()
    }

    /// Classify malformed events before they reach a window or the store.
    pub fn validate(&self) -> Result<(), PoisonReason> {
        if self.event_type == EventType::Unknown {
            return Err(PoisonReason::UnknownEventType);
        }
        if !self.payload.is_object() {
            return Err(PoisonReason::PayloadNotObject);
        }
        if self.timestamp <= 0 {
            return Err(PoisonReason::NonPositiveTimestamp);
        }
        Ok(())
    }
}
