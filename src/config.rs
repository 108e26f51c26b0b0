//! Runtime configuration from environment variables.

use crate::broker::ProducerConfig;
use crate::consumer::sink::StoreSinkConfig;
use crate::consumer::ConsumerConfig;
use crate::etl::EtlConfig;
use std::env;

/// Configuration for the pipeline runtime.
///
/// Loaded from environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Path to the SQLite activity log database
    pub db_path: String,

    /// Topic events are published to
    pub topic: String,

    /// Consumer group for the live-stats consumer
    pub stats_group: String,

    /// Consumer group for the durable store sink
    pub persistence_group: String,

    /// Partitions per topic
    pub partitions: u32,

    /// Streaming window horizon in seconds
    pub window_horizon_secs: i64,

    /// Hard cap on events held in the window
    pub window_max_events: usize,

    /// Publish attempts before falling back to a direct durable write
    pub publish_max_attempts: u32,

    /// Overall bound on the publish leg in milliseconds
    pub publish_timeout_ms: u64,

    /// Consecutive poll failures before a consumer reports fatal
    pub fatal_failure_threshold: u32,

    /// ETL trigger interval in milliseconds
    pub etl_interval_ms: u64,

    /// Moving-average window for the daily series (days)
    pub sma_window: usize,

    /// Anomaly band width in standard deviations
    pub anomaly_k: f64,

    /// ETL load range in days; 0 means all-time
    pub etl_range_days: i64,

    /// Re-publish derived "processed" events
    pub republish_processed: bool,
}

impl RuntimeConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `EVENTFLOW_DB_PATH` (default: /var/lib/eventflow/eventflow.db)
    /// - `EVENTFLOW_TOPIC` (default: user_events)
    /// - `EVENTFLOW_PARTITIONS` (default: 4)
    /// - `WINDOW_HORIZON_SECS` (default: 300)
    /// - `WINDOW_MAX_EVENTS` (default: 10000)
    /// - `PUBLISH_MAX_ATTEMPTS` (default: 3)
    /// - `PUBLISH_TIMEOUT_MS` (default: 2000)
    /// - `FATAL_FAILURE_THRESHOLD` (default: 5)
    /// - `ETL_INTERVAL_MS` (default: 60000)
    /// - `ETL_SMA_WINDOW` (default: 7)
    /// - `ETL_ANOMALY_K` (default: 2.0)
    /// - `ETL_RANGE_DAYS` (default: 0, all-time)
    /// - `REPUBLISH_PROCESSED` (default: false)
    pub fn from_env() -> Self {
        Self {
            db_path: env::var("EVENTFLOW_DB_PATH")
                .unwrap_or_else(|_| "/var/lib/eventflow/eventflow.db".to_string()),

            topic: env::var("EVENTFLOW_TOPIC").unwrap_or_else(|_| "user_events".to_string()),

            stats_group: env::var("EVENTFLOW_STATS_GROUP")
                .unwrap_or_else(|_| "streaming_stats".to_string()),

            persistence_group: env::var("EVENTFLOW_PERSISTENCE_GROUP")
                .unwrap_or_else(|_| "persistence".to_string()),

            partitions: parse_env("EVENTFLOW_PARTITIONS", 4),

            window_horizon_secs: parse_env("WINDOW_HORIZON_SECS", 300),

            window_max_events: parse_env("WINDOW_MAX_EVENTS", 10_000),

            publish_max_attempts: parse_env("PUBLISH_MAX_ATTEMPTS", 3),

            publish_timeout_ms: parse_env("PUBLISH_TIMEOUT_MS", 2_000),

            fatal_failure_threshold: parse_env("FATAL_FAILURE_THRESHOLD", 5),

            etl_interval_ms: parse_env("ETL_INTERVAL_MS", 60_000),

            sma_window: parse_env("ETL_SMA_WINDOW", 7),

            anomaly_k: parse_env("ETL_ANOMALY_K", 2.0),

            etl_range_days: parse_env("ETL_RANGE_DAYS", 0),

            republish_processed: parse_env("REPUBLISH_PROCESSED", false),
        }
    }

    pub fn producer_config(&self) -> ProducerConfig {
        ProducerConfig {
            topic: self.topic.clone(),
            max_attempts: self.publish_max_attempts,
            publish_timeout_ms: self.publish_timeout_ms,
            ..Default::default()
        }
    }

    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            topic: self.topic.clone(),
            group: self.stats_group.clone(),
            window_horizon_secs: self.window_horizon_secs,
            window_max_events: self.window_max_events,
            fatal_failure_threshold: self.fatal_failure_threshold,
            republish_processed: self.republish_processed,
            ..Default::default()
        }
    }

    pub fn sink_config(&self) -> StoreSinkConfig {
        StoreSinkConfig {
            topic: self.topic.clone(),
            group: self.persistence_group.clone(),
            ..Default::default()
        }
    }

    pub fn etl_config(&self) -> EtlConfig {
        EtlConfig {
            sma_window: self.sma_window,
            anomaly_k: self.anomaly_k,
            default_range_days: (self.etl_range_days > 0).then_some(self.etl_range_days),
            ..Default::default()
        }
    }
}

fn parse_env<T: std::str::FromStr>(var: &str, default: T) -> T {
    env::var(var)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        env::remove_var("EVENTFLOW_DB_PATH");
        env::remove_var("EVENTFLOW_TOPIC");
        env::remove_var("ETL_RANGE_DAYS");

        let config = RuntimeConfig::from_env();

        assert_eq!(config.db_path, "/var/lib/eventflow/eventflow.db");
        assert_eq!(config.topic, "user_events");
        assert_eq!(config.partitions, 4);
        assert_eq!(config.window_horizon_secs, 300);
        assert_eq!(config.fatal_failure_threshold, 5);
        assert_eq!(config.etl_config().default_range_days, None);
    }

    #[test]
    fn test_custom_config() {
        env::set_var("EVENTFLOW_DB_PATH", "/tmp/test.db");
        env::set_var("WINDOW_HORIZON_SECS", "600");
        env::set_var("ETL_RANGE_DAYS", "30");

        let config = RuntimeConfig::from_env();

        assert_eq!(config.db_path, "/tmp/test.db");
        assert_eq!(config.window_horizon_secs, 600);
        assert_eq!(config.etl_config().default_range_days, Some(30));

        env::remove_var("EVENTFLOW_DB_PATH");
        env::remove_var("WINDOW_HORIZON_SECS");
        env::remove_var("ETL_RANGE_DAYS");
    }
}
