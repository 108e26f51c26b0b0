//! Read-only analytics facade for the dashboard/API layer.
//!
//! Merges the live window snapshot (stream consumer) with the latest
//! completed frame per job (ETL engine). Reads never block the consumer or
//! a running ETL job: snapshots and frames are Arc reads. Derived queries
//! answer with an explicit not-yet-computed state until the first run
//! completes instead of fabricating zeros.

use crate::broker::{BrokerClient, BrokerHealth};
use crate::consumer::ConsumerView;
use crate::etl::{AnalyticsFrame, DailyPoint, EtlEngine, EtlError, EtlParams, JobStatus};
use crate::event::Event;
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Result of a derived-analytics query.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", content = "data", rename_all = "snake_case")]
pub enum QueryOutcome<T> {
    Ready(T),
    /// No ETL run has ever completed for the backing job.
    NotYetComputed,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamingStats {
    pub counts_by_type: HashMap<String, u64>,
    pub counts_by_origin: HashMap<String, u64>,
    pub window_start: i64,
    pub window_end: i64,
    pub total_events: u64,
    pub poison_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SegmentEntry {
    pub segment_label: String,
    pub recency_days: i64,
    pub frequency: u64,
    pub engagement: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeSeriesPoint {
    pub date: NaiveDate,
    pub value: u64,
    pub is_anomaly: bool,
}

pub struct AnalyticsService {
    consumer: ConsumerView,
    etl: Arc<EtlEngine>,
    broker: Arc<dyn BrokerClient>,
    /// Job whose frame backs the derived queries.
    default_job: String,
}

impl AnalyticsService {
    pub fn new(
        consumer: ConsumerView,
        etl: Arc<EtlEngine>,
        broker: Arc<dyn BrokerClient>,
        default_job: impl Into<String>,
    ) -> Self {
        Self {
            consumer,
            etl,
            broker,
            default_job: default_job.into(),
        }
    }

    /// Live counters over the current streaming window.
    pub fn streaming_stats(&self) -> StreamingStats {
        let snapshot = self.consumer.snapshot();
        StreamingStats {
            counts_by_type: snapshot.counts_by_type.clone(),
            counts_by_origin: snapshot.counts_by_origin.clone(),
            window_start: snapshot.window_start,
            window_end: snapshot.window_end,
            total_events: snapshot.total_events,
            poison_count: snapshot.poison_count,
        }
    }

    /// Recent events from the live window, most recent first.
    pub fn recent_events(&self, limit: usize) -> Vec<Event> {
        self.consumer.snapshot().recent_events(limit)
    }

    /// Per-user segmentation from the latest completed frame.
    pub fn segmentation(&self) -> QueryOutcome<BTreeMap<String, SegmentEntry>> {
        match self.etl.latest_frame(&self.default_job) {
            Some(frame) => QueryOutcome::Ready(
                frame
                    .users
                    .iter()
                    .map(|(user_key, metrics)| {
                        (
                            user_key.clone(),
                            SegmentEntry {
                                segment_label: metrics.segment_label.clone(),
                                recency_days: metrics.recency_days,
                                frequency: metrics.frequency,
                                engagement: metrics.engagement,
                            },
                        )
                    })
                    .collect(),
            ),
            None => QueryOutcome::NotYetComputed,
        }
    }

    /// Per-user churn risk in [0, 1]; `None` entries are undetermined
    /// (too little history), preserved rather than faked.
    pub fn churn_insights(&self) -> QueryOutcome<BTreeMap<String, Option<f64>>> {
        match self.etl.latest_frame(&self.default_job) {
            Some(frame) => QueryOutcome::Ready(
                frame
                    .users
                    .iter()
                    .map(|(user_key, metrics)| (user_key.clone(), metrics.churn_risk))
                    .collect(),
            ),
            None => QueryOutcome::NotYetComputed,
        }
    }

    /// Daily series for a metric, optionally bounded to an inclusive date
    /// range. `activity` (event counts per day) is the only metric computed
    /// today; unknown names answer with an empty series and a warning.
    pub fn time_series(
        &self,
        metric: &str,
        range: Option<(NaiveDate, NaiveDate)>,
    ) -> QueryOutcome<Vec<TimeSeriesPoint>> {
        match self.etl.latest_frame(&self.default_job) {
            Some(frame) => {
                if metric != "activity" {
                    log::warn!("⚠️  Unknown time-series metric '{}'", metric);
                    return QueryOutcome::Ready(Vec::new());
                }
                QueryOutcome::Ready(
                    frame
                        .series
                        .iter()
                        .filter(|point| in_range(point, range))
                        .map(|point| TimeSeriesPoint {
                            date: point.date,
                            value: point.value,
                            is_anomaly: point.is_anomaly,
                        })
                        .collect(),
                )
            }
            None => QueryOutcome::NotYetComputed,
        }
    }

    /// Full frame access for report export.
    pub fn latest_frame(&self, job_name: &str) -> Option<Arc<AnalyticsFrame>> {
        self.etl.latest_frame(job_name)
    }

    /// Trigger an asynchronous ETL run.
    pub fn run_batch_job(&self, job_name: &str, params: EtlParams) -> Result<String, EtlError> {
        self.etl.run_job(job_name, params)
    }

    pub fn job_status(&self, job_id: &str) -> Option<JobStatus> {
        self.etl.job_status(job_id)
    }

    pub async fn broker_health(&self) -> BrokerHealth {
        self.broker.health().await
    }
}

fn in_range(point: &DailyPoint, range: Option<(NaiveDate, NaiveDate)>) -> bool {
    match range {
        Some((start, end)) => point.date >= start && point.date <= end,
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::consumer::{ConsumerConfig, ConsumerManager};
    use crate::etl::{EtlConfig, DEFAULT_JOB_NAME};
    use crate::event::{EventOrigin, EventType};
    use crate::store::{ActivityLogStore, MemoryActivityStore};
    use serde_json::json;

    const DAY: i64 = crate::etl::features::SECONDS_PER_DAY;

    async fn service_with_data(
        reference: i64,
    ) -> (AnalyticsService, Arc<InMemoryBroker>, ConsumerManager) {
        let broker = Arc::new(InMemoryBroker::new(4));
        let store = Arc::new(MemoryActivityStore::new_with_timestamp_fn(Box::new(
            move || reference,
        )));
        for day in [10, 5, 1] {
            let event = Event::new(
                EventType::UserLogin,
                json!({}),
                reference - day * DAY,
                EventOrigin::user("alice"),
            );
            store.append(&event).await.unwrap();
        }

        let manager = ConsumerManager::new(broker.clone());
        manager
            .start_with_timestamp_fn(
                ConsumerConfig {
                    poll_interval_ms: 5,
                    ..Default::default()
                },
                Box::new(move || reference),
            )
            .await;
        let view = manager.view("user_events", "streaming_stats").await.unwrap();

        let etl = Arc::new(EtlEngine::new_with_timestamp_fn(
            store,
            EtlConfig::default(),
            Box::new(move || reference),
        ));

        let service = AnalyticsService::new(view, etl, broker.clone(), DEFAULT_JOB_NAME);
        (service, broker, manager)
    }

    #[tokio::test]
    async fn test_not_yet_computed_before_first_run() {
        let (service, _broker, _manager) = service_with_data(1_000 * DAY).await;

        assert_eq!(service.segmentation(), QueryOutcome::NotYetComputed);
        assert_eq!(service.churn_insights(), QueryOutcome::NotYetComputed);
        assert_eq!(service.time_series("activity", None), QueryOutcome::NotYetComputed);
    }

    #[tokio::test]
    async fn test_ready_after_completed_run() {
        let reference = 1_000 * DAY;
        let (service, _broker, _manager) = service_with_data(reference).await;

        let job_id = service
            .run_batch_job(DEFAULT_JOB_NAME, EtlParams::default())
            .unwrap();
        for _ in 0..100 {
            if service.job_status(&job_id) == Some(JobStatus::Succeeded) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(service.job_status(&job_id), Some(JobStatus::Succeeded));

        let QueryOutcome::Ready(segments) = service.segmentation() else {
            panic!("expected segmentation to be ready");
        };
        assert!(segments.contains_key("user:alice"));

        let QueryOutcome::Ready(churn) = service.churn_insights() else {
            panic!("expected churn to be ready");
        };
        let alice = churn["user:alice"].unwrap();
        assert!((0.0..=1.0).contains(&alice));

        let QueryOutcome::Ready(series) = service.time_series("activity", None) else {
            panic!("expected series to be ready");
        };
        assert_eq!(series.len(), 3);
    }

    #[tokio::test]
    async fn test_time_series_range_filter() {
        let reference = 1_000 * DAY;
        let (service, _broker, _manager) = service_with_data(reference).await;
        let job_id = service
            .run_batch_job(DEFAULT_JOB_NAME, EtlParams::default())
            .unwrap();
        for _ in 0..100 {
            if service.job_status(&job_id) == Some(JobStatus::Succeeded) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let QueryOutcome::Ready(all) = service.time_series("activity", None) else {
            panic!("series not ready");
        };
        let last_date = all.last().unwrap().date;
        let QueryOutcome::Ready(bounded) =
            service.time_series("activity", Some((last_date, last_date)))
        else {
            panic!("series not ready");
        };
        assert_eq!(bounded.len(), 1);
        assert_eq!(bounded[0].date, last_date);
    }

    #[tokio::test]
    async fn test_streaming_stats_reflect_live_window() {
        let reference = 1_000 * DAY;
        let (service, broker, _manager) = service_with_data(reference).await;

        let event = Event::new(
            EventType::UserLogin,
            json!({}),
            reference - 10,
            EventOrigin::user("live"),
        );
        broker.publish("user_events", event.clone()).await.unwrap();

        for _ in 0..100 {
            if service.streaming_stats().total_events == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let stats = service.streaming_stats();
        assert_eq!(stats.counts_by_type["user_login"], 1);
        assert_eq!(stats.counts_by_origin["user:live"], 1);

        let recent = service.recent_events(5);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0], event);
    }

    #[tokio::test]
    async fn test_broker_health_passthrough() {
        let (service, broker, _manager) = service_with_data(1_000 * DAY).await;
        assert!(service.broker_health().await.reachable);
        broker.set_reachable(false);
        assert!(!service.broker_health().await.reachable);
    }
}
