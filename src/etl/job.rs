//! ETL job runner.
//!
//! One job name maps to at most one in-flight run: a request while a run is
//! active is rejected with [`EtlError::JobBusy`] (the documented policy;
//! requests are not queued). A completed frame replaces the previous one for
//! that job under a single write-lock swap, so readers always see a whole
//! frame. Cancellation is cooperative and checked between stages, never
//! mid-row.

use crate::etl::churn::churn_score;
use crate::etl::clean::{clean_rows, CleanRow};
use crate::etl::features::derive_user_features;
use crate::etl::frame::{top_email_domains, AnalyticsFrame, FrameSummary, UserMetrics};
use crate::etl::segmentation::segment_users;
use crate::etl::timeseries::daily_series;
use crate::store::{ActivityLogStore, StoreError};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

pub const DEFAULT_JOB_NAME: &str = "daily_analytics";

#[derive(Debug, Clone)]
pub struct EtlConfig {
    /// Rows with the same (origin, event type) within this many seconds
    /// collapse to the first.
    pub dedup_tolerance_secs: i64,
    pub sma_window: usize,
    pub anomaly_k: f64,
    /// Default load range; `None` loads all-time.
    pub default_range_days: Option<i64>,
}

impl Default for EtlConfig {
    fn default() -> Self {
        Self {
            dedup_tolerance_secs: 2,
            sma_window: 7,
            anomaly_k: 2.0,
            default_range_days: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EtlParams {
    /// Override the load range for this run.
    pub last_n_days: Option<i64>,
    /// Anchor timestamp; defaults to now at submission. Pinning it makes a
    /// run reproducible.
    pub reference_ts: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub job_id: String,
    pub job_name: String,
    pub status: JobStatus,
    pub submitted_at: i64,
    pub finished_at: Option<i64>,
    pub error: Option<String>,
}

#[derive(Debug)]
pub enum EtlError {
    /// A run for this job name is already in progress.
    JobBusy(String),
    Cancelled,
    Store(StoreError),
}

impl std::fmt::Display for EtlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EtlError::JobBusy(job) => write!(f, "ETL job '{}' is already running", job),
            EtlError::Cancelled => write!(f, "ETL run cancelled"),
            EtlError::Store(err) => write!(f, "ETL load failed: {}", err),
        }
    }
}

impl std::error::Error for EtlError {}

impl From<StoreError> for EtlError {
    fn from(err: StoreError) -> Self {
        EtlError::Store(err)
    }
}

pub struct EtlEngine {
    store: Arc<dyn ActivityLogStore>,
    config: EtlConfig,
    /// Latest completed frame per job name; swapped whole.
    frames: RwLock<HashMap<String, Arc<AnalyticsFrame>>>,
    jobs: Mutex<HashMap<String, JobRecord>>,
    /// Presence means the job name is running; the flag requests cancel.
    running: Mutex<HashMap<String, Arc<AtomicBool>>>,
    now_fn: Box<dyn Fn() -> i64 + Send + Sync>,
}

impl EtlEngine {
    pub fn new(store: Arc<dyn ActivityLogStore>, config: EtlConfig) -> Self {
        Self::new_with_timestamp_fn(store, config, Box::new(|| chrono::Utc::now().timestamp()))
    }

    pub fn new_with_timestamp_fn(
        store: Arc<dyn ActivityLogStore>,
        config: EtlConfig,
        now_fn: Box<dyn Fn() -> i64 + Send + Sync>,
    ) -> Self {
        Self {
            store,
            config,
            frames: RwLock::new(HashMap::new()),
            jobs: Mutex::new(HashMap::new()),
            running: Mutex::new(HashMap::new()),
            now_fn,
        }
    }

    /// Trigger an asynchronous run. Returns the job id immediately, or
    /// `JobBusy` while a run for the same name is in flight.
    pub fn run_job(self: &Arc<Self>, job_name: &str, params: EtlParams) -> Result<String, EtlError> {
        let cancel = Arc::new(AtomicBool::new(false));
        {
            let mut running = self.running.lock().unwrap();
            if running.contains_key(job_name) {
                return Err(EtlError::JobBusy(job_name.to_string()));
            }
            running.insert(job_name.to_string(), cancel.clone());
        }

        let job_id = uuid::Uuid::new_v4().to_string();
        let submitted_at = (self.now_fn)();
        self.jobs.lock().unwrap().insert(
            job_id.clone(),
            JobRecord {
                job_id: job_id.clone(),
                job_name: job_name.to_string(),
                status: JobStatus::Pending,
                submitted_at,
                finished_at: None,
                error: None,
            },
        );

        let engine = self.clone();
        let name = job_name.to_string();
        let id = job_id.clone();
        tokio::spawn(async move {
            engine.set_job_status(&id, JobStatus::Running, None);
            let result = engine
                .run_once_with_cancel(&name, params, Some(&cancel))
                .await;
            match result {
                Ok(frame) => {
                    log::info!(
                        "✅ ETL job '{}' succeeded: {} users, {} rows",
                        name,
                        frame.users.len(),
                        frame.row_count
                    );
                    engine
                        .frames
                        .write()
                        .unwrap()
                        .insert(name.clone(), Arc::new(frame));
                    engine.set_job_status(&id, JobStatus::Succeeded, None);
                }
                Err(e) => {
                    log::error!("❌ ETL job '{}' failed: {}", name, e);
                    engine.set_job_status(&id, JobStatus::Failed, Some(e.to_string()));
                }
            }
            engine.running.lock().unwrap().remove(&name);
        });

        Ok(job_id)
    }

    /// One synchronous pipeline pass. Pure given the loaded rows and the
    /// reference timestamp; used directly by deterministic tests.
    pub async fn run_once(
        &self,
        job_name: &str,
        params: EtlParams,
    ) -> Result<AnalyticsFrame, EtlError> {
        self.run_once_with_cancel(job_name, params, None).await
    }

    async fn run_once_with_cancel(
        &self,
        job_name: &str,
        params: EtlParams,
        cancel: Option<&AtomicBool>,
    ) -> Result<AnalyticsFrame, EtlError> {
        let reference_ts = params.reference_ts.unwrap_or_else(|| (self.now_fn)());
        let range_days = params.last_n_days.or(self.config.default_range_days);
        let (start_ts, end_ts) = match range_days {
            Some(days) => (
                reference_ts - days * crate::etl::features::SECONDS_PER_DAY,
                reference_ts + 1,
            ),
            None => (1, i64::MAX),
        };

        // Load
        let rows = self.store.query_range(start_ts, end_ts).await?;
        check_cancel(cancel)?;

        // Clean
        let clean = clean_rows(&rows, self.config.dedup_tolerance_secs);
        check_cancel(cancel)?;

        // Feature derivation
        let features = derive_user_features(&clean, reference_ts);
        check_cancel(cancel)?;

        // Segmentation
        let segments = segment_users(&features, reference_ts);
        check_cancel(cancel)?;

        // Churn scoring: two equal sub-windows over the observed span
        let window_start = clean
            .iter()
            .map(|r| r.timestamp)
            .min()
            .unwrap_or(reference_ts);
        let per_user_timestamps = group_timestamps(&clean);
        check_cancel(cancel)?;

        // Time-series analysis
        let series = daily_series(&clean, self.config.sma_window, self.config.anomaly_k);
        check_cancel(cancel)?;

        // Assemble the frame
        let mut users = BTreeMap::new();
        let mut user_type_distribution: BTreeMap<String, u64> = BTreeMap::new();
        let mut domain_counts: BTreeMap<String, u64> = BTreeMap::new();

        for (user_key, feature) in &features {
            let segment = &segments[user_key];
            let churn_risk = per_user_timestamps
                .get(user_key)
                .and_then(|ts| churn_score(ts, window_start, reference_ts));

            *user_type_distribution
                .entry(feature.user_type.as_str().to_string())
                .or_insert(0) += 1;
            if let Some(domain) = &feature.email_domain {
                *domain_counts.entry(domain.clone()).or_insert(0) += 1;
            }

            users.insert(
                user_key.clone(),
                UserMetrics {
                    account_age_days: feature.account_age_days,
                    user_type: feature.user_type,
                    email_domain: feature.email_domain.clone(),
                    activity_count: feature.activity_count,
                    last_7d_count: feature.last_7d_count,
                    recency_days: segment.recency_days,
                    frequency: segment.frequency,
                    engagement: segment.engagement,
                    r_tier: segment.r_tier,
                    f_tier: segment.f_tier,
                    m_tier: segment.m_tier,
                    segment_label: segment.segment_label.clone(),
                    churn_risk,
                },
            );
        }

        let mut counts_by_type: BTreeMap<String, u64> = BTreeMap::new();
        for row in &clean {
            *counts_by_type
                .entry(row.event_type.as_str().to_string())
                .or_insert(0) += 1;
        }

        Ok(AnalyticsFrame {
            job_name: job_name.to_string(),
            reference_ts,
            row_count: clean.len() as u64,
            summary: FrameSummary {
                total_rows: clean.len() as u64,
                total_users: users.len() as u64,
                counts_by_type,
                user_type_distribution,
                top_email_domains: top_email_domains(&domain_counts, 5),
            },
            users,
            series,
        })
    }

    /// Request cooperative cancellation of a running job. Returns whether a
    /// run was in flight.
    pub fn cancel_job(&self, job_name: &str) -> bool {
        match self.running.lock().unwrap().get(job_name) {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, job_name: &str) -> bool {
        self.running.lock().unwrap().contains_key(job_name)
    }

    pub fn job_status(&self, job_id: &str) -> Option<JobStatus> {
        self.jobs.lock().unwrap().get(job_id).map(|r| r.status)
    }

    pub fn job_record(&self, job_id: &str) -> Option<JobRecord> {
        self.jobs.lock().unwrap().get(job_id).cloned()
    }

    /// Latest completed frame for a job, if any run has ever finished.
    pub fn latest_frame(&self, job_name: &str) -> Option<Arc<AnalyticsFrame>> {
        self.frames.read().unwrap().get(job_name).cloned()
    }

    fn set_job_status(&self, job_id: &str, status: JobStatus, error: Option<String>) {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(record) = jobs.get_mut(job_id) {
            record.status = status;
            record.error = error;
            if matches!(status, JobStatus::Succeeded | JobStatus::Failed) {
                record.finished_at = Some((self.now_fn)());
            }
        }
    }
}

fn check_cancel(cancel: Option<&AtomicBool>) -> Result<(), EtlError> {
    if cancel.is_some_and(|flag| flag.load(Ordering::SeqCst)) {
        return Err(EtlError::Cancelled);
    }
    Ok(())
}

fn group_timestamps(rows: &[CleanRow]) -> BTreeMap<String, Vec<i64>> {
    let mut grouped: BTreeMap<String, Vec<i64>> = BTreeMap::new();
    for row in rows {
        grouped
            .entry(row.user_key.clone())
            .or_default()
            .push(row.timestamp);
    }
    for timestamps in grouped.values_mut() {
        timestamps.sort_unstable();
    }
    grouped
}

/// Periodic trigger: run the job on an interval, skipping ticks while a run
/// is still in flight.
pub async fn etl_scheduler_task(
    engine: Arc<EtlEngine>,
    job_name: String,
    interval_ms: u64,
    mut shutdown_rx: tokio::sync::watch::Receiver<bool>,
) {
    log::info!(
        "⏰ Starting ETL scheduler for '{}' (interval: {}ms)",
        job_name,
        interval_ms
    );
    let mut timer = tokio::time::interval(std::time::Duration::from_millis(interval_ms));
    // The first tick fires immediately; skip it so the runtime settles.
    timer.tick().await;

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = timer.tick() => {
                match engine.run_job(&job_name, EtlParams::default()) {
                    Ok(job_id) => log::debug!("Scheduled ETL run '{}' ({})", job_name, job_id),
                    Err(EtlError::JobBusy(_)) => {
                        log::debug!("ETL job '{}' still running, skipping tick", job_name);
                    }
                    Err(e) => log::warn!("⚠️  ETL trigger failed: {}", e),
                }
            }
        }
    }

    log::info!("✅ ETL scheduler stopped for '{}'", job_name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Event, EventOrigin, EventType};
    use crate::store::{ActivityLogRow, MemoryActivityStore};
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    const DAY: i64 = crate::etl::features::SECONDS_PER_DAY;

    async fn seeded_store(reference: i64) -> Arc<MemoryActivityStore> {
        let store = Arc::new(MemoryActivityStore::new_with_timestamp_fn(Box::new(
            move || reference,
        )));
        // Veteran with steady activity
        for day in [40, 30, 20, 10, 5, 1] {
            let event = Event::new(
                EventType::UserLogin,
                json!({}),
                reference - day * DAY,
                EventOrigin::user("alice"),
            );
            store.append(&event).await.unwrap();
        }
        // New user registered 3 days ago
        let event = Event::new(
            EventType::UserRegistered,
            json!({"email": "bob@example.com"}),
            reference - 3 * DAY,
            EventOrigin::user("bob"),
        );
        store.append(&event).await.unwrap();
        // Dormant user, long gone
        for day in [90, 80] {
            let event = Event::new(
                EventType::ApiCall,
                json!({}),
                reference - day * DAY,
                EventOrigin::user("carol"),
            );
            store.append(&event).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_run_once_builds_complete_frame() {
        let reference = 1_000 * DAY;
        let store = seeded_store(reference).await;
        let engine = EtlEngine::new_with_timestamp_fn(
            store,
            EtlConfig::default(),
            Box::new(move || reference),
        );

        let frame = engine
            .run_once(DEFAULT_JOB_NAME, EtlParams::default())
            .await
            .unwrap();

        assert_eq!(frame.users.len(), 3);
        assert_eq!(frame.row_count, 9);

        let alice = &frame.users["user:alice"];
        assert_eq!(alice.user_type, crate::etl::UserType::Veteran);
        assert!(alice.churn_risk.is_some());

        let bob = &frame.users["user:bob"];
        assert_eq!(bob.user_type, crate::etl::UserType::New);
        assert_eq!(bob.email_domain.as_deref(), Some("example.com"));
        // Single event: churn is undetermined, not zero.
        assert_eq!(bob.churn_risk, None);

        let carol = &frame.users["user:carol"];
        assert!(carol.churn_risk.unwrap() > alice.churn_risk.unwrap());

        assert_eq!(frame.summary.total_users, 3);
        assert_eq!(frame.summary.user_type_distribution["veteran"], 2);
        assert_eq!(frame.summary.top_email_domains[0].0, "example.com");
        assert!(!frame.series.is_empty());
    }

    #[tokio::test]
    async fn test_reruns_are_byte_identical() {
        let reference = 1_000 * DAY;
        let store = seeded_store(reference).await;
        let engine = EtlEngine::new_with_timestamp_fn(
            store,
            EtlConfig::default(),
            Box::new(move || reference),
        );
        let params = EtlParams {
            reference_ts: Some(reference),
            ..Default::default()
        };

        let first = engine.run_once(DEFAULT_JOB_NAME, params.clone()).await.unwrap();
        let second = engine.run_once(DEFAULT_JOB_NAME, params).await.unwrap();

        assert_eq!(first.to_json().unwrap(), second.to_json().unwrap());
    }

    #[tokio::test]
    async fn test_range_bounds_the_load() {
        let reference = 1_000 * DAY;
        let store = seeded_store(reference).await;
        let engine = EtlEngine::new_with_timestamp_fn(
            store,
            EtlConfig::default(),
            Box::new(move || reference),
        );

        let frame = engine
            .run_once(
                DEFAULT_JOB_NAME,
                EtlParams {
                    last_n_days: Some(7),
                    reference_ts: Some(reference),
                },
            )
            .await
            .unwrap();

        // Only alice (days 5, 1) and bob (day 3) fall inside the week.
        assert_eq!(frame.users.len(), 2);
        assert!(frame.users.contains_key("user:alice"));
        assert!(frame.users.contains_key("user:bob"));
    }

    /// Store wrapper that stalls loads so busy/cancel paths are observable.
    struct SlowStore {
        inner: Arc<MemoryActivityStore>,
        delay_ms: u64,
    }

    #[async_trait]
    impl crate::store::ActivityLogStore for SlowStore {
        async fn append(&self, event: &Event) -> Result<i64, StoreError> {
            self.inner.append(event).await
        }
        async fn query_range(
            &self,
            start_ts: i64,
            end_ts: i64,
        ) -> Result<Vec<ActivityLogRow>, StoreError> {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            self.inner.query_range(start_ts, end_ts).await
        }
        async fn query_by_user(
            &self,
            user_id: &str,
            limit: usize,
        ) -> Result<Vec<ActivityLogRow>, StoreError> {
            self.inner.query_by_user(user_id, limit).await
        }
        async fn recent(&self, limit: usize) -> Result<Vec<ActivityLogRow>, StoreError> {
            self.inner.recent(limit).await
        }
        async fn count(&self) -> Result<u64, StoreError> {
            self.inner.count().await
        }
    }

    #[tokio::test]
    async fn test_concurrent_run_is_rejected_busy() {
        let reference = 1_000 * DAY;
        let inner = seeded_store(reference).await;
        let store = Arc::new(SlowStore {
            inner,
            delay_ms: 200,
        });
        let engine = Arc::new(EtlEngine::new_with_timestamp_fn(
            store,
            EtlConfig::default(),
            Box::new(move || reference),
        ));

        let first = engine.run_job(DEFAULT_JOB_NAME, EtlParams::default());
        assert!(first.is_ok());

        let second = engine.run_job(DEFAULT_JOB_NAME, EtlParams::default());
        assert!(matches!(second, Err(EtlError::JobBusy(_))));

        // A different job name is unaffected.
        assert!(engine.run_job("weekly_report", EtlParams::default()).is_ok());

        // After completion the name frees up and the frame is published.
        let job_id = first.unwrap();
        for _ in 0..100 {
            if engine.job_status(&job_id) == Some(JobStatus::Succeeded) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(engine.job_status(&job_id), Some(JobStatus::Succeeded));
        assert!(engine.latest_frame(DEFAULT_JOB_NAME).is_some());
        assert!(engine.run_job(DEFAULT_JOB_NAME, EtlParams::default()).is_ok());
    }

    #[tokio::test]
    async fn test_cancel_marks_job_failed() {
        let reference = 1_000 * DAY;
        let inner = seeded_store(reference).await;
        let store = Arc::new(SlowStore {
            inner,
            delay_ms: 200,
        });
        let engine = Arc::new(EtlEngine::new_with_timestamp_fn(
            store,
            EtlConfig::default(),
            Box::new(move || reference),
        ));

        let job_id = engine.run_job(DEFAULT_JOB_NAME, EtlParams::default()).unwrap();
        // Cancel while the load stage is still sleeping.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(engine.cancel_job(DEFAULT_JOB_NAME));

        for _ in 0..100 {
            if engine.job_status(&job_id) == Some(JobStatus::Failed) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let record = engine.job_record(&job_id).unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert!(record.error.unwrap().contains("cancelled"));
        // No frame was published for the cancelled run.
        assert!(engine.latest_frame(DEFAULT_JOB_NAME).is_none());
    }
}
