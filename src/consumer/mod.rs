//! Long-running stream consumers.
//!
//! One logical consumer task per (topic, consumer group). The task drains
//! the broker in batches, keeps the rolling [`StreamingWindow`] current, and
//! publishes immutable snapshots for readers. Start/stop transitions are
//! serialized by the [`ConsumerManager`]; starting a running consumer is a
//! reported no-op, never an error.

pub mod sink;
pub mod window;

pub use sink::store_sink_task;
pub use window::{SharedSnapshot, StreamingWindow, WindowSnapshot};

use crate::broker::BrokerClient;
use crate::event::{Event, EventType};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::interval;

/// Consumer lifecycle:
/// `Stopped -> Starting -> Running -> Stopping -> Stopped`, with implicit
/// `Running -> Running` self-transitions per processed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub topic: String,
    pub group: String,
    pub poll_interval_ms: u64,
    pub poll_batch_size: usize,
    /// Window horizon in seconds; events older than this are evicted.
    pub window_horizon_secs: i64,
    pub window_max_events: usize,
    /// Consecutive poll failures before the consumer reports fatal and stops.
    pub fatal_failure_threshold: u32,
    pub failure_backoff_initial_ms: u64,
    pub failure_backoff_max_ms: u64,
    /// Grace period for draining in-flight work on stop before the task is
    /// force-terminated.
    pub stop_grace_ms: u64,
    /// Re-publish a derived `system_event` for every processed event to
    /// `<topic>.processed`.
    pub republish_processed: bool,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            topic: "user_events".to_string(),
            group: "streaming_stats".to_string(),
            poll_interval_ms: 100,
            poll_batch_size: 256,
            window_horizon_secs: 300,
            window_max_events: 10_000,
            fatal_failure_threshold: 5,
            failure_backoff_initial_ms: 100,
            failure_backoff_max_ms: 5_000,
            stop_grace_ms: 2_000,
            republish_processed: false,
        }
    }
}

/// Read-only handle shared with the query layer. All fields are Arcs; the
/// view stays valid after the consumer stops.
#[derive(Clone)]
pub struct ConsumerView {
    status: Arc<RwLock<ConsumerStatus>>,
    fatal_reason: Arc<RwLock<Option<String>>>,
    snapshot: SharedSnapshot,
    processed: Arc<AtomicU64>,
    poisoned: Arc<AtomicU64>,
}

impl ConsumerView {
    fn new() -> Self {
        Self {
            status: Arc::new(RwLock::new(ConsumerStatus::Stopped)),
            fatal_reason: Arc::new(RwLock::new(None)),
            snapshot: window::new_shared_snapshot(),
            processed: Arc::new(AtomicU64::new(0)),
            poisoned: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn status(&self) -> ConsumerStatus {
        *self.status.read().unwrap()
    }

    /// Set when the consecutive-failure threshold tripped.
    pub fn fatal_reason(&self) -> Option<String> {
        self.fatal_reason.read().unwrap().clone()
    }

    pub fn snapshot(&self) -> Arc<WindowSnapshot> {
        window::read_snapshot(&self.snapshot)
    }

    pub fn processed_count(&self) -> u64 {
        self.processed.load(Ordering::SeqCst)
    }

    pub fn poison_count(&self) -> u64 {
        self.poisoned.load(Ordering::SeqCst)
    }

    fn set_status(&self, status: ConsumerStatus) {
        *self.status.write().unwrap() = status;
    }

    fn set_fatal(&self, reason: String) {
        *self.fatal_reason.write().unwrap() = Some(reason);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// The consumer was already running; reported, not an error.
    AlreadyRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Drained and stopped within the grace period.
    Stopped,
    /// Grace period elapsed; the task was aborted and unapplied events
    /// dropped (the window is advisory).
    ForceTerminated,
    NotRunning,
}

struct ManagedConsumer {
    view: ConsumerView,
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
    stop_grace_ms: u64,
}

/// Owns all consumer tasks; start/stop are serialized behind one async
/// mutex, so duplicate active consumers on a (topic, group) are impossible.
pub struct ConsumerManager {
    broker: Arc<dyn BrokerClient>,
    consumers: Mutex<HashMap<(String, String), ManagedConsumer>>,
}

impl ConsumerManager {
    pub fn new(broker: Arc<dyn BrokerClient>) -> Self {
        Self {
            broker,
            consumers: Mutex::new(HashMap::new()),
        }
    }

    pub async fn start(&self, config: ConsumerConfig) -> StartOutcome {
        self.start_with_timestamp_fn(config, Box::new(|| chrono::Utc::now().timestamp()))
            .await
    }

    pub async fn start_with_timestamp_fn(
        &self,
        config: ConsumerConfig,
        now_fn: Box<dyn Fn() -> i64 + Send + Sync>,
    ) -> StartOutcome {
        let key = (config.topic.clone(), config.group.clone());
        let mut consumers = self.consumers.lock().await;

        if let Some(existing) = consumers.get(&key) {
            if existing.view.status() != ConsumerStatus::Stopped {
                log::info!(
                    "Consumer for topic '{}' group '{}' already running, start is a no-op",
                    key.0,
                    key.1
                );
                return StartOutcome::AlreadyRunning;
            }
        }

        let view = ConsumerView::new();
        view.set_status(ConsumerStatus::Starting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task_view = view.clone();
        let broker = self.broker.clone();
        let stop_grace_ms = config.stop_grace_ms;
        let join = tokio::spawn(async move {
            run_consumer(broker, config, task_view, shutdown_rx, now_fn).await;
        });

        consumers.insert(
            key,
            ManagedConsumer {
                view,
                shutdown: shutdown_tx,
                join,
                stop_grace_ms,
            },
        );

        StartOutcome::Started
    }

    pub async fn stop(&self, topic: &str, group: &str) -> StopOutcome {
        let key = (topic.to_string(), group.to_string());
        let mut consumers = self.consumers.lock().await;

        let Some(managed) = consumers.remove(&key) else {
            return StopOutcome::NotRunning;
        };
        if managed.view.status() == ConsumerStatus::Stopped {
            return StopOutcome::NotRunning;
        }

        let _ = managed.shutdown.send(true);
        let grace = Duration::from_millis(managed.stop_grace_ms);
        let abort_handle = managed.join.abort_handle();
        match tokio::time::timeout(grace, managed.join).await {
            Ok(_) => StopOutcome::Stopped,
            Err(_) => {
                log::warn!(
                    "⚠️  Consumer '{}'/'{}' did not drain within {}ms, force-terminating",
                    topic,
                    group,
                    managed.stop_grace_ms
                );
                abort_handle.abort();
                managed.view.set_status(ConsumerStatus::Stopped);
                StopOutcome::ForceTerminated
            }
        }
    }

    pub async fn view(&self, topic: &str, group: &str) -> Option<ConsumerView> {
        let key = (topic.to_string(), group.to_string());
        self.consumers.lock().await.get(&key).map(|m| m.view.clone())
    }
}

async fn run_consumer(
    broker: Arc<dyn BrokerClient>,
    config: ConsumerConfig,
    view: ConsumerView,
    mut shutdown_rx: watch::Receiver<bool>,
    now_fn: Box<dyn Fn() -> i64 + Send + Sync>,
) {
    log::info!(
        "🚀 Starting consumer: topic '{}', group '{}' (horizon {}s)",
        config.topic,
        config.group,
        config.window_horizon_secs
    );

    // Resume from the last committed cursor rather than reprocessing the
    // whole topic.
    if let Err(e) = broker.resubscribe(&config.topic, &config.group).await {
        log::warn!("⚠️  Resubscribe failed, continuing with poll: {}", e);
    }

    let mut window = StreamingWindow::new(config.window_horizon_secs, config.window_max_events);
    let mut consecutive_failures: u32 = 0;
    let mut tick = interval(Duration::from_millis(config.poll_interval_ms));

    view.set_status(ConsumerStatus::Running);

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    view.set_status(ConsumerStatus::Stopping);
                    // Drain: anything already polled was applied synchronously,
                    // so publish a final snapshot and leave.
                    let now = (now_fn)();
                    window.evict_older_than(now);
                    window::publish_snapshot(
                        &view.snapshot,
                        window.snapshot(now, view.poison_count()),
                    );
                    break;
                }
            }
            _ = tick.tick() => {
                match broker.poll(&config.topic, &config.group, config.poll_batch_size).await {
                    Ok(batch) => {
                        consecutive_failures = 0;
                        if !batch.is_empty() {
                            for polled in batch {
                                process_event(&broker, &config, &view, &mut window, polled.event).await;
                            }
                            if let Err(e) = broker.commit(&config.topic, &config.group).await {
                                log::warn!("⚠️  Cursor commit failed: {}", e);
                            }
                        }
                        let now = (now_fn)();
                        window.evict_older_than(now);
                        window::publish_snapshot(
                            &view.snapshot,
                            window.snapshot(now, view.poison_count()),
                        );
                    }
                    Err(e) => {
                        consecutive_failures += 1;
                        log::warn!(
                            "⚠️  Poll failed ({} consecutive): {}",
                            consecutive_failures,
                            e
                        );
                        if consecutive_failures >= config.fatal_failure_threshold {
                            let reason = format!(
                                "{} consecutive broker read failures, last: {}",
                                consecutive_failures, e
                            );
                            log::error!("❌ Consumer fatal: {}", reason);
                            view.set_fatal(reason);
                            break;
                        }
                        let delay = failure_delay(&config, consecutive_failures);
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }

    view.set_status(ConsumerStatus::Stopped);
    log::info!(
        "✅ Consumer stopped: topic '{}', group '{}' ({} processed, {} poison)",
        config.topic,
        config.group,
        view.processed_count(),
        view.poison_count()
    );
}

async fn process_event(
    broker: &Arc<dyn BrokerClient>,
    config: &ConsumerConfig,
    view: &ConsumerView,
    window: &mut StreamingWindow,
    event: Event,
) {
    // Poison events are logged and skipped; they never halt consumption.
    if let Err(reason) = event.validate() {
        view.poisoned.fetch_add(1, Ordering::SeqCst);
        log::warn!("⚠️  Skipping poison event ({})", reason);
        return;
    }

    if config.republish_processed && event.event_type != EventType::SystemEvent {
        let derived = Event::new(
            EventType::SystemEvent,
            serde_json::json!({
                "derived_from": event.event_type.as_str(),
                "origin": event.origin.key(),
            }),
            event.timestamp,
            event.origin.clone(),
        );
        let processed_topic = format!("{}.processed", config.topic);
        if let Err(e) = broker.publish(&processed_topic, derived).await {
            log::debug!("Derived-event republish failed: {}", e);
        }
    }

    window.add_event(event);
    view.processed.fetch_add(1, Ordering::SeqCst);
}

fn failure_delay(config: &ConsumerConfig, consecutive_failures: u32) -> Duration {
    let exponent = consecutive_failures.saturating_sub(1).min(16);
    let delay = config
        .failure_backoff_initial_ms
        .saturating_mul(2_u64.saturating_pow(exponent))
        .min(config.failure_backoff_max_ms);
    Duration::from_millis(delay)
}
