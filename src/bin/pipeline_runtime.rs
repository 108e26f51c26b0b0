//! Pipeline Runtime
//!
//! Orchestrates the full event pipeline in one process:
//! - Opens the SQLite activity log (schema created on first run)
//! - Creates the in-memory topic broker
//! - Spawns the live-stats consumer and the durable store sink
//! - Schedules periodic ETL runs and logs streaming stats
//!
//! Usage:
//!   cargo run --release --bin pipeline_runtime
//!
//! Environment variables: see `RuntimeConfig::from_env`.

use dotenv::dotenv;
use eventflow::broker::{BrokerClient, EventProducer, InMemoryBroker};
use eventflow::config::RuntimeConfig;
use eventflow::consumer::{store_sink_task, ConsumerManager};
use eventflow::etl::{etl_scheduler_task, EtlEngine, DEFAULT_JOB_NAME};
use eventflow::event::{EventOrigin, EventType};
use eventflow::query::AnalyticsService;
use eventflow::store::{ActivityLogStore, SqliteActivityStore};
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = RuntimeConfig::from_env();

    info!("🚀 Starting eventflow pipeline runtime");
    info!("📊 Configuration:");
    info!("   ├─ Database: {}", config.db_path);
    info!("   ├─ Topic: {} ({} partitions)", config.topic, config.partitions);
    info!(
        "   ├─ Window: {}s horizon, {} events max",
        config.window_horizon_secs, config.window_max_events
    );
    info!("   └─ ETL interval: {}ms", config.etl_interval_ms);

    // Durable activity log
    let store: Arc<dyn ActivityLogStore> = Arc::new(SqliteActivityStore::new(&config.db_path)?);

    // Broker + ingress
    let broker: Arc<dyn BrokerClient> = Arc::new(InMemoryBroker::new(config.partitions));
    let producer = Arc::new(EventProducer::new(
        broker.clone(),
        store.clone(),
        config.producer_config(),
    ));

    // Live-stats consumer
    let manager = Arc::new(ConsumerManager::new(broker.clone()));
    manager.start(config.consumer_config()).await;
    let view = manager
        .view(&config.topic, &config.stats_group)
        .await
        .ok_or("stats consumer failed to register")?;

    // Durable store sink
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sink = tokio::spawn(store_sink_task(
        broker.clone(),
        store.clone(),
        config.sink_config(),
        shutdown_rx.clone(),
    ));

    // ETL engine + periodic trigger
    let etl = Arc::new(EtlEngine::new(store.clone(), config.etl_config()));
    let scheduler = tokio::spawn(etl_scheduler_task(
        etl.clone(),
        DEFAULT_JOB_NAME.to_string(),
        config.etl_interval_ms,
        shutdown_rx.clone(),
    ));

    // Query facade; the HTTP/dashboard layer hangs off this
    let service = Arc::new(AnalyticsService::new(
        view.clone(),
        etl.clone(),
        broker.clone(),
        DEFAULT_JOB_NAME,
    ));

    // The request-handling layer calls record_event on this producer; mark
    // the runtime start so the pipeline always carries at least one event.
    producer
        .record_event(
            EventType::SystemEvent,
            serde_json::json!({"message": "pipeline runtime started"}),
            EventOrigin::default(),
        )
        .await?;

    info!("✅ Pipeline running, press Ctrl-C to stop");

    // Periodic stats log until shutdown
    let mut stats_timer = tokio::time::interval(Duration::from_secs(30));
    stats_timer.tick().await;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("🛑 Shutdown requested");
                break;
            }
            _ = stats_timer.tick() => {
                let stats = service.streaming_stats();
                let health = service.broker_health().await;
                info!(
                    "📊 Window: {} events, {} poison | broker reachable: {} | lag: {:?}",
                    stats.total_events,
                    stats.poison_count,
                    health.reachable,
                    health.lag_per_topic
                );
            }
        }
    }

    // Ordered shutdown: consumers drain, background tasks exit.
    let _ = shutdown_tx.send(true);
    manager.stop(&config.topic, &config.stats_group).await;
    if let Err(e) = sink.await {
        warn!("⚠️  Store sink task ended abnormally: {}", e);
    }
    if let Err(e) = scheduler.await {
        warn!("⚠️  ETL scheduler task ended abnormally: {}", e);
    }

    info!("✅ Pipeline stopped");
    Ok(())
}
