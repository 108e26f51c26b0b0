//! Batch ETL over the activity log.
//!
//! A run loads a bounded slice of rows, cleans it, derives per-user
//! features, segments users (RFM), scores churn risk, and builds a daily
//! time series. Every stage is a pure function over its input: identical
//! rows and reference timestamp produce a byte-identical frame, which is
//! what the determinism tests pin down. The engine never mutates the
//! activity log.
//!
//! Module organization:
//! - `clean` - row validation, user-key resolution, near-duplicate removal
//! - `features` - per-user aggregates (account age, activity, email domain)
//! - `segmentation` - per-run quantile RFM tiers and segment labels
//! - `churn` - monotonic churn-risk heuristic
//! - `timeseries` - daily counts, trailing SMA, anomaly flags
//! - `frame` - the versioned output snapshot
//! - `job` - job runner: busy rejection, status registry, atomic frame swap

pub mod churn;
pub mod clean;
pub mod features;
pub mod frame;
pub mod job;
pub mod segmentation;
pub mod timeseries;

pub use clean::CleanRow;
pub use features::{UserFeatures, UserType};
pub use frame::{AnalyticsFrame, DailyPoint, FrameSummary, UserMetrics};
pub use job::{
    etl_scheduler_task, EtlConfig, EtlEngine, EtlError, EtlParams, JobRecord, JobStatus,
    DEFAULT_JOB_NAME,
};
pub use segmentation::RfmScore;
