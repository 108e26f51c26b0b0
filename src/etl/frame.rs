//! The versioned output of one ETL run.
//!
//! A frame is immutable once built and replaces its predecessor for the
//! same job atomically. All maps are BTreeMaps so serialization order is
//! stable and reruns over identical rows serialize byte-identically.

use crate::etl::features::UserType;
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserMetrics {
    pub account_age_days: i64,
    pub user_type: UserType,
    pub email_domain: Option<String>,
    pub activity_count: u64,
    pub last_7d_count: u64,
    pub recency_days: i64,
    pub frequency: u64,
    pub engagement: f64,
    pub r_tier: u8,
    pub f_tier: u8,
    pub m_tier: u8,
    pub segment_label: String,
    /// `None` when undetermined (fewer than 2 events for a trend).
    pub churn_risk: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyPoint {
    pub date: NaiveDate,
    pub value: u64,
    pub moving_avg: f64,
    pub is_anomaly: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameSummary {
    pub total_rows: u64,
    pub total_users: u64,
    pub counts_by_type: BTreeMap<String, u64>,
    pub user_type_distribution: BTreeMap<String, u64>,
    /// Top 5 email domains by user count, count-descending then
    /// name-ascending for stable ties.
    pub top_email_domains: Vec<(String, u64)>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalyticsFrame {
    pub job_name: String,
    /// Anchor for all age/recency arithmetic in this run.
    pub reference_ts: i64,
    pub row_count: u64,
    pub users: BTreeMap<String, UserMetrics>,
    pub series: Vec<DailyPoint>,
    pub summary: FrameSummary,
}

impl AnalyticsFrame {
    /// Canonical serialized form, used by the determinism tests and by
    /// report export.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

pub fn top_email_domains(
    domain_counts: &BTreeMap<String, u64>,
    limit: usize,
) -> Vec<(String, u64)> {
    let mut domains: Vec<(String, u64)> = domain_counts
        .iter()
        .map(|(domain, count)| (domain.clone(), *count))
        .collect();
    domains.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    domains.truncate(limit);
    domains
}
