//! RFM segmentation: recency, frequency, and an engagement proxy bucketed
//! into per-run quantile tiers.
//!
//! Tier boundaries are recomputed from each run's population, so a tier (and
//! the label built from tiers) is comparable only within one run. Recency is
//! inverted: the most recently active users land in tier 5.

use crate::etl::features::{UserFeatures, SECONDS_PER_DAY};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RfmScore {
    /// Days since the user's last event, relative to the run reference.
    pub recency_days: i64,
    /// Event count inside the analysis window.
    pub frequency: u64,
    /// Weighted engagement proxy (monetary stand-in).
    pub engagement: f64,
    pub r_tier: u8,
    pub f_tier: u8,
    pub m_tier: u8,
    pub segment_label: String,
}

/// Quintile of `value` within the run population (1 = bottom, 5 = top).
/// `sorted` must be ascending. Rank counts values <= `value`, so ties share
/// a tier and reruns are deterministic.
fn quantile_tier(sorted: &[f64], value: f64) -> u8 {
    if sorted.is_empty() {
        return 1;
    }
    let rank = sorted.partition_point(|x| *x <= value);
    let pct = rank as f64 / sorted.len() as f64;
    ((pct * 5.0).ceil() as u8).clamp(1, 5)
}

/// Fixed tier-combination lookup. The extremes are pinned ("555" is a
/// champion, "111" is at risk); the rest bucket by recency first, the way
/// the marketing taxonomy reads them.
fn segment_label(r_tier: u8, f_tier: u8, m_tier: u8) -> &'static str {
    match (r_tier, f_tier, m_tier) {
        (r, f, m) if r >= 4 && f >= 4 && m >= 4 => "champion",
        (r, f, _) if r >= 4 && f >= 3 => "loyal",
        (r, _, _) if r >= 4 => "promising",
        (3, f, _) if f >= 3 => "needs_attention",
        (3, _, _) => "about_to_sleep",
        (r, f, _) if r <= 2 && f >= 4 => "cant_lose",
        (r, f, _) if r <= 2 && f >= 2 => "hibernating",
        _ => "at_risk",
    }
}

pub fn segment_users(
    features: &BTreeMap<String, UserFeatures>,
    reference_ts: i64,
) -> BTreeMap<String, RfmScore> {
    let mut recencies: Vec<f64> = Vec::with_capacity(features.len());
    let mut frequencies: Vec<f64> = Vec::with_capacity(features.len());
    let mut engagements: Vec<f64> = Vec::with_capacity(features.len());

    for feature in features.values() {
        recencies.push(((reference_ts - feature.last_seen) / SECONDS_PER_DAY) as f64);
        frequencies.push(feature.activity_count as f64);
        engagements.push(feature.engagement);
    }
    recencies.sort_by(f64::total_cmp);
    frequencies.sort_by(f64::total_cmp);
    engagements.sort_by(f64::total_cmp);

    features
        .iter()
        .map(|(user_key, feature)| {
            let recency_days = (reference_ts - feature.last_seen) / SECONDS_PER_DAY;

            // High recency (long absence) is bad, so the tier is inverted.
            let r_tier = 6 - quantile_tier(&recencies, recency_days as f64);
            let f_tier = quantile_tier(&frequencies, feature.activity_count as f64);
            let m_tier = quantile_tier(&engagements, feature.engagement);

            let score = RfmScore {
                recency_days,
                frequency: feature.activity_count,
                engagement: feature.engagement,
                r_tier,
                f_tier,
                m_tier,
                segment_label: segment_label(r_tier, f_tier, m_tier).to_string(),
            };
            (user_key.clone(), score)
        })
        .collect()
}
