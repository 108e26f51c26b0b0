//! Churn-risk heuristic.
//!
//! A score in [0, 1], deterministic for identical input, monotonic
//! non-decreasing in both the recency gap and the frequency decline between
//! the two halves of the analysis window. No randomness anywhere.

use crate::etl::features::SECONDS_PER_DAY;

/// Days of absence after which the recency component saturates toward 1.
const RECENCY_SATURATION_DAYS: f64 = 30.0;

const RECENCY_WEIGHT: f64 = 0.6;
const DECLINE_WEIGHT: f64 = 0.4;

/// Score one user's churn risk from their event timestamps (ascending)
/// within `[window_start, reference_ts]`.
///
/// Returns `None` (undetermined) when fewer than 2 events exist; a trend
/// needs at least two points.
pub fn churn_score(timestamps: &[i64], window_start: i64, reference_ts: i64) -> Option<f64> {
    if timestamps.len() < 2 {
        return None;
    }

    let last_seen = *timestamps.last()?;
    let recency_days = ((reference_ts - last_seen).max(0) as f64) / SECONDS_PER_DAY as f64;
    let recency_component = 1.0 - (-recency_days / RECENCY_SATURATION_DAYS).exp();

    // Frequency trend over two equal sub-windows: a drop from the first
    // half to the second raises the risk, growth does not lower it below
    // the recency floor.
    let midpoint = window_start + (reference_ts - window_start) / 2;
    let first_half = timestamps.iter().filter(|ts| **ts < midpoint).count() as f64;
    let second_half = timestamps.iter().filter(|ts| **ts >= midpoint).count() as f64;
    let decline_component = if first_half > 0.0 {
        ((first_half - second_half) / first_half).clamp(0.0, 1.0)
    } else {
        0.0
    };

    let score = RECENCY_WEIGHT * recency_component + DECLINE_WEIGHT * decline_component;
    Some(score.clamp(0.0, 1.0))
}
