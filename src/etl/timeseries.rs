//! Daily time series: counts per calendar date, trailing moving average,
//! and mean ± k·σ anomaly flags.

use crate::etl::clean::CleanRow;
use crate::etl::features::date_of;
use crate::etl::frame::DailyPoint;
use std::collections::BTreeMap;

/// Build the daily activity series from cleaned rows.
///
/// The moving average covers up to `sma_window` points including the
/// current day. The anomaly band is computed from the trailing window
/// EXCLUDING the current day, so a spike cannot dampen its own baseline;
/// a date is anomalous when |count − mean| > k·σ. Fewer than 2 trailing
/// points leave the flag false (undetermined, not an error).
pub fn daily_series(rows: &[CleanRow], sma_window: usize, anomaly_k: f64) -> Vec<DailyPoint> {
    let mut counts: BTreeMap<chrono::NaiveDate, u64> = BTreeMap::new();
    for row in rows {
        if let Some(date) = date_of(row.timestamp) {
            *counts.entry(date).or_insert(0) += 1;
        }
    }

    let window = sma_window.max(1);
    let dates: Vec<chrono::NaiveDate> = counts.keys().copied().collect();
    let values: Vec<u64> = counts.values().copied().collect();

    dates
        .iter()
        .enumerate()
        .map(|(i, date)| {
            let value = values[i];

            let sma_start = (i + 1).saturating_sub(window);
            let sma_slice = &values[sma_start..=i];
            let moving_avg = mean(sma_slice);

            let trailing_start = i.saturating_sub(window);
            let trailing = &values[trailing_start..i];
            let is_anomaly = if trailing.len() < 2 {
                false
            } else {
                let trailing_mean = mean(trailing);
                let trailing_std = stddev(trailing, trailing_mean);
                (value as f64 - trailing_mean).abs() > anomaly_k * trailing_std
            };

            DailyPoint {
                date: *date,
                value,
                moving_avg,
                is_anomaly,
            }
        })
        .collect()
}

fn mean(values: &[u64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<u64>() as f64 / values.len() as f64
}

fn stddev(values: &[u64], mean: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let variance = values
        .iter()
        .map(|v| {
            let diff = *v as f64 - mean;
            diff * diff
        })
        .sum::<f64>()
        / values.len() as f64;
    variance.sqrt()
}
