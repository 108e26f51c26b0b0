//! Clean stage: validate rows, resolve user keys, drop near-duplicates.

use crate::etl::features::resolve_email;
use crate::event::EventType;
use crate::store::ActivityLogRow;

/// A validated, deduplicated row ready for the derivation stages.
#[derive(Debug, Clone, PartialEq)]
pub struct CleanRow {
    /// Stable user identity: `user:<id>` or `anon:<ip>`.
    pub user_key: String,
    pub event_type: EventType,
    pub timestamp: i64,
    /// Email carried in the payload, if any (registration events mostly).
    pub email: Option<String>,
}

/// Drop rows with missing mandatory fields and deduplicate rows with the
/// same (user key, event type) landing within `dedup_tolerance_secs` of an
/// already kept row. First occurrence wins. Output is sorted by
/// (user key, timestamp) for deterministic downstream iteration.
pub fn clean_rows(rows: &[ActivityLogRow], dedup_tolerance_secs: i64) -> Vec<CleanRow> {
    let mut cleaned: Vec<CleanRow> = rows
        .iter()
        .filter(|row| {
            row.event_type != EventType::Unknown && row.timestamp > 0 && row.payload.is_object()
        })
        .map(|row| CleanRow {
            user_key: row.user_key(),
            event_type: row.event_type,
            timestamp: row.timestamp,
            email: resolve_email(&row.payload),
        })
        .collect();

    // Dedup within (user key, event type) streaks, tolerance applied against
    // the last KEPT row so a burst collapses to its first element.
    cleaned.sort_by(|a, b| {
        (&a.user_key, a.event_type.as_str(), a.timestamp).cmp(&(
            &b.user_key,
            b.event_type.as_str(),
            b.timestamp,
        ))
    });

    let mut deduped: Vec<CleanRow> = Vec::with_capacity(cleaned.len());
    for row in cleaned {
        let duplicate = deduped.last().is_some_and(|kept: &CleanRow| {
            kept.user_key == row.user_key
                && kept.event_type == row.event_type
                && row.timestamp - kept.timestamp <= dedup_tolerance_secs
        });
        if !duplicate {
            deduped.push(row);
        }
    }

    deduped.sort_by(|a, b| {
        (&a.user_key, a.timestamp, a.event_type.as_str()).cmp(&(
            &b.user_key,
            b.timestamp,
            b.event_type.as_str(),
        ))
    });
    deduped
}
