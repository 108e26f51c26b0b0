//! Feature derivation: per-user aggregates computed from cleaned rows.

use crate::etl::clean::CleanRow;
use chrono::NaiveDate;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

pub const SECONDS_PER_DAY: i64 = 86_400;

/// Inclusive account-age threshold separating new users from veterans.
pub const NEW_USER_MAX_AGE_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UserType {
    New,
    Veteran,
}

impl UserType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserType::New => "new",
            UserType::Veteran => "veteran",
        }
    }

    /// `New` iff the account is at most [`NEW_USER_MAX_AGE_DAYS`] old
    /// (inclusive: exactly 7 days is still new).
    pub fn from_account_age(account_age_days: i64) -> Self {
        if account_age_days <= NEW_USER_MAX_AGE_DAYS {
            UserType::New
        } else {
            UserType::Veteran
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UserFeatures {
    pub first_seen: i64,
    pub last_seen: i64,
    pub account_age_days: i64,
    pub activity_count: u64,
    pub last_7d_count: u64,
    pub daily_counts: BTreeMap<NaiveDate, u64>,
    pub email_domain: Option<String>,
    pub user_type: UserType,
    /// Weighted engagement proxy: sum of per-event-type weights.
    pub engagement: f64,
}

/// Lower-cased email from a payload, if present.
pub fn resolve_email(payload: &Value) -> Option<String> {
    payload
        .get("email")
        .and_then(|v| v.as_str())
        .map(|s| s.to_lowercase())
}

pub fn email_domain(email: &str) -> Option<String> {
    email.rsplit_once('@').map(|(_, domain)| domain.to_string())
}

/// Aggregate cleaned rows per user key. `reference_ts` anchors all
/// age/recency arithmetic so reruns over the same rows are identical.
pub fn derive_user_features(
    rows: &[CleanRow],
    reference_ts: i64,
) -> BTreeMap<String, UserFeatures> {
    let mut features: BTreeMap<String, UserFeatures> = BTreeMap::new();
    let week_cutoff = reference_ts - 7 * SECONDS_PER_DAY;

    for row in rows {
        let entry = features
            .entry(row.user_key.clone())
            .or_insert_with(|| UserFeatures {
                first_seen: row.timestamp,
                last_seen: row.timestamp,
                account_age_days: 0,
                activity_count: 0,
                last_7d_count: 0,
                daily_counts: BTreeMap::new(),
                email_domain: None,
                user_type: UserType::New,
                engagement: 0.0,
            });

        entry.first_seen = entry.first_seen.min(row.timestamp);
        entry.last_seen = entry.last_seen.max(row.timestamp);
        entry.activity_count += 1;
        entry.engagement += row.event_type.engagement_weight();
        if row.timestamp > week_cutoff {
            entry.last_7d_count += 1;
        }
        if let Some(date) = date_of(row.timestamp) {
            *entry.daily_counts.entry(date).or_insert(0) += 1;
        }
        if entry.email_domain.is_none() {
            if let Some(email) = &row.email {
                entry.email_domain = email_domain(email);
            }
        }
    }

    for feature in features.values_mut() {
        feature.account_age_days = (reference_ts - feature.first_seen) / SECONDS_PER_DAY;
        feature.user_type = UserType::from_account_age(feature.account_age_days);
    }

    features
}

pub fn date_of(timestamp: i64) -> Option<NaiveDate> {
    chrono::DateTime::from_timestamp(timestamp, 0).map(|dt| dt.date_naive())
}
