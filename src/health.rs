//! health.rs: per-source health tracking and backoff for the scheduler.
//!
//! Failures accumulate per source; a source that keeps failing is checked
//! less often, up to once a day.

use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;

use crate::ingest::config::HealthConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Never,
    Live,
    Degraded,
    Dead,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceHealth {
    pub status: HealthStatus,
    pub consecutive_failures: u32,
    pub first_failure: Option<DateTime<Utc>>,
    pub last_checked: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub next_check_after: Option<DateTime<Utc>>,
    pub backoff_minutes: u64,
}

impl Default for SourceHealth {
    fn default() -> Self {
        Self {
            status: HealthStatus::Never,
            consecutive_failures: 0,
            first_failure: None,
            last_checked: None,
            last_success: None,
            last_error: None,
            next_check_after: None,
            backoff_minutes: 0,
        }
    }
}

impl SourceHealth {
    pub fn record_success(&mut self, now: DateTime<Utc>, base_interval_secs: u64) {
        self.status = HealthStatus::Live;
        self.consecutive_failures = 0;
        self.first_failure = None;
        self.last_error = None;
        self.last_checked = Some(now);
        self.last_success = Some(now);
        self.backoff_minutes = base_interval_secs.div_ceil(60);
        self.next_check_after = now.checked_add_signed(secs(base_interval_secs));
    }

    pub fn record_failure(&mut self, now: DateTime<Utc>, error: String, cfg: &HealthConfig) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let first = *self.first_failure.get_or_insert(now);
        self.status = if self.consecutive_failures >= cfg.dead_after_failures {
            HealthStatus::Dead
        } else {
            HealthStatus::Degraded
        };
        self.last_error = Some(error);
        self.last_checked = Some(now);

        let down_for = now.signed_duration_since(first);
        let minutes = if down_for > ChronoDuration::days(7) {
            cfg.dead_7d_backoff_minutes
        } else if down_for > ChronoDuration::hours(24) {
            cfg.dead_24h_backoff_minutes
        } else if self.status == HealthStatus::Dead {
            cfg.dead_backoff_minutes
        } else {
            cfg.degraded_backoff_minutes
        };
        self.backoff_minutes = minutes;
        self.next_check_after = now.checked_add_signed(secs(minutes.saturating_mul(60)));
    }

    /// True while `now` is inside the backoff window.
    pub fn should_skip(&self, now: DateTime<Utc>) -> bool {
        self.consecutive_failures > 0 && self.next_check_after.is_some_and(|t| now < t)
    }
}

fn secs(n: u64) -> ChronoDuration {
    ChronoDuration::seconds(i64::try_from(n).unwrap_or(i64::MAX).min(i64::MAX / 1_000))
}

/// Shared snapshot of every source's health.
///
/// A panic inside one source's update does not poison the others: the lock is
/// recovered and the last written entries are served.
#[derive(Debug, Default)]
pub struct HealthRegistry {
    inner: Mutex<BTreeMap<String, SourceHealth>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, source: &str) -> SourceHealth {
        let m = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        m.get(source).cloned().unwrap_or_default()
    }

    pub fn update<F: FnOnce(&mut SourceHealth)>(&self, source: &str, f: F) -> SourceHealth {
        let mut m = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let entry = m.entry(source.to_string()).or_default();
        f(entry);
        entry.clone()
    }

    pub fn snapshot(&self) -> BTreeMap<String, SourceHealth> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}
