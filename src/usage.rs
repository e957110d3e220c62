//! Per-token monthly message counters.
//!
//! Counters are keyed by `(period, token)` where the period is the current
//! UTC calendar month (`"2026-03"`). Rollover is implicit: when the month
//! changes, lookups use a new key that has no entry yet, so every token
//! starts again at zero. Entries for past months are inert; they are swept
//! opportunistically by [`UsageCounter::sweep_stale`] and never affect a
//! decision.
//!
//! Counters live only in memory. A restart resets all usage.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;

/// A calendar-month billing period, formatted `YYYY-MM`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UsagePeriod(String);

impl UsagePeriod {
    /// Period containing the current UTC instant.
    pub fn current() -> Self {
        Self::containing(Utc::now())
    }

    pub fn containing(at: DateTime<Utc>) -> Self {
        Self(at.format("%Y-%m").to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UsagePeriod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Concurrent `(period, token) -> count` map.
///
/// Increments on the same key serialize on the owning shard; increments on
/// different keys generally land on different shards and do not contend.
#[derive(Debug, Default)]
pub struct UsageCounter {
    counts: DashMap<(UsagePeriod, String), u64>,
    /// Period of the most recent sweep.
    swept: Mutex<Option<UsagePeriod>>,
}

impl UsageCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages recorded for `token` in `period`; 0 when absent.
    pub fn peek(&self, period: &UsagePeriod, token: &str) -> u64 {
        self.counts
            .get(&(period.clone(), token.to_string()))
            .map(|count| *count)
            .unwrap_or(0)
    }

    /// Add one to the counter and return the new value.
    pub fn increment(&self, period: &UsagePeriod, token: &str) -> u64 {
        let mut count = self
            .counts
            .entry((period.clone(), token.to_string()))
            .or_insert(0);
        *count += 1;
        *count
    }

    /// Remove the counter and return its last value.
    pub fn take(&self, period: &UsagePeriod, token: &str) -> u64 {
        self.counts
            .remove(&(period.clone(), token.to_string()))
            .map(|(_, count)| count)
            .unwrap_or(0)
    }

    /// Move the count of `from` to `to` within `period`.
    ///
    /// Afterwards `to` holds exactly what `from` held (nothing, if `from` had
    /// no entry) and `from` has no entry.
    pub fn migrate(&self, period: &UsagePeriod, from: &str, to: &str) -> u64 {
        let key_to = (period.clone(), to.to_string());
        match self.counts.remove(&(period.clone(), from.to_string())) {
            Some((_, count)) => {
                self.counts.insert(key_to, count);
                count
            }
            None => {
                self.counts.remove(&key_to);
                0
            }
        }
    }

    /// Drop every entry older than `period`. Returns how many were removed.
    pub fn evict_before(&self, period: &UsagePeriod) -> usize {
        let before = self.counts.len();
        self.counts.retain(|(p, _), _| p >= period);
        before.saturating_sub(self.counts.len())
    }

    /// Run [`evict_before`](Self::evict_before) once per period.
    ///
    /// Cheap to call on every request: it only scans the map the first time
    /// it sees a new period.
    pub fn sweep_stale(&self, period: &UsagePeriod) {
        let Ok(mut swept) = self.swept.lock() else {
            return;
        };
        if swept.as_ref() == Some(period) {
            return;
        }
        *swept = Some(period.clone());
        drop(swept);

        let removed = self.evict_before(period);
        if removed > 0 {
            debug!(period = %period, removed, "usage: evicted stale-period counters");
        }
    }

    /// Number of live entries across all periods.
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
