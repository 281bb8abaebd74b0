//! Freshness Policy
//!
//! Decides whether the most recent capture of a dataset is too old.
//! All comparisons happen in UTC.

use chrono::{DateTime, Duration, FixedOffset, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_THRESHOLD_HOURS: f64 = 24.0;

/// A timestamp as handed over by a store or a caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservedAt {
    Zoned(DateTime<FixedOffset>),
    /// No offset attached; read as UTC, never as local time
    Naive(NaiveDateTime),
}

impl ObservedAt {
    pub fn to_utc(self) -> DateTime<Utc> {
        match self {
            ObservedAt::Zoned(ts) => ts.with_timezone(&Utc),
            ObservedAt::Naive(ts) => ts.and_utc(),
        }
    }
}

impl From<DateTime<Utc>> for ObservedAt {
    fn from(ts: DateTime<Utc>) -> Self {
        ObservedAt::Zoned(ts.fixed_offset())
    }
}

impl From<DateTime<FixedOffset>> for ObservedAt {
    fn from(ts: DateTime<FixedOffset>) -> Self {
        ObservedAt::Zoned(ts)
    }
}

impl From<NaiveDateTime> for ObservedAt {
    fn from(ts: NaiveDateTime) -> Self {
        ObservedAt::Naive(ts)
    }
}

/// Staleness window
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FreshnessPolicy {
    pub threshold_hours: f64,
}

impl Default for FreshnessPolicy {
    fn default() -> Self {
        Self {
            threshold_hours: DEFAULT_THRESHOLD_HOURS,
        }
    }
}

impl FreshnessPolicy {
    pub fn new(threshold_hours: f64) -> Self {
        Self { threshold_hours }
    }

    /// The window as a duration. Negative and NaN thresholds count as zero;
    /// thresholds past the representable range saturate.
    pub fn threshold(&self) -> Duration {
        let millis = self.threshold_hours * 3_600_000.0;
        if millis.is_nan() || millis <= 0.0 {
            return Duration::zero();
        }
        Duration::try_milliseconds(millis.round() as i64).unwrap_or(Duration::MAX)
    }

    /// `now - observed_at > threshold`
    pub fn is_stale(&self, observed_at: impl Into<ObservedAt>, now: DateTime<Utc>) -> bool {
        now - observed_at.into().to_utc() > self.threshold()
    }
}

/// Free-standing form of [`FreshnessPolicy::is_stale`]
pub fn is_stale(observed_at: impl Into<ObservedAt>, now: DateTime<Utc>, threshold_hours: f64) -> bool {
    FreshnessPolicy::new(threshold_hours).is_stale(observed_at, now)
}

/// Hours elapsed between `observed_at` and `now`; negative for future timestamps
pub fn age_hours(observed_at: impl Into<ObservedAt>, now: DateTime<Utc>) -> f64 {
    (now - observed_at.into().to_utc()).num_milliseconds() as f64 / 3_600_000.0
}
