//! Domain records: alerts, per-source state, and ingestion runs.
//!
//! Observation times are Modified Julian Dates (MJD), the epoch scale used by
//! the survey. Wall-clock times are UTC [`chrono::DateTime`]s.

pub mod alert;
pub mod run;
pub mod state;

use chrono::{DateTime, Utc};

/// MJD of the Unix epoch (1970-01-01T00:00:00Z).
pub const UNIX_EPOCH_MJD: f64 = 40_587.0;

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Convert a UTC wall-clock instant to MJD.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn mjd_from_datetime(ts: DateTime<Utc>) -> f64 {
    let seconds = ts.timestamp() as f64 + f64::from(ts.timestamp_subsec_millis()) / 1_000.0;
    UNIX_EPOCH_MJD + seconds / SECONDS_PER_DAY
}

/// Current time as MJD.
#[must_use]
pub fn mjd_now() -> f64 {
    mjd_from_datetime(Utc::now())
}

/// MJD of the instant `days` days before now.
#[must_use]
pub fn days_ago_mjd(days: u32) -> f64 {
    mjd_now() - f64::from(days)
}
