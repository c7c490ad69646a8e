//! Ingestion run audit record.

#![allow(missing_docs)]

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a run stopped pulling from its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Exhausted,
    MaxRecords,
    MaxDuration,
    Cancelled,
    SourceError,
}

impl StopReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Exhausted => "exhausted",
            Self::MaxRecords => "max_records",
            Self::MaxDuration => "max_duration",
            Self::Cancelled => "cancelled",
            Self::SourceError => "source_error",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "exhausted" => Some(Self::Exhausted),
            "max_records" => Some(Self::MaxRecords),
            "max_duration" => Some(Self::MaxDuration),
            "cancelled" => Some(Self::Cancelled),
            "source_error" => Some(Self::SourceError),
            _ => None,
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-run counters.
///
/// `alerts_received == alerts_stored + alerts_failed + duplicates_skipped`
/// holds for every terminal run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub alerts_received: u64,
    pub alerts_stored: u64,
    pub alerts_failed: u64,
    pub duplicates_skipped: u64,
    /// Records the source dropped for failing to decode or validate.
    pub records_skipped: u64,
    pub new_sources: u64,
    pub updated_sources: u64,
    pub reassociations_detected: u64,
    pub batches_written: u64,
    pub batches_failed: u64,
    pub state_update_failures: u64,
    /// Buffered records discarded when a fatal error ended the run.
    pub unflushed_on_failure: u64,
}

impl RunCounts {
    /// Whether the audit equation balances.
    #[must_use]
    pub const fn is_balanced(&self) -> bool {
        self.alerts_received == self.alerts_stored + self.alerts_failed + self.duplicates_skipped
    }
}

/// One pipeline execution, created at start and completed in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionRun {
    /// Storage identity, assigned on first write.
    pub id: Option<i64>,
    pub source_name: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    #[serde(flatten)]
    pub counts: RunCounts,
    pub stop_reason: Option<StopReason>,
    pub error_message: Option<String>,
    pub metadata: serde_json::Value,
}

impl IngestionRun {
    /// A fresh run in RUNNING status.
    #[must_use]
    pub fn start(source_name: impl Into<String>) -> Self {
        Self {
            id: None,
            source_name: source_name.into(),
            started_at: Utc::now(),
            completed_at: None,
            status: RunStatus::Running,
            counts: RunCounts::default(),
            stop_reason: None,
            error_message: None,
            metadata: serde_json::Value::Object(serde_json::Map::new()),
        }
    }

    /// Move to a terminal status and stamp the end time.
    pub fn finish(&mut self, status: RunStatus, error_message: Option<String>) {
        self.status = status;
        self.error_message = error_message;
        self.completed_at = Some(Utc::now());
    }

    /// Elapsed seconds, up to now for a run still in progress.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn duration_secs(&self) -> f64 {
        let end = self.completed_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds().max(0) as f64 / 1_000.0
    }

    /// Stored alerts per second.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn processing_rate(&self) -> f64 {
        let secs = self.duration_secs();
        if secs > 0.0 {
            self.counts.alerts_stored as f64 / secs
        } else {
            0.0
        }
    }

    /// Fraction of non-duplicate alerts that were stored.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn success_rate(&self) -> f64 {
        let attempted = self.counts.alerts_stored + self.counts.alerts_failed;
        if attempted == 0 {
            1.0
        } else {
            self.counts.alerts_stored as f64 / attempted as f64
        }
    }
}
