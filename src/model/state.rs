//! Per-detection-source tracked state and the reassociation verdicts.

#![allow(missing_docs)]

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Why an alert counts as a reassociation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReassociationReason {
    /// Previously unassociated source now has an object.
    NewAssociation,
    /// Associated object identifier changed.
    ChangedAssociation,
    /// Same object, but the association refresh time moved.
    UpdatedReassociation,
}

impl ReassociationReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NewAssociation => "new_association",
            Self::ChangedAssociation => "changed_association",
            Self::UpdatedReassociation => "updated_reassociation",
        }
    }

    /// Parse the stored string form.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "new_association" => Some(Self::NewAssociation),
            "changed_association" => Some(Self::ChangedAssociation),
            "updated_reassociation" => Some(Self::UpdatedReassociation),
            _ => None,
        }
    }
}

impl fmt::Display for ReassociationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of classifying one alert against prior state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "reason")]
pub enum Classification {
    New,
    Unchanged,
    Reassociated(ReassociationReason),
}

impl Classification {
    #[must_use]
    pub const fn is_reassociation(self) -> bool {
        matches!(self, Self::Reassociated(_))
    }

    #[must_use]
    pub const fn reason(self) -> Option<ReassociationReason> {
        match self {
            Self::Reassociated(reason) => Some(reason),
            Self::New | Self::Unchanged => None,
        }
    }
}

/// Durable state of one detection source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceState {
    pub dia_source_id: i64,
    pub first_seen_mjd: f64,
    pub last_seen_mjd: f64,
    pub observation_count: u64,
    pub ss_object_id: Option<String>,
    pub ss_object_reassoc_time_mjd: Option<f64>,
    pub updated_at: DateTime<Utc>,
}

/// One observation applied to state; the arguments of an upsert.
#[derive(Debug, Clone, PartialEq)]
pub struct StateObservation {
    pub dia_source_id: i64,
    pub mjd: f64,
    pub ss_object_id: Option<String>,
    pub ss_object_reassoc_time_mjd: Option<f64>,
}

impl SourceState {
    /// Apply one observation using the durable merge rules.
    ///
    /// Epoch bounds widen monotonically, the count increments, and the
    /// association fields take the observation's values.
    #[must_use]
    pub fn merged(prior: Option<&Self>, obs: &StateObservation, now: DateTime<Utc>) -> Self {
        match prior {
            None => Self {
                dia_source_id: obs.dia_source_id,
                first_seen_mjd: obs.mjd,
                last_seen_mjd: obs.mjd,
                observation_count: 1,
                ss_object_id: obs.ss_object_id.clone(),
                ss_object_reassoc_time_mjd: obs.ss_object_reassoc_time_mjd,
                updated_at: now,
            },
            Some(prev) => Self {
                dia_source_id: prev.dia_source_id,
                first_seen_mjd: prev.first_seen_mjd.min(obs.mjd),
                last_seen_mjd: prev.last_seen_mjd.max(obs.mjd),
                observation_count: prev.observation_count.saturating_add(1),
                ss_object_id: obs.ss_object_id.clone(),
                ss_object_reassoc_time_mjd: obs.ss_object_reassoc_time_mjd,
                updated_at: now,
            },
        }
    }
}
