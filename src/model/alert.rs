//! Normalized alert records.
//!
//! [`AlertFields`] is the raw, unchecked shape a source produces. The only way
//! to obtain an [`AlertRecord`] is through validation, so every record that
//! reaches the pipeline has in-range coordinates and statistics.

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::ops::Deref;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::errors::{IngestError, Result};
use crate::model::state::{Classification, ReassociationReason};

/// Free-form auxiliary flags attached to an alert.
pub type SideTable = BTreeMap<String, serde_json::Value>;

/// Unvalidated alert payload as decoded from a source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertFields {
    pub alert_id: i64,
    pub dia_source_id: i64,
    #[serde(default)]
    pub dia_object_id: Option<i64>,
    pub ra: f64,
    pub dec: f64,
    pub mjd: f64,
    #[serde(default)]
    pub ingested_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub filter_name: Option<String>,
    #[serde(default)]
    pub ps_flux: Option<f64>,
    #[serde(default)]
    pub ps_flux_err: Option<f64>,
    #[serde(default)]
    pub snr: Option<f64>,
    #[serde(default)]
    pub extendedness_median: Option<f64>,
    #[serde(default)]
    pub extendedness_min: Option<f64>,
    #[serde(default)]
    pub extendedness_max: Option<f64>,
    #[serde(default)]
    pub has_ss_source: bool,
    #[serde(default)]
    pub ss_object_id: Option<String>,
    #[serde(default)]
    pub ss_object_reassoc_time_mjd: Option<f64>,
    #[serde(default)]
    pub is_reassociation: bool,
    #[serde(default)]
    pub reassociation_reason: Option<ReassociationReason>,
    #[serde(default)]
    pub trail_data: SideTable,
    #[serde(default)]
    pub pixel_flags: SideTable,
}

impl AlertFields {
    /// Minimal payload with identity, position and epoch.
    #[must_use]
    pub fn new(alert_id: i64, dia_source_id: i64, ra: f64, dec: f64, mjd: f64) -> Self {
        Self {
            alert_id,
            dia_source_id,
            ra,
            dec,
            mjd,
            ..Self::default()
        }
    }

    /// Attach a Solar System object association.
    #[must_use]
    pub fn with_association(mut self, ss_object_id: impl Into<String>, reassoc_time: Option<f64>) -> Self {
        self.ss_object_id = Some(ss_object_id.into());
        self.ss_object_reassoc_time_mjd = reassoc_time;
        self.has_ss_source = true;
        self
    }

    #[must_use]
    pub fn with_extendedness(mut self, median: f64, min: f64, max: f64) -> Self {
        self.extendedness_median = Some(median);
        self.extendedness_min = Some(min);
        self.extendedness_max = Some(max);
        self
    }

    #[must_use]
    pub fn with_photometry(mut self, filter: &str, flux: f64, flux_err: f64, snr: f64) -> Self {
        self.filter_name = Some(filter.to_string());
        self.ps_flux = Some(flux);
        self.ps_flux_err = Some(flux_err);
        self.snr = Some(snr);
        self
    }

    /// Validate and normalize into an [`AlertRecord`].
    pub fn validate(self) -> Result<AlertRecord> {
        AlertRecord::try_from(self)
    }
}

/// A validated alert. Read-only apart from the one-time classification annotation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "AlertFields", into = "AlertFields")]
pub struct AlertRecord(AlertFields);

impl AlertRecord {
    /// Parse and validate one JSON-encoded alert.
    pub fn from_json(raw: &str) -> Result<Self> {
        let fields: AlertFields = serde_json::from_str(raw)?;
        Self::try_from(fields)
    }

    /// Consume the record, returning its fields.
    #[must_use]
    pub fn into_fields(self) -> AlertFields {
        self.0
    }

    /// Whether this alert carries an SSO association.
    #[must_use]
    pub fn is_associated(&self) -> bool {
        self.0.ss_object_id.is_some()
    }

    /// Record the state tracker's verdict on this alert.
    pub(crate) fn annotate(&mut self, classification: Classification) {
        match classification {
            Classification::Reassociated(reason) => {
                self.0.is_reassociation = true;
                self.0.reassociation_reason = Some(reason);
            }
            Classification::New | Classification::Unchanged => {
                self.0.is_reassociation = false;
                self.0.reassociation_reason = None;
            }
        }
    }
}

impl Deref for AlertRecord {
    type Target = AlertFields;

    fn deref(&self) -> &AlertFields {
        &self.0
    }
}

impl From<AlertRecord> for AlertFields {
    fn from(value: AlertRecord) -> Self {
        value.0
    }
}

impl TryFrom<AlertFields> for AlertRecord {
    type Error = IngestError;

    fn try_from(mut fields: AlertFields) -> Result<Self> {
        check_finite("ra", fields.ra)?;
        if !(0.0..360.0).contains(&fields.ra) {
            return Err(IngestError::invalid_record(
                "ra",
                format!("must be in [0, 360), got {}", fields.ra),
            ));
        }
        check_finite("dec", fields.dec)?;
        if !(-90.0..=90.0).contains(&fields.dec) {
            return Err(IngestError::invalid_record(
                "dec",
                format!("must be in [-90, 90], got {}", fields.dec),
            ));
        }
        check_finite("mjd", fields.mjd)?;
        if fields.mjd <= 0.0 {
            return Err(IngestError::invalid_record(
                "mjd",
                format!("must be positive, got {}", fields.mjd),
            ));
        }

        for (name, value) in [
            ("ps_flux", fields.ps_flux),
            ("ps_flux_err", fields.ps_flux_err),
            ("ss_object_reassoc_time_mjd", fields.ss_object_reassoc_time_mjd),
        ] {
            if let Some(v) = value {
                check_finite(name, v)?;
            }
        }

        if let Some(snr) = fields.snr {
            check_finite("snr", snr)?;
            if snr < 0.0 {
                return Err(IngestError::invalid_record(
                    "snr",
                    format!("must be >= 0, got {snr}"),
                ));
            }
        }

        for (name, value) in [
            ("extendedness_median", fields.extendedness_median),
            ("extendedness_min", fields.extendedness_min),
            ("extendedness_max", fields.extendedness_max),
        ] {
            if let Some(v) = value
                && !(0.0..=1.0).contains(&v)
            {
                return Err(IngestError::invalid_record(
                    name,
                    format!("must be in [0, 1], got {v}"),
                ));
            }
        }

        if let Some(id) = fields.ss_object_id.as_deref()
            && id.trim().is_empty()
        {
            fields.ss_object_id = None;
        }
        fields.has_ss_source = fields.has_ss_source || fields.ss_object_id.is_some();
        fields.filter_name = fields
            .filter_name
            .map(|f| f.trim().to_ascii_lowercase())
            .filter(|f| !f.is_empty());
        if fields.ingested_at.is_none() {
            fields.ingested_at = Some(Utc::now());
        }

        Ok(Self(fields))
    }
}

fn check_finite(field: &'static str, value: f64) -> Result<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(IngestError::invalid_record(
            field,
            format!("must be finite, got {value}"),
        ))
    }
}
