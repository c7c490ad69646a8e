//! Storage statistics for the `stats` command and run reports.

#![allow(missing_docs)]

use std::path::Path;

use rusqlite::Connection;
use serde::Serialize;

use crate::core::errors::Result;
use crate::storage::schema;
use crate::storage::sqlite::from_sql_count;

/// Snapshot of what the database holds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StorageStats {
    pub schema_version: i64,
    pub alerts: u64,
    pub tracked_sources: u64,
    pub ingestion_runs: u64,
    pub sso_alerts: u64,
    pub reassociation_alerts: u64,
    pub min_mjd: Option<f64>,
    pub max_mjd: Option<f64>,
    pub file_size_bytes: Option<u64>,
}

impl StorageStats {
    /// Observation span in days, when any alerts are stored.
    #[must_use]
    pub fn mjd_span_days(&self) -> Option<f64> {
        match (self.min_mjd, self.max_mjd) {
            (Some(min), Some(max)) => Some(max - min),
            _ => None,
        }
    }
}

pub(crate) fn collect(conn: &Connection, path: Option<&Path>) -> Result<StorageStats> {
    let count = |sql: &str| -> Result<u64> {
        let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
        Ok(from_sql_count(n))
    };

    let (min_mjd, max_mjd): (Option<f64>, Option<f64>) = conn.query_row(
        "SELECT MIN(mjd), MAX(mjd) FROM alerts_raw",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    let file_size_bytes = path
        .and_then(|p| std::fs::metadata(p).ok())
        .map(|meta| meta.len());

    Ok(StorageStats {
        schema_version: schema::schema_version(conn)?,
        alerts: count("SELECT COUNT(*) FROM alerts_raw")?,
        tracked_sources: count("SELECT COUNT(*) FROM processed_sources")?,
        ingestion_runs: count("SELECT COUNT(*) FROM ingestion_runs")?,
        sso_alerts: count("SELECT COUNT(*) FROM alerts_raw WHERE has_ss_source = 1")?,
        reassociation_alerts: count("SELECT COUNT(*) FROM alerts_raw WHERE is_reassociation = 1")?,
        min_mjd,
        max_mjd,
        file_size_bytes,
    })
}

#[cfg(test)]
mod tests {
    use crate::model::alert::AlertFields;
    use crate::model::run::IngestionRun;
    use crate::model::state::{Classification, ReassociationReason};
    use crate::storage::AlertStore;
    use crate::storage::schema::SCHEMA_VERSION;
    use crate::storage::sqlite::SqliteStore;

    #[test]
    fn empty_database_has_zero_counts() {
        let store = SqliteStore::open_in_memory().unwrap();
        let stats = store.stats().unwrap();
        assert_eq!(stats.schema_version, SCHEMA_VERSION);
        assert_eq!(stats.alerts, 0);
        assert!(stats.min_mjd.is_none());
        assert!(stats.mjd_span_days().is_none());
        assert!(stats.file_size_bytes.is_none());
    }

    #[test]
    fn stats_reflect_stored_content() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SqliteStore::open(&dir.path().join("s.sqlite3")).unwrap();
        let plain = AlertFields::new(1, 1, 1.0, 1.0, 60_000.0).validate().unwrap();
        let mut moved = AlertFields::new(2, 1, 1.0, 1.0, 60_010.0)
            .with_association("X", None)
            .validate()
            .unwrap();
        moved.annotate(Classification::Reassociated(
            ReassociationReason::NewAssociation,
        ));
        store.write_batch(&[plain, moved]).unwrap();
        store.write_run(&mut IngestionRun::start("mock")).unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.alerts, 2);
        assert_eq!(stats.sso_alerts, 1);
        assert_eq!(stats.reassociation_alerts, 1);
        assert_eq!(stats.ingestion_runs, 1);
        assert_eq!(stats.tracked_sources, 0);
        assert!((stats.mjd_span_days().unwrap() - 10.0).abs() < 1e-9);
        assert!(stats.file_size_bytes.unwrap() > 0);
    }
}
