//! Schema versioning and ordered migrations.
//!
//! The persisted version lives in `PRAGMA user_version`. Pending migrations run
//! in order inside one transaction, so a failed upgrade leaves the previous
//! schema intact.

use rusqlite::{Connection, Transaction};

use crate::core::errors::{IngestError, Result};

/// Schema version this build reads and writes.
pub const SCHEMA_VERSION: i64 = 2;

/// Outcome of bringing a database up to [`SCHEMA_VERSION`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationReport {
    pub from_version: i64,
    pub to_version: i64,
}

impl MigrationReport {
    /// Whether any migration ran.
    #[must_use]
    pub const fn migrated(&self) -> bool {
        self.from_version != self.to_version
    }
}

/// Read the persisted schema version.
pub fn schema_version(conn: &Connection) -> Result<i64> {
    let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

/// Apply pending migrations; refuse a database written by a newer build.
pub fn migrate(conn: &mut Connection) -> Result<MigrationReport> {
    let from_version = schema_version(conn)?;

    if from_version > SCHEMA_VERSION {
        return Err(IngestError::SchemaTooNew {
            found: from_version,
            supported: SCHEMA_VERSION,
        });
    }

    if from_version == SCHEMA_VERSION {
        return Ok(MigrationReport {
            from_version,
            to_version: from_version,
        });
    }

    let tx = conn.transaction()?;
    let mut version = from_version;
    while version < SCHEMA_VERSION {
        let next = version + 1;
        apply_migration(&tx, next).map_err(|error| IngestError::Migration {
            version: next,
            details: error.to_string(),
        })?;
        version = next;
    }
    tx.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    tx.commit()?;

    Ok(MigrationReport {
        from_version,
        to_version: SCHEMA_VERSION,
    })
}

fn apply_migration(tx: &Transaction<'_>, version: i64) -> rusqlite::Result<()> {
    match version {
        1 => tx.execute_batch(SCHEMA_V1),
        2 => tx.execute_batch(SCHEMA_V2),
        other => Err(rusqlite::Error::InvalidParameterName(format!(
            "unknown migration target version {other}"
        ))),
    }
}

const SCHEMA_V1: &str = "
CREATE TABLE IF NOT EXISTS alerts_raw (
    alert_id INTEGER PRIMARY KEY,
    dia_source_id INTEGER NOT NULL,
    dia_object_id INTEGER,
    ra REAL NOT NULL CHECK (ra >= 0 AND ra < 360),
    dec REAL NOT NULL CHECK (dec >= -90 AND dec <= 90),
    mjd REAL NOT NULL CHECK (mjd > 0),
    ingested_at TEXT NOT NULL,
    filter_name TEXT,
    ps_flux REAL,
    ps_flux_err REAL,
    snr REAL,
    extendedness_median REAL,
    extendedness_min REAL,
    extendedness_max REAL,
    has_ss_source INTEGER NOT NULL DEFAULT 0,
    ss_object_id TEXT,
    ss_object_reassoc_time_mjd REAL,
    is_reassociation INTEGER NOT NULL DEFAULT 0,
    reassociation_reason TEXT,
    trail_data TEXT NOT NULL DEFAULT '{}',
    pixel_flags TEXT NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS processed_sources (
    dia_source_id INTEGER PRIMARY KEY,
    first_seen_mjd REAL NOT NULL,
    last_seen_mjd REAL NOT NULL,
    observation_count INTEGER NOT NULL DEFAULT 1,
    ss_object_id TEXT,
    ss_object_reassoc_time_mjd REAL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS ingestion_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_name TEXT NOT NULL,
    started_at TEXT NOT NULL,
    completed_at TEXT,
    status TEXT NOT NULL
        CHECK (status IN ('running', 'completed', 'failed', 'cancelled')),
    alerts_received INTEGER NOT NULL DEFAULT 0,
    alerts_stored INTEGER NOT NULL DEFAULT 0,
    alerts_failed INTEGER NOT NULL DEFAULT 0,
    duplicates_skipped INTEGER NOT NULL DEFAULT 0,
    records_skipped INTEGER NOT NULL DEFAULT 0,
    new_sources INTEGER NOT NULL DEFAULT 0,
    updated_sources INTEGER NOT NULL DEFAULT 0,
    reassociations_detected INTEGER NOT NULL DEFAULT 0,
    batches_written INTEGER NOT NULL DEFAULT 0,
    batches_failed INTEGER NOT NULL DEFAULT 0,
    state_update_failures INTEGER NOT NULL DEFAULT 0,
    unflushed_on_failure INTEGER NOT NULL DEFAULT 0,
    stop_reason TEXT,
    error_message TEXT,
    metadata TEXT NOT NULL DEFAULT '{}'
);
";

const SCHEMA_V2: &str = "
CREATE INDEX IF NOT EXISTS idx_alerts_dia_source ON alerts_raw(dia_source_id);
CREATE INDEX IF NOT EXISTS idx_alerts_mjd ON alerts_raw(mjd);
CREATE INDEX IF NOT EXISTS idx_alerts_ss_object ON alerts_raw(ss_object_id)
    WHERE ss_object_id IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_alerts_extendedness ON alerts_raw(extendedness_median);
CREATE INDEX IF NOT EXISTS idx_alerts_reassociation ON alerts_raw(is_reassociation)
    WHERE is_reassociation = 1;
CREATE INDEX IF NOT EXISTS idx_sources_last_seen ON processed_sources(last_seen_mjd);
CREATE INDEX IF NOT EXISTS idx_runs_started ON ingestion_runs(started_at);

CREATE VIEW IF NOT EXISTS v_point_sources AS
SELECT * FROM alerts_raw
WHERE extendedness_median IS NOT NULL AND extendedness_median < 0.3;

CREATE VIEW IF NOT EXISTS v_extended_sources AS
SELECT * FROM alerts_raw
WHERE extendedness_median IS NOT NULL AND extendedness_median > 0.7;

CREATE VIEW IF NOT EXISTS v_minimoon_candidates AS
SELECT * FROM alerts_raw
WHERE has_ss_source = 1
  AND extendedness_median IS NOT NULL
  AND extendedness_median BETWEEN 0.3 AND 0.7;

CREATE VIEW IF NOT EXISTS v_reassociations AS
SELECT * FROM alerts_raw WHERE is_reassociation = 1 ORDER BY mjd DESC;

CREATE VIEW IF NOT EXISTS v_ingestion_daily AS
SELECT
    date(started_at) AS date,
    COUNT(*) AS runs,
    SUM(alerts_stored) AS total_stored,
    SUM(alerts_failed) AS total_failed,
    SUM(new_sources) AS total_new_sources,
    SUM(reassociations_detected) AS total_reassociations
FROM ingestion_runs
WHERE status = 'completed'
GROUP BY date(started_at)
ORDER BY date DESC;

CREATE VIEW IF NOT EXISTS v_source_stats AS
SELECT
    dia_source_id,
    observation_count,
    first_seen_mjd,
    last_seen_mjd,
    last_seen_mjd - first_seen_mjd AS arc_length_days,
    ss_object_id,
    ss_object_reassoc_time_mjd
FROM processed_sources
ORDER BY observation_count DESC;
";

#[cfg(test)]
mod tests {
    use super::*;

    fn table_names(conn: &Connection, kind: &str) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = ?1 ORDER BY name")
            .unwrap();
        stmt.query_map([kind], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<String>, _>>()
            .unwrap()
    }

    #[test]
    fn fresh_database_migrates_to_current() {
        let mut conn = Connection::open_in_memory().unwrap();
        let report = migrate(&mut conn).unwrap();
        assert_eq!(report.from_version, 0);
        assert_eq!(report.to_version, SCHEMA_VERSION);
        assert!(report.migrated());
        assert_eq!(schema_version(&conn).unwrap(), SCHEMA_VERSION);

        let tables = table_names(&conn, "table");
        for expected in ["alerts_raw", "ingestion_runs", "processed_sources"] {
            assert!(tables.iter().any(|t| t == expected), "missing {expected}");
        }
        let views = table_names(&conn, "view");
        assert!(views.iter().any(|v| v == "v_minimoon_candidates"));
        assert!(views.iter().any(|v| v == "v_reassociations"));
    }

    #[test]
    fn migrate_is_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        let again = migrate(&mut conn).unwrap();
        assert!(!again.migrated());
    }

    #[test]
    fn partial_schema_is_upgraded_in_order() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(SCHEMA_V1).unwrap();
        conn.pragma_update(None, "user_version", 1).unwrap();

        let report = migrate(&mut conn).unwrap();
        assert_eq!(report.from_version, 1);
        assert!(table_names(&conn, "index")
            .iter()
            .any(|i| i == "idx_alerts_dia_source"));
    }

    #[test]
    fn newer_schema_is_rejected() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "user_version", SCHEMA_VERSION + 1)
            .unwrap();
        let err = migrate(&mut conn).unwrap_err();
        assert!(matches!(err, IngestError::SchemaTooNew { .. }));
        assert_eq!(err.code(), "AIN-2201");
    }
}
