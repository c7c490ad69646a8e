//! SQLite alert store: WAL-mode database with versioned schema.
//!
//! Alert inserts are `INSERT OR IGNORE` keyed on the alert id, and state
//! upserts are one `ON CONFLICT ... DO UPDATE` statement, so concurrent
//! ingesters sharing a database cannot duplicate alerts or lose counts.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::backup::Backup;
use rusqlite::{Connection, OpenFlags, OptionalExtension, Row, params};

use crate::core::errors::{IngestError, Result};
use crate::model::alert::{AlertFields, AlertRecord, SideTable};
use crate::model::days_ago_mjd;
use crate::model::run::{IngestionRun, RunCounts, RunStatus, StopReason};
use crate::model::state::{ReassociationReason, SourceState, StateObservation};
use crate::storage::AlertStore;
use crate::storage::schema::{self, MigrationReport};
use crate::storage::stats::{self, StorageStats};

/// Busy timeout used when none is configured.
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Pages copied per step of an online backup.
const BACKUP_PAGES_PER_STEP: std::os::raw::c_int = 256;

const INSERT_ALERT_SQL: &str = "INSERT OR IGNORE INTO alerts_raw (
        alert_id, dia_source_id, dia_object_id, ra, dec, mjd, ingested_at,
        filter_name, ps_flux, ps_flux_err, snr,
        extendedness_median, extendedness_min, extendedness_max,
        has_ss_source, ss_object_id, ss_object_reassoc_time_mjd,
        is_reassociation, reassociation_reason, trail_data, pixel_flags
    ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21)";

const UPSERT_STATE_SQL: &str = "INSERT INTO processed_sources (
        dia_source_id, first_seen_mjd, last_seen_mjd, observation_count,
        ss_object_id, ss_object_reassoc_time_mjd, updated_at
    ) VALUES (?1, ?2, ?2, 1, ?3, ?4, ?5)
    ON CONFLICT(dia_source_id) DO UPDATE SET
        first_seen_mjd = MIN(first_seen_mjd, excluded.first_seen_mjd),
        last_seen_mjd = MAX(last_seen_mjd, excluded.last_seen_mjd),
        observation_count = observation_count + 1,
        ss_object_id = excluded.ss_object_id,
        ss_object_reassoc_time_mjd = excluded.ss_object_reassoc_time_mjd,
        updated_at = excluded.updated_at";

const SELECT_STATE_COLUMNS: &str = "SELECT dia_source_id, first_seen_mjd, last_seen_mjd,
        observation_count, ss_object_id, ss_object_reassoc_time_mjd, updated_at
    FROM processed_sources";

const SELECT_RUN_COLUMNS: &str = "SELECT id, source_name, started_at, completed_at, status,
        alerts_received, alerts_stored, alerts_failed, duplicates_skipped, records_skipped,
        new_sources, updated_sources, reassociations_detected, batches_written,
        batches_failed, state_update_failures, unflushed_on_failure,
        stop_reason, error_message, metadata
    FROM ingestion_runs";

/// SQLite-backed [`AlertStore`].
pub struct SqliteStore {
    conn: Connection,
    path: Option<PathBuf>,
    migration: MigrationReport,
}

impl SqliteStore {
    /// Open (or create) the database at `path`, applying PRAGMAs and migrations.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_timeout(path, DEFAULT_BUSY_TIMEOUT_MS)
    }

    /// Like [`Self::open`] with an explicit busy timeout.
    pub fn open_with_timeout(path: &Path, busy_timeout_ms: u64) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|source| IngestError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let mut conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        apply_pragmas(&conn, busy_timeout_ms, true)?;
        let migration = schema::migrate(&mut conn)?;

        Ok(Self {
            conn,
            path: Some(path.to_path_buf()),
            migration,
        })
    }

    /// Private in-memory database, used by tests and dry validation.
    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        apply_pragmas(&conn, DEFAULT_BUSY_TIMEOUT_MS, false)?;
        let migration = schema::migrate(&mut conn)?;
        Ok(Self {
            conn,
            path: None,
            migration,
        })
    }

    /// Database file path; `None` for in-memory stores.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Migrations applied when this store was opened.
    pub const fn migration(&self) -> MigrationReport {
        self.migration
    }

    /// Fetch one stored alert.
    pub fn alert_by_id(&self, alert_id: i64) -> Result<Option<AlertRecord>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT alert_id, dia_source_id, dia_object_id, ra, dec, mjd, ingested_at,
                    filter_name, ps_flux, ps_flux_err, snr,
                    extendedness_median, extendedness_min, extendedness_max,
                    has_ss_source, ss_object_id, ss_object_reassoc_time_mjd,
                    is_reassociation, reassociation_reason, trail_data, pixel_flags
             FROM alerts_raw WHERE alert_id = ?1",
        )?;
        let raw = stmt.query_row(params![alert_id], read_alert_row).optional()?;
        raw.map(StoredAlert::into_record).transpose()
    }

    /// Number of stored alerts.
    pub fn alert_count(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM alerts_raw", [], |row| row.get(0))?;
        Ok(from_sql_count(count))
    }

    /// Fetch one run record by id.
    pub fn get_run(&self, id: i64) -> Result<Option<IngestionRun>> {
        let mut stmt = self
            .conn
            .prepare_cached(&format!("{SELECT_RUN_COLUMNS} WHERE id = ?1"))?;
        let raw = stmt.query_row(params![id], read_run_row).optional()?;
        raw.map(StoredRun::into_run).transpose()
    }

    /// Most recent runs, newest first.
    pub fn recent_runs(&self, limit: u32) -> Result<Vec<IngestionRun>> {
        let mut stmt = self
            .conn
            .prepare_cached(&format!("{SELECT_RUN_COLUMNS} ORDER BY id DESC LIMIT ?1"))?;
        let rows = stmt
            .query_map(params![limit], read_run_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter().map(StoredRun::into_run).collect()
    }

    /// Sources whose last observation falls in `[start_mjd, end_mjd]`.
    pub fn sources_in_window(&self, start_mjd: f64, end_mjd: f64) -> Result<Vec<SourceState>> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "{SELECT_STATE_COLUMNS} WHERE last_seen_mjd BETWEEN ?1 AND ?2
             ORDER BY last_seen_mjd DESC"
        ))?;
        let rows = stmt
            .query_map(params![start_mjd, end_mjd], read_state_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter().map(StoredState::into_state).collect()
    }

    /// Delete state rows not observed within the last `max_age_days` days.
    ///
    /// Returns the number of rows deleted.
    pub fn cleanup_old_state(&mut self, max_age_days: u32) -> Result<usize> {
        let cutoff = days_ago_mjd(max_age_days);
        let deleted = self
            .conn
            .execute(
                "DELETE FROM processed_sources WHERE last_seen_mjd < ?1",
                params![cutoff],
            )
            .map_err(sql_context("cleanup_old_state"))?;
        Ok(deleted)
    }

    /// Row counts, epoch range and file size.
    pub fn stats(&self) -> Result<StorageStats> {
        stats::collect(&self.conn, self.path.as_deref())
    }

    /// Compact the database file.
    pub fn vacuum(&self) -> Result<()> {
        self.conn.execute_batch("VACUUM")?;
        Ok(())
    }

    /// Copy the live database to `dest` with the SQLite online-backup API.
    ///
    /// Parent directories are created. An existing file at `dest` is overwritten.
    pub fn backup(&self, dest: &Path) -> Result<()> {
        if self.path.as_deref() == Some(dest) {
            return Err(IngestError::InvalidConfig {
                details: format!("backup target {} is the live database", dest.display()),
            });
        }
        if let Some(parent) = dest.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|source| IngestError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let mut target = Connection::open(dest)?;
        let backup = Backup::new(&self.conn, &mut target)?;
        backup.run_to_completion(BACKUP_PAGES_PER_STEP, Duration::ZERO, None)?;
        Ok(())
    }

    /// Check that WAL mode is active (for diagnostics).
    pub fn is_wal_mode(&self) -> bool {
        self.conn
            .query_row("PRAGMA journal_mode", [], |row| row.get::<_, String>(0))
            .map(|mode| mode.eq_ignore_ascii_case("wal"))
            .unwrap_or(false)
    }
}

impl AlertStore for SqliteStore {
    fn write_batch(&mut self, records: &[AlertRecord]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        let tx = self.conn.transaction().map_err(sql_context("write_batch"))?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare_cached(INSERT_ALERT_SQL)?;
            for record in records {
                let trail_data = serde_json::to_string(&record.trail_data)?;
                let pixel_flags = serde_json::to_string(&record.pixel_flags)?;
                let ingested_at = format_ts(record.ingested_at.unwrap_or_else(Utc::now));
                inserted += stmt
                    .execute(params![
                        record.alert_id,
                        record.dia_source_id,
                        record.dia_object_id,
                        record.ra,
                        record.dec,
                        record.mjd,
                        ingested_at,
                        record.filter_name,
                        record.ps_flux,
                        record.ps_flux_err,
                        record.snr,
                        record.extendedness_median,
                        record.extendedness_min,
                        record.extendedness_max,
                        record.has_ss_source,
                        record.ss_object_id,
                        record.ss_object_reassoc_time_mjd,
                        record.is_reassociation,
                        record.reassociation_reason.map(ReassociationReason::as_str),
                        trail_data,
                        pixel_flags,
                    ])
                    .map_err(sql_context("write_batch"))?;
            }
        }
        tx.commit().map_err(sql_context("write_batch"))?;
        Ok(inserted)
    }

    fn contains_alert(&self, alert_id: i64) -> Result<bool> {
        let found = self
            .conn
            .prepare_cached("SELECT 1 FROM alerts_raw WHERE alert_id = ?1")?
            .query_row(params![alert_id], |_| Ok(()))
            .optional()?;
        Ok(found.is_some())
    }

    fn get_state(&self, dia_source_id: i64) -> Result<Option<SourceState>> {
        let mut stmt = self
            .conn
            .prepare_cached(&format!("{SELECT_STATE_COLUMNS} WHERE dia_source_id = ?1"))?;
        let raw = stmt
            .query_row(params![dia_source_id], read_state_row)
            .optional()?;
        raw.map(StoredState::into_state).transpose()
    }

    fn upsert_state(&mut self, obs: &StateObservation) -> Result<()> {
        self.conn
            .prepare_cached(UPSERT_STATE_SQL)?
            .execute(params![
                obs.dia_source_id,
                obs.mjd,
                obs.ss_object_id,
                obs.ss_object_reassoc_time_mjd,
                format_ts(Utc::now()),
            ])
            .map_err(sql_context("upsert_state"))?;
        Ok(())
    }

    fn upsert_states(&mut self, observations: &[StateObservation]) -> Result<()> {
        if observations.is_empty() {
            return Ok(());
        }
        let now = format_ts(Utc::now());
        let tx = self.conn.transaction().map_err(sql_context("upsert_state"))?;
        {
            let mut stmt = tx.prepare_cached(UPSERT_STATE_SQL)?;
            for obs in observations {
                stmt.execute(params![
                    obs.dia_source_id,
                    obs.mjd,
                    obs.ss_object_id,
                    obs.ss_object_reassoc_time_mjd,
                    now,
                ])
                .map_err(sql_context("upsert_state"))?;
            }
        }
        tx.commit().map_err(sql_context("upsert_state"))?;
        Ok(())
    }

    fn write_run(&mut self, run: &mut IngestionRun) -> Result<i64> {
        let metadata = serde_json::to_string(&run.metadata)?;
        let c = &run.counts;
        let counts = [
            c.alerts_received,
            c.alerts_stored,
            c.alerts_failed,
            c.duplicates_skipped,
            c.records_skipped,
            c.new_sources,
            c.updated_sources,
            c.reassociations_detected,
            c.batches_written,
            c.batches_failed,
            c.state_update_failures,
            c.unflushed_on_failure,
        ]
        .map(to_sql_count);
        let started_at = format_ts(run.started_at);
        let completed_at = run.completed_at.map(format_ts);
        let stop_reason = run.stop_reason.map(StopReason::as_str);

        if let Some(id) = run.id {
            let changed = self
                .conn
                .prepare_cached(
                    "UPDATE ingestion_runs SET
                        source_name = ?2, started_at = ?3, completed_at = ?4, status = ?5,
                        alerts_received = ?6, alerts_stored = ?7, alerts_failed = ?8,
                        duplicates_skipped = ?9, records_skipped = ?10, new_sources = ?11,
                        updated_sources = ?12, reassociations_detected = ?13,
                        batches_written = ?14, batches_failed = ?15,
                        state_update_failures = ?16, unflushed_on_failure = ?17,
                        stop_reason = ?18, error_message = ?19, metadata = ?20
                     WHERE id = ?1",
                )?
                .execute(params![
                    id,
                    run.source_name,
                    started_at,
                    completed_at,
                    run.status.as_str(),
                    counts[0],
                    counts[1],
                    counts[2],
                    counts[3],
                    counts[4],
                    counts[5],
                    counts[6],
                    counts[7],
                    counts[8],
                    counts[9],
                    counts[10],
                    counts[11],
                    stop_reason,
                    run.error_message,
                    metadata,
                ])
                .map_err(sql_context("write_run"))?;
            if changed == 0 {
                return Err(IngestError::RunNotFound { id });
            }
            return Ok(id);
        }

        self.conn
            .prepare_cached(
                "INSERT INTO ingestion_runs (
                    source_name, started_at, completed_at, status,
                    alerts_received, alerts_stored, alerts_failed, duplicates_skipped,
                    records_skipped, new_sources, updated_sources, reassociations_detected,
                    batches_written, batches_failed, state_update_failures,
                    unflushed_on_failure, stop_reason, error_message, metadata
                ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19)",
            )?
            .execute(params![
                run.source_name,
                started_at,
                completed_at,
                run.status.as_str(),
                counts[0],
                counts[1],
                counts[2],
                counts[3],
                counts[4],
                counts[5],
                counts[6],
                counts[7],
                counts[8],
                counts[9],
                counts[10],
                counts[11],
                stop_reason,
                run.error_message,
                metadata,
            ])
            .map_err(sql_context("write_run"))?;
        let id = self.conn.last_insert_rowid();
        run.id = Some(id);
        Ok(id)
    }
}

// ──────────────────── row mapping ────────────────────

struct StoredAlert {
    fields: AlertFields,
    ingested_at: String,
    reason: Option<String>,
    trail_data: String,
    pixel_flags: String,
}

impl StoredAlert {
    fn into_record(self) -> Result<AlertRecord> {
        let mut fields = self.fields;
        fields.ingested_at = Some(parse_ts(&self.ingested_at)?);
        fields.reassociation_reason = self.reason.as_deref().and_then(ReassociationReason::parse);
        fields.trail_data = serde_json::from_str::<SideTable>(&self.trail_data)?;
        fields.pixel_flags = serde_json::from_str::<SideTable>(&self.pixel_flags)?;
        AlertRecord::try_from(fields)
    }
}

fn read_alert_row(row: &Row<'_>) -> rusqlite::Result<StoredAlert> {
    let fields = AlertFields {
        alert_id: row.get(0)?,
        dia_source_id: row.get(1)?,
        dia_object_id: row.get(2)?,
        ra: row.get(3)?,
        dec: row.get(4)?,
        mjd: row.get(5)?,
        ingested_at: None,
        filter_name: row.get(7)?,
        ps_flux: row.get(8)?,
        ps_flux_err: row.get(9)?,
        snr: row.get(10)?,
        extendedness_median: row.get(11)?,
        extendedness_min: row.get(12)?,
        extendedness_max: row.get(13)?,
        has_ss_source: row.get(14)?,
        ss_object_id: row.get(15)?,
        ss_object_reassoc_time_mjd: row.get(16)?,
        is_reassociation: row.get(17)?,
        reassociation_reason: None,
        trail_data: SideTable::new(),
        pixel_flags: SideTable::new(),
    };
    Ok(StoredAlert {
        fields,
        ingested_at: row.get(6)?,
        reason: row.get(18)?,
        trail_data: row.get(19)?,
        pixel_flags: row.get(20)?,
    })
}

struct StoredState {
    dia_source_id: i64,
    first_seen_mjd: f64,
    last_seen_mjd: f64,
    observation_count: i64,
    ss_object_id: Option<String>,
    ss_object_reassoc_time_mjd: Option<f64>,
    updated_at: String,
}

impl StoredState {
    fn into_state(self) -> Result<SourceState> {
        Ok(SourceState {
            dia_source_id: self.dia_source_id,
            first_seen_mjd: self.first_seen_mjd,
            last_seen_mjd: self.last_seen_mjd,
            observation_count: from_sql_count(self.observation_count),
            ss_object_id: self.ss_object_id,
            ss_object_reassoc_time_mjd: self.ss_object_reassoc_time_mjd,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

fn read_state_row(row: &Row<'_>) -> rusqlite::Result<StoredState> {
    Ok(StoredState {
        dia_source_id: row.get(0)?,
        first_seen_mjd: row.get(1)?,
        last_seen_mjd: row.get(2)?,
        observation_count: row.get(3)?,
        ss_object_id: row.get(4)?,
        ss_object_reassoc_time_mjd: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

struct StoredRun {
    id: i64,
    source_name: String,
    started_at: String,
    completed_at: Option<String>,
    status: String,
    counts: [i64; 12],
    stop_reason: Option<String>,
    error_message: Option<String>,
    metadata: String,
}

impl StoredRun {
    fn into_run(self) -> Result<IngestionRun> {
        let status = RunStatus::parse(&self.status).ok_or_else(|| IngestError::Serialization {
            context: "ingestion_runs.status",
            details: format!("unknown run status {:?}", self.status),
        })?;
        let [
            alerts_received,
            alerts_stored,
            alerts_failed,
            duplicates_skipped,
            records_skipped,
            new_sources,
            updated_sources,
            reassociations_detected,
            batches_written,
            batches_failed,
            state_update_failures,
            unflushed_on_failure,
        ] = self.counts.map(from_sql_count);
        Ok(IngestionRun {
            id: Some(self.id),
            source_name: self.source_name,
            started_at: parse_ts(&self.started_at)?,
            completed_at: self.completed_at.as_deref().map(parse_ts).transpose()?,
            status,
            counts: RunCounts {
                alerts_received,
                alerts_stored,
                alerts_failed,
                duplicates_skipped,
                records_skipped,
                new_sources,
                updated_sources,
                reassociations_detected,
                batches_written,
                batches_failed,
                state_update_failures,
                unflushed_on_failure,
            },
            stop_reason: self.stop_reason.as_deref().and_then(StopReason::parse),
            error_message: self.error_message,
            metadata: serde_json::from_str(&self.metadata)?,
        })
    }
}

fn read_run_row(row: &Row<'_>) -> rusqlite::Result<StoredRun> {
    let mut counts = [0_i64; 12];
    for (offset, slot) in counts.iter_mut().enumerate() {
        *slot = row.get(5 + offset)?;
    }
    Ok(StoredRun {
        id: row.get(0)?,
        source_name: row.get(1)?,
        started_at: row.get(2)?,
        completed_at: row.get(3)?,
        status: row.get(4)?,
        counts,
        stop_reason: row.get(17)?,
        error_message: row.get(18)?,
        metadata: row.get(19)?,
    })
}

// ──────────────────── helpers ────────────────────

pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|error| IngestError::Serialization {
            context: "timestamp",
            details: format!("{raw:?}: {error}"),
        })
}

fn to_sql_count(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

pub(crate) fn from_sql_count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn sql_context(context: &'static str) -> impl Fn(rusqlite::Error) -> IngestError {
    move |error| IngestError::Sql {
        context,
        details: error.to_string(),
    }
}

fn apply_pragmas(conn: &Connection, busy_timeout_ms: u64, expect_wal: bool) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA temp_store = MEMORY;
         PRAGMA foreign_keys = ON;",
    )?;
    conn.busy_timeout(std::time::Duration::from_millis(busy_timeout_ms))?;
    if expect_wal {
        let mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
        if !mode.eq_ignore_ascii_case("wal") {
            eprintln!("[AIN-SQLITE] WARNING: requested WAL mode but got '{mode}'");
        }
    }
    Ok(())
}

// ──────────────────── tests ────────────────────
