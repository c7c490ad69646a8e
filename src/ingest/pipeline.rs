//! Ingestion pipeline: source -> dedup -> classify -> batch -> store -> audit.
//!
//! One [`Pipeline`] executes exactly one run, moving `Idle -> Running ->
//! Finished`. The run record is persisted before the source is connected
//! and again on every exit path, so even a failed connect leaves an audit
//! row. Per-batch write failures are isolated to their batch; a source
//! failure ends the run.
//!
//! State for staged records is committed only after their batch is durable,
//! so a failed batch never advances tracked state.

#![allow(missing_docs)]

use std::collections::HashSet;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};

use crate::core::config::IngestConfig;
use crate::core::errors::{IngestError, Result};
use crate::ingest::cancel::CancelToken;
use crate::ingest::state::{StagedTally, StateTracker};
use crate::logger::events::{EventLoggerHandle, IngestEvent};
use crate::model::alert::AlertRecord;
use crate::model::run::{IngestionRun, RunStatus, StopReason};
use crate::source::AlertSource;
use crate::storage::AlertStore;

/// Knobs for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOptions {
    /// Records per storage write; at least 1.
    pub batch_size: usize,
    pub max_records: Option<u64>,
    pub max_duration: Option<Duration>,
    /// Skip alerts whose id is already stored or already seen this run.
    pub skip_duplicates: bool,
    /// Classify everything, write nothing (not even the run record).
    pub dry_run: bool,
    pub track_state: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self::from(&IngestConfig::default())
    }
}

impl From<&IngestConfig> for PipelineOptions {
    fn from(cfg: &IngestConfig) -> Self {
        Self {
            batch_size: cfg.batch_size.max(1),
            max_records: cfg.max_records,
            max_duration: cfg.max_duration_secs.map(Duration::from_secs),
            skip_duplicates: cfg.skip_duplicates,
            dry_run: cfg.dry_run,
            track_state: cfg.track_state,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Running,
    Finished,
}

/// Single-use orchestrator over one source and one store.
pub struct Pipeline<S, St> {
    source: S,
    store: St,
    options: PipelineOptions,
    tracker: StateTracker,
    cancel: CancelToken,
    events: Option<EventLoggerHandle>,
    metadata: Map<String, Value>,
    phase: Phase,
    last_run: Option<IngestionRun>,
}

impl<S: AlertSource, St: AlertStore> Pipeline<S, St> {
    pub fn new(source: S, store: St, mut options: PipelineOptions) -> Self {
        options.batch_size = options.batch_size.max(1);
        Self {
            source,
            store,
            options,
            tracker: StateTracker::new(),
            cancel: CancelToken::new(),
            events: None,
            metadata: Map::new(),
            phase: Phase::Idle,
            last_run: None,
        }
    }

    /// Stop cleanly when `token` is cancelled.
    #[must_use]
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    #[must_use]
    pub fn with_event_logger(mut self, events: EventLoggerHandle) -> Self {
        self.events = Some(events);
        self
    }

    /// Extra key recorded in the run's metadata.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub const fn phase(&self) -> Phase {
        self.phase
    }

    pub const fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// The run record as last seen, also after a failed run.
    pub const fn last_run(&self) -> Option<&IngestionRun> {
        self.last_run.as_ref()
    }

    pub const fn store(&self) -> &St {
        &self.store
    }

    pub fn into_parts(self) -> (S, St) {
        (self.source, self.store)
    }

    /// Execute the run.
    ///
    /// Returns the terminal run record for COMPLETED and CANCELLED runs.
    /// Fatal errors are returned after the FAILED record has been persisted;
    /// [`Pipeline::last_run`] still holds it.
    pub fn run(&mut self) -> Result<IngestionRun> {
        if self.phase != Phase::Idle {
            return Err(IngestError::PipelineReused);
        }
        self.phase = Phase::Running;

        let mut run = IngestionRun::start(self.source.source_name());
        run.metadata = Value::Object(self.run_metadata());
        let persist = !self.options.dry_run;
        if persist && let Err(e) = self.store.write_run(&mut run) {
            self.phase = Phase::Finished;
            return Err(e);
        }

        let Self {
            source,
            store,
            options,
            tracker,
            cancel,
            events,
            ..
        } = self;
        let events = events.as_ref();
        emit(
            events,
            IngestEvent::RunStarted {
                run_id: run.id,
                source: run.source_name.clone(),
            },
        );

        let mut guard = RunGuard {
            store,
            run,
            persist,
            armed: true,
        };
        let outcome = drive(source, &mut guard, tracker, options, cancel, events);

        source.close();
        guard.run.counts.records_skipped = source.records_skipped();
        emit(
            events,
            IngestEvent::SourceClosed {
                source: guard.run.source_name.clone(),
                records_skipped: guard.run.counts.records_skipped,
            },
        );

        let result = guard.finish(outcome);
        emit(events, IngestEvent::RunFinished(Box::new(guard.run.clone())));
        let run = guard.run.clone();
        drop(guard);

        self.phase = Phase::Finished;
        self.last_run = Some(run.clone());
        result.map(|()| run)
    }

    fn run_metadata(&self) -> Map<String, Value> {
        let mut meta = self.metadata.clone();
        let o = &self.options;
        meta.insert("batch_size".into(), Value::from(o.batch_size));
        meta.insert("skip_duplicates".into(), Value::from(o.skip_duplicates));
        meta.insert("track_state".into(), Value::from(o.track_state));
        meta.insert("dry_run".into(), Value::from(o.dry_run));
        if let Some(max) = o.max_records {
            meta.insert("max_records".into(), Value::from(max));
        }
        if let Some(max) = o.max_duration {
            meta.insert("max_duration_secs".into(), Value::from(max.as_secs()));
        }
        meta
    }
}

/// Holds the run record while a run is in flight.
///
/// Dropping an armed guard (a panic mid-run) still writes a FAILED record.
struct RunGuard<'a, St: AlertStore> {
    store: &'a mut St,
    run: IngestionRun,
    persist: bool,
    armed: bool,
}

impl<St: AlertStore> RunGuard<'_, St> {
    /// Settle status from the drive outcome and persist the terminal record.
    fn finish(&mut self, outcome: Result<StopReason>) -> Result<()> {
        self.armed = false;
        let result = match outcome {
            Ok(reason) => {
                self.run.stop_reason = Some(reason);
                let status = if reason == StopReason::Cancelled {
                    RunStatus::Cancelled
                } else {
                    RunStatus::Completed
                };
                self.run.finish(status, None);
                Ok(())
            }
            Err(e) => {
                if matches!(
                    e,
                    IngestError::SourceConnect { .. } | IngestError::SourceFetch { .. }
                ) {
                    self.run.stop_reason = Some(StopReason::SourceError);
                }
                self.run.finish(RunStatus::Failed, Some(e.to_string()));
                Err(e)
            }
        };

        if self.persist
            && let Err(write_err) = self.store.write_run(&mut self.run)
        {
            eprintln!("[AIN-PIPELINE] failed to persist run record: {write_err}");
            return result.and(Err(write_err));
        }
        result
    }
}

impl<St: AlertStore> Drop for RunGuard<'_, St> {
    fn drop(&mut self) {
        if self.armed && self.persist {
            self.run
                .finish(RunStatus::Failed, Some("run aborted before completion".to_string()));
            let _ = self.store.write_run(&mut self.run);
        }
    }
}

/// Pull records until the stream ends or a bound trips.
///
/// On error the buffered batch is accounted as failed and unflushed.
fn drive<S: AlertSource, St: AlertStore>(
    source: &mut S,
    guard: &mut RunGuard<'_, St>,
    tracker: &mut StateTracker,
    options: &PipelineOptions,
    cancel: &CancelToken,
    events: Option<&EventLoggerHandle>,
) -> Result<StopReason> {
    let mut batcher = Batcher {
        store: &mut *guard.store,
        run: &mut guard.run,
        tracker,
        options,
        events,
        persist: guard.persist,
        batch: Vec::with_capacity(options.batch_size),
        seen: HashSet::new(),
    };

    let outcome = pump(source, &mut batcher, options, cancel, events);
    match outcome {
        Ok(reason) => {
            batcher.flush();
            Ok(reason)
        }
        Err(e) => {
            batcher.abandon();
            Err(e)
        }
    }
}

fn pump<S: AlertSource, St: AlertStore>(
    source: &mut S,
    batcher: &mut Batcher<'_, St>,
    options: &PipelineOptions,
    cancel: &CancelToken,
    events: Option<&EventLoggerHandle>,
) -> Result<StopReason> {
    source.connect()?;
    emit(
        events,
        IngestEvent::SourceConnected {
            source: source.source_name().to_string(),
        },
    );

    let started = Instant::now();
    let mut stream = source.fetch_alerts(options.max_records)?;
    loop {
        if let Some(reason) = bound_reached(batcher.run.counts.alerts_received, started, options, cancel) {
            return Ok(reason);
        }
        let Some(item) = stream.next() else {
            return Ok(StopReason::Exhausted);
        };
        batcher.accept(item?)?;
    }
}

fn bound_reached(
    received: u64,
    started: Instant,
    options: &PipelineOptions,
    cancel: &CancelToken,
) -> Option<StopReason> {
    if cancel.is_cancelled() {
        return Some(StopReason::Cancelled);
    }
    if options.max_records.is_some_and(|max| received >= max) {
        return Some(StopReason::MaxRecords);
    }
    if options.max_duration.is_some_and(|max| started.elapsed() >= max) {
        return Some(StopReason::MaxDuration);
    }
    None
}

/// Owns the in-memory batch and the per-run counters it feeds.
struct Batcher<'a, St: AlertStore> {
    store: &'a mut St,
    run: &'a mut IngestionRun,
    tracker: &'a mut StateTracker,
    options: &'a PipelineOptions,
    events: Option<&'a EventLoggerHandle>,
    persist: bool,
    batch: Vec<AlertRecord>,
    /// Alert ids accepted this run and not lost to a failed batch.
    seen: HashSet<i64>,
}

impl<St: AlertStore> Batcher<'_, St> {
    fn accept(&mut self, mut record: AlertRecord) -> Result<()> {
        self.run.counts.alerts_received += 1;
        match self.admit(&mut record) {
            Ok(true) => {
                self.seen.insert(record.alert_id);
                self.batch.push(record);
                if self.batch.len() >= self.options.batch_size {
                    self.flush();
                }
                Ok(())
            }
            Ok(false) => {
                self.run.counts.duplicates_skipped += 1;
                Ok(())
            }
            Err(e) => {
                self.run.counts.alerts_failed += 1;
                Err(e)
            }
        }
    }

    /// Dedup check then classification. `false` means duplicate.
    fn admit(&mut self, record: &mut AlertRecord) -> Result<bool> {
        if self.options.skip_duplicates
            && (self.seen.contains(&record.alert_id) || self.store.contains_alert(record.alert_id)?)
        {
            return Ok(false);
        }
        if self.options.track_state {
            self.tracker.stage(record, &*self.store)?;
        }
        Ok(true)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn flush(&mut self) {
        if self.batch.is_empty() {
            return;
        }
        let size = self.batch.len() as u64;

        if !self.persist {
            let tally = self.tracker.settle_in_memory();
            self.credit(tally);
            self.run.counts.alerts_stored += size;
            self.run.counts.batches_written += 1;
            self.batch.clear();
            return;
        }

        let started = Instant::now();
        match self.store.write_batch(&self.batch) {
            Ok(inserted) => {
                let inserted = inserted as u64;
                let counts = &mut self.run.counts;
                counts.alerts_stored += inserted;
                counts.duplicates_skipped += size.saturating_sub(inserted);
                counts.batches_written += 1;
                emit(
                    self.events,
                    IngestEvent::BatchWritten {
                        run_id: self.run.id,
                        batch_size: size,
                        inserted,
                        duration_ms: started.elapsed().as_millis() as u64,
                    },
                );
                if self.options.track_state {
                    self.commit_state();
                }
                self.checkpoint();
            }
            Err(e) => {
                self.run.counts.alerts_failed += size;
                self.run.counts.batches_failed += 1;
                self.tracker.discard();
                for record in &self.batch {
                    self.seen.remove(&record.alert_id);
                }
                eprintln!("[AIN-PIPELINE] batch of {size} alerts failed: {e}");
                emit(
                    self.events,
                    IngestEvent::BatchFailed {
                        run_id: self.run.id,
                        batch_size: size,
                        error_code: e.code().to_string(),
                        error_message: e.to_string(),
                    },
                );
            }
        }
        self.batch.clear();
    }

    fn commit_state(&mut self) {
        let staged = self.tracker.staged_len() as u64;
        match self.tracker.commit(&mut *self.store) {
            Ok(tally) => self.credit(tally),
            Err(e) => {
                self.run.counts.state_update_failures += staged;
                eprintln!("[AIN-PIPELINE] state update for {staged} observations failed: {e}");
                emit(
                    self.events,
                    IngestEvent::StateCommitFailed {
                        run_id: self.run.id,
                        observations: staged,
                        error_code: e.code().to_string(),
                        error_message: e.to_string(),
                    },
                );
            }
        }
    }

    /// Progress snapshot of the run record; failures only warn.
    fn checkpoint(&mut self) {
        if let Err(e) = self.store.write_run(self.run) {
            eprintln!("[AIN-PIPELINE] run checkpoint failed: {e}");
        }
    }

    fn credit(&mut self, tally: StagedTally) {
        let counts = &mut self.run.counts;
        counts.new_sources += tally.new_sources;
        counts.updated_sources += tally.updated_sources;
        counts.reassociations_detected += tally.reassociations;
    }

    /// Account for buffered records dropped by a fatal error.
    fn abandon(&mut self) {
        let size = self.batch.len() as u64;
        self.run.counts.alerts_failed += size;
        self.run.counts.unflushed_on_failure += size;
        self.tracker.discard();
        self.batch.clear();
    }
}

fn emit(events: Option<&EventLoggerHandle>, event: IngestEvent) {
    if let Some(handle) = events {
        handle.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::alert::AlertFields;
    use crate::model::state::{SourceState, StateObservation};
    use crate::source::memory::MemorySource;
    use crate::source::mock::MockSource;
    use crate::storage::sqlite::SqliteStore;

    /// Wraps a store, counting writes and optionally failing chosen batches.
    struct ProbeStore {
        inner: SqliteStore,
        write_calls: usize,
        rows_reported: usize,
        fail_batches: Vec<usize>,
        fail_state: bool,
    }

    impl ProbeStore {
        fn new() -> Self {
            Self {
                inner: SqliteStore::open_in_memory().unwrap(),
                write_calls: 0,
                rows_reported: 0,
                fail_batches: Vec::new(),
                fail_state: false,
            }
        }
    }

    impl AlertStore for ProbeStore {
        fn write_batch(&mut self, records: &[AlertRecord]) -> Result<usize> {
            self.write_calls += 1;
            if self.fail_batches.contains(&self.write_calls) {
                return Err(IngestError::Sql {
                    context: "write_batch",
                    details: "disk I/O error".to_string(),
                });
            }
            let n = self.inner.write_batch(records)?;
            self.rows_reported += n;
            Ok(n)
        }

        fn contains_alert(&self, alert_id: i64) -> Result<bool> {
            self.inner.contains_alert(alert_id)
        }

        fn get_state(&self, dia_source_id: i64) -> Result<Option<SourceState>> {
            self.inner.get_state(dia_source_id)
        }

        fn upsert_state(&mut self, obs: &StateObservation) -> Result<()> {
            if self.fail_state {
                return Err(IngestError::Sql {
                    context: "upsert_state",
                    details: "database is locked".to_string(),
                });
            }
            self.inner.upsert_state(obs)
        }

        fn write_run(&mut self, run: &mut IngestionRun) -> Result<i64> {
            self.inner.write_run(run)
        }
    }

    fn options(batch_size: usize) -> PipelineOptions {
        PipelineOptions {
            batch_size,
            ..PipelineOptions::default()
        }
    }

    fn records(ids: &[(i64, i64)]) -> Vec<AlertRecord> {
        ids.iter()
            .map(|&(alert, source)| {
                AlertFields::new(alert, source, 10.0, 10.0, 60_000.0 + alert as f64)
                    .validate()
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn issues_ceil_n_over_b_writes() {
        let source = MockSource::new(23, 5);
        let mut pipeline = Pipeline::new(source, ProbeStore::new(), options(5));
        let run = pipeline.run().unwrap();

        assert_eq!(pipeline.store().write_calls, 5);
        assert_eq!(pipeline.store().rows_reported, 23);
        assert_eq!(run.counts.alerts_stored, 23);
        assert_eq!(run.counts.batches_written, 5);
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.stop_reason, Some(StopReason::Exhausted));
        assert!(run.counts.is_balanced());
    }

    #[test]
    fn duplicate_in_run_is_skipped_not_failed() {
        let source = MemorySource::new("replay", records(&[(1, 10), (2, 10), (1, 10)]));
        let mut pipeline = Pipeline::new(source, ProbeStore::new(), options(10));
        let run = pipeline.run().unwrap();

        assert_eq!(run.counts.alerts_received, 3);
        assert_eq!(run.counts.alerts_stored, 2);
        assert_eq!(run.counts.duplicates_skipped, 1);
        assert_eq!(run.counts.alerts_failed, 0);
        assert_eq!(pipeline.store().inner.alert_count().unwrap(), 2);
    }

    #[test]
    fn already_stored_alert_is_skipped_on_second_run() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let first = Pipeline::new(
            MemorySource::new("replay", records(&[(1, 10), (2, 11)])),
            &mut store,
            options(10),
        )
        .run()
        .unwrap();
        assert_eq!(first.counts.alerts_stored, 2);

        let second = Pipeline::new(
            MemorySource::new("replay", records(&[(1, 10), (2, 11), (3, 12)])),
            &mut store,
            options(10),
        )
        .run()
        .unwrap();
        assert_eq!(second.counts.alerts_stored, 1);
        assert_eq!(second.counts.duplicates_skipped, 2);
        assert_eq!(store.get_state(10).unwrap().unwrap().observation_count, 1);
    }

    #[test]
    fn without_dedup_storage_still_ignores_duplicates() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store.write_batch(&records(&[(1, 10)])).unwrap();
        let mut opts = options(10);
        opts.skip_duplicates = false;
        let run = Pipeline::new(
            MemorySource::new("replay", records(&[(1, 10), (2, 10)])),
            &mut store,
            opts,
        )
        .run()
        .unwrap();
        assert_eq!(run.counts.alerts_stored, 1);
        assert_eq!(run.counts.duplicates_skipped, 1);
        assert!(run.counts.is_balanced());
    }

    #[test]
    fn max_records_completes_early() {
        let mut opts = options(4);
        opts.max_records = Some(10);
        let mut pipeline = Pipeline::new(MockSource::new(100, 1), ProbeStore::new(), opts);
        let run = pipeline.run().unwrap();

        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.stop_reason, Some(StopReason::MaxRecords));
        assert_eq!(run.counts.alerts_received, 10);
        assert!(run.counts.alerts_stored <= 10);
        assert_eq!(pipeline.store().write_calls, 3);
    }

    #[test]
    fn zero_duration_bound_stops_before_reading() {
        let mut opts = options(4);
        opts.max_duration = Some(Duration::ZERO);
        let run = Pipeline::new(MockSource::new(10, 1), ProbeStore::new(), opts)
            .run()
            .unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.stop_reason, Some(StopReason::MaxDuration));
        assert_eq!(run.counts.alerts_received, 0);
    }

    #[test]
    fn cancellation_ends_run_as_cancelled() {
        let token = CancelToken::new();
        token.cancel();
        let mut pipeline = Pipeline::new(MockSource::new(10, 1), ProbeStore::new(), options(4))
            .with_cancel_token(token);
        let run = pipeline.run().unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
        assert_eq!(run.stop_reason, Some(StopReason::Cancelled));
        let stored = pipeline.store().inner.get_run(run.id.unwrap()).unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Cancelled);
    }

    #[test]
    fn fetch_failure_fails_run_and_persists_record() {
        let source = MemorySource::new(
            "replay",
            records(&[(1, 1), (2, 2), (3, 3), (4, 4), (5, 5)]),
        )
        .failing_after(3, "broker connection reset");
        let mut pipeline = Pipeline::new(source, ProbeStore::new(), options(2));
        let err = pipeline.run().unwrap_err();
        assert!(matches!(err, IngestError::SourceFetch { .. }));

        let run = pipeline.last_run().unwrap().clone();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.stop_reason, Some(StopReason::SourceError));
        assert_eq!(run.counts.alerts_stored, 2);
        assert_eq!(run.counts.alerts_failed, 1);
        assert_eq!(run.counts.unflushed_on_failure, 1);
        assert!(run.counts.is_balanced());
        assert!(run.error_message.as_deref().unwrap().contains("broker connection reset"));

        let stored = pipeline.store().inner.get_run(run.id.unwrap()).unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Failed);
        assert_eq!(stored.counts.unflushed_on_failure, 1);
    }

    #[test]
    fn connect_failure_is_audited() {
        let source = MemorySource::new("replay", Vec::new()).failing_connect("unreachable");
        let mut pipeline = Pipeline::new(source, ProbeStore::new(), options(2));
        assert!(matches!(
            pipeline.run(),
            Err(IngestError::SourceConnect { .. })
        ));
        let runs = pipeline.store().inner.recent_runs(5).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Failed);
    }

    #[test]
    fn failing_batch_is_isolated() {
        let mut store = ProbeStore::new();
        store.fail_batches = vec![2];
        let source = MemorySource::new(
            "replay",
            records(&[(1, 1), (2, 2), (3, 3), (4, 4), (5, 5), (6, 6)]),
        );
        let mut pipeline = Pipeline::new(source, store, options(2));
        let run = pipeline.run().unwrap();

        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.counts.alerts_stored, 4);
        assert_eq!(run.counts.alerts_failed, 2);
        assert_eq!(run.counts.batches_failed, 1);
        assert_eq!(run.counts.batches_written, 2);
        assert!(run.counts.is_balanced());
        // State never advanced for the lost batch.
        assert!(pipeline.store().inner.get_state(3).unwrap().is_none());
        assert!(pipeline.store().inner.get_state(5).unwrap().is_some());
    }

    #[test]
    fn state_failure_is_counted_and_run_continues() {
        let mut store = ProbeStore::new();
        store.fail_state = true;
        let source = MemorySource::new("replay", records(&[(1, 1), (2, 2), (3, 3)]));
        let run = Pipeline::new(source, store, options(2)).run().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.counts.alerts_stored, 3);
        assert_eq!(run.counts.state_update_failures, 3);
        assert_eq!(run.counts.new_sources, 0);
    }

    #[test]
    fn classification_sees_earlier_records_in_same_batch() {
        let mut raw: Vec<AlertFields> = records(&[(1, 7), (2, 7), (3, 7)])
            .into_iter()
            .map(AlertRecord::into_fields)
            .collect();
        raw[1] = raw[1].clone().with_association("SSO_A", Some(60_001.0));
        raw[2] = raw[2].clone().with_association("SSO_B", Some(60_001.0));
        let source = MemorySource::from_fields("replay", raw);
        let mut pipeline = Pipeline::new(source, ProbeStore::new(), options(10));
        let run = pipeline.run().unwrap();

        assert_eq!(run.counts.new_sources, 1);
        assert_eq!(run.counts.updated_sources, 2);
        assert_eq!(run.counts.reassociations_detected, 2);
        let store = &pipeline.store().inner;
        let second = store.alert_by_id(2).unwrap().unwrap();
        assert!(second.is_reassociation);
        let state = store.get_state(7).unwrap().unwrap();
        assert_eq!(state.observation_count, 3);
        assert_eq!(state.ss_object_id.as_deref(), Some("SSO_B"));
    }

    #[test]
    fn dry_run_classifies_but_writes_nothing() {
        let mut opts = options(5);
        opts.dry_run = true;
        let mut pipeline = Pipeline::new(MockSource::new(20, 3), ProbeStore::new(), opts);
        let run = pipeline.run().unwrap();

        assert_eq!(run.counts.alerts_received, 20);
        assert_eq!(run.counts.alerts_stored, 20);
        assert!(run.counts.new_sources > 0);
        assert!(run.id.is_none());
        let probe = pipeline.store();
        assert_eq!(probe.write_calls, 0);
        assert_eq!(probe.inner.alert_count().unwrap(), 0);
        assert!(probe.inner.recent_runs(5).unwrap().is_empty());
    }

    #[test]
    fn track_state_off_leaves_state_untouched() {
        let mut opts = options(5);
        opts.track_state = false;
        let source = MemorySource::new("replay", records(&[(1, 1), (2, 1)]));
        let mut pipeline = Pipeline::new(source, ProbeStore::new(), opts);
        let run = pipeline.run().unwrap();
        assert_eq!(run.counts.alerts_stored, 2);
        assert_eq!(run.counts.new_sources, 0);
        assert!(pipeline.store().inner.get_state(1).unwrap().is_none());
    }

    #[test]
    fn second_run_is_refused() {
        let mut pipeline = Pipeline::new(MockSource::new(3, 1), ProbeStore::new(), options(2));
        pipeline.run().unwrap();
        assert_eq!(pipeline.phase(), Phase::Finished);
        assert!(matches!(pipeline.run(), Err(IngestError::PipelineReused)));
    }

    #[test]
    fn metadata_is_recorded_on_the_run() {
        let mut pipeline = Pipeline::new(MockSource::new(2, 1), ProbeStore::new(), options(2))
            .with_metadata("config_hash", "abc123");
        let run = pipeline.run().unwrap();
        let stored = pipeline.store().inner.get_run(run.id.unwrap()).unwrap().unwrap();
        assert_eq!(stored.metadata["config_hash"], "abc123");
        assert_eq!(stored.metadata["batch_size"], 2);
    }

    #[test]
    fn source_skips_are_carried_to_the_run() {
        let mut raw: Vec<AlertFields> = records(&[(1, 1), (2, 2)])
            .into_iter()
            .map(AlertRecord::into_fields)
            .collect();
        raw[0].ra = 400.0;
        let run = Pipeline::new(MemorySource::from_fields("replay", raw), ProbeStore::new(), options(2))
            .run()
            .unwrap();
        assert_eq!(run.counts.records_skipped, 1);
        assert_eq!(run.counts.alerts_received, 1);
    }
}
