//! Event logger thread.
//!
//! A dedicated thread owns the [`JsonlWriter`]. Producers send
//! [`IngestEvent`]s through a bounded crossbeam channel with `try_send`, so
//! a slow disk never stalls ingestion; events that do not fit are counted
//! and reported in the log once there is room again.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};

use crate::core::config::LoggingConfig;
use crate::core::errors::{IngestError, Result};
use crate::logger::jsonl::{EventType, JsonlConfig, JsonlWriter, LogEntry, Severity};
use crate::model::run::{IngestionRun, RunStatus};

const CHANNEL_CAPACITY: usize = 1024;

/// Something worth recording about an ingestion run.
#[derive(Debug, Clone)]
pub enum IngestEvent {
    RunStarted {
        run_id: Option<i64>,
        source: String,
    },
    /// Terminal snapshot of a run, whatever its status.
    RunFinished(Box<IngestionRun>),
    SourceConnected {
        source: String,
    },
    SourceClosed {
        source: String,
        records_skipped: u64,
    },
    BatchWritten {
        run_id: Option<i64>,
        batch_size: u64,
        inserted: u64,
        duration_ms: u64,
    },
    BatchFailed {
        run_id: Option<i64>,
        batch_size: u64,
        error_code: String,
        error_message: String,
    },
    StateCommitFailed {
        run_id: Option<i64>,
        observations: u64,
        error_code: String,
        error_message: String,
    },
    SchemaMigrated {
        from_version: i64,
        to_version: i64,
    },
    StateCleanup {
        max_age_days: u32,
        removed: u64,
    },
    ConfigLoaded {
        path: String,
        config_hash: String,
    },
    Error {
        code: String,
        message: String,
    },
    /// Ask the logger thread to flush and exit.
    Shutdown,
}

/// Cloneable, non-blocking sender half of the event logger.
#[derive(Debug, Clone)]
pub struct EventLoggerHandle {
    tx: Sender<IngestEvent>,
    dropped_events: Arc<AtomicU64>,
}

impl EventLoggerHandle {
    /// Queue an event; drops and counts it when the channel is full.
    pub fn send(&self, event: IngestEvent) {
        if let Err(TrySendError::Full(_)) = self.tx.try_send(event) {
            self.dropped_events.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Events dropped since the logger last reported them.
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    /// Ask the thread to stop; join the handle returned by the spawn to wait.
    pub fn shutdown(&self) {
        let _ = self.tx.send(IngestEvent::Shutdown);
    }
}

#[derive(Debug, Clone)]
pub struct EventLoggerConfig {
    pub jsonl: JsonlConfig,
    pub channel_capacity: usize,
}

impl EventLoggerConfig {
    #[must_use]
    pub fn from_logging(logging: &LoggingConfig) -> Self {
        Self {
            jsonl: JsonlConfig::from_logging(logging),
            channel_capacity: CHANNEL_CAPACITY,
        }
    }
}

/// Spawn the logger thread.
///
/// It runs until [`EventLoggerHandle::shutdown`] is called or every handle
/// is dropped.
pub fn spawn_event_logger(
    config: EventLoggerConfig,
) -> Result<(EventLoggerHandle, thread::JoinHandle<()>)> {
    let (tx, rx) = bounded::<IngestEvent>(config.channel_capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    let handle = EventLoggerHandle {
        tx,
        dropped_events: Arc::clone(&dropped),
    };

    let join = thread::Builder::new()
        .name("ain-events".to_string())
        .spawn(move || logger_thread_main(&rx, config.jsonl, &dropped))
        .map_err(|e| IngestError::Runtime {
            details: format!("failed to spawn event logger thread: {e}"),
        })?;

    Ok((handle, join))
}

fn logger_thread_main(rx: &Receiver<IngestEvent>, jsonl: JsonlConfig, dropped: &AtomicU64) {
    let mut writer = JsonlWriter::open(jsonl);

    while let Ok(event) = rx.recv() {
        let lost = dropped.swap(0, Ordering::Relaxed);
        if lost > 0 {
            let mut warn = LogEntry::new(EventType::Error, Severity::Warning);
            warn.details = Some(format!("{lost} events dropped due to back-pressure"));
            writer.write_entry(&warn);
        }

        if matches!(event, IngestEvent::Shutdown) {
            break;
        }
        writer.write_entry(&to_log_entry(&event));
    }

    writer.flush();
    writer.fsync();
}

fn to_log_entry(event: &IngestEvent) -> LogEntry {
    match event {
        IngestEvent::RunStarted { run_id, source } => {
            let mut e = LogEntry::new(EventType::RunStart, Severity::Info);
            e.run_id = *run_id;
            e.source = Some(source.clone());
            e
        }
        IngestEvent::RunFinished(run) => run_finished_entry(run),
        IngestEvent::SourceConnected { source } => {
            let mut e = LogEntry::new(EventType::SourceConnect, Severity::Info);
            e.source = Some(source.clone());
            e
        }
        IngestEvent::SourceClosed {
            source,
            records_skipped,
        } => {
            let mut e = LogEntry::new(EventType::SourceClose, Severity::Info);
            e.source = Some(source.clone());
            if *records_skipped > 0 {
                e.details = Some(format!("{records_skipped} invalid records skipped"));
            }
            e
        }
        IngestEvent::BatchWritten {
            run_id,
            batch_size,
            inserted,
            duration_ms,
        } => {
            let mut e = LogEntry::new(EventType::BatchWrite, Severity::Info);
            e.run_id = *run_id;
            e.batch_size = Some(*batch_size);
            e.inserted = Some(*inserted);
            e.duration_ms = Some(*duration_ms);
            e
        }
        IngestEvent::BatchFailed {
            run_id,
            batch_size,
            error_code,
            error_message,
        } => {
            let mut e = LogEntry::new(EventType::BatchFail, Severity::Warning)
                .with_error(error_code, error_message.clone());
            e.run_id = *run_id;
            e.batch_size = Some(*batch_size);
            e
        }
        IngestEvent::StateCommitFailed {
            run_id,
            observations,
            error_code,
            error_message,
        } => {
            let mut e = LogEntry::new(EventType::StateCommitFail, Severity::Warning)
                .with_error(error_code, error_message.clone());
            e.run_id = *run_id;
            e.batch_size = Some(*observations);
            e
        }
        IngestEvent::SchemaMigrated {
            from_version,
            to_version,
        } => {
            let mut e = LogEntry::new(EventType::SchemaMigrate, Severity::Info);
            e.details = Some(format!("schema v{from_version} -> v{to_version}"));
            e
        }
        IngestEvent::StateCleanup {
            max_age_days,
            removed,
        } => {
            let mut e = LogEntry::new(EventType::StateCleanup, Severity::Info);
            e.details = Some(format!(
                "removed {removed} sources unseen for {max_age_days} days"
            ));
            e
        }
        IngestEvent::ConfigLoaded { path, config_hash } => {
            let mut e = LogEntry::new(EventType::ConfigLoad, Severity::Info);
            e.details = Some(format!("{path} (hash {config_hash})"));
            e
        }
        IngestEvent::Error { code, message } => {
            LogEntry::new(EventType::Error, Severity::Critical).with_error(code, message.clone())
        }
        IngestEvent::Shutdown => {
            let mut e = LogEntry::new(EventType::Error, Severity::Info);
            e.details = Some("logger shutdown".to_string());
            e
        }
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn run_finished_entry(run: &IngestionRun) -> LogEntry {
    let (event, severity) = match run.status {
        RunStatus::Failed => (EventType::RunFail, Severity::Critical),
        RunStatus::Cancelled => (EventType::RunCancel, Severity::Warning),
        RunStatus::Completed | RunStatus::Running => (EventType::RunComplete, Severity::Info),
    };
    let mut e = LogEntry::new(event, severity);
    e.run_id = run.id;
    e.source = Some(run.source_name.clone());
    e.counts = Some(run.counts);
    e.stop_reason = run.stop_reason.map(|r| r.as_str().to_string());
    e.duration_ms = Some((run.duration_secs() * 1_000.0) as u64);
    e.error_message.clone_from(&run.error_message);
    e
}
