//! Convenience re-exports for library consumers.
//!
//! ```rust,no_run
//! use alert_ingest::prelude::*;
//! ```

// Core
pub use crate::core::config::{Config, IngestConfig, SourceSettings};
pub use crate::core::errors::{IngestError, Result};

// Model
pub use crate::model::alert::{AlertFields, AlertRecord};
pub use crate::model::run::{IngestionRun, RunCounts, RunStatus, StopReason};
pub use crate::model::state::{Classification, ReassociationReason, SourceState};

// Sources
pub use crate::source::AlertSource;
pub use crate::source::registry::SourceRegistry;

// Storage
pub use crate::storage::AlertStore;
pub use crate::storage::sqlite::SqliteStore;

// Ingestion
pub use crate::ingest::{CancelToken, Pipeline, PipelineOptions, StateTracker};

// Logging
pub use crate::logger::{EventLoggerHandle, IngestEvent, spawn_event_logger};
