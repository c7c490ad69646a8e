#![forbid(unsafe_code)]

//! alert_ingest: idempotent ingestion of astronomical alert streams.
//!
//! Alerts are pulled from a pluggable [`source::AlertSource`], classified per
//! detection source by the [`ingest::StateTracker`] (new, unchanged, or
//! reassociated with a different Solar System object), and written in batches
//! to SQLite. Every run leaves an [`model::run::IngestionRun`] audit record.
//!
//! # Library usage
//!
//! ```rust,no_run
//! use alert_ingest::prelude::*;
//!
//! # fn main() -> alert_ingest::core::errors::Result<()> {
//! let settings = SourceSettings::default();
//! let source = SourceRegistry::with_builtins().create("mock", &settings)?;
//! let mut store = SqliteStore::open(std::path::Path::new("alerts.sqlite3"))?;
//! let mut pipeline = Pipeline::new(source, &mut store, PipelineOptions::default());
//! let run = pipeline.run()?;
//! println!("stored {} alerts", run.counts.alerts_stored);
//! # Ok(())
//! # }
//! ```

pub mod prelude;

pub mod core;
pub mod ingest;
pub mod logger;
pub mod model;
pub mod source;
pub mod storage;
