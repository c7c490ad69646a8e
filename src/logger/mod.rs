//! Structured event log: JSONL lines written from a dedicated thread.

pub mod events;
pub mod jsonl;

pub use events::{EventLoggerConfig, EventLoggerHandle, IngestEvent, spawn_event_logger};
