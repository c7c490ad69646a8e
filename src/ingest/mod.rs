//! Ingestion: the run orchestrator, state classification, and cancellation.

pub mod cancel;
pub mod pipeline;
pub mod state;

pub use cancel::CancelToken;
pub use pipeline::{Phase, Pipeline, PipelineOptions};
pub use state::{StateTracker, classify};
