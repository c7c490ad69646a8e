//! Alert sources: the pull contract, a name registry, and built-in sources.
//!
//! A source is connected once, asked for a lazy stream of validated records,
//! and closed. Records that fail to decode or validate are dropped by the
//! source itself and only show up in [`AlertSource::records_skipped`]; an
//! `Err` item in the stream means the source itself broke and the run must
//! stop.

pub mod jsonl;
pub mod memory;
pub mod mock;
pub mod registry;

use crate::core::errors::Result;
use crate::model::alert::AlertRecord;

/// Lazy stream of records from one `fetch_alerts` call.
pub type AlertIter<'a> = Box<dyn Iterator<Item = Result<AlertRecord>> + 'a>;

/// Pull-based producer of alert records.
pub trait AlertSource {
    /// Label recorded on ingestion runs.
    fn source_name(&self) -> &str;

    /// Make the source ready; failure is fatal for the run.
    fn connect(&mut self) -> Result<()>;

    /// Stream up to `limit` records (unbounded when `None`).
    ///
    /// The stream is not restartable; a later call continues where the
    /// previous one stopped.
    fn fetch_alerts(&mut self, limit: Option<u64>) -> Result<AlertIter<'_>>;

    /// Release resources. Safe to call more than once.
    fn close(&mut self);

    /// Records dropped so far because they failed to decode or validate.
    fn records_skipped(&self) -> u64 {
        0
    }
}

impl<S: AlertSource + ?Sized> AlertSource for Box<S> {
    fn source_name(&self) -> &str {
        (**self).source_name()
    }

    fn connect(&mut self) -> Result<()> {
        (**self).connect()
    }

    fn fetch_alerts(&mut self, limit: Option<u64>) -> Result<AlertIter<'_>> {
        (**self).fetch_alerts(limit)
    }

    fn close(&mut self) {
        (**self).close();
    }

    fn records_skipped(&self) -> u64 {
        (**self).records_skipped()
    }
}
