//! In-memory replay source.

use std::collections::VecDeque;

use crate::core::errors::{IngestError, Result};
use crate::model::alert::{AlertFields, AlertRecord};
use crate::source::{AlertIter, AlertSource};

/// Replays a fixed sequence of records.
///
/// Raw fields are validated on construction; invalid ones are skipped and
/// counted like any other source would. Connect and fetch failures can be
/// scripted to exercise the fatal-error paths of a run.
#[derive(Debug)]
pub struct MemorySource {
    name: String,
    queue: VecDeque<AlertRecord>,
    skipped: u64,
    fail_connect: Option<String>,
    fail_after: Option<(u64, String)>,
    delivered: u64,
    connected: bool,
    close_calls: u32,
}

impl MemorySource {
    #[must_use]
    pub fn new(name: impl Into<String>, records: Vec<AlertRecord>) -> Self {
        Self {
            name: name.into(),
            queue: records.into(),
            skipped: 0,
            fail_connect: None,
            fail_after: None,
            delivered: 0,
            connected: false,
            close_calls: 0,
        }
    }

    /// Validate raw payloads, keeping the valid ones.
    #[must_use]
    pub fn from_fields(name: impl Into<String>, fields: Vec<AlertFields>) -> Self {
        let mut skipped = 0;
        let records = fields
            .into_iter()
            .filter_map(|f| match f.validate() {
                Ok(record) => Some(record),
                Err(_) => {
                    skipped += 1;
                    None
                }
            })
            .collect();
        let mut source = Self::new(name, records);
        source.skipped = skipped;
        source
    }

    /// Make `connect` fail with `details`.
    #[must_use]
    pub fn failing_connect(mut self, details: impl Into<String>) -> Self {
        self.fail_connect = Some(details.into());
        self
    }

    /// Yield a fetch error after `delivered` records have been produced.
    #[must_use]
    pub fn failing_after(mut self, delivered: u64, details: impl Into<String>) -> Self {
        self.fail_after = Some((delivered, details.into()));
        self
    }

    /// Records not yet delivered.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.queue.len()
    }

    /// How many times `close` has been called.
    #[must_use]
    pub const fn close_calls(&self) -> u32 {
        self.close_calls
    }

    fn next_item(&mut self) -> Option<Result<AlertRecord>> {
        if let Some((after, details)) = &self.fail_after
            && self.delivered >= *after
        {
            return Some(Err(IngestError::SourceFetch {
                source_name: self.name.clone(),
                details: details.clone(),
            }));
        }
        let record = self.queue.pop_front()?;
        self.delivered += 1;
        Some(Ok(record))
    }
}

impl AlertSource for MemorySource {
    fn source_name(&self) -> &str {
        &self.name
    }

    fn connect(&mut self) -> Result<()> {
        if let Some(details) = &self.fail_connect {
            return Err(IngestError::SourceConnect {
                source_name: self.name.clone(),
                details: details.clone(),
            });
        }
        self.connected = true;
        Ok(())
    }

    fn fetch_alerts(&mut self, limit: Option<u64>) -> Result<AlertIter<'_>> {
        if !self.connected {
            return Err(IngestError::SourceFetch {
                source_name: self.name.clone(),
                details: "source not connected".to_string(),
            });
        }
        let mut remaining = limit;
        Ok(Box::new(std::iter::from_fn(move || {
            if remaining == Some(0) {
                return None;
            }
            let item = self.next_item()?;
            if let Some(left) = remaining.as_mut() {
                *left -= 1;
            }
            Some(item)
        })))
    }

    fn close(&mut self) {
        self.connected = false;
        self.close_calls += 1;
    }

    fn records_skipped(&self) -> u64 {
        self.skipped
    }
}
