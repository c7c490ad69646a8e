//! Durable storage: the write-path contract and its SQLite backend.

pub mod schema;
pub mod sqlite;
pub mod stats;

use crate::core::errors::Result;
use crate::model::alert::AlertRecord;
use crate::model::run::IngestionRun;
use crate::model::state::{SourceState, StateObservation};

/// Storage operations the ingestion pipeline and state tracker depend on.
pub trait AlertStore {
    /// Insert all records atomically, ignoring alert ids already stored.
    ///
    /// Returns the number of rows actually inserted.
    fn write_batch(&mut self, records: &[AlertRecord]) -> Result<usize>;

    /// Whether an alert with this id is durably stored.
    fn contains_alert(&self, alert_id: i64) -> Result<bool>;

    /// Tracked state for one detection source.
    fn get_state(&self, dia_source_id: i64) -> Result<Option<SourceState>>;

    /// Insert or merge one observation into tracked state in a single statement.
    fn upsert_state(&mut self, obs: &StateObservation) -> Result<()>;

    /// Apply several observations in order.
    fn upsert_states(&mut self, observations: &[StateObservation]) -> Result<()> {
        for obs in observations {
            self.upsert_state(obs)?;
        }
        Ok(())
    }

    /// Insert a new run or update it by id; assigns and returns the id.
    fn write_run(&mut self, run: &mut IngestionRun) -> Result<i64>;
}

impl<S: AlertStore + ?Sized> AlertStore for &mut S {
    fn write_batch(&mut self, records: &[AlertRecord]) -> Result<usize> {
        (**self).write_batch(records)
    }

    fn contains_alert(&self, alert_id: i64) -> Result<bool> {
        (**self).contains_alert(alert_id)
    }

    fn get_state(&self, dia_source_id: i64) -> Result<Option<SourceState>> {
        (**self).get_state(dia_source_id)
    }

    fn upsert_state(&mut self, obs: &StateObservation) -> Result<()> {
        (**self).upsert_state(obs)
    }

    fn upsert_states(&mut self, observations: &[StateObservation]) -> Result<()> {
        (**self).upsert_states(observations)
    }

    fn write_run(&mut self, run: &mut IngestionRun) -> Result<i64> {
        (**self).write_run(run)
    }
}
