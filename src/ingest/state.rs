//! State tracker: classifies alerts against per-source history.
//!
//! Classification precedence, first match wins:
//! 1. no prior state: [`Classification::New`]
//! 2. prior unassociated, record associated: `new_association`
//! 3. both associated, identifiers differ: `changed_association`
//! 4. both refresh times present and different: `updated_reassociation`
//! 5. otherwise [`Classification::Unchanged`]
//!
//! State advances on every observation regardless of the verdict.

#![allow(missing_docs)]

use std::collections::HashMap;

use chrono::Utc;

use crate::core::errors::Result;
use crate::model::alert::AlertRecord;
use crate::model::state::{Classification, ReassociationReason, SourceState, StateObservation};
use crate::storage::AlertStore;

/// Decide the verdict for one observation given the prior state.
#[must_use]
#[allow(clippy::float_cmp)]
pub fn classify(
    prior: Option<&SourceState>,
    ss_object_id: Option<&str>,
    reassoc_time: Option<f64>,
) -> Classification {
    let Some(prior) = prior else {
        return Classification::New;
    };
    match (prior.ss_object_id.as_deref(), ss_object_id) {
        (None, Some(_)) => {
            return Classification::Reassociated(ReassociationReason::NewAssociation);
        }
        (Some(before), Some(now)) if before != now => {
            return Classification::Reassociated(ReassociationReason::ChangedAssociation);
        }
        _ => {}
    }
    match (prior.ss_object_reassoc_time_mjd, reassoc_time) {
        (Some(before), Some(now)) if before != now => {
            Classification::Reassociated(ReassociationReason::UpdatedReassociation)
        }
        _ => Classification::Unchanged,
    }
}

fn observation(record: &AlertRecord) -> StateObservation {
    StateObservation {
        dia_source_id: record.dia_source_id,
        mjd: record.mjd,
        ss_object_id: record.ss_object_id.clone(),
        ss_object_reassoc_time_mjd: record.ss_object_reassoc_time_mjd,
    }
}

/// Tallies of staged classifications, credited when they are committed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StagedTally {
    pub new_sources: u64,
    pub updated_sources: u64,
    pub reassociations: u64,
}

/// Classifies alerts and keeps tracked state current.
///
/// Two modes of use. [`StateTracker::classify_and_update`] reads, classifies
/// and upserts one record immediately. The pipeline instead stages records
/// while a batch accumulates: staged observations form an overlay consulted
/// before the store, so repeated sightings of one source inside a batch
/// classify against each other, and the overlay is committed only after the
/// batch's alerts are durable.
#[derive(Debug, Default)]
pub struct StateTracker {
    overlay: HashMap<i64, SourceState>,
    staged: Vec<StateObservation>,
    tally: StagedTally,
}

impl StateTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state for a source, including staged observations.
    pub fn get_state<S: AlertStore + ?Sized>(
        &self,
        store: &S,
        dia_source_id: i64,
    ) -> Result<Option<SourceState>> {
        if let Some(state) = self.overlay.get(&dia_source_id) {
            return Ok(Some(state.clone()));
        }
        store.get_state(dia_source_id)
    }

    /// Classify one record, annotate it, and upsert its state right away.
    pub fn classify_and_update<S: AlertStore + ?Sized>(
        &mut self,
        record: &mut AlertRecord,
        store: &mut S,
    ) -> Result<Classification> {
        let prior = self.get_state(store, record.dia_source_id)?;
        let verdict = classify(
            prior.as_ref(),
            record.ss_object_id.as_deref(),
            record.ss_object_reassoc_time_mjd,
        );
        store.upsert_state(&observation(record))?;
        self.overlay.remove(&record.dia_source_id);
        record.annotate(verdict);
        Ok(verdict)
    }

    /// Classify and annotate one record, staging its state change.
    pub fn stage<S: AlertStore + ?Sized>(
        &mut self,
        record: &mut AlertRecord,
        store: &S,
    ) -> Result<Classification> {
        let prior = self.get_state(store, record.dia_source_id)?;
        let verdict = classify(
            prior.as_ref(),
            record.ss_object_id.as_deref(),
            record.ss_object_reassoc_time_mjd,
        );
        let obs = observation(record);
        let merged = SourceState::merged(prior.as_ref(), &obs, Utc::now());
        self.overlay.insert(obs.dia_source_id, merged);
        self.staged.push(obs);

        if prior.is_some() {
            self.tally.updated_sources += 1;
        } else {
            self.tally.new_sources += 1;
        }
        if verdict.is_reassociation() {
            self.tally.reassociations += 1;
        }
        record.annotate(verdict);
        Ok(verdict)
    }

    /// Persist staged observations and clear the overlay.
    ///
    /// On failure the staged work is discarded, since the overlay could no
    /// longer be trusted to match the store.
    pub fn commit<S: AlertStore + ?Sized>(&mut self, store: &mut S) -> Result<StagedTally> {
        let staged = std::mem::take(&mut self.staged);
        let tally = std::mem::take(&mut self.tally);
        self.overlay.clear();
        store.upsert_states(&staged)?;
        Ok(tally)
    }

    /// Accept staged classifications without persisting (dry run).
    ///
    /// The overlay is kept so later records still see earlier ones. It holds
    /// one merged state per distinct source, never one per alert, so a dry
    /// run over an unbounded source grows with the number of sources seen.
    /// Bound it with `max_records` or `max_duration`.
    pub fn settle_in_memory(&mut self) -> StagedTally {
        self.staged.clear();
        std::mem::take(&mut self.tally)
    }

    /// Drop staged work, e.g. after its batch failed to write.
    pub fn discard(&mut self) {
        self.staged.clear();
        self.overlay.clear();
        self.tally = StagedTally::default();
    }

    /// Observations waiting for commit.
    #[must_use]
    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }

    /// Sources whose state is held in memory rather than read from the store.
    #[must_use]
    pub fn overlay_len(&self) -> usize {
        self.overlay.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::alert::AlertFields;
    use crate::storage::sqlite::SqliteStore;

    fn prior(ss: Option<&str>, reassoc: Option<f64>) -> SourceState {
        SourceState {
            dia_source_id: 1,
            first_seen_mjd: 100.0,
            last_seen_mjd: 100.0,
            observation_count: 1,
            ss_object_id: ss.map(str::to_string),
            ss_object_reassoc_time_mjd: reassoc,
            updated_at: Utc::now(),
        }
    }

    fn record(alert_id: i64, ss: Option<&str>, reassoc: Option<f64>) -> AlertRecord {
        let mut fields = AlertFields::new(alert_id, 1, 10.0, 10.0, 100.0 + alert_id as f64);
        if let Some(id) = ss {
            fields = fields.with_association(id, reassoc);
        }
        fields.validate().unwrap()
    }

    #[test]
    fn never_seen_is_new() {
        assert_eq!(classify(None, None, None), Classification::New);
        assert_eq!(classify(None, Some("X"), Some(1.0)), Classification::New);
    }

    #[test]
    fn association_appearing_is_new_association() {
        let p = prior(None, None);
        assert_eq!(
            classify(Some(&p), Some("X"), None),
            Classification::Reassociated(ReassociationReason::NewAssociation)
        );
    }

    #[test]
    fn association_switching_is_changed_association() {
        let p = prior(Some("X"), None);
        assert_eq!(
            classify(Some(&p), Some("Y"), None),
            Classification::Reassociated(ReassociationReason::ChangedAssociation)
        );
    }

    #[test]
    fn refresh_time_moving_is_updated_reassociation() {
        let p = prior(Some("X"), Some(100.0));
        assert_eq!(
            classify(Some(&p), Some("X"), Some(101.0)),
            Classification::Reassociated(ReassociationReason::UpdatedReassociation)
        );
    }

    #[test]
    fn identical_association_is_unchanged() {
        let p = prior(Some("X"), Some(100.0));
        assert_eq!(
            classify(Some(&p), Some("X"), Some(100.0)),
            Classification::Unchanged
        );
    }

    #[test]
    fn id_change_wins_over_time_change() {
        let p = prior(Some("X"), Some(100.0));
        assert_eq!(
            classify(Some(&p), Some("Y"), Some(101.0)),
            Classification::Reassociated(ReassociationReason::ChangedAssociation)
        );
    }

    #[test]
    fn still_unassociated_is_unchanged() {
        let p = prior(None, None);
        assert_eq!(classify(Some(&p), None, None), Classification::Unchanged);
    }

    #[test]
    fn losing_association_is_unchanged() {
        let p = prior(Some("X"), Some(100.0));
        assert_eq!(classify(Some(&p), None, None), Classification::Unchanged);
    }

    #[test]
    fn classify_and_update_advances_state_every_time() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let mut tracker = StateTracker::new();

        let mut first = record(1, None, None);
        assert_eq!(
            tracker.classify_and_update(&mut first, &mut store).unwrap(),
            Classification::New
        );
        let mut second = record(2, None, None);
        assert_eq!(
            tracker.classify_and_update(&mut second, &mut store).unwrap(),
            Classification::Unchanged
        );
        let mut third = record(3, Some("X"), Some(50.0));
        assert_eq!(
            tracker.classify_and_update(&mut third, &mut store).unwrap(),
            Classification::Reassociated(ReassociationReason::NewAssociation)
        );
        assert!(third.is_reassociation);

        let state = tracker.get_state(&store, 1).unwrap().unwrap();
        assert_eq!(state.observation_count, 3);
        assert!((state.last_seen_mjd - 103.0).abs() < f64::EPSILON);
        assert_eq!(state.ss_object_id.as_deref(), Some("X"));
    }

    #[test]
    fn staged_records_see_each_other_before_commit() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let mut tracker = StateTracker::new();

        let mut a = record(1, None, None);
        let mut b = record(2, Some("X"), None);
        assert_eq!(tracker.stage(&mut a, &store).unwrap(), Classification::New);
        assert_eq!(
            tracker.stage(&mut b, &store).unwrap(),
            Classification::Reassociated(ReassociationReason::NewAssociation)
        );
        assert!(store.get_state(1).unwrap().is_none());
        assert_eq!(tracker.staged_len(), 2);

        let tally = tracker.commit(&mut store).unwrap();
        assert_eq!(
            tally,
            StagedTally {
                new_sources: 1,
                updated_sources: 1,
                reassociations: 1,
            }
        );
        let state = store.get_state(1).unwrap().unwrap();
        assert_eq!(state.observation_count, 2);
        assert_eq!(tracker.staged_len(), 0);
    }

    #[test]
    fn discard_reverts_to_durable_state() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut tracker = StateTracker::new();
        let mut a = record(1, None, None);
        tracker.stage(&mut a, &store).unwrap();
        tracker.discard();
        assert!(tracker.get_state(&store, 1).unwrap().is_none());

        let mut again = record(2, None, None);
        assert_eq!(tracker.stage(&mut again, &store).unwrap(), Classification::New);
    }

    #[test]
    fn settle_in_memory_keeps_overlay_without_writing() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut tracker = StateTracker::new();
        let mut a = record(1, None, None);
        tracker.stage(&mut a, &store).unwrap();
        let tally = tracker.settle_in_memory();
        assert_eq!(tally.new_sources, 1);

        let mut b = record(2, None, None);
        assert_eq!(tracker.stage(&mut b, &store).unwrap(), Classification::Unchanged);
        assert!(store.get_state(1).unwrap().is_none());
    }

    #[test]
    fn dry_run_overlay_grows_per_source_not_per_alert() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut tracker = StateTracker::new();
        for alert_id in 0..300 {
            let source = alert_id % 3;
            let mut rec = AlertFields::new(alert_id, source, 10.0, 10.0, 100.0 + alert_id as f64)
                .validate()
                .unwrap();
            tracker.stage(&mut rec, &store).unwrap();
            if alert_id % 25 == 24 {
                tracker.settle_in_memory();
            }
        }
        tracker.settle_in_memory();
        assert_eq!(tracker.overlay_len(), 3);
        assert_eq!(tracker.staged_len(), 0);

        let state = tracker.get_state(&store, 0).unwrap().unwrap();
        assert_eq!(state.observation_count, 100);
    }
}
