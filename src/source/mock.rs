//! Seeded synthetic alert generator.
//!
//! Detection sources are drawn from a bounded pool so entities recur, and each
//! entity carries an association that can appear, switch object, or refresh
//! over the stream. The same settings always produce the same alerts.

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::core::config::SourceSettings;
use crate::core::errors::{IngestError, Result};
use crate::model::alert::{AlertFields, AlertRecord};
use crate::source::{AlertIter, AlertSource};

const ALERT_ID_BASE: i64 = 1_000_000;
const SOURCE_ID_BASE: i64 = 2_000_000;
const OBJECT_ID_BASE: i64 = 3_000_000;
const FILTERS: [&str; 5] = ["g", "r", "i", "z", "y"];

#[derive(Debug, Default)]
struct EntityAssociation {
    ss_object_id: Option<String>,
    reassoc_time: Option<f64>,
    generation: u32,
}

/// Deterministic synthetic source.
#[derive(Debug)]
pub struct MockSource {
    count: u64,
    seed: u64,
    entity_pool: u64,
    sso_probability: f64,
    reassociation_probability: f64,
    base_mjd: f64,
    rng: Option<StdRng>,
    generated: u64,
    entities: HashMap<i64, EntityAssociation>,
    connected: bool,
}

impl MockSource {
    /// Registry name.
    pub const NAME: &'static str = "mock";

    /// Source producing `count` alerts from `seed`, other knobs at defaults.
    #[must_use]
    pub fn new(count: u64, seed: u64) -> Self {
        let mut settings = SourceSettings::default();
        settings.count = count;
        settings.seed = seed;
        Self::from_settings(&settings)
    }

    #[must_use]
    pub fn from_settings(settings: &SourceSettings) -> Self {
        Self {
            count: settings.count,
            seed: settings.seed,
            entity_pool: settings.entity_pool.max(1),
            sso_probability: settings.sso_probability.clamp(0.0, 1.0),
            reassociation_probability: settings.reassociation_probability.clamp(0.0, 1.0),
            base_mjd: settings.base_mjd,
            rng: None,
            generated: 0,
            entities: HashMap::new(),
            connected: false,
        }
    }

    /// Alerts produced so far.
    #[must_use]
    pub const fn generated(&self) -> u64 {
        self.generated
    }

    #[allow(clippy::cast_precision_loss, clippy::cast_possible_wrap)]
    fn generate(&mut self) -> Result<AlertRecord> {
        let index = self.generated;
        self.generated += 1;
        let seed = self.seed;
        let rng = self.rng.get_or_insert_with(|| StdRng::seed_from_u64(seed));

        let entity_offset = rng.random_range(0..self.entity_pool);
        let dia_source_id = SOURCE_ID_BASE + entity_offset as i64;
        let mjd = self.base_mjd + index as f64 * 0.01 + rng.random_range(0.0..0.01);
        let ra = rng.random_range(0.0..360.0);
        let dec = rng.random_range(-90.0..=90.0);

        // Mostly stars or galaxies, with a thin intermediate population.
        let morphology: f64 = rng.random();
        let raw_extendedness = if morphology < 0.5 {
            gauss(rng, 0.15, 0.05)
        } else if morphology < 0.9 {
            gauss(rng, 0.85, 0.1)
        } else {
            gauss(rng, 0.5, 0.15)
        };
        let extendedness = raw_extendedness.clamp(0.0, 1.0);
        let ext_min = (extendedness - rng.random_range(0.0..0.1)).max(0.0);
        let ext_max = (extendedness + rng.random_range(0.0..0.1)).min(1.0);

        let flux = gauss(rng, 1_000.0, 500.0).max(0.0);
        let flux_err = gauss(rng, flux * 0.01, flux * 0.005).abs();
        let snr = if flux_err > 0.0 { flux / flux_err } else { 100.0 };
        let filter = FILTERS[rng.random_range(0..FILTERS.len())];

        let assoc = self.entities.entry(dia_source_id).or_default();
        if assoc.ss_object_id.is_none() {
            if rng.random_bool(self.sso_probability) {
                assoc.generation += 1;
                assoc.ss_object_id = Some(format!("SSO_{dia_source_id}_{}", assoc.generation));
                assoc.reassoc_time = Some(mjd - rng.random_range(0.0..1.0));
            }
        } else if rng.random_bool(self.reassociation_probability) {
            if rng.random_bool(0.5) {
                assoc.generation += 1;
                assoc.ss_object_id = Some(format!("SSO_{dia_source_id}_{}", assoc.generation));
            }
            assoc.reassoc_time = Some(mjd - rng.random_range(0.0..1.0));
        }

        let mut fields = AlertFields::new(ALERT_ID_BASE + index as i64, dia_source_id, ra, dec, mjd)
            .with_photometry(filter, flux, flux_err, snr)
            .with_extendedness(extendedness, ext_min, ext_max);
        fields.dia_object_id = Some(OBJECT_ID_BASE + entity_offset as i64 / 10);
        if let Some(id) = assoc.ss_object_id.clone() {
            fields = fields.with_association(id, assoc.reassoc_time);
        }

        if rng.random_bool(0.1) {
            fields.trail_data.insert(
                "trailLength".to_string(),
                serde_json::json!(rng.random_range(1.0..50.0)),
            );
            fields.trail_data.insert(
                "trailAngle".to_string(),
                serde_json::json!(rng.random_range(0.0..360.0)),
            );
        }
        for (flag, p) in [
            ("pixelFlagsBad", 0.01),
            ("pixelFlagsCr", 0.05),
            ("pixelFlagsEdge", 0.02),
            ("pixelFlagsSaturated", 0.01),
        ] {
            fields
                .pixel_flags
                .insert(flag.to_string(), serde_json::json!(rng.random_bool(p)));
        }

        fields.validate()
    }
}

impl AlertSource for MockSource {
    fn source_name(&self) -> &str {
        Self::NAME
    }

    fn connect(&mut self) -> Result<()> {
        self.rng = Some(StdRng::seed_from_u64(self.seed));
        self.generated = 0;
        self.entities.clear();
        self.connected = true;
        Ok(())
    }

    fn fetch_alerts(&mut self, limit: Option<u64>) -> Result<AlertIter<'_>> {
        if !self.connected {
            return Err(IngestError::SourceFetch {
                source_name: Self::NAME.to_string(),
                details: "source not connected".to_string(),
            });
        }
        let available = self.count.saturating_sub(self.generated);
        let mut remaining = limit.map_or(available, |l| l.min(available));
        Ok(Box::new(std::iter::from_fn(move || {
            if remaining == 0 {
                return None;
            }
            remaining -= 1;
            Some(self.generate())
        })))
    }

    fn close(&mut self) {
        self.connected = false;
    }
}

/// Approximate normal draw (Irwin-Hall sum of twelve uniforms).
fn gauss(rng: &mut StdRng, mean: f64, sd: f64) -> f64 {
    let sum: f64 = (0..12).map(|_| rng.random::<f64>()).sum();
    mean + sd * (sum - 6.0)
}
