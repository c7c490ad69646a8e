//! Configuration system: TOML file + env var overrides + smart defaults.

#![allow(missing_docs)]

use std::env;
use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::errors::{IngestError, Result};

/// Environment variable prefix for every override.
pub const ENV_PREFIX: &str = "ALERT_INGEST_";

/// Full configuration model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub ingest: IngestConfig,
    pub storage: StorageConfig,
    pub source: SourceSettings,
    pub retention: RetentionConfig,
    pub logging: LoggingConfig,
    pub paths: PathsConfig,
}

/// Pipeline knobs: batching, run bounds, and the optional behaviors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IngestConfig {
    pub batch_size: usize,
    /// Upper bound on records received per run. Absent means unbounded.
    pub max_records: Option<u64>,
    /// Upper bound on wall time per run. Absent means unbounded.
    pub max_duration_secs: Option<u64>,
    pub skip_duplicates: bool,
    pub dry_run: bool,
    pub track_state: bool,
}

/// SQLite storage location and contention handling.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StorageConfig {
    pub database: PathBuf,
    pub busy_timeout_ms: u64,
}

/// Settings handed to source factories from the registry.
///
/// Each built-in source reads only the fields it understands.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SourceSettings {
    /// Registry name of the default source.
    pub name: String,
    /// File or directory for file-backed sources.
    pub path: Option<PathBuf>,
    /// Number of alerts a synthetic source produces.
    pub count: u64,
    pub seed: u64,
    /// Distinct detection sources a synthetic source draws from.
    pub entity_pool: u64,
    /// Probability that a synthetic alert carries an SSO association.
    pub sso_probability: f64,
    /// Probability that an associated synthetic alert switches object or refreshes.
    pub reassociation_probability: f64,
    /// Starting epoch (MJD) for synthetic observations.
    pub base_mjd: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetentionConfig {
    /// State rows not observed for this many days are removed by cleanup.
    pub state_max_age_days: u32,
}

/// Structured event log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub enabled: bool,
    pub event_log: PathBuf,
    pub fallback_log: Option<PathBuf>,
    pub max_size_bytes: u64,
    pub max_rotated_files: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub config_file: PathBuf,
    pub data_dir: PathBuf,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            max_records: None,
            max_duration_secs: None,
            skip_duplicates: true,
            dry_run: false,
            track_state: true,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: PathsConfig::default().data_dir.join("alerts.sqlite3"),
            busy_timeout_ms: 5_000,
        }
    }
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            name: "mock".to_string(),
            path: None,
            count: 1_000,
            seed: 42,
            entity_pool: 200,
            sso_probability: 0.3,
            reassociation_probability: 0.1,
            base_mjd: 60_000.0,
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            state_max_age_days: 90,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            event_log: PathsConfig::default().data_dir.join("events.jsonl"),
            fallback_log: None,
            max_size_bytes: 64 * 1024 * 1024,
            max_rotated_files: 5,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        let home_dir = env::var_os("HOME").map_or_else(
            || {
                eprintln!(
                    "[AIN-CONFIG] WARNING: HOME not set, falling back to /tmp for data paths"
                );
                PathBuf::from("/tmp")
            },
            PathBuf::from,
        );
        Self {
            config_file: home_dir
                .join(".config")
                .join("alert-ingest")
                .join("config.toml"),
            data_dir: home_dir.join(".local").join("share").join("alert-ingest"),
        }
    }
}

impl Config {
    /// Default configuration path.
    #[must_use]
    pub fn default_path() -> PathBuf {
        PathsConfig::default().config_file
    }

    /// Load config from default or explicit path, then apply env overrides.
    ///
    /// Missing config file is not an error when loading from default path; defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path_buf = path.map_or_else(Self::default_path, Path::to_path_buf);
        let is_explicit_path = path.is_some();

        let mut cfg = if path_buf.exists() {
            let raw = fs::read_to_string(&path_buf).map_err(|source| IngestError::Io {
                path: path_buf.clone(),
                source,
            })?;
            let parsed: Self = toml::from_str(&raw)?;
            parsed
        } else if is_explicit_path {
            return Err(IngestError::MissingConfig { path: path_buf });
        } else {
            Self::default()
        };

        cfg.paths.config_file = path_buf;
        cfg.apply_env_overrides_from(env_var)?;
        cfg.normalize();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Deterministic hash of the effective config, recorded with each run.
    ///
    /// FNV-1a keeps the value stable across processes and toolchains.
    pub fn stable_hash(&self) -> Result<String> {
        let canonical = serde_json::to_string(self)?;
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in canonical.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        Ok(format!("{hash:016x}"))
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|error| IngestError::Serialization {
            context: "toml",
            details: error.to_string(),
        })
    }

    fn apply_env_overrides_from<F>(&mut self, mut lookup: F) -> Result<()>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let mut var = |suffix: &str| {
            let name = format!("{ENV_PREFIX}{suffix}");
            lookup(&name).map(|raw| (name, raw))
        };

        // ingest
        if let Some((name, raw)) = var("BATCH_SIZE") {
            self.ingest.batch_size = parse_env(&name, &raw)?;
        }
        if let Some((name, raw)) = var("MAX_RECORDS") {
            self.ingest.max_records = Some(parse_env(&name, &raw)?);
        }
        if let Some((name, raw)) = var("MAX_DURATION_SECS") {
            self.ingest.max_duration_secs = Some(parse_env(&name, &raw)?);
        }
        if let Some((name, raw)) = var("SKIP_DUPLICATES") {
            self.ingest.skip_duplicates = parse_env(&name, &raw)?;
        }
        if let Some((name, raw)) = var("DRY_RUN") {
            self.ingest.dry_run = parse_env(&name, &raw)?;
        }
        if let Some((name, raw)) = var("TRACK_STATE") {
            self.ingest.track_state = parse_env(&name, &raw)?;
        }

        // storage
        if let Some((_, raw)) = var("DATABASE") {
            self.storage.database = PathBuf::from(raw);
        }
        if let Some((name, raw)) = var("BUSY_TIMEOUT_MS") {
            self.storage.busy_timeout_ms = parse_env(&name, &raw)?;
        }

        // source
        if let Some((_, raw)) = var("SOURCE") {
            self.source.name = raw;
        }
        if let Some((_, raw)) = var("SOURCE_PATH") {
            self.source.path = Some(PathBuf::from(raw));
        }
        if let Some((name, raw)) = var("SOURCE_COUNT") {
            self.source.count = parse_env(&name, &raw)?;
        }
        if let Some((name, raw)) = var("SOURCE_SEED") {
            self.source.seed = parse_env(&name, &raw)?;
        }
        if let Some((name, raw)) = var("SOURCE_SSO_PROBABILITY") {
            self.source.sso_probability = parse_env(&name, &raw)?;
        }

        // retention
        if let Some((name, raw)) = var("STATE_MAX_AGE_DAYS") {
            self.retention.state_max_age_days = parse_env(&name, &raw)?;
        }

        // logging
        if let Some((name, raw)) = var("LOG_ENABLED") {
            self.logging.enabled = parse_env(&name, &raw)?;
        }
        if let Some((_, raw)) = var("EVENT_LOG") {
            self.logging.event_log = PathBuf::from(raw);
        }

        Ok(())
    }

    fn normalize(&mut self) {
        self.source.name = self.source.name.trim().to_ascii_lowercase();
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.ingest.batch_size == 0 {
            return Err(IngestError::InvalidConfig {
                details: "ingest.batch_size must be >= 1".to_string(),
            });
        }
        if self.ingest.max_records == Some(0) {
            return Err(IngestError::InvalidConfig {
                details: "ingest.max_records must be >= 1 when set".to_string(),
            });
        }
        if self.ingest.max_duration_secs == Some(0) {
            return Err(IngestError::InvalidConfig {
                details: "ingest.max_duration_secs must be >= 1 when set".to_string(),
            });
        }

        if self.source.name.is_empty() {
            return Err(IngestError::InvalidConfig {
                details: "source.name must not be empty".to_string(),
            });
        }
        if self.source.entity_pool == 0 {
            return Err(IngestError::InvalidConfig {
                details: "source.entity_pool must be >= 1".to_string(),
            });
        }
        validate_prob("source.sso_probability", self.source.sso_probability)?;
        validate_prob(
            "source.reassociation_probability",
            self.source.reassociation_probability,
        )?;
        if !(self.source.base_mjd.is_finite() && self.source.base_mjd > 0.0) {
            return Err(IngestError::InvalidConfig {
                details: format!(
                    "source.base_mjd must be a positive epoch, got {}",
                    self.source.base_mjd
                ),
            });
        }

        if self.retention.state_max_age_days == 0 {
            return Err(IngestError::InvalidConfig {
                details: "retention.state_max_age_days must be >= 1".to_string(),
            });
        }

        if self.logging.max_size_bytes == 0 {
            return Err(IngestError::InvalidConfig {
                details: "logging.max_size_bytes must be >= 1".to_string(),
            });
        }

        Ok(())
    }
}

fn validate_prob(name: &str, value: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(IngestError::InvalidConfig {
            details: format!("{name} must be in [0,1], got {value}"),
        });
    }
    Ok(())
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|raw| !raw.trim().is_empty())
}

fn parse_env<T>(name: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|error| IngestError::ConfigParse {
            context: "env",
            details: format!("{name}={raw:?}: {error}"),
        })
}
