//! AIN-prefixed error types with structured error codes.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, IngestError>;

/// Top-level error type for alert ingestion.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("[AIN-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[AIN-1002] missing configuration file: {path}")]
    MissingConfig { path: PathBuf },

    #[error("[AIN-1003] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[AIN-1101] invalid alert record, field {field}: {details}")]
    InvalidRecord {
        field: &'static str,
        details: String,
    },

    #[error("[AIN-1201] unknown source {name:?}; available: {available}")]
    UnknownSource { name: String, available: String },

    #[error("[AIN-1202] source {name:?} is already registered")]
    DuplicateSource { name: String },

    #[error("[AIN-2001] source {source_name} failed to connect: {details}")]
    SourceConnect {
        source_name: String,
        details: String,
    },

    #[error("[AIN-2002] source {source_name} failed during fetch: {details}")]
    SourceFetch {
        source_name: String,
        details: String,
    },

    #[error("[AIN-2101] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },

    #[error("[AIN-2102] SQL failure in {context}: {details}")]
    Sql {
        context: &'static str,
        details: String,
    },

    #[error(
        "[AIN-2201] database schema version {found} is newer than supported version {supported}"
    )]
    SchemaTooNew { found: i64, supported: i64 },

    #[error("[AIN-2202] migration to schema version {version} failed: {details}")]
    Migration { version: i64, details: String },

    #[error("[AIN-2301] ingestion run {id} not found")]
    RunNotFound { id: i64 },

    #[error("[AIN-2401] pipeline has already executed a run")]
    PipelineReused,

    #[error("[AIN-3002] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[AIN-3003] channel closed in component {component}")]
    ChannelClosed { component: &'static str },

    #[error("[AIN-3900] runtime failure: {details}")]
    Runtime { details: String },
}

impl IngestError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "AIN-1001",
            Self::MissingConfig { .. } => "AIN-1002",
            Self::ConfigParse { .. } => "AIN-1003",
            Self::InvalidRecord { .. } => "AIN-1101",
            Self::UnknownSource { .. } => "AIN-1201",
            Self::DuplicateSource { .. } => "AIN-1202",
            Self::SourceConnect { .. } => "AIN-2001",
            Self::SourceFetch { .. } => "AIN-2002",
            Self::Serialization { .. } => "AIN-2101",
            Self::Sql { .. } => "AIN-2102",
            Self::SchemaTooNew { .. } => "AIN-2201",
            Self::Migration { .. } => "AIN-2202",
            Self::RunNotFound { .. } => "AIN-2301",
            Self::PipelineReused => "AIN-2401",
            Self::Io { .. } => "AIN-3002",
            Self::ChannelClosed { .. } => "AIN-3003",
            Self::Runtime { .. } => "AIN-3900",
        }
    }

    /// Whether retrying might resolve the failure.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Io { .. }
                | Self::ChannelClosed { .. }
                | Self::SourceConnect { .. }
                | Self::Sql { .. }
                | Self::Runtime { .. }
        )
    }

    /// Fatal errors end a run; everything else is handled locally by the pipeline.
    #[must_use]
    pub const fn is_fatal_for_run(&self) -> bool {
        matches!(
            self,
            Self::SourceConnect { .. } | Self::SourceFetch { .. } | Self::SchemaTooNew { .. }
        )
    }

    /// Convenience constructor for IO errors with a known path.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Convenience constructor for record validation failures.
    #[must_use]
    pub fn invalid_record(field: &'static str, details: impl Into<String>) -> Self {
        Self::InvalidRecord {
            field,
            details: details.into(),
        }
    }
}

impl From<rusqlite::Error> for IngestError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sql {
            context: "rusqlite",
            details: value.to_string(),
        }
    }
}

impl From<serde_json::Error> for IngestError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for IngestError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_variants() -> Vec<IngestError> {
        vec![
            IngestError::InvalidConfig {
                details: String::new(),
            },
            IngestError::MissingConfig {
                path: PathBuf::new(),
            },
            IngestError::ConfigParse {
                context: "",
                details: String::new(),
            },
            IngestError::invalid_record("ra", ""),
            IngestError::UnknownSource {
                name: String::new(),
                available: String::new(),
            },
            IngestError::DuplicateSource {
                name: String::new(),
            },
            IngestError::SourceConnect {
                source_name: String::new(),
                details: String::new(),
            },
            IngestError::SourceFetch {
                source_name: String::new(),
                details: String::new(),
            },
            IngestError::Serialization {
                context: "",
                details: String::new(),
            },
            IngestError::Sql {
                context: "",
                details: String::new(),
            },
            IngestError::SchemaTooNew {
                found: 9,
                supported: 2,
            },
            IngestError::Migration {
                version: 1,
                details: String::new(),
            },
            IngestError::RunNotFound { id: 1 },
            IngestError::PipelineReused,
            IngestError::io("", std::io::Error::other("test")),
            IngestError::ChannelClosed { component: "" },
            IngestError::Runtime {
                details: String::new(),
            },
        ]
    }

    #[test]
    fn error_codes_are_unique() {
        let errors = all_variants();
        let codes: Vec<&str> = errors.iter().map(IngestError::code).collect();
        let unique: std::collections::HashSet<&&str> = codes.iter().collect();
        assert_eq!(
            codes.len(),
            unique.len(),
            "error codes must be unique: {codes:?}"
        );
    }

    #[test]
    fn error_codes_have_ain_prefix_and_appear_in_display() {
        for err in all_variants() {
            assert!(
                err.code().starts_with("AIN-"),
                "code {} must start with AIN-",
                err.code()
            );
            assert!(
                err.to_string().contains(err.code()),
                "display should contain error code: {err}"
            );
        }
    }

    #[test]
    fn fatal_classification_matches_taxonomy() {
        assert!(
            IngestError::SourceFetch {
                source_name: "mock".to_string(),
                details: "broken pipe".to_string(),
            }
            .is_fatal_for_run()
        );
        assert!(IngestError::SchemaTooNew { found: 3, supported: 2 }.is_fatal_for_run());
        assert!(
            !IngestError::Sql {
                context: "write_batch",
                details: String::new(),
            }
            .is_fatal_for_run()
        );
        assert!(!IngestError::invalid_record("dec", "out of range").is_fatal_for_run());
    }

    #[test]
    fn retryable_errors_are_correct() {
        assert!(IngestError::ChannelClosed { component: "test" }.is_retryable());
        assert!(
            IngestError::Sql {
                context: "",
                details: String::new()
            }
            .is_retryable()
        );
        assert!(!IngestError::PipelineReused.is_retryable());
        assert!(!IngestError::invalid_record("mjd", "negative").is_retryable());
        assert!(!IngestError::SchemaTooNew { found: 5, supported: 2 }.is_retryable());
    }

    #[test]
    fn io_convenience_constructor() {
        let err = IngestError::io(
            "/tmp/alerts.jsonl",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert_eq!(err.code(), "AIN-3002");
        assert!(err.to_string().contains("/tmp/alerts.jsonl"));
    }

    #[test]
    fn from_rusqlite_error() {
        let sql_err =
            rusqlite::Error::SqliteFailure(rusqlite::ffi::Error::new(1), Some("test".to_string()));
        let err: IngestError = sql_err.into();
        assert_eq!(err.code(), "AIN-2102");
    }

    #[test]
    fn from_serde_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: IngestError = json_err.into();
        assert_eq!(err.code(), "AIN-2101");
    }

    #[test]
    fn from_toml_error() {
        let toml_err = toml::from_str::<toml::Value>("= invalid").unwrap_err();
        let err: IngestError = toml_err.into();
        assert_eq!(err.code(), "AIN-1003");
    }
}
