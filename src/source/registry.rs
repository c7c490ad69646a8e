//! Name → factory registry for alert sources.

use std::collections::BTreeMap;
use std::fmt;

use crate::core::config::SourceSettings;
use crate::core::errors::{IngestError, Result};
use crate::source::AlertSource;
use crate::source::jsonl::JsonlSource;
use crate::source::mock::MockSource;

/// Builds a source from configuration.
pub type SourceFactory = fn(&SourceSettings) -> Result<Box<dyn AlertSource>>;

/// Explicit registry of source constructors, built at startup and passed by
/// reference to whatever resolves source names.
#[derive(Clone)]
pub struct SourceRegistry {
    factories: BTreeMap<String, SourceFactory>,
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl SourceRegistry {
    /// Registry with no sources.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Registry with the `mock` and `jsonl` sources.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry
            .factories
            .insert(MockSource::NAME.to_string(), build_mock);
        registry
            .factories
            .insert(JsonlSource::NAME.to_string(), build_jsonl);
        registry
    }

    /// Add a source under `name`. Names are case-insensitive and unique.
    pub fn register(&mut self, name: &str, factory: SourceFactory) -> Result<()> {
        let key = normalize(name);
        if self.factories.contains_key(&key) {
            return Err(IngestError::DuplicateSource { name: key });
        }
        self.factories.insert(key, factory);
        Ok(())
    }

    /// Construct the source registered under `name`.
    pub fn create(&self, name: &str, settings: &SourceSettings) -> Result<Box<dyn AlertSource>> {
        let key = normalize(name);
        let factory = self
            .factories
            .get(&key)
            .ok_or_else(|| IngestError::UnknownSource {
                name: key.clone(),
                available: self.names().join(", "),
            })?;
        factory(settings)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(&normalize(name))
    }

    /// Registered names in sorted order.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

impl fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceRegistry")
            .field("names", &self.names())
            .finish()
    }
}

fn build_mock(settings: &SourceSettings) -> Result<Box<dyn AlertSource>> {
    Ok(Box::new(MockSource::from_settings(settings)))
}

fn build_jsonl(settings: &SourceSettings) -> Result<Box<dyn AlertSource>> {
    Ok(Box::new(JsonlSource::from_settings(settings)?))
}

fn normalize(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::memory::MemorySource;

    fn memory_factory(_: &SourceSettings) -> Result<Box<dyn AlertSource>> {
        Ok(Box::new(MemorySource::new("replay", Vec::new())))
    }

    #[test]
    fn builtins_are_registered() {
        let registry = SourceRegistry::with_builtins();
        assert_eq!(registry.names(), vec!["jsonl", "mock"]);
        assert!(registry.contains("MOCK"));
    }

    #[test]
    fn create_builds_named_source() {
        let registry = SourceRegistry::default();
        let source = registry
            .create("mock", &SourceSettings::default())
            .expect("mock source");
        assert_eq!(source.source_name(), "mock");
    }

    #[test]
    fn unknown_name_lists_available() {
        let registry = SourceRegistry::with_builtins();
        let err = registry
            .create("kafka", &SourceSettings::default())
            .err()
            .expect("unknown source");
        assert!(matches!(err, IngestError::UnknownSource { .. }));
        let msg = err.to_string();
        assert!(msg.contains("kafka"));
        assert!(msg.contains("jsonl, mock"));
    }

    #[test]
    fn duplicate_registration_rejected() {
        let mut registry = SourceRegistry::empty();
        registry.register("replay", memory_factory).unwrap();
        let err = registry.register(" Replay ", memory_factory).unwrap_err();
        assert!(matches!(err, IngestError::DuplicateSource { .. }));
    }

    #[test]
    fn registries_are_independent() {
        let mut a = SourceRegistry::empty();
        let b = SourceRegistry::empty();
        a.register("replay", memory_factory).unwrap();
        assert!(a.contains("replay"));
        assert!(!b.contains("replay"));
    }
}
