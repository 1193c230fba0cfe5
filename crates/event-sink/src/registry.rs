use std::collections::BTreeMap;
use std::sync::Arc;

use crate::{RecordingSink, Sink, SinkConfig, StdoutSink};

/// Builds a sink from its config section.
pub type SinkFactory = fn(&SinkConfig) -> anyhow::Result<Arc<dyn Sink>>;

/// Sink factories keyed by the `type` written in the config.
///
/// The sink is created once at startup; the pipeline never switches sinks
/// while running.
pub struct SinkRegistry {
    factories: BTreeMap<String, SinkFactory>,
}

impl Default for SinkRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl SinkRegistry {
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Registry with the `stdout` and `memory` sinks.
    pub fn with_builtin() -> Self {
        let mut registry = Self::empty();
        registry.register("stdout", StdoutSink::from_config);
        registry.register("memory", RecordingSink::from_config);
        registry
    }

    /// Registers a factory, replacing any previous one for `kind`.
    pub fn register(&mut self, kind: impl Into<String>, factory: SinkFactory) {
        self.factories.insert(kind.into(), factory);
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn create(&self, config: &SinkConfig) -> anyhow::Result<Arc<dyn Sink>> {
        let factory = self.factories.get(&config.kind).ok_or_else(|| {
            anyhow::anyhow!(
                "unknown sink type '{}'; available: {}",
                config.kind,
                self.kinds().collect::<Vec<_>>().join(", ")
            )
        })?;
        let sink = factory(config)?;
        tracing::info!(sink = sink.name(), "created sink");
        Ok(sink)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_kinds() {
        let registry = SinkRegistry::with_builtin();
        assert_eq!(registry.kinds().collect::<Vec<_>>(), vec!["memory", "stdout"]);
        assert_eq!(registry.create(&SinkConfig::new("stdout")).unwrap().name(), "stdout");
        assert_eq!(registry.create(&SinkConfig::new("memory")).unwrap().name(), "memory");
    }

    #[test]
    fn test_unknown_kind_lists_available() {
        let err = SinkRegistry::with_builtin()
            .create(&SinkConfig::new("kafka"))
            .err()
            .unwrap();
        let message = err.to_string();
        assert!(message.contains("unknown sink type 'kafka'"));
        assert!(message.contains("memory, stdout"));
    }

    #[test]
    fn test_invalid_option_is_rejected() {
        let mut config = SinkConfig::new("stdout");
        config
            .options
            .insert("include_schema".to_string(), "maybe".to_string());
        assert!(SinkRegistry::with_builtin().create(&config).is_err());
    }

    #[test]
    fn test_custom_factory() {
        let mut registry = SinkRegistry::empty();
        registry.register("null", RecordingSink::from_config);
        assert!(registry.create(&SinkConfig::new("null")).is_ok());
        assert!(registry.create(&SinkConfig::new("stdout")).is_err());
    }
}
