use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The `[sink]` config section: a registered sink kind plus free-form options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkConfig {
    #[serde(rename = "type", default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

fn default_kind() -> String {
    "stdout".to_string()
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            kind: default_kind(),
            options: BTreeMap::new(),
        }
    }
}

impl SinkConfig {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            options: BTreeMap::new(),
        }
    }

    pub fn option(&self, name: &str) -> Option<&str> {
        self.options.get(name).map(String::as_str)
    }

    /// Parses a boolean option, accepting `true`/`false`.
    pub fn bool_option(&self, name: &str, default: bool) -> anyhow::Result<bool> {
        match self.option(name) {
            None => Ok(default),
            Some(value) => value.parse().map_err(|_| {
                anyhow::anyhow!("sink option '{name}' must be true or false, got '{value}'")
            }),
        }
    }
}
