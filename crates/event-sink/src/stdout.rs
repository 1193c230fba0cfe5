use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use stream_types::{Envelope, EnvelopeKey};

use crate::{Sink, SinkConfig};

/// Logs every envelope as a single JSON line.
///
/// The schema descriptor is dropped unless `include_schema = "true"` is set
/// in the sink options.
pub struct StdoutSink {
    include_schema: bool,
}

impl StdoutSink {
    pub fn new(include_schema: bool) -> Self {
        Self { include_schema }
    }

    pub fn from_config(config: &SinkConfig) -> anyhow::Result<Arc<dyn Sink>> {
        let include_schema = config.bool_option("include_schema", false)?;
        Ok(Arc::new(Self::new(include_schema)))
    }

    fn render(&self, envelope: &Envelope) -> anyhow::Result<String> {
        let data = if self.include_schema {
            serde_json::to_string(envelope)?
        } else {
            serde_json::to_string(&serde_json::json!({ "payload": &envelope.payload }))?
        };
        Ok(data)
    }
}

#[async_trait]
impl Sink for StdoutSink {
    fn name(&self) -> &str {
        "stdout"
    }

    async fn emit(
        &self,
        _timestamp: DateTime<Utc>,
        topic: &str,
        _key: &EnvelopeKey,
        envelope: &Envelope,
    ) -> anyhow::Result<()> {
        let data = self.render(envelope)?;
        tracing::info!(target: "stdout_sink", "===> /{topic}: \t{data}");
        Ok(())
    }
}
