//! Wiring of one change stream: sink, offsets, registry and session setup.

use crate::consumer::{ConsumerConfig, ReplicationConsumer, SessionSummary};
use crate::dispatcher::{Dispatcher, DispatcherConfig};
use crate::envelope::{EnvelopeBuilder, EnvelopeConfig};
use crate::error::Result;
use crate::filter::RelationFilter;
use crate::metrics::PipelineMetrics;
use crate::registry::SchemaRegistry;
use crate::transport::ReplicationTransport;
use event_sink::Sink;
use offset_store::{OffsetStore, StreamIdentity};
use std::sync::Arc;
use stream_types::StreamPosition;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub envelope: EnvelopeConfig,
    pub dispatch: DispatcherConfig,
    pub consumer: ConsumerConfig,
    pub filter: RelationFilter,
    /// Where to start when no offset has been stored yet. `None` starts
    /// wherever the slot stands.
    pub initial_position: Option<StreamPosition>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            envelope: EnvelopeConfig::default(),
            dispatch: DispatcherConfig::default(),
            consumer: ConsumerConfig::default(),
            filter: RelationFilter::timescaledb_defaults(),
            initial_position: None,
        }
    }
}

pub struct Pipeline {
    sink: Arc<dyn Sink>,
    offsets: Arc<dyn OffsetStore>,
    stream: StreamIdentity,
    config: PipelineConfig,
    registry: Arc<SchemaRegistry>,
    metrics: Arc<PipelineMetrics>,
}

impl Pipeline {
    pub fn new(
        sink: Arc<dyn Sink>,
        offsets: Arc<dyn OffsetStore>,
        stream: StreamIdentity,
        config: PipelineConfig,
    ) -> Self {
        Self {
            sink,
            offsets,
            stream,
            config,
            registry: Arc::new(SchemaRegistry::new()),
            metrics: PipelineMetrics::new(),
        }
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    pub fn stream(&self) -> &StreamIdentity {
        &self.stream
    }

    /// The stored offset, or the configured initial position when nothing
    /// was stored yet.
    pub async fn resume_position(&self) -> Result<Option<StreamPosition>> {
        let stored = self.offsets.load(&self.stream).await?;
        Ok(stored
            .map(|record| record.confirmed_position)
            .or(self.config.initial_position))
    }

    /// Runs one session over `transport`, resuming from the stored offset.
    pub async fn run_session<T: ReplicationTransport>(
        &self,
        transport: T,
        shutdown: &CancellationToken,
    ) -> Result<SessionSummary> {
        let resume = self.resume_position().await?;
        info!(stream = %self.stream, resume = ?resume, "starting pipeline session");

        let dispatcher = Dispatcher::new(
            Arc::clone(&self.sink),
            Arc::clone(&self.offsets),
            self.stream.clone(),
            EnvelopeBuilder::new(self.config.envelope.clone()),
            self.config.dispatch,
            Arc::clone(&self.metrics),
            resume,
        );
        let consumer = ReplicationConsumer::new(
            Arc::clone(&self.registry),
            self.config.filter.clone(),
            self.config.consumer,
            Arc::clone(&self.metrics),
        );
        consumer.start(transport, dispatcher, resume, shutdown).await
    }
}
