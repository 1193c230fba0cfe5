//! Wires configuration into a running stream.

use crate::config::Config;
use anyhow::Context;
use event_sink::{Sink, SinkRegistry};
use offset_store::{OffsetRecord, OffsetStore};
use pipeline::{PgSlotTransport, Pipeline, ReplicationTransport, SessionSummary, Supervisor};
use std::sync::Arc;
use stream_types::StreamPosition;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Command-line values that take precedence over the config file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub connection_string: Option<String>,
    pub slot: Option<String>,
    pub publication: Option<String>,
    pub topic_prefix: Option<String>,
    pub sink: Option<String>,
}

impl Overrides {
    pub fn apply(&self, config: &mut Config) -> anyhow::Result<()> {
        if let Some(connection_string) = &self.connection_string {
            config.postgresql.connection_string = connection_string.clone();
        }
        if let Some(slot) = &self.slot {
            config.postgresql.slot = slot.clone();
        }
        if let Some(publication) = &self.publication {
            config.postgresql.publication = publication.clone();
        }
        if let Some(prefix) = &self.topic_prefix {
            config.topic.prefix = prefix.clone();
        }
        if let Some(sink) = &self.sink {
            config.sink.kind = sink.clone();
        }
        config.validate()
    }
}

/// Streams from the configured replication slot until `shutdown` fires or a
/// fatal error occurs.
pub async fn run_stream(config: &Config, shutdown: CancellationToken) -> anyhow::Result<SessionSummary> {
    let sink = SinkRegistry::with_builtin()
        .create(&config.sink)
        .with_context(|| format!("Failed to create '{}' sink", config.sink.kind))?;
    let offsets = open_offsets(config).await?;
    let slot = config.slot_config();
    stream_with(config, sink, offsets, move || PgSlotTransport::new(slot.clone()), &shutdown).await
}

/// Like [`run_stream`], over caller-provided sink, offsets and transport.
pub async fn stream_with<T, F>(
    config: &Config,
    sink: Arc<dyn Sink>,
    offsets: Arc<dyn OffsetStore>,
    connect: F,
    shutdown: &CancellationToken,
) -> anyhow::Result<SessionSummary>
where
    T: ReplicationTransport,
    F: FnMut() -> T,
{
    let stream = config.stream_identity()?;
    info!(
        stream = %stream,
        sink = sink.name(),
        "Starting change stream from slot {}",
        config.postgresql.slot
    );
    let pipeline = Pipeline::new(sink, offsets, stream, config.pipeline_config()?);

    let emission = config.metrics.output.as_ref().map(|path| {
        info!("Writing metrics to {} every {:?}", path.display(), config.metrics.interval);
        pipeline
            .metrics()
            .start_emission_task(path.clone(), config.metrics.interval)
    });

    let outcome = Supervisor::new(&pipeline, config.reconnect_policy())
        .run(connect, shutdown)
        .await;

    if let Some(handle) = emission {
        if handle.is_finished() {
            match handle.await {
                Ok(Err(e)) => warn!("Metrics emission stopped: {e:#}"),
                Err(e) => warn!("Metrics emission task failed: {e}"),
                Ok(Ok(())) => {}
            }
        } else {
            handle.abort();
        }
    }

    match outcome {
        Ok(summary) => {
            info!(
                confirmed = ?summary.confirmed,
                "Change stream stopped; {} records decoded in the last session",
                summary.records_decoded
            );
            Ok(summary)
        }
        Err(e) => {
            let confirmed = pipeline
                .metrics()
                .confirmed_position()
                .map_or_else(|| "none".to_string(), |p| p.to_string());
            let kind = e.kind();
            Err(anyhow::Error::new(e).context(format!(
                "replication stopped with {kind}; last confirmed position: {confirmed}"
            )))
        }
    }
}

async fn open_offsets(config: &Config) -> anyhow::Result<Arc<dyn OffsetStore>> {
    config
        .offsets
        .open(&config.postgresql.connection_string)
        .await
        .context("Failed to open offset store")
}

/// The stored offset of the configured stream.
pub async fn show_offset(config: &Config) -> anyhow::Result<Option<OffsetRecord>> {
    let stream = config.stream_identity()?;
    let offsets = open_offsets(config).await?;
    Ok(offsets.load(&stream).await?)
}

/// Stores `position` as the confirmed offset. Positions below the stored
/// one are rejected.
pub async fn set_offset(config: &Config, position: StreamPosition) -> anyhow::Result<OffsetRecord> {
    let stream = config.stream_identity()?;
    let offsets = open_offsets(config).await?;
    let record = offsets
        .save(&stream, position)
        .await
        .with_context(|| format!("Failed to set offset of {stream} to {position}"))?;
    info!("Offset of {stream} set to {position}");
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use event_sink::RecordingSink;
    use offset_store::{MemoryStore, OffsetStorage};
    use pgoutput::testing;
    use pipeline::testing::ScriptedTransport;
    use pipeline::transport::RawMessage;
    use std::time::Duration;
    use tempfile::TempDir;

    fn ts() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn fast_config() -> Config {
        let mut config = Config::from_toml(
            r#"
            [postgresql]
            connection_string = "host=db.example.com dbname=metrics"
            slot = "events"

            [topic]
            prefix = "tsdb"

            [replication]
            poll_interval = "5ms"
            ack_interval = "5ms"

            [dispatch]
            initial_backoff = "1ms"
            max_backoff = "5ms"
            "#,
        )
        .unwrap();
        config.offsets = OffsetStorage::Memory;
        config
    }

    fn one_insert() -> Vec<RawMessage> {
        vec![
            RawMessage::new(10u64, testing::begin(10, ts(), 7)),
            RawMessage::new(
                10u64,
                testing::relation(1, "public", "readings", b'd', &[("id", 23, true)]),
            ),
            RawMessage::new(10u64, testing::insert(1, &[testing::TupleValue::text("1")])),
            RawMessage::new(11u64, testing::commit(10, 11, ts())),
        ]
    }

    #[test]
    fn test_overrides_take_precedence() {
        let mut config = Config::default();
        let overrides = Overrides {
            connection_string: Some("postgresql://u@other:5432/tsdb".to_string()),
            slot: Some("override_slot".to_string()),
            publication: None,
            topic_prefix: Some("metrics".to_string()),
            sink: Some("memory".to_string()),
        };
        overrides.apply(&mut config).unwrap();

        assert_eq!(config.postgresql.slot, "override_slot");
        assert_eq!(config.postgresql.publication, "tsdb_event_streamer");
        assert_eq!(config.topic.prefix, "metrics");
        assert_eq!(config.sink.kind, "memory");
        assert_eq!(
            config.stream_identity().unwrap().as_str(),
            "other/tsdb/override_slot"
        );

        let empty_slot = Overrides {
            slot: Some(String::new()),
            ..Overrides::default()
        };
        assert!(empty_slot.apply(&mut config).is_err());
    }

    #[tokio::test]
    async fn test_stream_with_delivers_and_writes_metrics() {
        let dir = TempDir::new().unwrap();
        let metrics_path = dir.path().join("metrics.jsonl");
        let mut config = fast_config();
        config.metrics.output = Some(metrics_path.clone());
        config.metrics.interval = Duration::from_millis(1);

        let sink = Arc::new(RecordingSink::new());
        let offsets = Arc::new(MemoryStore::new());
        let shutdown = CancellationToken::new();
        let mut transport =
            Some(ScriptedTransport::new(vec![one_insert()]).cancel_when_drained(shutdown.clone()));

        let summary = stream_with(
            &config,
            sink.clone(),
            offsets.clone(),
            move || transport.take().unwrap_or_else(ScriptedTransport::empty),
            &shutdown,
        )
        .await
        .unwrap();

        assert_eq!(summary.confirmed, Some(StreamPosition::new(11)));
        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].topic, "tsdb.public.readings");
        assert_eq!(events[0].envelope.payload.source.db, "metrics");

        let stream = config.stream_identity().unwrap();
        let stored = offsets.load(&stream).await.unwrap().unwrap();
        assert_eq!(stored.confirmed_position, StreamPosition::new(11));
    }

    #[tokio::test]
    async fn test_fatal_error_reports_last_confirmed_position() {
        let config = fast_config();
        let sink = Arc::new(RecordingSink::new());
        let offsets = Arc::new(MemoryStore::new());
        let shutdown = CancellationToken::new();

        let mut batches = vec![one_insert()];
        batches.push(vec![RawMessage::new(20u64, testing::commit(19, 20, ts()))]);
        let mut transport = Some(ScriptedTransport::new(batches));

        let err = stream_with(
            &config,
            sink,
            offsets,
            move || transport.take().unwrap_or_else(ScriptedTransport::empty),
            &shutdown,
        )
        .await
        .unwrap_err();

        let message = format!("{err:#}");
        assert!(message.contains("stopped with ProtocolError"), "{message}");
        assert!(message.contains("last confirmed position: 0/B"), "{message}");
        let pipeline_error = err.downcast_ref::<pipeline::PipelineError>().unwrap();
        assert_eq!(pipeline_error.kind(), pipeline::ErrorKind::ProtocolError);
    }

    #[tokio::test]
    async fn test_show_and_set_offset_on_filesystem() {
        let dir = TempDir::new().unwrap();
        let mut config = fast_config();
        config.offsets = OffsetStorage::Filesystem {
            dir: dir.path().to_path_buf(),
        };

        assert!(show_offset(&config).await.unwrap().is_none());

        let record = set_offset(&config, "0/16B3748".parse().unwrap()).await.unwrap();
        assert_eq!(record.confirmed_position, StreamPosition::new(0x16B3748));

        let shown = show_offset(&config).await.unwrap().unwrap();
        assert_eq!(shown.confirmed_position, StreamPosition::new(0x16B3748));
        assert_eq!(shown.stream.as_str(), "db.example.com/metrics/events");

        assert!(set_offset(&config, StreamPosition::new(1)).await.is_err());
    }
}
