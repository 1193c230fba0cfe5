//! TOML configuration file.
//!
//! Every key has a default, so an empty file is a valid configuration that
//! streams `dbname=postgres` on localhost to stdout.
//!
//! ```toml
//! log_level = "info"
//!
//! [postgresql]
//! connection_string = "host=localhost user=postgres dbname=metrics"
//! slot = "tsdb_event_streamer"
//! publication = "tsdb_event_streamer"
//!
//! [topic]
//! prefix = "metrics"
//!
//! [sink]
//! type = "stdout"
//!
//! [offsets]
//! storage = "filesystem"
//! dir = "/var/lib/tsdb-event-streamer"
//!
//! [dispatch]
//! max_attempts = 5
//! initial_backoff = "100ms"
//! ```

pub mod duration;

use anyhow::Context;
use event_sink::SinkConfig;
use offset_store::{OffsetStorage, StreamIdentity};
use pipeline::{
    ConsumerConfig, DispatcherConfig, EnvelopeConfig, PgSlotConfig, PipelineConfig,
    ReconnectPolicy, RelationFilter, RetryPolicy, DEFAULT_EXCLUDES,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use stream_types::StreamPosition;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub log_level: String,
    pub postgresql: PostgresConfig,
    pub topic: TopicConfig,
    pub sink: SinkConfig,
    pub offsets: OffsetStorage,
    pub dispatch: DispatchConfig,
    pub replication: ReplicationConfig,
    pub reconnect: ReconnectConfig,
    pub filter: FilterConfig,
    pub envelope: EnvelopeSection,
    pub metrics: MetricsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            postgresql: PostgresConfig::default(),
            topic: TopicConfig::default(),
            sink: SinkConfig::default(),
            offsets: OffsetStorage::default(),
            dispatch: DispatchConfig::default(),
            replication: ReplicationConfig::default(),
            reconnect: ReconnectConfig::default(),
            filter: FilterConfig::default(),
            envelope: EnvelopeSection::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PostgresConfig {
    pub connection_string: String,
    pub slot: String,
    pub publication: String,
    pub create_slot: bool,
    pub create_publication: bool,
    pub batch_size: i32,
    /// Start position for a stream without a stored offset, e.g. `0/16B3748`.
    pub initial_position: Option<StreamPosition>,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            connection_string: "host=localhost user=postgres dbname=postgres".to_string(),
            slot: "tsdb_event_streamer".to_string(),
            publication: "tsdb_event_streamer".to_string(),
            create_slot: true,
            create_publication: false,
            batch_size: 1000,
            initial_position: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TopicConfig {
    pub prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DispatchConfig {
    pub max_attempts: u32,
    #[serde(deserialize_with = "duration::deserialize")]
    pub initial_backoff: Duration,
    #[serde(deserialize_with = "duration::deserialize")]
    pub max_backoff: Duration,
    pub multiplier: f64,
    pub jitter: bool,
    pub max_parallel_lanes: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            max_attempts: retry.max_attempts,
            initial_backoff: retry.initial_delay,
            max_backoff: retry.max_delay,
            multiplier: retry.multiplier,
            jitter: retry.jitter,
            max_parallel_lanes: DispatcherConfig::default().max_parallel_lanes,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReplicationConfig {
    #[serde(deserialize_with = "duration::deserialize")]
    pub poll_interval: Duration,
    #[serde(deserialize_with = "duration::deserialize")]
    pub ack_interval: Duration,
    pub channel_capacity: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        let consumer = ConsumerConfig::default();
        Self {
            poll_interval: consumer.poll_interval,
            ack_interval: consumer.ack_interval,
            channel_capacity: consumer.channel_capacity,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReconnectConfig {
    #[serde(deserialize_with = "duration::deserialize")]
    pub initial_backoff: Duration,
    #[serde(deserialize_with = "duration::deserialize")]
    pub max_backoff: Duration,
    pub multiplier: f64,
    pub jitter: bool,
    /// Give up after this long without a working session.
    #[serde(deserialize_with = "duration::deserialize")]
    pub max_duration: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        let policy = ReconnectPolicy::default();
        Self {
            initial_backoff: policy.backoff.initial_delay,
            max_backoff: policy.backoff.max_delay,
            multiplier: policy.backoff.multiplier,
            jitter: policy.backoff.jitter,
            max_duration: policy.max_reconnect_duration,
        }
    }
}

/// Relation patterns are `schema.table` globs; a bare table matches in any schema.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FilterConfig {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            include: Vec::new(),
            exclude: DEFAULT_EXCLUDES.iter().map(|p| p.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EnvelopeSection {
    pub include_schema: bool,
    pub connector_name: String,
}

impl Default for EnvelopeSection {
    fn default() -> Self {
        let envelope = EnvelopeConfig::default();
        Self {
            include_schema: envelope.include_schema,
            connector_name: envelope.connector_name,
        }
    }
}

/// Periodic JSON-lines snapshots of pipeline metrics; off without `output`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MetricsConfig {
    pub output: Option<PathBuf>,
    #[serde(deserialize_with = "duration::deserialize")]
    pub interval: Duration,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            output: None,
            interval: Duration::from_secs(10),
        }
    }
}

impl Config {
    pub fn from_toml(source: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(source).context("Failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let source = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&source).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.postgresql.slot.is_empty() {
            anyhow::bail!("postgresql.slot must not be empty");
        }
        if self.postgresql.publication.is_empty() {
            anyhow::bail!("postgresql.publication must not be empty");
        }
        if self.postgresql.batch_size <= 0 {
            anyhow::bail!("postgresql.batch_size must be positive");
        }
        if self.dispatch.max_attempts == 0 {
            anyhow::bail!("dispatch.max_attempts must be at least 1");
        }
        if self.dispatch.max_parallel_lanes == 0 {
            anyhow::bail!("dispatch.max_parallel_lanes must be at least 1");
        }
        if self.replication.channel_capacity == 0 {
            anyhow::bail!("replication.channel_capacity must be at least 1");
        }
        if self.dispatch.multiplier < 1.0 || self.reconnect.multiplier < 1.0 {
            anyhow::bail!("backoff multipliers must be at least 1.0");
        }
        self.connection()?;
        Ok(())
    }

    /// The parsed `postgresql.connection_string`.
    pub fn connection(&self) -> anyhow::Result<tokio_postgres::Config> {
        tokio_postgres::Config::from_str(&self.postgresql.connection_string)
            .context("postgresql.connection_string is not a valid connection string")
    }

    /// Identity of the replication stream in the offset store.
    pub fn stream_identity(&self) -> anyhow::Result<StreamIdentity> {
        StreamIdentity::from_connection_config(&self.connection()?, &self.postgresql.slot)
    }

    /// The database being streamed; like libpq, defaults to the user name.
    pub fn database_name(&self) -> anyhow::Result<String> {
        let connection = self.connection()?;
        Ok(connection
            .get_dbname()
            .or_else(|| connection.get_user())
            .unwrap_or_default()
            .to_string())
    }

    pub fn slot_config(&self) -> PgSlotConfig {
        PgSlotConfig {
            connection_string: self.postgresql.connection_string.clone(),
            slot: self.postgresql.slot.clone(),
            publication: self.postgresql.publication.clone(),
            create_slot: self.postgresql.create_slot,
            create_publication: self.postgresql.create_publication,
            batch_size: self.postgresql.batch_size,
        }
    }

    pub fn pipeline_config(&self) -> anyhow::Result<PipelineConfig> {
        Ok(PipelineConfig {
            envelope: EnvelopeConfig {
                topic_prefix: self.topic.prefix.clone(),
                include_schema: self.envelope.include_schema,
                connector_name: self.envelope.connector_name.clone(),
                database: self.database_name()?,
            },
            dispatch: DispatcherConfig {
                retry: RetryPolicy {
                    max_attempts: self.dispatch.max_attempts,
                    initial_delay: self.dispatch.initial_backoff,
                    max_delay: self.dispatch.max_backoff,
                    multiplier: self.dispatch.multiplier,
                    jitter: self.dispatch.jitter,
                },
                max_parallel_lanes: self.dispatch.max_parallel_lanes,
            },
            consumer: ConsumerConfig {
                poll_interval: self.replication.poll_interval,
                ack_interval: self.replication.ack_interval,
                channel_capacity: self.replication.channel_capacity,
            },
            filter: RelationFilter::new(&self.filter.include, &self.filter.exclude),
            initial_position: self.postgresql.initial_position,
        })
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            backoff: RetryPolicy {
                max_attempts: u32::MAX,
                initial_delay: self.reconnect.initial_backoff,
                max_delay: self.reconnect.max_backoff,
                multiplier: self.reconnect.multiplier,
                jitter: self.reconnect.jitter,
            },
            max_reconnect_duration: self.reconnect.max_duration,
        }
    }
}
