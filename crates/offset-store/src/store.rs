//! Offset storage trait and shared types.

use crate::error::{OffsetError, Result};
use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use stream_types::StreamPosition;
use tokio_postgres::config::Host;

const DEFAULT_PORT: u16 = 5432;

/// Identifies one replication stream, e.g. `db.example.com/metrics/events_slot`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamIdentity(String);

impl StreamIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derives an identity from a connection string and the replication
    /// slot name. Accepts everything libpq does.
    pub fn from_connection_and_slot(connection_string: &str, slot: &str) -> anyhow::Result<Self> {
        let config = tokio_postgres::Config::from_str(connection_string)
            .context("Invalid connection string")?;
        Self::from_connection_config(&config, slot)
    }

    /// `servers/database/slot`, where servers are the configured hosts (with
    /// non-default ports) and the database falls back to the user name as
    /// libpq does.
    pub fn from_connection_config(config: &tokio_postgres::Config, slot: &str) -> anyhow::Result<Self> {
        if slot.is_empty() {
            bail!("replication slot name must not be empty");
        }

        let mut hosts: Vec<String> = config
            .get_hosts()
            .iter()
            .map(|host| match host {
                Host::Tcp(name) => name.clone(),
                #[cfg(unix)]
                Host::Unix(path) => path.display().to_string(),
            })
            .collect();
        if hosts.is_empty() {
            hosts = config.get_hostaddrs().iter().map(|addr| addr.to_string()).collect();
        }
        if hosts.is_empty() {
            hosts.push("localhost".to_string());
        }

        let ports = config.get_ports();
        let servers: Vec<String> = hosts
            .iter()
            .enumerate()
            .map(|(i, host)| {
                let port = ports.get(i).or_else(|| ports.first()).copied().unwrap_or(DEFAULT_PORT);
                match (port == DEFAULT_PORT, host.contains(':')) {
                    (true, _) => host.clone(),
                    (false, true) => format!("[{host}]:{port}"),
                    (false, false) => format!("{host}:{port}"),
                }
            })
            .collect();

        let database = config
            .get_dbname()
            .or_else(|| config.get_user())
            .filter(|name| !name.is_empty())
            .ok_or_else(|| {
                anyhow!("connection string must name a database or a user to derive a stream identity")
            })?;
        Ok(Self(format!("{}/{database}/{slot}", servers.join(","))))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File-name-safe form of the identity.
    pub fn file_stem(&self) -> String {
        self.0
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect()
    }
}

impl fmt::Display for StreamIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The durable confirmed position of one stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetRecord {
    pub stream: StreamIdentity,
    pub confirmed_position: StreamPosition,
    pub updated_at: DateTime<Utc>,
}

/// Durable offset storage.
///
/// `save` must not return before the position is durable, must be a no-op
/// for the currently stored position, and must reject lower positions with
/// [`OffsetError::Regression`].
#[async_trait]
pub trait OffsetStore: Send + Sync {
    /// Returns `None` when the stream has never confirmed a position.
    async fn load(&self, stream: &StreamIdentity) -> Result<Option<OffsetRecord>>;

    async fn save(&self, stream: &StreamIdentity, position: StreamPosition) -> Result<OffsetRecord>;
}

/// Shared monotonicity check; `Ok(true)` means the stored record already
/// holds `position`.
pub(crate) fn check_advance(
    stream: &StreamIdentity,
    current: Option<&OffsetRecord>,
    position: StreamPosition,
) -> Result<bool> {
    match current {
        Some(record) if record.confirmed_position == position => Ok(true),
        Some(record) if record.confirmed_position > position => Err(OffsetError::Regression {
            stream: stream.to_string(),
            stored: record.confirmed_position,
            attempted: position,
        }),
        _ => Ok(false),
    }
}
