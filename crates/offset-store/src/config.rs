//! Offset storage selection.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use crate::{FilesystemStore, MemoryStore, OffsetStore, PostgresStore};

/// Where offsets are kept, as written in the `[offsets]` config section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "storage", rename_all = "lowercase")]
pub enum OffsetStorage {
    Filesystem {
        #[serde(default = "default_dir")]
        dir: PathBuf,
    },
    Postgres {
        #[serde(default = "default_table")]
        table: String,
        /// Defaults to the replication source's connection string.
        connection_string: Option<String>,
    },
    Memory,
}

fn default_dir() -> PathBuf {
    PathBuf::from(".tsdb-event-streamer-offsets")
}

fn default_table() -> String {
    "tsdb_event_streamer_offsets".to_string()
}

impl Default for OffsetStorage {
    fn default() -> Self {
        OffsetStorage::Filesystem { dir: default_dir() }
    }
}

impl OffsetStorage {
    /// Opens the configured backend.
    pub async fn open(&self, source_connection_string: &str) -> anyhow::Result<Arc<dyn OffsetStore>> {
        match self {
            OffsetStorage::Filesystem { dir } => {
                tracing::info!("Using filesystem offset store at {}", dir.display());
                Ok(Arc::new(FilesystemStore::new(dir.clone())))
            }
            OffsetStorage::Postgres {
                table,
                connection_string,
            } => {
                let conn = connection_string
                    .as_deref()
                    .unwrap_or(source_connection_string);
                let (client, connection) = tokio_postgres::connect(conn, tokio_postgres::NoTls)
                    .await
                    .map_err(|e| anyhow::anyhow!("Failed to connect to offset database: {e}"))?;
                tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        tracing::error!("Offset store connection error: {e}");
                    }
                });
                let store = PostgresStore::new(Arc::new(client), table);
                store.ensure_table().await?;
                tracing::info!("Using PostgreSQL offset store table {table}");
                Ok(Arc::new(store))
            }
            OffsetStorage::Memory => {
                tracing::warn!("Using in-memory offset store; offsets are lost on exit");
                Ok(Arc::new(MemoryStore::new()))
            }
        }
    }
}
