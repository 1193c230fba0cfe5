//! Replication transport over a regular SQL connection.
//!
//! Changes are read with `pg_logical_slot_peek_binary_changes` and consumed
//! with `pg_replication_slot_advance`, so nothing is lost if the process dies
//! between reading and delivering.

use super::{RawMessage, ReplicationTransport};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use stream_types::StreamPosition;
use tokio::task::JoinHandle;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, error, info, warn};

const PEEK_CHANGES: &str = "SELECT lsn::text, data FROM pg_logical_slot_peek_binary_changes(\
     $1, NULL, $2, 'proto_version', '1', 'publication_names', $3)";
const ADVANCE_SLOT: &str = "SELECT pg_replication_slot_advance($1, $2::text::pg_lsn)";
const SLOT_POSITION: &str = "SELECT confirmed_flush_lsn::text, plugin::text \
     FROM pg_replication_slots WHERE slot_name = $1";
const CREATE_SLOT: &str = "SELECT pg_create_logical_replication_slot($1, 'pgoutput')";
const PUBLICATION_EXISTS: &str = "SELECT 1 FROM pg_publication WHERE pubname = $1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgSlotConfig {
    pub connection_string: String,
    pub slot: String,
    pub publication: String,
    /// Create the slot when it does not exist.
    pub create_slot: bool,
    /// Create a `FOR ALL TABLES` publication when it does not exist.
    pub create_publication: bool,
    /// Upper bound on changes per peek. The server only checks it at
    /// transaction boundaries, so a batch may be larger.
    pub batch_size: i32,
}

pub struct PgSlotTransport {
    config: PgSlotConfig,
    client: Option<Client>,
    connection: Option<JoinHandle<()>>,
    acknowledged: Option<StreamPosition>,
}

impl PgSlotTransport {
    pub fn new(config: PgSlotConfig) -> Self {
        Self {
            config,
            client: None,
            connection: None,
            acknowledged: None,
        }
    }

    fn client(&self) -> Result<&Client> {
        self.client
            .as_ref()
            .ok_or_else(|| anyhow!("replication slot '{}' is not open", self.config.slot))
    }

    async fn ensure_publication(&self) -> Result<()> {
        let client = self.client()?;
        let name = &self.config.publication;
        let rows = client
            .query(PUBLICATION_EXISTS, &[name])
            .await
            .context("Failed to look up publication")?;
        if !rows.is_empty() {
            return Ok(());
        }
        if !self.config.create_publication {
            bail!("Publication '{name}' does not exist");
        }

        info!("Creating publication: {name}");
        client
            .batch_execute(&format!(
                "CREATE PUBLICATION {} FOR ALL TABLES",
                quote_ident(name)
            ))
            .await
            .context("Failed to create publication")?;
        Ok(())
    }

    /// Returns the slot's confirmed flush position, creating the slot first
    /// if allowed.
    async fn ensure_slot(&self) -> Result<Option<StreamPosition>> {
        let client = self.client()?;
        let slot = &self.config.slot;
        let rows = client
            .query(SLOT_POSITION, &[slot])
            .await
            .context("Failed to check for existing replication slot")?;

        if let Some(row) = rows.first() {
            let confirmed: Option<String> = row.get(0);
            let plugin: Option<String> = row.get(1);
            if plugin.as_deref() != Some("pgoutput") {
                bail!(
                    "Replication slot '{slot}' uses plugin {}, expected pgoutput",
                    plugin.as_deref().unwrap_or("<none>")
                );
            }
            info!("Replication slot already exists: {slot}");
            return confirmed
                .map(|lsn| lsn.parse::<StreamPosition>())
                .transpose()
                .context("Invalid confirmed_flush_lsn");
        }

        if !self.config.create_slot {
            bail!("Replication slot '{slot}' does not exist");
        }
        info!("Creating new logical replication slot: {slot}");
        client
            .execute(CREATE_SLOT, &[slot])
            .await
            .context("Failed to create logical replication slot")?;
        Ok(None)
    }

    async fn advance(&mut self, position: StreamPosition) -> Result<()> {
        let client = self.client()?;
        client
            .query(ADVANCE_SLOT, &[&self.config.slot, &position.to_string()])
            .await
            .with_context(|| format!("Failed to advance slot to {position}"))?;
        self.acknowledged = Some(position);
        Ok(())
    }
}

#[async_trait]
impl ReplicationTransport for PgSlotTransport {
    async fn open(&mut self, resume: Option<StreamPosition>) -> Result<()> {
        let (client, connection) = tokio_postgres::connect(&self.config.connection_string, NoTls)
            .await
            .context("Failed to connect to PostgreSQL")?;

        let handle = tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("Connection error: {e}");
            }
        });
        self.client = Some(client);
        self.connection = Some(handle);

        self.ensure_publication().await?;
        let slot_position = self.ensure_slot().await?;
        self.acknowledged = slot_position;

        match (resume, slot_position) {
            (Some(resume), Some(slot)) if resume > slot => {
                info!("Advancing slot {} from {slot} to stored offset {resume}", self.config.slot);
                self.advance(resume).await?;
            }
            (Some(resume), Some(slot)) if resume < slot => {
                warn!(
                    "Slot {} is at {slot}, past the stored offset {resume}; changes in between are gone",
                    self.config.slot
                );
            }
            _ => {}
        }

        info!(
            slot = %self.config.slot,
            publication = %self.config.publication,
            position = ?self.acknowledged,
            "replication slot opened"
        );
        Ok(())
    }

    async fn next_batch(&mut self) -> Result<Vec<RawMessage>> {
        let client = self.client()?;
        let rows = client
            .query(
                PEEK_CHANGES,
                &[
                    &self.config.slot,
                    &self.config.batch_size,
                    &self.config.publication,
                ],
            )
            .await
            .context("Failed to peek changes from replication slot")?;

        let mut batch = Vec::with_capacity(rows.len());
        for row in rows {
            let lsn: String = row.get(0);
            let data: Vec<u8> = row.get(1);
            let position = lsn
                .parse::<StreamPosition>()
                .with_context(|| format!("Invalid change LSN {lsn}"))?;
            batch.push(RawMessage { position, data });
        }
        debug!("Peeked {} changes", batch.len());
        Ok(batch)
    }

    async fn acknowledge(&mut self, position: StreamPosition) -> Result<()> {
        if self.acknowledged.is_some_and(|acked| position <= acked) {
            return Ok(());
        }
        debug!("Acknowledging up to {position}");
        self.advance(position).await
    }

    async fn close(&mut self) -> Result<()> {
        self.client = None;
        if let Some(handle) = self.connection.take() {
            handle.abort();
        }
        info!("Closed replication slot {}", self.config.slot);
        Ok(())
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> PgSlotConfig {
        PgSlotConfig {
            connection_string: "host=localhost dbname=metrics".to_string(),
            slot: "events".to_string(),
            publication: "events_pub".to_string(),
            create_slot: true,
            create_publication: true,
            batch_size: 500,
        }
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("events_pub"), "\"events_pub\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[tokio::test]
    async fn test_operations_require_open_slot() {
        let mut transport = PgSlotTransport::new(config());
        let err = transport.next_batch().await.unwrap_err();
        assert!(err.to_string().contains("is not open"));
        assert!(transport
            .acknowledge(StreamPosition::new(5))
            .await
            .is_err());
        transport.close().await.unwrap();
    }
}
