//! PostgreSQL-backed offset storage.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use stream_types::StreamPosition;
use tokio_postgres::{Client, Row};

use crate::error::{OffsetError, Result};
use crate::store::{OffsetRecord, OffsetStore, StreamIdentity};

/// Stores offsets as rows of a table keyed by stream identity.
///
/// The upsert only applies when the stored position is not ahead of the new
/// one, so the regression guard holds even with concurrent writers.
pub struct PostgresStore {
    client: Arc<Client>,
    table: String,
}

impl PostgresStore {
    /// `table` may be schema-qualified; each part is quoted as an identifier.
    pub fn new(client: Arc<Client>, table: &str) -> Self {
        let table = table
            .split('.')
            .map(quote_ident)
            .collect::<Vec<_>>()
            .join(".");
        Self { client, table }
    }

    pub async fn ensure_table(&self) -> Result<()> {
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                stream_id TEXT PRIMARY KEY,
                confirmed_lsn PG_LSN NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )",
            self.table
        );
        self.client.batch_execute(&ddl).await?;
        tracing::info!(table = %self.table, "offset table ready");
        Ok(())
    }
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn record_from_row(stream: &StreamIdentity, row: &Row) -> Result<OffsetRecord> {
    let lsn: String = row.try_get(0)?;
    let updated_at: DateTime<Utc> = row.try_get(1)?;
    let confirmed_position = lsn.parse().map_err(|e: stream_types::PositionParseError| {
        OffsetError::Corrupt {
            location: format!("offset row for '{stream}'"),
            reason: e.to_string(),
        }
    })?;
    Ok(OffsetRecord {
        stream: stream.clone(),
        confirmed_position,
        updated_at,
    })
}

#[async_trait]
impl OffsetStore for PostgresStore {
    async fn load(&self, stream: &StreamIdentity) -> Result<Option<OffsetRecord>> {
        let query = format!(
            "SELECT confirmed_lsn::text, updated_at FROM {} WHERE stream_id = $1",
            self.table
        );
        let row = self.client.query_opt(&query, &[&stream.as_str()]).await?;
        row.map(|row| record_from_row(stream, &row)).transpose()
    }

    async fn save(&self, stream: &StreamIdentity, position: StreamPosition) -> Result<OffsetRecord> {
        let upsert = format!(
            "INSERT INTO {table} (stream_id, confirmed_lsn, updated_at)
             VALUES ($1, $2::text::pg_lsn, now())
             ON CONFLICT (stream_id) DO UPDATE
                SET confirmed_lsn = EXCLUDED.confirmed_lsn, updated_at = EXCLUDED.updated_at
                WHERE {table}.confirmed_lsn < EXCLUDED.confirmed_lsn
             RETURNING confirmed_lsn::text, updated_at",
            table = self.table
        );
        let position_text = position.to_string();
        let row = self
            .client
            .query_opt(&upsert, &[&stream.as_str(), &position_text])
            .await?;
        if let Some(row) = row {
            let record = record_from_row(stream, &row)?;
            tracing::debug!(stream = %stream, position = %position, "stored offset");
            return Ok(record);
        }

        // The guard rejected the update: either the same position or a regression.
        let current = self.load(stream).await?.ok_or_else(|| {
            OffsetError::Unavailable(format!("offset row for '{stream}' vanished during save"))
        })?;
        if current.confirmed_position == position {
            return Ok(current);
        }
        Err(OffsetError::Regression {
            stream: stream.to_string(),
            stored: current.confirmed_position,
            attempted: position,
        })
    }
}
