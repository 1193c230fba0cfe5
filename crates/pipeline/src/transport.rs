//! Source of raw replication messages.

mod postgres;

pub use postgres::{PgSlotConfig, PgSlotTransport};

use anyhow::Result;
use async_trait::async_trait;
use stream_types::StreamPosition;

/// One undecoded `pgoutput` message and the WAL position it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub position: StreamPosition,
    pub data: Vec<u8>,
}

impl RawMessage {
    pub fn new(position: impl Into<StreamPosition>, data: Vec<u8>) -> Self {
        Self {
            position: position.into(),
            data,
        }
    }
}

/// A connection to a logical replication slot.
///
/// Messages may be delivered again until they are acknowledged; the
/// pipeline suppresses replays itself.
#[async_trait]
pub trait ReplicationTransport: Send {
    /// Connects and positions the stream at `resume` (or wherever the slot
    /// stands when `None`).
    async fn open(&mut self, resume: Option<StreamPosition>) -> Result<()>;

    /// Next batch in WAL order. An empty batch means nothing is pending.
    async fn next_batch(&mut self) -> Result<Vec<RawMessage>>;

    /// Lets the source discard WAL up to `position`.
    async fn acknowledge(&mut self, position: StreamPosition) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}
