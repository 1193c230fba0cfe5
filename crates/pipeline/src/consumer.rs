//! Reads the replication stream and feeds the dispatcher.

use crate::assembler::{DispatchUnit, TransactionAssembler};
use crate::dispatcher::Dispatcher;
use crate::error::{PipelineError, Result};
use crate::filter::RelationFilter;
use crate::metrics::PipelineMetrics;
use crate::registry::SchemaRegistry;
use crate::transport::{RawMessage, ReplicationTransport};
use pgoutput::Decoder;
use std::sync::Arc;
use std::time::Duration;
use stream_types::StreamPosition;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerConfig {
    /// Wait between polls when the source has nothing new.
    pub poll_interval: Duration,
    /// How often the confirmed position is acknowledged to the source.
    pub ack_interval: Duration,
    /// Dispatch units buffered between the consumer and the dispatcher.
    pub channel_capacity: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            ack_interval: Duration::from_secs(1),
            channel_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSummary {
    pub confirmed: Option<StreamPosition>,
    pub records_decoded: u64,
}

/// Drives one replication session: transport → decoder → assembler → dispatcher.
pub struct ReplicationConsumer {
    registry: Arc<SchemaRegistry>,
    filter: RelationFilter,
    config: ConsumerConfig,
    metrics: Arc<PipelineMetrics>,
}

struct Session<'a, T> {
    transport: &'a mut T,
    assembler: TransactionAssembler,
    units: mpsc::Sender<DispatchUnit>,
    confirmed: watch::Receiver<Option<StreamPosition>>,
    acknowledged: Option<StreamPosition>,
    last_ack: Instant,
}

impl ReplicationConsumer {
    pub fn new(
        registry: Arc<SchemaRegistry>,
        filter: RelationFilter,
        config: ConsumerConfig,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            registry,
            filter,
            config,
            metrics,
        }
    }

    /// Runs a session until `shutdown` fires at a transaction boundary or
    /// an error occurs.
    ///
    /// On the way out the dispatcher is drained, the last confirmed
    /// position is acknowledged and the transport is closed.
    pub async fn start<T: ReplicationTransport>(
        &self,
        mut transport: T,
        dispatcher: Dispatcher,
        resume: Option<StreamPosition>,
        shutdown: &CancellationToken,
    ) -> Result<SessionSummary> {
        let decoded_before = self.metrics.records_decoded();
        if let Err(e) = transport.open(resume).await {
            let _ = transport.close().await;
            return Err(PipelineError::transport(e));
        }
        info!(resume = ?resume, "replication session started");

        let (units, receiver) = mpsc::channel(self.config.channel_capacity.max(1));
        let confirmed = dispatcher.subscribe();
        let dispatcher_task = tokio::spawn(dispatcher.run(receiver));

        let (pumped, confirmed, acknowledged) = {
            let mut session = Session {
                transport: &mut transport,
                assembler: TransactionAssembler::new(
                    Arc::clone(&self.registry),
                    self.filter.clone(),
                    resume,
                    Arc::clone(&self.metrics),
                ),
                units,
                confirmed,
                acknowledged: resume,
                last_ack: Instant::now(),
            };
            let pumped = self.pump(&mut session, shutdown).await;
            // Closing the channel lets the dispatcher finish what it holds.
            let Session {
                units,
                confirmed,
                acknowledged,
                ..
            } = session;
            drop(units);
            (pumped, confirmed, acknowledged)
        };

        let drained = match dispatcher_task.await {
            Ok(result) => result,
            Err(e) => {
                warn!("Dispatcher task ended abnormally: {e}");
                Err(PipelineError::DispatcherStopped)
            }
        };

        let confirmed = *confirmed.borrow();
        if let Some(position) = confirmed {
            if !acknowledged.is_some_and(|acked| position <= acked) {
                if let Err(e) = transport.acknowledge(position).await {
                    warn!("Final acknowledgment of {position} failed: {e:#}");
                }
            }
        }
        if let Err(e) = transport.close().await {
            warn!("Failed to close transport: {e:#}");
        }

        match (pumped, drained) {
            (Err(PipelineError::DispatcherStopped), Err(e)) => return Err(e),
            (Err(e), _) | (Ok(()), Err(e)) => return Err(e),
            (Ok(()), Ok(_)) => {}
        }
        let summary = SessionSummary {
            confirmed,
            records_decoded: self.metrics.records_decoded() - decoded_before,
        };
        info!(
            confirmed = ?summary.confirmed,
            records = summary.records_decoded,
            "replication session stopped"
        );
        Ok(summary)
    }

    async fn pump<T: ReplicationTransport>(
        &self,
        session: &mut Session<'_, T>,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        loop {
            if shutdown.is_cancelled() && session.assembler.is_idle() {
                debug!("Shutdown requested at transaction boundary");
                return Ok(());
            }
            if session.last_ack.elapsed() >= self.config.ack_interval {
                session.acknowledge().await?;
            }

            let batch = session
                .transport
                .next_batch()
                .await
                .map_err(PipelineError::transport)?;
            let sent = self.process(session, batch, shutdown).await?;
            if sent > 0 {
                continue;
            }

            // Nothing new: let the source drop what was already delivered
            // before waiting, so replays do not pile up.
            session.acknowledge().await?;
            tokio::select! {
                _ = shutdown.cancelled(), if session.assembler.is_idle() => {}
                changed = session.confirmed.changed() => {
                    if changed.is_err() {
                        return Err(PipelineError::DispatcherStopped);
                    }
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    /// Decodes and assembles one batch. Returns the number of units handed
    /// to the dispatcher.
    async fn process<T: ReplicationTransport>(
        &self,
        session: &mut Session<'_, T>,
        batch: Vec<RawMessage>,
        shutdown: &CancellationToken,
    ) -> Result<usize> {
        let mut sent = 0;
        for message in batch {
            let record =
                Decoder::decode(&message.data).map_err(|source| PipelineError::Decode {
                    position: message.position,
                    source,
                })?;
            self.metrics.record_decoded();

            if let Some(unit) = session.assembler.apply(record, message.position)? {
                session
                    .units
                    .send(unit)
                    .await
                    .map_err(|_| PipelineError::DispatcherStopped)?;
                sent += 1;
            }
            // The rest of the batch is peeked again by the next session.
            if shutdown.is_cancelled() && session.assembler.is_idle() {
                break;
            }
        }
        Ok(sent)
    }
}

impl<T: ReplicationTransport> Session<'_, T> {
    /// Acknowledges the dispatcher's confirmed position, never anything
    /// beyond it.
    async fn acknowledge(&mut self) -> Result<()> {
        self.last_ack = Instant::now();
        let Some(position) = *self.confirmed.borrow_and_update() else {
            return Ok(());
        };
        if self.acknowledged.is_some_and(|acked| position <= acked) {
            return Ok(());
        }
        self.transport
            .acknowledge(position)
            .await
            .map_err(PipelineError::transport)?;
        debug!(%position, "acknowledged");
        self.acknowledged = Some(position);
        Ok(())
    }
}
