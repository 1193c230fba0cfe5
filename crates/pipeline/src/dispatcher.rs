//! Delivers assembled transactions to the sink and records the offset.

use crate::assembler::DispatchUnit;
use crate::envelope::EnvelopeBuilder;
use crate::error::{PipelineError, Result};
use crate::metrics::PipelineMetrics;
use crate::retry::RetryPolicy;
use chrono::{DateTime, Utc};
use event_sink::Sink;
use futures::{stream, StreamExt, TryStreamExt};
use offset_store::{OffsetStore, StreamIdentity};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use stream_types::{Envelope, StreamPosition, Transaction};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DispatcherConfig {
    pub retry: RetryPolicy,
    /// Lanes emitted concurrently within one transaction. 1 keeps emission
    /// fully sequential in WAL order.
    pub max_parallel_lanes: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            max_parallel_lanes: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchResult {
    pub envelopes: usize,
    pub confirmed: StreamPosition,
}

/// Sole writer of the stream offset.
///
/// A transaction's commit position is saved only after every one of its
/// envelopes was accepted by the sink, and published to subscribers only
/// after the save returned.
pub struct Dispatcher {
    sink: Arc<dyn Sink>,
    offsets: Arc<dyn OffsetStore>,
    stream: StreamIdentity,
    builder: EnvelopeBuilder,
    config: DispatcherConfig,
    metrics: Arc<PipelineMetrics>,
    confirmed: watch::Sender<Option<StreamPosition>>,
}

impl Dispatcher {
    pub fn new(
        sink: Arc<dyn Sink>,
        offsets: Arc<dyn OffsetStore>,
        stream: StreamIdentity,
        builder: EnvelopeBuilder,
        config: DispatcherConfig,
        metrics: Arc<PipelineMetrics>,
        confirmed: Option<StreamPosition>,
    ) -> Self {
        if let Some(position) = confirmed {
            metrics.set_confirmed(position);
        }
        let (confirmed, _) = watch::channel(confirmed);
        Self {
            sink,
            offsets,
            stream,
            builder,
            config,
            metrics,
            confirmed,
        }
    }

    /// Receives every newly confirmed position.
    pub fn subscribe(&self) -> watch::Receiver<Option<StreamPosition>> {
        self.confirmed.subscribe()
    }

    pub fn confirmed(&self) -> Option<StreamPosition> {
        *self.confirmed.borrow()
    }

    pub async fn handle(&self, unit: DispatchUnit) -> Result<()> {
        match unit {
            DispatchUnit::Transaction(transaction) => {
                self.dispatch(&transaction).await?;
            }
            DispatchUnit::Truncate(truncate) => {
                let envelopes = self.envelopes(&truncate);
                self.emit_all(truncate.commit_timestamp, envelopes).await?;
            }
            DispatchUnit::Empty {
                commit_position, ..
            } => self.confirm_empty(commit_position).await?,
            DispatchUnit::Commit {
                xid,
                commit_position,
            } => {
                let confirmed = self.confirm(commit_position).await?;
                debug!(xid, %confirmed, "truncate-only transaction confirmed");
            }
        }
        Ok(())
    }

    pub async fn dispatch(&self, transaction: &Transaction) -> Result<DispatchResult> {
        let position = transaction.commit_position;
        if let Some(confirmed) = self.confirmed() {
            if position < confirmed {
                return Err(self.regression(confirmed, position));
            }
            if position == confirmed {
                debug!(xid = transaction.xid, %position, "transaction already confirmed");
                return Ok(DispatchResult {
                    envelopes: 0,
                    confirmed,
                });
            }
        }

        let started = Instant::now();
        let envelopes = self.envelopes(transaction);
        let count = self
            .emit_all(transaction.commit_timestamp, envelopes)
            .await?;
        let confirmed = self.confirm(position).await?;
        self.metrics
            .record_transaction(started.elapsed(), transaction.commit_timestamp);

        debug!(
            xid = transaction.xid,
            envelopes = count,
            %confirmed,
            "transaction dispatched"
        );
        Ok(DispatchResult {
            envelopes: count,
            confirmed,
        })
    }

    /// Advances the offset for a commit that produced no envelopes.
    pub async fn confirm_empty(&self, position: StreamPosition) -> Result<()> {
        self.metrics.record_empty_transaction();
        self.confirm(position).await?;
        Ok(())
    }

    /// Handles units until the sender side closes. Returns the last
    /// confirmed position.
    pub async fn run(self, mut units: mpsc::Receiver<DispatchUnit>) -> Result<Option<StreamPosition>> {
        info!(sink = self.sink.name(), stream = %self.stream, "dispatcher started");
        while let Some(unit) = units.recv().await {
            if let Err(e) = self.handle(unit).await {
                error!(error = %e, kind = %e.kind(), "dispatch failed");
                return Err(e);
            }
        }
        info!(confirmed = ?self.confirmed(), "dispatcher drained");
        Ok(self.confirmed())
    }

    fn envelopes(&self, transaction: &Transaction) -> Vec<Envelope> {
        transaction
            .records
            .iter()
            .map(|record| self.builder.build(record))
            .collect()
    }

    async fn confirm(&self, position: StreamPosition) -> Result<StreamPosition> {
        if let Some(confirmed) = self.confirmed() {
            if position < confirmed {
                return Err(self.regression(confirmed, position));
            }
            if position == confirmed {
                return Ok(confirmed);
            }
        }

        self.offsets.save(&self.stream, position).await?;
        self.confirmed.send_replace(Some(position));
        self.metrics.set_confirmed(position);
        Ok(position)
    }

    fn regression(&self, confirmed: StreamPosition, attempted: StreamPosition) -> PipelineError {
        PipelineError::OffsetRegression {
            stream: self.stream.to_string(),
            confirmed,
            attempted,
        }
    }

    async fn emit_all(&self, timestamp: DateTime<Utc>, envelopes: Vec<Envelope>) -> Result<usize> {
        let total = envelopes.len();
        if self.config.max_parallel_lanes <= 1 {
            for envelope in &envelopes {
                self.emit_with_retry(timestamp, envelope).await?;
            }
            return Ok(total);
        }

        stream::iter(lanes(envelopes))
            .map(|lane| async move {
                for envelope in &lane {
                    self.emit_with_retry(timestamp, envelope).await?;
                }
                Ok::<_, PipelineError>(())
            })
            .buffer_unordered(self.config.max_parallel_lanes)
            .try_collect::<Vec<()>>()
            .await?;
        Ok(total)
    }

    async fn emit_with_retry(&self, timestamp: DateTime<Utc>, envelope: &Envelope) -> Result<()> {
        let max_attempts = self.config.retry.max_attempts.max(1);
        let mut backoff = self.config.retry.backoff();
        let mut attempt = 1;

        loop {
            match self
                .sink
                .emit(timestamp, &envelope.topic, &envelope.key, envelope)
                .await
            {
                Ok(()) => {
                    self.metrics.record_envelope();
                    return Ok(());
                }
                Err(e) if attempt < max_attempts => {
                    let delay = backoff.next_delay();
                    warn!(
                        topic = %envelope.topic,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "emission failed, retrying"
                    );
                    self.metrics.record_retry();
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    self.metrics.record_delivery_failure();
                    return Err(PipelineError::Delivery {
                        topic: envelope.topic.clone(),
                        attempts: attempt,
                        source: e.into(),
                    });
                }
            }
        }
    }
}

/// Splits envelopes by `(topic, partition key)`, keeping WAL order inside
/// each lane and ordering lanes by first appearance.
fn lanes(envelopes: Vec<Envelope>) -> Vec<Vec<Envelope>> {
    let mut index: HashMap<(String, String), usize> = HashMap::new();
    let mut lanes: Vec<Vec<Envelope>> = Vec::new();
    for envelope in envelopes {
        let key = (envelope.topic.clone(), envelope.key.partition_key());
        let slot = *index.entry(key).or_insert_with(|| {
            lanes.push(Vec::new());
            lanes.len() - 1
        });
        lanes[slot].push(envelope);
    }
    lanes
}
