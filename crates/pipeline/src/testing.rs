//! Test doubles for driving the pipeline without a database.

use crate::transport::{RawMessage, ReplicationTransport};
use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use stream_types::StreamPosition;
use tokio_util::sync::CancellationToken;

/// What a [`ScriptedTransport`] was asked to do.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportLog {
    pub opens: Vec<Option<StreamPosition>>,
    pub acks: Vec<StreamPosition>,
    pub batches_served: usize,
    pub closed: usize,
}

/// A slot that keeps serving everything past the acknowledged position.
struct Slot {
    transactions: Vec<Vec<RawMessage>>,
    /// Transactions written to the source so far.
    visible: usize,
    acknowledged: Option<StreamPosition>,
}

impl Slot {
    fn advance(&mut self, position: StreamPosition) {
        if !self.acknowledged.is_some_and(|acked| acked >= position) {
            self.acknowledged = Some(position);
        }
    }

    fn peek(&mut self) -> Vec<RawMessage> {
        self.visible = (self.visible + 1).min(self.transactions.len());
        let acknowledged = self.acknowledged;
        self.transactions[..self.visible]
            .iter()
            .filter(|transaction| {
                transaction
                    .last()
                    .is_some_and(|end| !acknowledged.is_some_and(|acked| end.position <= acked))
            })
            .flatten()
            .cloned()
            .collect()
    }

    fn drained(&self) -> bool {
        self.visible == self.transactions.len()
    }
}

/// Serves pre-built batches, then empty ones.
///
/// By default batches are consumed when served. [`ScriptedTransport::replaying`]
/// behaves like a peeked slot instead.
pub struct ScriptedTransport {
    batches: VecDeque<Vec<RawMessage>>,
    slot: Option<Slot>,
    log: Arc<Mutex<TransportLog>>,
    cancel_when_drained: Option<CancellationToken>,
    fail_after: Option<usize>,
    fail_open: bool,
    served: usize,
}

impl ScriptedTransport {
    pub fn new(batches: impl IntoIterator<Item = Vec<RawMessage>>) -> Self {
        Self {
            batches: batches.into_iter().collect(),
            slot: None,
            log: Arc::default(),
            cancel_when_drained: None,
            fail_after: None,
            fail_open: false,
            served: 0,
        }
    }

    /// Serves like `pg_logical_slot_peek_binary_changes`: every poll returns
    /// all transactions whose last message lies past the acknowledged
    /// position, so unacknowledged changes (and their RELATION messages)
    /// come back until `acknowledge` moves past them. One more scripted
    /// transaction becomes visible per poll.
    pub fn replaying(transactions: impl IntoIterator<Item = Vec<RawMessage>>) -> Self {
        let mut transport = Self::empty();
        transport.slot = Some(Slot {
            transactions: transactions.into_iter().collect(),
            visible: 0,
            acknowledged: None,
        });
        transport
    }

    /// A transport with nothing to serve.
    pub fn empty() -> Self {
        Self::new(Vec::<Vec<RawMessage>>::new())
    }

    /// Cancels `token` once every scripted batch was served.
    pub fn cancel_when_drained(mut self, token: CancellationToken) -> Self {
        self.cancel_when_drained = Some(token);
        self
    }

    /// Fails like a dropped connection after serving `batches` batches.
    pub fn fail_after(mut self, batches: usize) -> Self {
        self.fail_after = Some(batches);
        self
    }

    pub fn fail_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    /// Shares the log with another transport, so a sequence of sessions
    /// can be inspected as a whole.
    pub fn with_log(mut self, log: Arc<Mutex<TransportLog>>) -> Self {
        self.log = log;
        self
    }

    pub fn log_handle(&self) -> Arc<Mutex<TransportLog>> {
        Arc::clone(&self.log)
    }

    pub fn log(&self) -> TransportLog {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, TransportLog> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ReplicationTransport for ScriptedTransport {
    async fn open(&mut self, resume: Option<StreamPosition>) -> Result<()> {
        self.lock().opens.push(resume);
        if self.fail_open {
            bail!("connection refused");
        }
        if let (Some(slot), Some(resume)) = (self.slot.as_mut(), resume) {
            slot.advance(resume);
        }
        Ok(())
    }

    async fn next_batch(&mut self) -> Result<Vec<RawMessage>> {
        if self.fail_after.is_some_and(|limit| self.served >= limit) {
            bail!("connection reset by peer");
        }
        if let Some(slot) = self.slot.as_mut() {
            let batch = slot.peek();
            if batch.is_empty() {
                if slot.drained() {
                    if let Some(token) = &self.cancel_when_drained {
                        token.cancel();
                    }
                }
                return Ok(batch);
            }
            self.served += 1;
            self.lock().batches_served += 1;
            return Ok(batch);
        }
        match self.batches.pop_front() {
            Some(batch) => {
                self.served += 1;
                self.lock().batches_served += 1;
                Ok(batch)
            }
            None => {
                if let Some(token) = &self.cancel_when_drained {
                    token.cancel();
                }
                Ok(Vec::new())
            }
        }
    }

    async fn acknowledge(&mut self, position: StreamPosition) -> Result<()> {
        self.lock().acks.push(position);
        if let Some(slot) = self.slot.as_mut() {
            slot.advance(position);
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.lock().closed += 1;
        Ok(())
    }
}
