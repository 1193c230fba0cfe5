//! Groups decoded WAL records into transactions.

use crate::error::{PipelineError, Result};
use crate::filter::RelationFilter;
use crate::metrics::PipelineMetrics;
use crate::registry::{map_tuple, RelationDefinition, SchemaRegistry};
use chrono::{DateTime, Utc};
use pgoutput::{Begin, Commit, OldTuple, TupleData, WalRecord};
use std::sync::Arc;
use stream_types::{
    ChangeRecord, RecordMeta, RelationId, RelationSchema, StreamPosition, Transaction,
};
use tracing::{debug, warn};

/// Work handed from the assembler to the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchUnit {
    /// A committed transaction with at least one record.
    Transaction(Transaction),
    /// TRUNCATE records, delivered as soon as they are seen. They do not
    /// move the offset; the enclosing transaction's commit does.
    Truncate(Transaction),
    /// A commit without deliverable records. Only advances the offset.
    Empty {
        xid: u32,
        commit_position: StreamPosition,
    },
    /// The commit of a transaction whose records all went out early as
    /// [`DispatchUnit::Truncate`] units. Only advances the offset.
    Commit {
        xid: u32,
        commit_position: StreamPosition,
    },
}

impl DispatchUnit {
    pub fn commit_position(&self) -> StreamPosition {
        match self {
            DispatchUnit::Transaction(t) | DispatchUnit::Truncate(t) => t.commit_position,
            DispatchUnit::Empty {
                commit_position, ..
            }
            | DispatchUnit::Commit {
                commit_position, ..
            } => *commit_position,
        }
    }
}

struct Buffer {
    xid: u32,
    begin_position: StreamPosition,
    final_lsn: StreamPosition,
    commit_timestamp: DateTime<Utc>,
    last_position: StreamPosition,
    next_sequence: u64,
    records: Vec<ChangeRecord>,
    /// Records already handed out in truncate units.
    forwarded: usize,
}

impl Buffer {
    fn meta(&mut self, position: StreamPosition) -> RecordMeta {
        let meta = RecordMeta {
            position,
            sequence: self.next_sequence,
            xid: self.xid,
            commit_timestamp: self.commit_timestamp,
        };
        self.next_sequence += 1;
        meta
    }
}

enum State {
    Idle,
    InTransaction(Box<Buffer>),
    /// Replay of a transaction that was already confirmed.
    Skipping {
        xid: u32,
    },
}

enum RowChange {
    Insert(TupleData),
    Update(Option<OldTuple>, TupleData),
    Delete(OldTuple),
}

impl RowChange {
    fn kind(&self) -> &'static str {
        match self {
            RowChange::Insert(_) => "INSERT",
            RowChange::Update(..) => "UPDATE",
            RowChange::Delete(_) => "DELETE",
        }
    }
}

/// State machine turning the decoded record stream into [`DispatchUnit`]s.
///
/// `Idle -> InTransaction -> Idle`, with `Skipping` standing in for
/// `InTransaction` while a replayed transaction is read past.
pub struct TransactionAssembler {
    registry: Arc<SchemaRegistry>,
    filter: RelationFilter,
    metrics: Arc<PipelineMetrics>,
    state: State,
    /// Transactions committing below this position were already delivered.
    watermark: Option<StreamPosition>,
}

impl TransactionAssembler {
    pub fn new(
        registry: Arc<SchemaRegistry>,
        filter: RelationFilter,
        resume: Option<StreamPosition>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            registry,
            filter,
            metrics,
            state: State::Idle,
            watermark: resume,
        }
    }

    /// True between transactions; the only point where stopping is allowed.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, State::Idle)
    }

    pub fn apply(
        &mut self,
        record: WalRecord,
        position: StreamPosition,
    ) -> Result<Option<DispatchUnit>> {
        if let State::InTransaction(buffer) = &mut self.state {
            if position < buffer.last_position {
                return Err(PipelineError::protocol(
                    position,
                    format!(
                        "{} position went backwards from {} inside transaction {}",
                        record.kind(),
                        buffer.last_position,
                        buffer.xid
                    ),
                ));
            }
            buffer.last_position = position;
        }

        match record {
            WalRecord::Begin(begin) => self.begin(begin, position),
            WalRecord::Commit(commit) => self.commit(commit, position),
            WalRecord::Relation(relation) => {
                self.registry.register(RelationDefinition::from(&relation));
                Ok(None)
            }
            WalRecord::Insert(insert) => {
                self.row_change(position, insert.relation_id, RowChange::Insert(insert.new))
            }
            WalRecord::Update(update) => self.row_change(
                position,
                update.relation_id,
                RowChange::Update(update.old, update.new),
            ),
            WalRecord::Delete(delete) => {
                self.row_change(position, delete.relation_id, RowChange::Delete(delete.old))
            }
            WalRecord::Truncate(truncate) => self.truncate(&truncate.relation_ids, position),
            other => {
                debug!(kind = other.kind(), %position, "ignoring message");
                Ok(None)
            }
        }
    }

    fn begin(&mut self, begin: Begin, position: StreamPosition) -> Result<Option<DispatchUnit>> {
        match &self.state {
            State::Idle => {}
            State::InTransaction(buffer) => {
                return Err(PipelineError::protocol(
                    position,
                    format!(
                        "BEGIN of transaction {} while transaction {} is open",
                        begin.xid, buffer.xid
                    ),
                ))
            }
            State::Skipping { xid } => {
                return Err(PipelineError::protocol(
                    position,
                    format!(
                        "BEGIN of transaction {} while transaction {xid} is open",
                        begin.xid
                    ),
                ))
            }
        }

        if let Some(watermark) = self.watermark {
            if begin.final_lsn < watermark {
                debug!(
                    xid = begin.xid,
                    final_lsn = %begin.final_lsn,
                    %watermark,
                    "skipping already confirmed transaction"
                );
                self.metrics.record_replayed_transaction();
                self.state = State::Skipping { xid: begin.xid };
                return Ok(None);
            }
        }

        self.state = State::InTransaction(Box::new(Buffer {
            xid: begin.xid,
            begin_position: position,
            final_lsn: begin.final_lsn,
            commit_timestamp: begin.commit_timestamp,
            last_position: position,
            next_sequence: 0,
            records: Vec::new(),
            forwarded: 0,
        }));
        Ok(None)
    }

    fn commit(&mut self, commit: Commit, position: StreamPosition) -> Result<Option<DispatchUnit>> {
        let buffer = match std::mem::replace(&mut self.state, State::Idle) {
            State::Idle => {
                return Err(PipelineError::protocol(position, "COMMIT without BEGIN"));
            }
            State::Skipping { .. } => return Ok(None),
            State::InTransaction(buffer) => buffer,
        };

        if commit.commit_lsn != buffer.final_lsn {
            return Err(PipelineError::protocol(
                position,
                format!(
                    "COMMIT at {} does not match BEGIN final LSN {} of transaction {}",
                    commit.commit_lsn, buffer.final_lsn, buffer.xid
                ),
            ));
        }
        if let Some(watermark) = self.watermark {
            if commit.end_lsn <= watermark {
                return Err(PipelineError::protocol(
                    position,
                    format!(
                        "commit position {} of transaction {} is not after {watermark}",
                        commit.end_lsn, buffer.xid
                    ),
                ));
            }
        }
        self.watermark = Some(commit.end_lsn);

        let Buffer {
            xid,
            begin_position,
            records,
            forwarded,
            ..
        } = *buffer;
        if records.is_empty() && forwarded > 0 {
            debug!(xid, forwarded, commit_position = %commit.end_lsn, "truncate-only transaction committed");
            return Ok(Some(DispatchUnit::Commit {
                xid,
                commit_position: commit.end_lsn,
            }));
        }
        if records.is_empty() {
            debug!(xid, commit_position = %commit.end_lsn, "empty transaction");
            return Ok(Some(DispatchUnit::Empty {
                xid,
                commit_position: commit.end_lsn,
            }));
        }

        debug!(xid, records = records.len(), commit_position = %commit.end_lsn, "transaction assembled");
        Ok(Some(DispatchUnit::Transaction(Transaction {
            xid,
            begin_position,
            commit_position: commit.end_lsn,
            commit_timestamp: commit.commit_timestamp,
            records,
        })))
    }

    fn row_change(
        &mut self,
        position: StreamPosition,
        relation_id: RelationId,
        change: RowChange,
    ) -> Result<Option<DispatchUnit>> {
        let buffer = match &mut self.state {
            State::InTransaction(buffer) => buffer,
            State::Skipping { .. } => return Ok(None),
            State::Idle => {
                return Err(PipelineError::protocol(
                    position,
                    format!("{} outside of a transaction", change.kind()),
                ))
            }
        };

        let schema = self.registry.resolve(relation_id)?;
        if !self.filter.accepts(&schema.name) {
            self.metrics.record_filtered();
            return Ok(None);
        }

        let meta = buffer.meta(position);
        let record = build_record(&self.registry, schema, &change, meta)?;
        buffer.records.push(record);
        Ok(None)
    }

    fn truncate(
        &mut self,
        relation_ids: &[RelationId],
        position: StreamPosition,
    ) -> Result<Option<DispatchUnit>> {
        let buffer = match &mut self.state {
            State::InTransaction(buffer) => buffer,
            State::Skipping { .. } => return Ok(None),
            State::Idle => {
                return Err(PipelineError::protocol(
                    position,
                    "TRUNCATE outside of a transaction",
                ))
            }
        };

        let mut records = Vec::with_capacity(relation_ids.len());
        for id in relation_ids {
            let schema = self.registry.resolve(*id)?;
            if !self.filter.accepts(&schema.name) {
                self.metrics.record_filtered();
                continue;
            }
            let meta = buffer.meta(position);
            records.push(ChangeRecord::truncate(schema, meta));
        }
        if records.is_empty() {
            return Ok(None);
        }

        // Earlier rows of this transaction are still buffered; emitting the
        // truncate now would reorder it before them.
        if !buffer.records.is_empty() {
            buffer.records.extend(records);
            return Ok(None);
        }

        buffer.forwarded += records.len();
        Ok(Some(DispatchUnit::Truncate(Transaction {
            xid: buffer.xid,
            begin_position: buffer.begin_position,
            commit_position: position,
            commit_timestamp: buffer.commit_timestamp,
            records,
        })))
    }
}

fn map_change(
    schema: &Arc<RelationSchema>,
    change: &RowChange,
    meta: RecordMeta,
) -> Result<ChangeRecord> {
    Ok(match change {
        RowChange::Insert(new) => ChangeRecord::insert(Arc::clone(schema), map_tuple(schema, new)?, meta),
        RowChange::Update(old, new) => {
            let before = old
                .as_ref()
                .map(|old| map_tuple(schema, old.tuple()))
                .transpose()?;
            ChangeRecord::update(Arc::clone(schema), before, map_tuple(schema, new)?, meta)
        }
        RowChange::Delete(old) => {
            ChangeRecord::delete(Arc::clone(schema), map_tuple(schema, old.tuple())?, meta)
        }
    })
}

/// Maps a change against `schema`; on a column-count mismatch re-resolves
/// the relation once and retries with a newer version if there is one.
fn build_record(
    registry: &SchemaRegistry,
    schema: Arc<RelationSchema>,
    change: &RowChange,
    meta: RecordMeta,
) -> Result<ChangeRecord> {
    match map_change(&schema, change, meta) {
        Err(err @ PipelineError::SchemaMismatch { .. }) => {
            let reloaded = registry.resolve(schema.id)?;
            if reloaded.version == schema.version {
                return Err(err);
            }
            warn!(
                relation = %schema.name,
                from = schema.version,
                to = reloaded.version,
                "retrying tuple with newer schema version"
            );
            map_change(&reloaded, change, meta)
        }
        other => other,
    }
}
