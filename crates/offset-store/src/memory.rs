//! In-process offset storage.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use stream_types::StreamPosition;

use crate::error::{OffsetError, Result};
use crate::store::{check_advance, OffsetRecord, OffsetStore, StreamIdentity};

#[derive(Default)]
struct State {
    records: HashMap<StreamIdentity, OffsetRecord>,
    history: Vec<(StreamIdentity, StreamPosition)>,
    failing_saves: usize,
}

/// Keeps offsets in memory and remembers every position actually written.
///
/// Offsets survive as long as the store does, so sharing one store between
/// pipeline runs simulates a restart.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Positions written for `stream`, oldest first. No-op saves are not recorded.
    pub fn history(&self, stream: &StreamIdentity) -> Vec<StreamPosition> {
        self.state()
            .history
            .iter()
            .filter(|(s, _)| s == stream)
            .map(|(_, p)| *p)
            .collect()
    }

    /// Makes the next `count` saves fail as if the backend were unreachable.
    pub fn fail_next_saves(&self, count: usize) {
        self.state().failing_saves = count;
    }
}

#[async_trait]
impl OffsetStore for MemoryStore {
    async fn load(&self, stream: &StreamIdentity) -> Result<Option<OffsetRecord>> {
        Ok(self.state().records.get(stream).cloned())
    }

    async fn save(&self, stream: &StreamIdentity, position: StreamPosition) -> Result<OffsetRecord> {
        let mut state = self.state();
        if state.failing_saves > 0 {
            state.failing_saves -= 1;
            return Err(OffsetError::Unavailable(format!(
                "injected failure saving {position} for '{stream}'"
            )));
        }
        if check_advance(stream, state.records.get(stream), position)? {
            if let Some(record) = state.records.get(stream) {
                return Ok(record.clone());
            }
        }
        let record = OffsetRecord {
            stream: stream.clone(),
            confirmed_position: position,
            updated_at: Utc::now(),
        };
        state.records.insert(stream.clone(), record.clone());
        state.history.push((stream.clone(), position));
        Ok(record)
    }
}
