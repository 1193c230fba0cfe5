use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use stream_types::{Envelope, EnvelopeKey};

use crate::{Sink, SinkConfig};

/// One envelope as seen by a [`RecordingSink`].
#[derive(Debug, Clone, PartialEq)]
pub struct EmittedEvent {
    pub timestamp: DateTime<Utc>,
    pub topic: String,
    pub key: EnvelopeKey,
    pub envelope: Envelope,
}

#[derive(Default)]
struct State {
    events: Vec<EmittedEvent>,
    failures_remaining: usize,
    attempts: usize,
}

/// Keeps every emitted envelope in memory.
///
/// Registered as the `memory` sink kind for dry runs, and used by tests to
/// inspect delivery order and to inject emission failures.
#[derive(Default)]
pub struct RecordingSink {
    state: Mutex<State>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(_config: &SinkConfig) -> anyhow::Result<Arc<dyn Sink>> {
        Ok(Arc::new(Self::new()))
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes the next `count` emissions fail.
    pub fn fail_next(&self, count: usize) {
        self.state().failures_remaining = count;
    }

    pub fn events(&self) -> Vec<EmittedEvent> {
        self.state().events.clone()
    }

    /// Emission attempts, including failed ones.
    pub fn attempts(&self) -> usize {
        self.state().attempts
    }

    pub fn clear(&self) {
        self.state().events.clear();
    }
}

#[async_trait]
impl Sink for RecordingSink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn emit(
        &self,
        timestamp: DateTime<Utc>,
        topic: &str,
        key: &EnvelopeKey,
        envelope: &Envelope,
    ) -> anyhow::Result<()> {
        let mut state = self.state();
        state.attempts += 1;
        if state.failures_remaining > 0 {
            state.failures_remaining -= 1;
            anyhow::bail!("injected emission failure for topic {topic}");
        }
        state.events.push(EmittedEvent {
            timestamp,
            topic: topic.to_string(),
            key: key.clone(),
            envelope: envelope.clone(),
        });
        Ok(())
    }
}
