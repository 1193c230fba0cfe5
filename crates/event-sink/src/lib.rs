//! Sink contract for delivering change envelopes.
//!
//! A sink receives one envelope at a time together with its topic and key.
//! Delivery is at-least-once: after a crash the pipeline may hand the same
//! envelope to a sink again, so implementations must tolerate duplicates.

mod config;
mod memory;
mod registry;
mod stdout;

pub use config::SinkConfig;
pub use memory::{EmittedEvent, RecordingSink};
pub use registry::{SinkFactory, SinkRegistry};
pub use stdout::StdoutSink;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use stream_types::{Envelope, EnvelopeKey};

#[async_trait]
pub trait Sink: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Delivers one envelope. `timestamp` is the source commit time.
    ///
    /// Returning an error makes the dispatcher retry the same envelope.
    async fn emit(
        &self,
        timestamp: DateTime<Utc>,
        topic: &str,
        key: &EnvelopeKey,
        envelope: &Envelope,
    ) -> anyhow::Result<()>;
}
