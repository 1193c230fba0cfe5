//! Change-event pipeline for PostgreSQL/TimescaleDB logical replication.
//!
//! Raw `pgoutput` messages flow from a [`ReplicationTransport`] through the
//! decoder and the [`TransactionAssembler`] into the [`Dispatcher`], which
//! emits one envelope per row change to a sink and records the commit
//! position in an offset store once the whole transaction was delivered.
//!
//! Delivery is at-least-once. After a restart, transactions that committed
//! below the stored offset are skipped; anything after it may be emitted
//! again.

pub mod assembler;
pub mod consumer;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod filter;
pub mod metrics;
pub mod pipeline;
pub mod registry;
pub mod retry;
pub mod supervisor;
pub mod transport;

#[doc(hidden)]
pub mod testing;

pub use assembler::{DispatchUnit, TransactionAssembler};
pub use consumer::{ConsumerConfig, ReplicationConsumer, SessionSummary};
pub use dispatcher::{DispatchResult, Dispatcher, DispatcherConfig};
pub use envelope::{EnvelopeBuilder, EnvelopeConfig};
pub use error::{ErrorKind, PipelineError, Result};
pub use filter::{RelationFilter, DEFAULT_EXCLUDES};
pub use metrics::{MetricsSnapshot, PipelineMetrics};
pub use pipeline::{Pipeline, PipelineConfig};
pub use registry::{map_tuple, RelationDefinition, SchemaRegistry};
pub use retry::{Backoff, RetryPolicy};
pub use supervisor::{ReconnectPolicy, Supervisor};
pub use transport::{PgSlotConfig, PgSlotTransport, RawMessage, ReplicationTransport};
