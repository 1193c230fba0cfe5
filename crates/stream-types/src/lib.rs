//! Change-event data model shared by the decoder, the pipeline, offset
//! stores and sinks.
//!
//! The types here are deliberately free of I/O: a [`ChangeRecord`] is built
//! by the transaction assembler from decoded WAL messages, grouped into a
//! [`Transaction`], and turned into an [`Envelope`] right before it is handed
//! to a sink.

pub mod change;
pub mod envelope;
pub mod position;
pub mod schema;
pub mod value;

pub use change::{ChangeRecord, FieldMap, Operation, RecordMeta, Transaction};
pub use envelope::{
    Envelope, EnvelopeKey, FieldDescriptor, Payload, SchemaDescriptor, SourceInfo,
};
pub use position::{PositionParseError, StreamPosition};
pub use schema::{Column, RelationId, RelationName, RelationSchema, ReplicaIdentity};
pub use value::{DataType, Value, ValueError};
