//! The sink-facing representation of a change.
//!
//! An envelope serializes as `{"schema": ..., "payload": ...}`. Topic and key
//! travel next to the body, so sinks can route without parsing it.

use crate::change::{FieldMap, Operation};
use serde::{Serialize, Serializer};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    #[serde(skip)]
    pub topic: String,
    #[serde(skip)]
    pub key: EnvelopeKey,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<SchemaDescriptor>,
    pub payload: Payload,
}

/// Key-column values of the changed row, in schema order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnvelopeKey(FieldMap);

impl EnvelopeKey {
    pub fn new(fields: FieldMap) -> Self {
        Self(fields)
    }

    pub fn fields(&self) -> &FieldMap {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Key values joined with `:`; empty for keyless relations.
    pub fn partition_key(&self) -> String {
        self.0
            .iter()
            .map(|(_, value)| value.to_key_string())
            .collect::<Vec<_>>()
            .join(":")
    }
}

impl Serialize for EnvelopeKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Payload {
    pub before: Option<FieldMap>,
    pub after: Option<FieldMap>,
    pub op: Operation,
    /// Commit timestamp of the source transaction, in milliseconds.
    pub ts_ms: i64,
    pub source: SourceInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceInfo {
    pub connector: String,
    pub name: String,
    pub db: String,
    pub schema: String,
    pub table: String,
    pub lsn: String,
    #[serde(rename = "txId")]
    pub tx_id: u32,
    pub sequence: u64,
    pub ts_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchemaDescriptor {
    pub name: String,
    pub version: u32,
    pub fields: Vec<FieldDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldDescriptor {
    pub field: String,
    #[serde(rename = "type")]
    pub type_name: String,
    pub optional: bool,
    pub key: bool,
}
