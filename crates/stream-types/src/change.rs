//! Decoded row changes and the transactions that carry them.

use crate::position::StreamPosition;
use crate::schema::RelationSchema;
use crate::value::Value;
use chrono::{DateTime, Utc};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    #[serde(rename = "c")]
    Insert,
    #[serde(rename = "u")]
    Update,
    #[serde(rename = "d")]
    Delete,
    #[serde(rename = "t")]
    Truncate,
}

impl Operation {
    /// Single-letter code used in envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            Operation::Insert => "c",
            Operation::Update => "u",
            Operation::Delete => "d",
            Operation::Truncate => "t",
        }
    }
}

/// Column values in column order.
///
/// Serializes as a JSON object whose keys keep the column order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldMap(Vec<(String, Value)>);

impl FieldMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self(Vec::with_capacity(capacity))
    }

    pub fn push(&mut self, name: impl Into<String>, value: Value) {
        self.0.push((name.into(), value));
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(n, _)| n.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: Into<String>> FromIterator<(S, Value)> for FieldMap {
    fn from_iter<I: IntoIterator<Item = (S, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(n, v)| (n.into(), v)).collect())
    }
}

impl Serialize for FieldMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, value) in &self.0 {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// Transaction-level facts stamped onto every record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordMeta {
    pub position: StreamPosition,
    /// Zero-based index of the record within its transaction.
    pub sequence: u64,
    pub xid: u32,
    pub commit_timestamp: DateTime<Utc>,
}

/// A single decoded row-level change.
///
/// Carries the schema version it was decoded against, so later schema
/// changes never alter how an in-flight record is interpreted.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecord {
    pub operation: Operation,
    pub relation: Arc<RelationSchema>,
    pub before: Option<FieldMap>,
    pub after: Option<FieldMap>,
    pub position: StreamPosition,
    pub sequence: u64,
    pub xid: u32,
    pub commit_timestamp: DateTime<Utc>,
}

impl ChangeRecord {
    fn with_images(
        operation: Operation,
        relation: Arc<RelationSchema>,
        before: Option<FieldMap>,
        after: Option<FieldMap>,
        meta: RecordMeta,
    ) -> Self {
        Self {
            operation,
            relation,
            before,
            after,
            position: meta.position,
            sequence: meta.sequence,
            xid: meta.xid,
            commit_timestamp: meta.commit_timestamp,
        }
    }

    pub fn insert(relation: Arc<RelationSchema>, after: FieldMap, meta: RecordMeta) -> Self {
        Self::with_images(Operation::Insert, relation, None, Some(after), meta)
    }

    /// `before` is absent when the source sent no old-row image.
    pub fn update(
        relation: Arc<RelationSchema>,
        before: Option<FieldMap>,
        after: FieldMap,
        meta: RecordMeta,
    ) -> Self {
        Self::with_images(Operation::Update, relation, before, Some(after), meta)
    }

    pub fn delete(relation: Arc<RelationSchema>, before: FieldMap, meta: RecordMeta) -> Self {
        Self::with_images(Operation::Delete, relation, Some(before), None, meta)
    }

    pub fn truncate(relation: Arc<RelationSchema>, meta: RecordMeta) -> Self {
        Self::with_images(Operation::Truncate, relation, None, None, meta)
    }

    /// The row image that identifies the row: `after` when present, else `before`.
    pub fn identity_image(&self) -> Option<&FieldMap> {
        self.after.as_ref().or(self.before.as_ref())
    }
}

/// All records between one BEGIN and its COMMIT, in WAL order.
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub xid: u32,
    pub begin_position: StreamPosition,
    /// End position of the COMMIT; the resume point once delivered.
    pub commit_position: StreamPosition,
    pub commit_timestamp: DateTime<Utc>,
    pub records: Vec<ChangeRecord>,
}

impl Transaction {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
