//! Relation schemas as announced by RELATION messages.

use crate::value::DataType;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Source-assigned relation identifier (the table OID).
pub type RelationId = u32;

/// Schema-qualified relation name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RelationName {
    pub schema: String,
    pub table: String,
}

impl RelationName {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for RelationName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

/// Which columns the source includes in the old-row image of updates and deletes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaIdentity {
    /// Primary key columns.
    Default,
    Nothing,
    /// All columns.
    Full,
    /// Columns of a chosen unique index.
    Index,
}

impl ReplicaIdentity {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            b'd' => Some(ReplicaIdentity::Default),
            b'n' => Some(ReplicaIdentity::Nothing),
            b'f' => Some(ReplicaIdentity::Full),
            b'i' => Some(ReplicaIdentity::Index),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub data_type: DataType,
    pub type_oid: u32,
    pub type_modifier: i32,
    /// The replication protocol carries no NOT NULL information; key columns
    /// are reported as non-nullable and everything else as nullable.
    pub nullable: bool,
    pub is_key: bool,
}

impl Column {
    pub fn new(name: impl Into<String>, type_oid: u32, type_modifier: i32, is_key: bool) -> Self {
        Self {
            name: name.into(),
            data_type: DataType::from_oid(type_oid),
            type_oid,
            type_modifier,
            nullable: !is_key,
            is_key,
        }
    }
}

/// One immutable version of a relation's layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationSchema {
    pub id: RelationId,
    pub name: RelationName,
    /// Starts at 1 and increases by one for every structural change.
    pub version: u32,
    pub replica_identity: ReplicaIdentity,
    pub columns: Vec<Column>,
}

impl RelationSchema {
    pub fn key_columns(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter().filter(|c| c.is_key)
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// True when `name` and `columns` describe exactly this version's layout.
    pub fn has_layout(&self, name: &RelationName, columns: &[Column]) -> bool {
        self.name == *name && self.columns == columns
    }
}
