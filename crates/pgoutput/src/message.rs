use bytes::Bytes;
use chrono::{DateTime, Utc};
use stream_types::{RelationId, StreamPosition};

/// One decoded `pgoutput` message.
#[derive(Debug, Clone, PartialEq)]
pub enum WalRecord {
    Begin(Begin),
    Commit(Commit),
    Relation(Relation),
    Insert(Insert),
    Update(Update),
    Delete(Delete),
    Truncate(Truncate),
    Origin(Origin),
    Type(TypeInfo),
    Message(LogicalMessage),
}

impl WalRecord {
    pub fn kind(&self) -> &'static str {
        match self {
            WalRecord::Begin(_) => "BEGIN",
            WalRecord::Commit(_) => "COMMIT",
            WalRecord::Relation(_) => "RELATION",
            WalRecord::Insert(_) => "INSERT",
            WalRecord::Update(_) => "UPDATE",
            WalRecord::Delete(_) => "DELETE",
            WalRecord::Truncate(_) => "TRUNCATE",
            WalRecord::Origin(_) => "ORIGIN",
            WalRecord::Type(_) => "TYPE",
            WalRecord::Message(_) => "MESSAGE",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Begin {
    /// LSN of the transaction's commit record.
    pub final_lsn: StreamPosition,
    pub commit_timestamp: DateTime<Utc>,
    pub xid: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Commit {
    pub flags: u8,
    pub commit_lsn: StreamPosition,
    /// LSN just past the commit record; where a consumer resumes.
    pub end_lsn: StreamPosition,
    pub commit_timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Relation {
    pub id: RelationId,
    pub namespace: String,
    pub name: String,
    pub replica_identity: u8,
    pub columns: Vec<RelationColumn>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelationColumn {
    pub flags: u8,
    pub name: String,
    pub type_oid: u32,
    pub type_modifier: i32,
}

impl RelationColumn {
    /// Flag bit 1 marks a column that is part of the replica identity key.
    pub fn is_key(&self) -> bool {
        self.flags & 1 == 1
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Insert {
    pub relation_id: RelationId,
    pub new: TupleData,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    pub relation_id: RelationId,
    pub old: Option<OldTuple>,
    pub new: TupleData,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Delete {
    pub relation_id: RelationId,
    pub old: OldTuple,
}

/// Old-row image of an UPDATE or DELETE.
#[derive(Debug, Clone, PartialEq)]
pub enum OldTuple {
    /// Replica identity columns only; other columns are null.
    Key(TupleData),
    /// The complete old row (`REPLICA IDENTITY FULL`).
    Full(TupleData),
}

impl OldTuple {
    pub fn tuple(&self) -> &TupleData {
        match self {
            OldTuple::Key(t) | OldTuple::Full(t) => t,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Truncate {
    pub options: u8,
    pub relation_ids: Vec<RelationId>,
}

impl Truncate {
    pub fn cascade(&self) -> bool {
        self.options & 1 != 0
    }

    pub fn restart_identity(&self) -> bool {
        self.options & 2 != 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Origin {
    pub commit_lsn: StreamPosition,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TypeInfo {
    pub id: u32,
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogicalMessage {
    pub transactional: bool,
    pub lsn: StreamPosition,
    pub prefix: String,
    pub content: Bytes,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TupleData(pub Vec<ColumnData>);

impl TupleData {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ColumnData> {
        self.0.iter()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ColumnData {
    Null,
    /// Unchanged TOASTed value; the actual value was not sent.
    Unchanged,
    Text(Bytes),
    Binary(Bytes),
}
