use crate::message::*;
use bytes::{Buf, Bytes};
use chrono::{DateTime, Utc};
use stream_types::StreamPosition;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("empty replication message")]
    Empty,

    #[error("unknown message tag {0:#04x}")]
    UnknownTag(u8),

    #[error("{message} message truncated while reading {field}: need {needed} bytes, {remaining} left")]
    Truncated {
        message: &'static str,
        field: &'static str,
        needed: usize,
        remaining: usize,
    },

    #[error("unexpected tuple marker {marker:#04x} in {message} message")]
    UnexpectedTupleMarker { message: &'static str, marker: u8 },

    #[error("unknown tuple column kind {0:#04x}")]
    UnknownColumnKind(u8),

    #[error("unterminated string while reading {field} of {message} message")]
    UnterminatedString {
        message: &'static str,
        field: &'static str,
    },

    #[error("invalid UTF-8 in {field} of {message} message: {source}")]
    Utf8 {
        message: &'static str,
        field: &'static str,
        #[source]
        source: std::str::Utf8Error,
    },

    #[error("timestamp {0} is out of range")]
    InvalidTimestamp(i64),

    #[error("{remaining} trailing bytes after {message} message")]
    TrailingBytes {
        message: &'static str,
        remaining: usize,
    },
}

pub type Result<T> = std::result::Result<T, DecodeError>;

/// Microseconds between the Unix epoch and PostgreSQL's epoch (2000-01-01).
const PG_EPOCH_OFFSET_MICROS: i64 = 946_684_800_000_000;

/// Converts a protocol timestamp (microseconds since 2000-01-01 UTC).
pub fn pg_timestamp(micros: i64) -> Result<DateTime<Utc>> {
    micros
        .checked_add(PG_EPOCH_OFFSET_MICROS)
        .and_then(DateTime::from_timestamp_micros)
        .ok_or(DecodeError::InvalidTimestamp(micros))
}

/// Stateless `pgoutput` decoder.
pub struct Decoder;

impl Decoder {
    pub fn decode(data: &[u8]) -> Result<WalRecord> {
        let (&tag, body) = data.split_first().ok_or(DecodeError::Empty)?;
        let message = match tag {
            b'B' => "BEGIN",
            b'C' => "COMMIT",
            b'R' => "RELATION",
            b'I' => "INSERT",
            b'U' => "UPDATE",
            b'D' => "DELETE",
            b'T' => "TRUNCATE",
            b'O' => "ORIGIN",
            b'Y' => "TYPE",
            b'M' => "MESSAGE",
            other => return Err(DecodeError::UnknownTag(other)),
        };
        let mut reader = Reader { buf: body, message };
        let record = match tag {
            b'B' => WalRecord::Begin(reader.begin()?),
            b'C' => WalRecord::Commit(reader.commit()?),
            b'R' => WalRecord::Relation(reader.relation()?),
            b'I' => WalRecord::Insert(reader.insert()?),
            b'U' => WalRecord::Update(reader.update()?),
            b'D' => WalRecord::Delete(reader.delete()?),
            b'T' => WalRecord::Truncate(reader.truncate()?),
            b'O' => WalRecord::Origin(reader.origin()?),
            b'Y' => WalRecord::Type(reader.type_info()?),
            _ => WalRecord::Message(reader.logical_message()?),
        };
        reader.finish()?;
        Ok(record)
    }
}

/// Bounds-checked cursor over one message body.
struct Reader<'a> {
    buf: &'a [u8],
    message: &'static str,
}

impl Reader<'_> {
    fn ensure(&self, field: &'static str, needed: usize) -> Result<()> {
        if self.buf.remaining() < needed {
            return Err(DecodeError::Truncated {
                message: self.message,
                field,
                needed,
                remaining: self.buf.remaining(),
            });
        }
        Ok(())
    }

    fn u8(&mut self, field: &'static str) -> Result<u8> {
        self.ensure(field, 1)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self, field: &'static str) -> Result<u16> {
        self.ensure(field, 2)?;
        Ok(self.buf.get_u16())
    }

    fn u32(&mut self, field: &'static str) -> Result<u32> {
        self.ensure(field, 4)?;
        Ok(self.buf.get_u32())
    }

    fn i32(&mut self, field: &'static str) -> Result<i32> {
        self.ensure(field, 4)?;
        Ok(self.buf.get_i32())
    }

    fn i64(&mut self, field: &'static str) -> Result<i64> {
        self.ensure(field, 8)?;
        Ok(self.buf.get_i64())
    }

    fn lsn(&mut self, field: &'static str) -> Result<StreamPosition> {
        self.ensure(field, 8)?;
        Ok(StreamPosition::new(self.buf.get_u64()))
    }

    fn timestamp(&mut self, field: &'static str) -> Result<DateTime<Utc>> {
        pg_timestamp(self.i64(field)?)
    }

    fn bytes(&mut self, field: &'static str, len: usize) -> Result<Bytes> {
        self.ensure(field, len)?;
        Ok(self.buf.copy_to_bytes(len))
    }

    /// Null-terminated UTF-8 string.
    fn string(&mut self, field: &'static str) -> Result<String> {
        let end = self
            .buf
            .iter()
            .position(|&b| b == 0)
            .ok_or(DecodeError::UnterminatedString {
                message: self.message,
                field,
            })?;
        let s = std::str::from_utf8(&self.buf[..end]).map_err(|source| DecodeError::Utf8 {
            message: self.message,
            field,
            source,
        })?;
        let s = s.to_string();
        self.buf.advance(end + 1);
        Ok(s)
    }

    fn finish(&self) -> Result<()> {
        if self.buf.has_remaining() {
            return Err(DecodeError::TrailingBytes {
                message: self.message,
                remaining: self.buf.remaining(),
            });
        }
        Ok(())
    }

    fn begin(&mut self) -> Result<Begin> {
        Ok(Begin {
            final_lsn: self.lsn("final_lsn")?,
            commit_timestamp: self.timestamp("commit_timestamp")?,
            xid: self.u32("xid")?,
        })
    }

    fn commit(&mut self) -> Result<Commit> {
        Ok(Commit {
            flags: self.u8("flags")?,
            commit_lsn: self.lsn("commit_lsn")?,
            end_lsn: self.lsn("end_lsn")?,
            commit_timestamp: self.timestamp("commit_timestamp")?,
        })
    }

    fn relation(&mut self) -> Result<Relation> {
        let id = self.u32("relation_id")?;
        let namespace = self.string("namespace")?;
        let name = self.string("relation_name")?;
        let replica_identity = self.u8("replica_identity")?;
        let count = self.u16("column_count")?;
        let mut columns = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            columns.push(RelationColumn {
                flags: self.u8("column_flags")?,
                name: self.string("column_name")?,
                type_oid: self.u32("column_type")?,
                type_modifier: self.i32("column_type_modifier")?,
            });
        }
        Ok(Relation {
            id,
            namespace,
            name,
            replica_identity,
            columns,
        })
    }

    fn insert(&mut self) -> Result<Insert> {
        let relation_id = self.u32("relation_id")?;
        self.expect_new_marker()?;
        Ok(Insert {
            relation_id,
            new: self.tuple()?,
        })
    }

    fn update(&mut self) -> Result<Update> {
        let relation_id = self.u32("relation_id")?;
        let old = match self.u8("tuple_marker")? {
            b'K' => Some(OldTuple::Key(self.tuple()?)),
            b'O' => Some(OldTuple::Full(self.tuple()?)),
            b'N' => None,
            marker => {
                return Err(DecodeError::UnexpectedTupleMarker {
                    message: self.message,
                    marker,
                })
            }
        };
        if old.is_some() {
            self.expect_new_marker()?;
        }
        Ok(Update {
            relation_id,
            old,
            new: self.tuple()?,
        })
    }

    fn delete(&mut self) -> Result<Delete> {
        let relation_id = self.u32("relation_id")?;
        let old = match self.u8("tuple_marker")? {
            b'K' => OldTuple::Key(self.tuple()?),
            b'O' => OldTuple::Full(self.tuple()?),
            marker => {
                return Err(DecodeError::UnexpectedTupleMarker {
                    message: self.message,
                    marker,
                })
            }
        };
        Ok(Delete { relation_id, old })
    }

    fn truncate(&mut self) -> Result<Truncate> {
        let count = self.u32("relation_count")?;
        let options = self.u8("options")?;
        // Each id takes four bytes; check before allocating.
        self.ensure("relation_ids", (count as usize).saturating_mul(4))?;
        let mut relation_ids = Vec::with_capacity(count as usize);
        for _ in 0..count {
            relation_ids.push(self.u32("relation_id")?);
        }
        Ok(Truncate {
            options,
            relation_ids,
        })
    }

    fn origin(&mut self) -> Result<Origin> {
        Ok(Origin {
            commit_lsn: self.lsn("commit_lsn")?,
            name: self.string("origin_name")?,
        })
    }

    fn type_info(&mut self) -> Result<TypeInfo> {
        Ok(TypeInfo {
            id: self.u32("type_id")?,
            namespace: self.string("namespace")?,
            name: self.string("type_name")?,
        })
    }

    fn logical_message(&mut self) -> Result<LogicalMessage> {
        let flags = self.u8("flags")?;
        let lsn = self.lsn("lsn")?;
        let prefix = self.string("prefix")?;
        let len = self.u32("content_length")? as usize;
        Ok(LogicalMessage {
            transactional: flags & 1 == 1,
            lsn,
            prefix,
            content: self.bytes("content", len)?,
        })
    }

    fn expect_new_marker(&mut self) -> Result<()> {
        match self.u8("tuple_marker")? {
            b'N' => Ok(()),
            marker => Err(DecodeError::UnexpectedTupleMarker {
                message: self.message,
                marker,
            }),
        }
    }

    fn tuple(&mut self) -> Result<TupleData> {
        let count = self.u16("tuple_column_count")?;
        let mut columns = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            let column = match self.u8("column_kind")? {
                b'n' => ColumnData::Null,
                b'u' => ColumnData::Unchanged,
                b't' => {
                    let len = self.u32("column_length")? as usize;
                    ColumnData::Text(self.bytes("column_value", len)?)
                }
                b'b' => {
                    let len = self.u32("column_length")? as usize;
                    ColumnData::Binary(self.bytes("column_value", len)?)
                }
                other => return Err(DecodeError::UnknownColumnKind(other)),
            };
            columns.push(column);
        }
        Ok(TupleData(columns))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, TupleValue};
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_begin_and_commit() {
        let begin = Decoder::decode(&testing::begin(0x10, ts(), 700)).unwrap();
        assert_eq!(
            begin,
            WalRecord::Begin(Begin {
                final_lsn: StreamPosition::new(0x10),
                commit_timestamp: ts(),
                xid: 700,
            })
        );

        let commit = Decoder::decode(&testing::commit(0x10, 0x18, ts())).unwrap();
        match commit {
            WalRecord::Commit(c) => {
                assert_eq!(c.commit_lsn, StreamPosition::new(0x10));
                assert_eq!(c.end_lsn, StreamPosition::new(0x18));
                assert_eq!(c.commit_timestamp, ts());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_pg_epoch_conversion() {
        assert_eq!(
            pg_timestamp(0).unwrap(),
            Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap()
        );
        assert!(pg_timestamp(i64::MAX).is_err());
    }

    #[test]
    fn test_relation() {
        let data = testing::relation(
            16384,
            "public",
            "readings",
            b'd',
            &[("id", 23, true), ("reading", 701, false)],
        );
        let WalRecord::Relation(relation) = Decoder::decode(&data).unwrap() else {
            panic!("expected relation");
        };
        assert_eq!(relation.id, 16384);
        assert_eq!(relation.namespace, "public");
        assert_eq!(relation.name, "readings");
        assert_eq!(relation.columns.len(), 2);
        assert!(relation.columns[0].is_key());
        assert!(!relation.columns[1].is_key());
        assert_eq!(relation.columns[1].type_oid, 701);
    }

    #[test]
    fn test_row_changes() {
        let insert = Decoder::decode(&testing::insert(
            1,
            &[TupleValue::text("1"), TupleValue::Null, TupleValue::Unchanged],
        ))
        .unwrap();
        let WalRecord::Insert(insert) = insert else {
            panic!("expected insert");
        };
        assert_eq!(
            insert.new.0,
            vec![
                ColumnData::Text(Bytes::from_static(b"1")),
                ColumnData::Null,
                ColumnData::Unchanged
            ]
        );

        let update = Decoder::decode(&testing::update(
            1,
            Some(testing::OldImage::Key(vec![TupleValue::text("1")])),
            &[TupleValue::text("2")],
        ))
        .unwrap();
        let WalRecord::Update(update) = update else {
            panic!("expected update");
        };
        assert!(matches!(update.old, Some(OldTuple::Key(_))));

        let update = Decoder::decode(&testing::update(1, None, &[TupleValue::text("2")])).unwrap();
        assert!(matches!(update, WalRecord::Update(Update { old: None, .. })));

        let delete = Decoder::decode(&testing::delete(
            1,
            testing::OldImage::Full(vec![TupleValue::text("2")]),
        ))
        .unwrap();
        assert!(matches!(
            delete,
            WalRecord::Delete(Delete {
                old: OldTuple::Full(_),
                ..
            })
        ));
    }

    #[test]
    fn test_truncate_and_ignored_messages() {
        let WalRecord::Truncate(truncate) =
            Decoder::decode(&testing::truncate(&[1, 2], 1)).unwrap()
        else {
            panic!("expected truncate");
        };
        assert_eq!(truncate.relation_ids, vec![1, 2]);
        assert!(truncate.cascade());
        assert!(!truncate.restart_identity());

        assert!(matches!(
            Decoder::decode(&testing::origin(5, "node_a")).unwrap(),
            WalRecord::Origin(_)
        ));
        assert!(matches!(
            Decoder::decode(&testing::type_message(9000, "public", "mood")).unwrap(),
            WalRecord::Type(_)
        ));
        let WalRecord::Message(message) =
            Decoder::decode(&testing::logical_message(true, 7, "audit", b"hello")).unwrap()
        else {
            panic!("expected logical message");
        };
        assert!(message.transactional);
        assert_eq!(message.content.as_ref(), b"hello");
    }

    #[test]
    fn test_unknown_tag() {
        assert!(matches!(
            Decoder::decode(b"Zabc"),
            Err(DecodeError::UnknownTag(b'Z'))
        ));
        assert!(matches!(Decoder::decode(b""), Err(DecodeError::Empty)));
    }

    #[test]
    fn test_truncated_messages_are_rejected() {
        let full = testing::insert(1, &[TupleValue::text("12345")]);
        for cut in 1..full.len() {
            assert!(
                Decoder::decode(&full[..cut]).is_err(),
                "prefix of {cut} bytes decoded"
            );
        }
        assert!(matches!(
            Decoder::decode(&testing::begin(1, ts(), 1)[..10]),
            Err(DecodeError::Truncated { field: "commit_timestamp", .. })
        ));
    }

    #[test]
    fn test_malformed_tuples() {
        let mut data = testing::insert(1, &[TupleValue::text("1")]);
        // tag(1) + relation id(4) + 'N'(1) + count(2) puts the column kind at 8
        data[8] = b'x';
        assert!(matches!(
            Decoder::decode(&data),
            Err(DecodeError::UnknownColumnKind(b'x'))
        ));

        let mut data = testing::insert(1, &[TupleValue::text("1")]);
        data[5] = b'K';
        assert!(matches!(
            Decoder::decode(&data),
            Err(DecodeError::UnexpectedTupleMarker { marker: b'K', .. })
        ));

        let mut data = testing::begin(1, ts(), 1);
        data.push(0);
        assert!(matches!(
            Decoder::decode(&data),
            Err(DecodeError::TrailingBytes { remaining: 1, .. })
        ));
    }

    #[test]
    fn test_invalid_utf8_in_names() {
        let mut data = testing::type_message(1, "public", "ab");
        let pos = data.iter().rposition(|&b| b == b'a').unwrap();
        data[pos] = 0xff;
        assert!(matches!(
            Decoder::decode(&data),
            Err(DecodeError::Utf8 { field: "type_name", .. })
        ));
    }
}
