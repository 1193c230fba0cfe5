//! Encoders producing byte-exact `pgoutput` messages for tests.

use bytes::{BufMut, BytesMut};
use chrono::{DateTime, Utc};

const PG_EPOCH_OFFSET_MICROS: i64 = 946_684_800_000_000;

/// A column value inside an encoded tuple.
#[derive(Debug, Clone, PartialEq)]
pub enum TupleValue {
    Null,
    Unchanged,
    Text(String),
    Binary(Vec<u8>),
}

impl TupleValue {
    pub fn text(value: impl Into<String>) -> Self {
        TupleValue::Text(value.into())
    }
}

/// Old-row image attached to UPDATE and DELETE messages.
#[derive(Debug, Clone, PartialEq)]
pub enum OldImage {
    Key(Vec<TupleValue>),
    Full(Vec<TupleValue>),
}

fn put_timestamp(buf: &mut BytesMut, ts: DateTime<Utc>) {
    buf.put_i64(ts.timestamp_micros() - PG_EPOCH_OFFSET_MICROS);
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

fn put_tuple(buf: &mut BytesMut, values: &[TupleValue]) {
    buf.put_u16(values.len() as u16);
    for value in values {
        match value {
            TupleValue::Null => buf.put_u8(b'n'),
            TupleValue::Unchanged => buf.put_u8(b'u'),
            TupleValue::Text(s) => {
                buf.put_u8(b't');
                buf.put_u32(s.len() as u32);
                buf.put_slice(s.as_bytes());
            }
            TupleValue::Binary(b) => {
                buf.put_u8(b'b');
                buf.put_u32(b.len() as u32);
                buf.put_slice(b);
            }
        }
    }
}

fn put_old_image(buf: &mut BytesMut, old: &OldImage) {
    match old {
        OldImage::Key(values) => {
            buf.put_u8(b'K');
            put_tuple(buf, values);
        }
        OldImage::Full(values) => {
            buf.put_u8(b'O');
            put_tuple(buf, values);
        }
    }
}

pub fn begin(final_lsn: u64, commit_timestamp: DateTime<Utc>, xid: u32) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u8(b'B');
    buf.put_u64(final_lsn);
    put_timestamp(&mut buf, commit_timestamp);
    buf.put_u32(xid);
    buf.to_vec()
}

pub fn commit(commit_lsn: u64, end_lsn: u64, commit_timestamp: DateTime<Utc>) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u8(b'C');
    buf.put_u8(0);
    buf.put_u64(commit_lsn);
    buf.put_u64(end_lsn);
    put_timestamp(&mut buf, commit_timestamp);
    buf.to_vec()
}

/// `columns` are `(name, type oid, is key)` triples.
pub fn relation(
    id: u32,
    namespace: &str,
    name: &str,
    replica_identity: u8,
    columns: &[(&str, u32, bool)],
) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u8(b'R');
    buf.put_u32(id);
    put_string(&mut buf, namespace);
    put_string(&mut buf, name);
    buf.put_u8(replica_identity);
    buf.put_u16(columns.len() as u16);
    for (column, type_oid, is_key) in columns {
        buf.put_u8(u8::from(*is_key));
        put_string(&mut buf, column);
        buf.put_u32(*type_oid);
        buf.put_i32(-1);
    }
    buf.to_vec()
}

pub fn insert(relation_id: u32, values: &[TupleValue]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u8(b'I');
    buf.put_u32(relation_id);
    buf.put_u8(b'N');
    put_tuple(&mut buf, values);
    buf.to_vec()
}

pub fn update(relation_id: u32, old: Option<OldImage>, new: &[TupleValue]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u8(b'U');
    buf.put_u32(relation_id);
    if let Some(old) = &old {
        put_old_image(&mut buf, old);
    }
    buf.put_u8(b'N');
    put_tuple(&mut buf, new);
    buf.to_vec()
}

pub fn delete(relation_id: u32, old: OldImage) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u8(b'D');
    buf.put_u32(relation_id);
    put_old_image(&mut buf, &old);
    buf.to_vec()
}

pub fn truncate(relation_ids: &[u32], options: u8) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u8(b'T');
    buf.put_u32(relation_ids.len() as u32);
    buf.put_u8(options);
    for id in relation_ids {
        buf.put_u32(*id);
    }
    buf.to_vec()
}

pub fn origin(commit_lsn: u64, name: &str) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u8(b'O');
    buf.put_u64(commit_lsn);
    put_string(&mut buf, name);
    buf.to_vec()
}

pub fn type_message(id: u32, namespace: &str, name: &str) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u8(b'Y');
    buf.put_u32(id);
    put_string(&mut buf, namespace);
    put_string(&mut buf, name);
    buf.to_vec()
}

pub fn logical_message(transactional: bool, lsn: u64, prefix: &str, content: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u8(b'M');
    buf.put_u8(u8::from(transactional));
    buf.put_u64(lsn);
    put_string(&mut buf, prefix);
    buf.put_u32(content.len() as u32);
    buf.put_slice(content);
    buf.to_vec()
}
