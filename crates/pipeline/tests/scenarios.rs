//! End-to-end decoding scenarios over a scripted replication stream.

use chrono::{DateTime, Utc};
use event_sink::{EmittedEvent, RecordingSink};
use offset_store::{MemoryStore, OffsetStore, StreamIdentity};
use pgoutput::testing::{self, OldImage, TupleValue};
use pipeline::testing::{ScriptedTransport, TransportLog};
use pipeline::transport::RawMessage;
use pipeline::{ConsumerConfig, DispatcherConfig, Pipeline, PipelineConfig, RetryPolicy, SessionSummary};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use stream_types::{StreamPosition, Value};
use tokio_util::sync::CancellationToken;

const INT4: u32 = 23;
const TEXT: u32 = 25;

fn ts() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

fn stream() -> StreamIdentity {
    StreamIdentity::new("localhost/metrics/events")
}

fn msg(position: u64, data: Vec<u8>) -> RawMessage {
    RawMessage::new(position, data)
}

fn int(v: i64) -> TupleValue {
    TupleValue::text(v.to_string())
}

fn config() -> PipelineConfig {
    PipelineConfig {
        consumer: ConsumerConfig {
            poll_interval: Duration::from_millis(5),
            ack_interval: Duration::from_millis(5),
            channel_capacity: 4,
        },
        dispatch: DispatcherConfig {
            retry: RetryPolicy {
                max_attempts: 3,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                multiplier: 2.0,
                jitter: false,
            },
            max_parallel_lanes: 1,
        },
        ..PipelineConfig::default()
    }
}

struct Run {
    summary: SessionSummary,
    events: Vec<EmittedEvent>,
    offsets: Arc<MemoryStore>,
    log: TransportLog,
    pipeline: Pipeline,
}

async fn run(batches: Vec<Vec<RawMessage>>) -> Run {
    let sink = Arc::new(RecordingSink::new());
    let offsets = Arc::new(MemoryStore::new());
    let pipeline = Pipeline::new(sink.clone(), offsets.clone(), stream(), config());

    let shutdown = CancellationToken::new();
    let transport = ScriptedTransport::new(batches).cancel_when_drained(shutdown.clone());
    let log = transport.log_handle();
    let summary = pipeline.run_session(transport, &shutdown).await.unwrap();
    let log = log.lock().unwrap().clone();

    Run {
        summary,
        events: sink.events(),
        offsets,
        log,
        pipeline,
    }
}

fn after(event: &EmittedEvent) -> serde_json::Value {
    serde_json::to_value(&event.envelope.payload.after).unwrap()
}

#[tokio::test]
async fn test_single_insert_is_dispatched_and_offset_advances() {
    let batch = vec![
        msg(10, testing::begin(10, ts(), 501)),
        msg(
            10,
            testing::relation(16384, "public", "readings", b'd', &[("id", INT4, true), ("val", INT4, false)]),
        ),
        msg(10, testing::insert(16384, &[int(1), int(5)])),
        msg(11, testing::commit(10, 11, ts())),
    ];
    let run = run(vec![batch]).await;

    assert_eq!(run.events.len(), 1);
    let event = &run.events[0];
    assert_eq!(event.topic, "public.readings");
    assert_eq!(after(event), json!({"id": 1, "val": 5}));
    assert_eq!(event.timestamp, ts());

    assert_eq!(run.summary.confirmed, Some(StreamPosition::new(11)));
    assert_eq!(run.offsets.history(&stream()), vec![StreamPosition::new(11)]);
    assert_eq!(run.log.acks.last(), Some(&StreamPosition::new(11)));
    assert_eq!(run.log.closed, 1);
}

#[tokio::test]
async fn test_update_then_delete_keep_order_and_key() {
    let columns = [("id", INT4, true), ("val", INT4, false)];
    let batch = vec![
        msg(20, testing::begin(30, ts(), 502)),
        msg(20, testing::relation(16384, "public", "readings", b'f', &columns)),
        msg(
            21,
            testing::update(16384, Some(OldImage::Full(vec![int(1), int(5)])), &[int(1), int(6)]),
        ),
        msg(22, testing::delete(16384, OldImage::Full(vec![int(1), int(6)]))),
        msg(31, testing::commit(30, 31, ts())),
    ];
    let run = run(vec![batch]).await;

    assert_eq!(run.events.len(), 2);
    let (update, delete) = (&run.events[0], &run.events[1]);

    let update_json = serde_json::to_value(&update.envelope).unwrap();
    assert_eq!(update_json["payload"]["op"], "u");
    assert_eq!(update_json["payload"]["before"], json!({"id": 1, "val": 5}));
    assert_eq!(update_json["payload"]["after"], json!({"id": 1, "val": 6}));

    let delete_json = serde_json::to_value(&delete.envelope).unwrap();
    assert_eq!(delete_json["payload"]["op"], "d");
    assert_eq!(delete_json["payload"]["before"], json!({"id": 1, "val": 6}));
    assert_eq!(delete_json["payload"]["after"], json!(null));

    for event in [update, delete] {
        assert_eq!(event.key.fields().get("id"), Some(&Value::Integer(1)));
        assert_eq!(event.key.fields().len(), 1);
    }
    assert!(update.envelope.payload.source.sequence < delete.envelope.payload.source.sequence);
    assert_eq!(run.summary.confirmed, Some(StreamPosition::new(31)));
}

#[tokio::test]
async fn test_relation_change_applies_to_later_inserts_only() {
    let v1 = [("id", INT4, true), ("val", INT4, false)];
    let v2 = [("id", INT4, true), ("val", INT4, false), ("label", TEXT, false)];
    let batches = vec![
        vec![
            msg(10, testing::begin(10, ts(), 1)),
            msg(10, testing::relation(16384, "public", "readings", b'd', &v1)),
            msg(10, testing::insert(16384, &[int(1), int(5)])),
            msg(11, testing::commit(10, 11, ts())),
        ],
        vec![
            msg(12, testing::begin(20, ts(), 2)),
            msg(12, testing::relation(16384, "public", "readings", b'd', &v2)),
            msg(13, testing::insert(16384, &[int(2), int(6), TupleValue::text("north")])),
            msg(21, testing::commit(20, 21, ts())),
        ],
    ];
    let run = run(batches).await;

    assert_eq!(run.events.len(), 2);
    assert_eq!(after(&run.events[0]), json!({"id": 1, "val": 5}));
    assert_eq!(
        after(&run.events[1]),
        json!({"id": 2, "val": 6, "label": "north"})
    );
    assert_eq!(run.pipeline.registry().versions(16384), vec![1, 2]);
    assert_eq!(
        run.pipeline.registry().version(16384, 1).unwrap().columns.len(),
        2
    );
    assert_eq!(
        run.offsets.history(&stream()),
        vec![StreamPosition::new(11), StreamPosition::new(21)]
    );
}

#[tokio::test]
async fn test_records_buffered_before_relation_change_keep_their_layout() {
    let v1 = [("id", INT4, true), ("val", INT4, false)];
    let v2 = [("id", INT4, true), ("val", INT4, false), ("label", TEXT, false)];
    let batch = vec![
        msg(10, testing::begin(40, ts(), 1)),
        msg(10, testing::relation(7, "public", "readings", b'd', &v1)),
        msg(11, testing::insert(7, &[int(1), int(5)])),
        msg(12, testing::relation(7, "public", "readings", b'd', &v2)),
        msg(13, testing::insert(7, &[int(2), int(6), TupleValue::Null])),
        msg(41, testing::commit(40, 41, ts())),
    ];
    let run = run(vec![batch]).await;

    assert_eq!(run.events.len(), 2);
    assert_eq!(after(&run.events[0]), json!({"id": 1, "val": 5}));
    assert_eq!(
        after(&run.events[1]),
        json!({"id": 2, "val": 6, "label": null})
    );
}

#[tokio::test]
async fn test_empty_transaction_advances_offset_without_envelopes() {
    let batch = vec![
        msg(50, testing::begin(50, ts(), 9)),
        msg(51, testing::commit(50, 51, ts())),
    ];
    let run = run(vec![batch]).await;

    assert!(run.events.is_empty());
    assert_eq!(run.summary.confirmed, Some(StreamPosition::new(51)));
    let stored = run.offsets.load(&stream()).await.unwrap().unwrap();
    assert_eq!(stored.confirmed_position, StreamPosition::new(51));
    assert_eq!(run.pipeline.metrics().snapshot().empty_transactions, 1);
}

#[tokio::test]
async fn test_truncate_only_transaction_is_not_counted_empty() {
    let batch = vec![
        msg(70, testing::begin(70, ts(), 11)),
        msg(
            70,
            testing::relation(16384, "public", "readings", b'd', &[("id", INT4, true), ("val", INT4, false)]),
        ),
        msg(70, testing::truncate(&[16384], 0)),
        msg(71, testing::commit(70, 71, ts())),
    ];
    let run = run(vec![batch]).await;

    assert_eq!(run.events.len(), 1);
    let envelope = serde_json::to_value(&run.events[0].envelope).unwrap();
    assert_eq!(envelope["payload"]["op"], "t");
    assert_eq!(run.summary.confirmed, Some(StreamPosition::new(71)));
    assert_eq!(run.offsets.history(&stream()), vec![StreamPosition::new(71)]);
    assert_eq!(run.pipeline.metrics().snapshot().empty_transactions, 0);
}

#[tokio::test]
async fn test_catalog_changes_are_filtered() {
    let batch = vec![
        msg(60, testing::begin(60, ts(), 3)),
        msg(
            60,
            testing::relation(99, "_timescaledb_catalog", "chunk", b'd', &[("id", INT4, true)]),
        ),
        msg(60, testing::insert(99, &[int(1)])),
        msg(61, testing::commit(60, 61, ts())),
    ];
    let run = run(vec![batch]).await;

    assert!(run.events.is_empty());
    assert_eq!(run.summary.confirmed, Some(StreamPosition::new(61)));
    assert_eq!(run.pipeline.metrics().snapshot().filtered_records, 1);
}
