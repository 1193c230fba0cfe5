//! Turns change records into sink envelopes.

use serde::Deserialize;
use stream_types::{
    ChangeRecord, Envelope, EnvelopeKey, FieldDescriptor, FieldMap, Payload, RelationName,
    RelationSchema, SchemaDescriptor, SourceInfo, Value,
};

fn default_connector_name() -> String {
    "tsdb-event-streamer".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EnvelopeConfig {
    /// Prepended to `schema.table`; an empty prefix yields bare `schema.table` topics.
    #[serde(default)]
    pub topic_prefix: String,
    /// Attach a schema descriptor to every envelope.
    #[serde(default)]
    pub include_schema: bool,
    #[serde(default = "default_connector_name")]
    pub connector_name: String,
    /// Source database name reported in `source.db`.
    #[serde(default)]
    pub database: String,
}

impl Default for EnvelopeConfig {
    fn default() -> Self {
        Self {
            topic_prefix: String::new(),
            include_schema: false,
            connector_name: default_connector_name(),
            database: String::new(),
        }
    }
}

/// Builds [`Envelope`]s. Pure: the same record always gives the same envelope.
#[derive(Debug, Clone, Default)]
pub struct EnvelopeBuilder {
    config: EnvelopeConfig,
}

impl EnvelopeBuilder {
    pub fn new(config: EnvelopeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EnvelopeConfig {
        &self.config
    }

    pub fn topic_for(&self, name: &RelationName) -> String {
        if self.config.topic_prefix.is_empty() {
            format!("{}.{}", name.schema, name.table)
        } else {
            format!("{}.{}.{}", self.config.topic_prefix, name.schema, name.table)
        }
    }

    pub fn build(&self, record: &ChangeRecord) -> Envelope {
        let relation = &record.relation;
        let ts_ms = record.commit_timestamp.timestamp_millis();
        let source_name = if self.config.topic_prefix.is_empty() {
            self.config.connector_name.clone()
        } else {
            self.config.topic_prefix.clone()
        };

        Envelope {
            topic: self.topic_for(&relation.name),
            key: key_for(record),
            schema: self
                .config
                .include_schema
                .then(|| schema_descriptor(relation)),
            payload: Payload {
                before: record.before.clone(),
                after: record.after.clone(),
                op: record.operation,
                ts_ms,
                source: SourceInfo {
                    connector: self.config.connector_name.clone(),
                    name: source_name,
                    db: self.config.database.clone(),
                    schema: relation.name.schema.clone(),
                    table: relation.name.table.clone(),
                    lsn: record.position.to_string(),
                    tx_id: record.xid,
                    sequence: record.sequence,
                    ts_ms,
                },
            },
        }
    }
}

/// Key-column values in schema order, taken from the identifying row image.
/// Truncates and keyless relations get an empty key.
fn key_for(record: &ChangeRecord) -> EnvelopeKey {
    let Some(image) = record.identity_image() else {
        return EnvelopeKey::default();
    };
    let fields: FieldMap = record
        .relation
        .key_columns()
        .map(|column| {
            let value = image.get(&column.name).cloned().unwrap_or(Value::Null);
            (column.name.as_str(), value)
        })
        .collect();
    EnvelopeKey::new(fields)
}

fn schema_descriptor(relation: &RelationSchema) -> SchemaDescriptor {
    SchemaDescriptor {
        name: relation.name.to_string(),
        version: relation.version,
        fields: relation
            .columns
            .iter()
            .map(|column| FieldDescriptor {
                field: column.name.clone(),
                type_name: column.data_type.type_name().to_string(),
                optional: column.nullable,
                key: column.is_key,
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use serde_json::json;
    use std::sync::Arc;
    use stream_types::{Column, RecordMeta, ReplicaIdentity, StreamPosition};

    fn relation(keys: &[bool]) -> Arc<RelationSchema> {
        let names = ["device", "ts", "value"];
        let oids = [25, 20, 701];
        Arc::new(RelationSchema {
            id: 7,
            name: RelationName::new("public", "readings"),
            version: 3,
            replica_identity: ReplicaIdentity::Default,
            columns: keys
                .iter()
                .enumerate()
                .map(|(i, key)| Column::new(names[i], oids[i], -1, *key))
                .collect(),
        })
    }

    fn meta() -> RecordMeta {
        RecordMeta {
            position: StreamPosition::new(0x1_0000_00A0),
            sequence: 2,
            xid: 900,
            commit_timestamp: DateTime::<Utc>::from_timestamp_millis(1_700_000_000_123).unwrap(),
        }
    }

    fn row() -> FieldMap {
        vec![
            ("device", Value::Text("d1".to_string())),
            ("ts", Value::BigInt(5)),
            ("value", Value::Double(1.5)),
        ]
        .into_iter()
        .collect()
    }

    fn builder(prefix: &str, include_schema: bool) -> EnvelopeBuilder {
        EnvelopeBuilder::new(EnvelopeConfig {
            topic_prefix: prefix.to_string(),
            include_schema,
            database: "metrics".to_string(),
            ..EnvelopeConfig::default()
        })
    }

    #[test]
    fn test_topic_naming() {
        let name = RelationName::new("public", "readings");
        assert_eq!(builder("prod", false).topic_for(&name), "prod.public.readings");
        assert_eq!(builder("", false).topic_for(&name), "public.readings");
    }

    #[test]
    fn test_insert_envelope() {
        let record = ChangeRecord::insert(relation(&[true, true, false]), row(), meta());
        let envelope = builder("prod", false).build(&record);

        assert_eq!(envelope.topic, "prod.public.readings");
        assert_eq!(envelope.key.partition_key(), "d1:5");
        assert!(envelope.schema.is_none());

        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["payload"]["op"], "c");
        assert_eq!(value["payload"]["before"], json!(null));
        assert_eq!(value["payload"]["after"]["value"], json!(1.5));
        assert_eq!(value["payload"]["ts_ms"], json!(1_700_000_000_123i64));
        assert_eq!(value["payload"]["source"]["lsn"], "1/A0");
        assert_eq!(value["payload"]["source"]["txId"], 900);
        assert_eq!(value["payload"]["source"]["sequence"], 2);
        assert_eq!(value["payload"]["source"]["name"], "prod");
        assert_eq!(value["payload"]["source"]["db"], "metrics");
        assert_eq!(value["payload"]["source"]["connector"], "tsdb-event-streamer");
    }

    #[test]
    fn test_delete_key_comes_from_before_image() {
        let record = ChangeRecord::delete(relation(&[true, false, false]), row(), meta());
        let envelope = builder("", false).build(&record);
        assert_eq!(envelope.key.partition_key(), "d1");
        assert!(envelope.payload.after.is_none());
    }

    #[test]
    fn test_keyless_and_truncate_have_empty_key() {
        let keyless = ChangeRecord::insert(relation(&[false, false, false]), row(), meta());
        assert!(builder("", false).build(&keyless).key.is_empty());

        let truncate = ChangeRecord::truncate(relation(&[true, false, false]), meta());
        let envelope = builder("", false).build(&truncate);
        assert!(envelope.key.is_empty());
        assert_eq!(serde_json::to_value(&envelope).unwrap()["payload"]["op"], "t");
    }

    #[test]
    fn test_schema_descriptor() {
        let record = ChangeRecord::insert(relation(&[true, false, false]), row(), meta());
        let envelope = builder("", true).build(&record);
        let schema = envelope.schema.unwrap();
        assert_eq!(schema.name, "public.readings");
        assert_eq!(schema.version, 3);
        assert_eq!(schema.fields.len(), 3);
        assert!(schema.fields[0].key);
        assert!(!schema.fields[0].optional);
        assert!(schema.fields[2].optional);
    }

    #[test]
    fn test_rebuilding_is_deterministic() {
        let record = ChangeRecord::insert(relation(&[true, true, false]), row(), meta());
        let builder = builder("prod", true);
        assert_eq!(builder.build(&record), builder.build(&record));
    }
}
