//! Versioned relation schemas learned from RELATION messages.

use crate::error::{PipelineError, Result};
use pgoutput::{ColumnData, Relation, TupleData};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use stream_types::{
    Column, FieldMap, RelationId, RelationName, RelationSchema, ReplicaIdentity, Value,
};
use tracing::{debug, info};

/// A relation layout as announced by the source, before versioning.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationDefinition {
    pub id: RelationId,
    pub name: RelationName,
    pub replica_identity: ReplicaIdentity,
    pub columns: Vec<Column>,
}

impl From<&Relation> for RelationDefinition {
    fn from(relation: &Relation) -> Self {
        Self {
            id: relation.id,
            name: RelationName::new(&relation.namespace, &relation.name),
            replica_identity: ReplicaIdentity::from_byte(relation.replica_identity)
                .unwrap_or(ReplicaIdentity::Default),
            columns: relation
                .columns
                .iter()
                .map(|c| Column::new(&c.name, c.type_oid, c.type_modifier, c.is_key()))
                .collect(),
        }
    }
}

#[derive(Default)]
struct RegistryState {
    latest: HashMap<RelationId, Arc<RelationSchema>>,
    history: BTreeMap<(RelationId, u32), Arc<RelationSchema>>,
}

/// Relation schemas keyed by relation id, with every historical version kept.
///
/// Published versions are immutable; readers get `Arc` snapshots, so a
/// record keeps pointing at the version it was decoded against after the
/// relation changes.
#[derive(Default)]
pub struct SchemaRegistry {
    state: RwLock<RegistryState>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publishes a new version when the layout was never seen before.
    ///
    /// A layout matching an earlier version (the source re-announces
    /// relations when changes are read again) makes that version the latest
    /// again instead of minting a new number.
    pub fn register(&self, definition: RelationDefinition) -> Arc<RelationSchema> {
        let mut state = self.write();
        let matches = |schema: &Arc<RelationSchema>| {
            schema.has_layout(&definition.name, &definition.columns)
                && schema.replica_identity == definition.replica_identity
        };

        let current = state.latest.get(&definition.id).cloned();
        if let Some(current) = current.as_ref().filter(|c| matches(*c)) {
            debug!(relation = %current.name, version = current.version, "relation unchanged");
            return Arc::clone(current);
        }
        let known = state
            .history
            .range((definition.id, 0)..=(definition.id, u32::MAX))
            .map(|(_, schema)| schema)
            .find(|schema| matches(*schema))
            .cloned();
        if let Some(known) = known {
            debug!(
                relation = %known.name,
                version = known.version,
                "relation re-announced with an earlier layout"
            );
            state.latest.insert(known.id, Arc::clone(&known));
            return known;
        }

        let latest_version = state
            .history
            .range((definition.id, 0)..=(definition.id, u32::MAX))
            .next_back()
            .map(|((_, v), _)| *v);
        let version = latest_version.map_or(1, |v| v + 1);
        let schema = Arc::new(RelationSchema {
            id: definition.id,
            name: definition.name,
            version,
            replica_identity: definition.replica_identity,
            columns: definition.columns,
        });
        info!(
            relation = %schema.name,
            relation_id = schema.id,
            version,
            columns = schema.columns.len(),
            "registered relation schema"
        );
        state
            .history
            .insert((schema.id, version), Arc::clone(&schema));
        state.latest.insert(schema.id, Arc::clone(&schema));
        schema
    }

    /// Latest version of a relation.
    pub fn resolve(&self, id: RelationId) -> Result<Arc<RelationSchema>> {
        self.read()
            .latest
            .get(&id)
            .cloned()
            .ok_or(PipelineError::UnknownRelation(id))
    }

    /// A specific historical version.
    pub fn version(&self, id: RelationId, version: u32) -> Option<Arc<RelationSchema>> {
        self.read().history.get(&(id, version)).cloned()
    }

    /// All known versions of a relation, oldest first.
    pub fn versions(&self, id: RelationId) -> Vec<u32> {
        self.read()
            .history
            .range((id, 0)..=(id, u32::MAX))
            .map(|((_, v), _)| *v)
            .collect()
    }
}

/// Converts raw tuple data into named, typed fields using `schema`.
pub fn map_tuple(schema: &RelationSchema, tuple: &TupleData) -> Result<FieldMap> {
    if tuple.len() != schema.columns.len() {
        return Err(PipelineError::SchemaMismatch {
            relation: schema.name.to_string(),
            version: schema.version,
            expected: schema.columns.len(),
            actual: tuple.len(),
        });
    }

    let mut fields = FieldMap::with_capacity(tuple.len());
    for (column, data) in schema.columns.iter().zip(tuple.iter()) {
        let value = match data {
            ColumnData::Null => Value::Null,
            ColumnData::Unchanged => Value::Unchanged,
            ColumnData::Binary(bytes) => Value::Bytea(bytes.to_vec()),
            ColumnData::Text(bytes) => {
                let text = std::str::from_utf8(bytes).map_err(|e| PipelineError::InvalidValue {
                    relation: schema.name.to_string(),
                    column: column.name.clone(),
                    source: stream_types::ValueError {
                        data_type: column.data_type.clone(),
                        input: String::from_utf8_lossy(bytes).into_owned(),
                        reason: e.to_string(),
                    },
                })?;
                Value::from_text(&column.data_type, text).map_err(|source| {
                    PipelineError::InvalidValue {
                        relation: schema.name.to_string(),
                        column: column.name.clone(),
                        source,
                    }
                })?
            }
        };
        fields.push(column.name.clone(), value);
    }
    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn definition(columns: &[(&str, u32, bool)]) -> RelationDefinition {
        RelationDefinition {
            id: 100,
            name: RelationName::new("public", "readings"),
            replica_identity: ReplicaIdentity::Default,
            columns: columns
                .iter()
                .map(|(n, oid, key)| Column::new(*n, *oid, -1, *key))
                .collect(),
        }
    }

    fn text(s: &'static str) -> ColumnData {
        ColumnData::Text(Bytes::from_static(s.as_bytes()))
    }

    #[test]
    fn test_versions_increase_only_on_change() {
        let registry = SchemaRegistry::new();
        let v1 = registry.register(definition(&[("id", 23, true)]));
        assert_eq!(v1.version, 1);

        let same = registry.register(definition(&[("id", 23, true)]));
        assert_eq!(same.version, 1);
        assert!(Arc::ptr_eq(&v1, &same));

        let v2 = registry.register(definition(&[("id", 23, true), ("value", 701, false)]));
        assert_eq!(v2.version, 2);
        assert_eq!(registry.versions(100), vec![1, 2]);

        // The old snapshot is untouched.
        assert_eq!(v1.columns.len(), 1);
        assert_eq!(registry.version(100, 1).unwrap().columns.len(), 1);
        assert_eq!(registry.resolve(100).unwrap().version, 2);
    }

    #[test]
    fn test_type_key_and_rename_changes_bump_version() {
        let registry = SchemaRegistry::new();
        registry.register(definition(&[("id", 23, true)]));
        assert_eq!(registry.register(definition(&[("id", 20, true)])).version, 2);
        assert_eq!(registry.register(definition(&[("id", 20, false)])).version, 3);

        let mut renamed = definition(&[("id", 20, false)]);
        renamed.name = RelationName::new("public", "readings_archive");
        assert_eq!(registry.register(renamed).version, 4);
    }

    #[test]
    fn test_reannounced_layout_reuses_its_version() {
        let registry = SchemaRegistry::new();
        let v1 = registry.register(definition(&[("id", 23, true)]));
        let v2 = registry.register(definition(&[("id", 23, true), ("value", 701, false)]));

        // Changes are read again from before the schema change.
        let again_v1 = registry.register(definition(&[("id", 23, true)]));
        assert!(Arc::ptr_eq(&v1, &again_v1));
        assert_eq!(registry.resolve(100).unwrap().version, 1);

        let again_v2 = registry.register(definition(&[("id", 23, true), ("value", 701, false)]));
        assert!(Arc::ptr_eq(&v2, &again_v2));
        assert_eq!(registry.resolve(100).unwrap().version, 2);
        assert_eq!(registry.versions(100), vec![1, 2]);

        let v3 = registry.register(definition(&[("id", 20, true)]));
        assert_eq!(v3.version, 3);
    }

    #[test]
    fn test_unknown_relation() {
        let registry = SchemaRegistry::new();
        assert!(matches!(
            registry.resolve(42),
            Err(PipelineError::UnknownRelation(42))
        ));
        assert!(registry.version(42, 1).is_none());
    }

    #[test]
    fn test_map_tuple() {
        let registry = SchemaRegistry::new();
        let schema = registry.register(definition(&[
            ("id", 23, true),
            ("value", 701, false),
            ("payload", 25, false),
            ("note", 25, false),
        ]));
        let fields = map_tuple(
            &schema,
            &TupleData(vec![
                text("7"),
                text("1.5"),
                ColumnData::Unchanged,
                ColumnData::Null,
            ]),
        )
        .unwrap();
        assert_eq!(fields.get("id"), Some(&Value::Integer(7)));
        assert_eq!(fields.get("value"), Some(&Value::Double(1.5)));
        assert_eq!(fields.get("payload"), Some(&Value::Unchanged));
        assert_eq!(fields.get("note"), Some(&Value::Null));
    }

    #[test]
    fn test_map_tuple_errors() {
        let registry = SchemaRegistry::new();
        let schema = registry.register(definition(&[("id", 23, true), ("value", 701, false)]));

        let err = map_tuple(&schema, &TupleData(vec![text("1")])).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::SchemaMismatch {
                expected: 2,
                actual: 1,
                ..
            }
        ));

        let err = map_tuple(&schema, &TupleData(vec![text("x"), text("1")])).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidValue { ref column, .. } if column == "id"));
    }

    #[test]
    fn test_definition_from_relation_message() {
        let relation = Relation {
            id: 5,
            namespace: "public".to_string(),
            name: "t".to_string(),
            replica_identity: b'f',
            columns: vec![pgoutput::RelationColumn {
                flags: 1,
                name: "id".to_string(),
                type_oid: 23,
                type_modifier: -1,
            }],
        };
        let definition = RelationDefinition::from(&relation);
        assert_eq!(definition.replica_identity, ReplicaIdentity::Full);
        assert!(definition.columns[0].is_key);
        assert!(!definition.columns[0].nullable);
    }
}
