// Schema documents.
// A schema document is the canonical JSON projection of a GraphDef persisted
// alongside the data: enough to detect drift between the code's declarations
// and what the store last saw. The hash is SHA-256 over the canonical text,
// so key order can never produce a spurious mismatch.

use serde_json::{json, Map, Value as JsonValue};
use sha2::{Digest, Sha256};

use crate::registry::KindRegistry;

/// Serialize a JSON value with object keys sorted recursively. Two
/// structurally equal values always produce identical text.
pub fn canonical_string(value: &JsonValue) -> String {
    serde_json::to_string(&canonicalize(value)).expect("JSON values always serialize")
}

fn canonicalize(value: &JsonValue) -> JsonValue {
    match value {
        JsonValue::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::with_capacity(map.len());
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            JsonValue::Object(sorted)
        }
        JsonValue::Array(items) => JsonValue::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// The JSON projection of a graph definition: kinds, prop shape descriptions,
/// delete behaviors, uniqueness constraints, and ontology relations.
pub fn build_schema_doc(registry: &KindRegistry) -> JsonValue {
    let mut nodes = Map::new();
    for kind in registry.node_kinds() {
        let registration = registry
            .node_registration(kind)
            .expect("registry iterates its own kinds");
        let uniques: Vec<JsonValue> = registration
            .unique
            .iter()
            .map(|c| {
                json!({
                    "name": c.name,
                    "fields": c.fields,
                    "scope": c.scope,
                    "collation": c.collation,
                })
            })
            .collect();
        nodes.insert(
            kind.to_string(),
            json!({
                "onDelete": registration.on_delete.as_str(),
                "unique": uniques,
                "props": registration.node_type.validator.describe(),
            }),
        );
    }

    let mut edges = Map::new();
    for kind in registry.edge_kinds() {
        let registration = registry
            .edge_registration(kind)
            .expect("registry iterates its own kinds");
        let props = registration
            .edge_type
            .validator
            .as_ref()
            .map(|v| v.describe())
            .unwrap_or(JsonValue::Null);
        edges.insert(
            kind.to_string(),
            json!({
                "from": registration.from_kinds,
                "to": registration.to_kinds,
                "cardinality": registration.cardinality.as_str(),
                "props": props,
            }),
        );
    }

    json!({
        "graph": registry.graph_name(),
        "nodes": nodes,
        "edges": edges,
        "ontology": registry.ontology(),
    })
}

/// SHA-256 of the canonical schema document text, hex-encoded. Consumers
/// compare hashes to detect schema drift.
pub fn schema_hash(doc: &JsonValue) -> String {
    let canonical = canonical_string(doc);
    let digest = Sha256::digest(canonical.as_bytes());
    hex::encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{EdgeRegistration, EdgeType, GraphDef, NodeRegistration, NodeType};

    #[test]
    fn canonical_string_sorts_keys_recursively() {
        let a = json!({"b": {"y": 1, "x": 2}, "a": 3});
        let b = json!({"a": 3, "b": {"x": 2, "y": 1}});
        assert_eq!(canonical_string(&a), canonical_string(&b));
        assert_eq!(canonical_string(&a), r#"{"a":3,"b":{"x":2,"y":1}}"#);
    }

    #[test]
    fn schema_hash_is_stable_across_declaration_noise() {
        let def = |name: &str| {
            GraphDef::builder(name)
                .node(NodeRegistration::new(NodeType::any("Person").unwrap()))
                .unwrap()
                .edge(EdgeRegistration::new(
                    EdgeType::any("knows").unwrap(),
                    ["Person"],
                    ["Person"],
                ))
                .unwrap()
                .build()
                .unwrap()
        };
        let reg_a = KindRegistry::new(def("g")).unwrap();
        let reg_b = KindRegistry::new(def("g")).unwrap();
        assert_eq!(
            schema_hash(&build_schema_doc(&reg_a)),
            schema_hash(&build_schema_doc(&reg_b))
        );

        let reg_c = KindRegistry::new(def("other")).unwrap();
        assert_ne!(
            schema_hash(&build_schema_doc(&reg_a)),
            schema_hash(&build_schema_doc(&reg_c))
        );
    }
}
