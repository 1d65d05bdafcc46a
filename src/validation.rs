// Prop validation boundary.
// The engine treats prop payloads as JSON objects checked by a validator the
// application supplies per kind. `PropSchema` is the bundled structural
// validator; anything implementing `PropValidator` (e.g. a generated schema
// from an external shape library) plugs in the same way.

use anyhow::{bail, Result};
use indexmap::IndexMap;
use serde_json::{json, Map, Value as JsonValue};
use std::fmt;

use crate::errors::TypeGraphError;

/// Validates and normalizes a prop payload for one kind.
///
/// `validate` returns the normalized payload that will be persisted; the
/// engine stores exactly what the validator returns. `describe` feeds the
/// schema document, so two validators with the same description hash the same.
pub trait PropValidator: Send + Sync {
    fn validate(&self, props: &JsonValue) -> Result<JsonValue>;

    /// JSON description of the accepted shape, used for schema hashing.
    fn describe(&self) -> JsonValue {
        json!("any")
    }
}

/// Pass-through validator: any JSON object (or absent payload) is accepted.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnyProps;

impl PropValidator for AnyProps {
    fn validate(&self, props: &JsonValue) -> Result<JsonValue> {
        match props {
            JsonValue::Null => Ok(JsonValue::Object(Map::new())),
            JsonValue::Object(_) => Ok(props.clone()),
            other => bail!(TypeGraphError::validation(
                "props",
                format!("expected a JSON object, got {}", type_name(other)),
            )),
        }
    }
}

/// Accepted primitive shapes for `PropSchema` fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Object,
    Array,
    Any,
}

impl FieldType {
    fn matches(&self, value: &JsonValue) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
            Self::Any => true,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
            Self::Any => "any",
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy)]
struct FieldSpec {
    ty: FieldType,
    required: bool,
}

/// Minimal structural validator: named top-level fields with primitive type
/// checks, a required set, and an unknown-field policy.
#[derive(Debug, Clone, Default)]
pub struct PropSchema {
    fields: IndexMap<String, FieldSpec>,
    deny_unknown: bool,
}

impl PropSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: impl Into<String>, ty: FieldType) -> Self {
        self.fields.insert(
            name.into(),
            FieldSpec {
                ty,
                required: false,
            },
        );
        self
    }

    pub fn required(mut self, name: impl Into<String>, ty: FieldType) -> Self {
        self.fields.insert(name.into(), FieldSpec { ty, required: true });
        self
    }

    /// Reject payloads carrying fields the schema does not declare.
    pub fn deny_unknown(mut self) -> Self {
        self.deny_unknown = true;
        self
    }
}

impl PropValidator for PropSchema {
    fn validate(&self, props: &JsonValue) -> Result<JsonValue> {
        let object = match props {
            JsonValue::Null => Map::new(),
            JsonValue::Object(map) => map.clone(),
            other => bail!(TypeGraphError::validation(
                "props",
                format!("expected a JSON object, got {}", type_name(other)),
            )),
        };

        for (name, spec) in &self.fields {
            match object.get(name) {
                None | Some(JsonValue::Null) if spec.required => {
                    bail!(TypeGraphError::validation(
                        format!("props.{name}"),
                        "required field is missing",
                    ));
                }
                Some(value) if !value.is_null() && !spec.ty.matches(value) => {
                    bail!(TypeGraphError::validation(
                        format!("props.{name}"),
                        format!("expected {}, got {}", spec.ty, type_name(value)),
                    ));
                }
                _ => {}
            }
        }

        if self.deny_unknown {
            for key in object.keys() {
                if !self.fields.contains_key(key) {
                    bail!(TypeGraphError::validation(
                        format!("props.{key}"),
                        "unknown field",
                    ));
                }
            }
        }

        Ok(JsonValue::Object(object))
    }

    fn describe(&self) -> JsonValue {
        let fields: Map<String, JsonValue> = self
            .fields
            .iter()
            .map(|(name, spec)| {
                (
                    name.clone(),
                    json!({ "type": spec.ty.name(), "required": spec.required }),
                )
            })
            .collect();
        json!({ "fields": fields, "denyUnknown": self.deny_unknown })
    }
}

fn type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

/// Pure helpers over dotted prop paths - no I/O, shared by unique-key
/// resolution, match-on comparison, and JSON-path compilation.
pub mod paths {
    use super::*;

    /// Split a dotted path into segments, rejecting empty segments.
    pub fn segments(path: &str) -> Result<Vec<&str>> {
        if path.is_empty() {
            bail!(TypeGraphError::validation("path", "prop path is empty"));
        }
        let parts: Vec<&str> = path.split('.').collect();
        if parts.iter().any(|p| p.is_empty()) {
            bail!(TypeGraphError::validation(
                "path",
                format!("prop path '{path}' contains an empty segment"),
            ));
        }
        Ok(parts)
    }

    /// Walk a dotted path through nested objects.
    pub fn get<'a>(value: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
        let mut current = value;
        for part in path.split('.') {
            current = current.as_object()?.get(part)?;
        }
        Some(current)
    }

    /// Shallow top-level merge: `patch` keys overwrite `base` keys. A `null`
    /// patch value overwrites rather than removes.
    pub fn merge(base: &JsonValue, patch: &JsonValue) -> JsonValue {
        let mut merged = match base {
            JsonValue::Object(map) => map.clone(),
            _ => Map::new(),
        };
        if let JsonValue::Object(patch_map) = patch {
            for (key, value) in patch_map {
                merged.insert(key.clone(), value.clone());
            }
        }
        JsonValue::Object(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn any_props_accepts_objects_only() {
        assert!(AnyProps.validate(&json!({"a": 1})).is_ok());
        assert_eq!(
            AnyProps.validate(&JsonValue::Null).unwrap(),
            json!({}),
        );
        assert!(AnyProps.validate(&json!([1, 2])).is_err());
    }

    #[test]
    fn schema_checks_required_and_types() {
        let schema = PropSchema::new()
            .required("name", FieldType::String)
            .field("age", FieldType::Number);

        assert!(schema.validate(&json!({"name": "ada", "age": 36})).is_ok());
        assert!(schema.validate(&json!({"age": 36})).is_err());
        assert!(schema.validate(&json!({"name": 7})).is_err());
        // optional fields may be absent or null
        assert!(schema.validate(&json!({"name": "ada", "age": null})).is_ok());
    }

    #[test]
    fn schema_unknown_field_policy() {
        let open = PropSchema::new().field("a", FieldType::Any);
        assert!(open.validate(&json!({"a": 1, "b": 2})).is_ok());

        let closed = PropSchema::new().field("a", FieldType::Any).deny_unknown();
        assert!(closed.validate(&json!({"a": 1, "b": 2})).is_err());
    }

    #[test]
    fn path_get_walks_nested_objects() {
        let value = json!({"a": {"b": {"c": 42}}});
        assert_eq!(paths::get(&value, "a.b.c"), Some(&json!(42)));
        assert_eq!(paths::get(&value, "a.x"), None);
    }

    #[test]
    fn merge_is_shallow() {
        let base = json!({"a": 1, "nested": {"x": 1}});
        let patch = json!({"b": 2, "nested": {"y": 2}});
        let merged = paths::merge(&base, &patch);
        assert_eq!(merged, json!({"a": 1, "b": 2, "nested": {"y": 2}}));
    }
}
