// Smart-select field tracking.
// A projection callback runs twice: once against a recording proxy to learn
// which fields it touches (so the compiler can emit a selective SELECT), and
// once per result row to build the output. Queries with optional traversals
// get two tracking passes, one per branch, so conditional reads are observed
// on both sides.

use serde_json::{Map, Value as JsonValue};
use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap, HashSet};

use crate::query_ast::{FieldRef, SystemField};
use crate::validation::paths;

/// One tracked access within an alias.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum TrackedField {
    Prop(String),
    System(&'static str),
}

/// What one alias requires from the row: either a known field set or the
/// whole row (the selectivity-disabling sentinel).
#[derive(Debug, Clone, PartialEq)]
pub enum AliasRequirement {
    Fields(BTreeSet<TrackedField>),
    Whole,
}

/// Records alias/field accesses during a tracking pass.
#[derive(Debug, Default)]
pub struct FieldTracker {
    state: RefCell<HashMap<String, AliasRequirement>>,
}

impl FieldTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, alias: &str, field: TrackedField) {
        let mut state = self.state.borrow_mut();
        match state
            .entry(alias.to_string())
            .or_insert_with(|| AliasRequirement::Fields(BTreeSet::new()))
        {
            AliasRequirement::Fields(fields) => {
                fields.insert(field);
            }
            AliasRequirement::Whole => {}
        }
    }

    fn record_whole(&self, alias: &str) {
        self.state
            .borrow_mut()
            .insert(alias.to_string(), AliasRequirement::Whole);
    }

    /// Merge another tracker's observations into this one (two-pass union).
    pub fn absorb(&self, other: FieldTracker) {
        for (alias, requirement) in other.state.into_inner() {
            match requirement {
                AliasRequirement::Whole => self.record_whole(&alias),
                AliasRequirement::Fields(fields) => {
                    for field in fields {
                        self.record(&alias, field);
                    }
                }
            }
        }
    }

    pub fn requirements(self) -> HashMap<String, AliasRequirement> {
        self.state.into_inner()
    }
}

/// A decoded result row handed to the projection callback on the real pass.
#[derive(Debug, Clone, Default)]
pub struct DecodedRow {
    /// Selective output columns keyed by their deterministic names.
    pub columns: HashMap<String, JsonValue>,
    /// Whole-row objects per alias (full-row projections).
    pub aliases: HashMap<String, JsonValue>,
    /// Optional-traversal aliases that did not match for this row.
    pub absent: HashSet<String>,
}

enum Mode<'a> {
    Track {
        tracker: &'a FieldTracker,
        optional_present: bool,
    },
    Read {
        row: &'a DecodedRow,
    },
}

/// The context handed to a projection callback. Use [`ProjectionCtx::alias`]
/// to reach an alias's fields.
pub struct ProjectionCtx<'a> {
    mode: Mode<'a>,
}

impl<'a> ProjectionCtx<'a> {
    pub fn tracking(tracker: &'a FieldTracker, optional_present: bool) -> Self {
        Self {
            mode: Mode::Track {
                tracker,
                optional_present,
            },
        }
    }

    pub fn reading(row: &'a DecodedRow) -> Self {
        Self {
            mode: Mode::Read { row },
        }
    }

    pub fn alias<'b>(&'b self, alias: &str) -> AliasView<'a, 'b> {
        AliasView {
            ctx: self,
            alias: alias.to_string(),
        }
    }
}

/// A view over one alias inside the projection callback.
pub struct AliasView<'a, 'b> {
    ctx: &'b ProjectionCtx<'a>,
    alias: String,
}

impl<'a, 'b> AliasView<'a, 'b> {
    /// Read a prop field (dotted path).
    pub fn prop(&self, path: &str) -> JsonValue {
        match &self.ctx.mode {
            Mode::Track { tracker, .. } => {
                tracker.record(&self.alias, TrackedField::Prop(path.to_string()));
                JsonValue::Null
            }
            Mode::Read { row } => {
                let column = FieldRef::Prop {
                    alias: self.alias.clone(),
                    path: path.to_string(),
                }
                .output_name();
                if let Some(value) = row.columns.get(&column) {
                    return value.clone();
                }
                row.aliases
                    .get(&self.alias)
                    .and_then(|object| object.get("props"))
                    .and_then(|props| paths::get(props, path))
                    .cloned()
                    .unwrap_or(JsonValue::Null)
            }
        }
    }

    fn system(&self, field: SystemField) -> JsonValue {
        match &self.ctx.mode {
            Mode::Track { tracker, .. } => {
                tracker.record(&self.alias, TrackedField::System(field.column()));
                JsonValue::Null
            }
            Mode::Read { row } => {
                let column = FieldRef::System {
                    alias: self.alias.clone(),
                    field,
                }
                .output_name();
                if let Some(value) = row.columns.get(&column) {
                    return value.clone();
                }
                row.aliases
                    .get(&self.alias)
                    .and_then(|object| object.get(field.column()))
                    .cloned()
                    .unwrap_or(JsonValue::Null)
            }
        }
    }

    pub fn id(&self) -> JsonValue {
        self.system(SystemField::Id)
    }

    pub fn kind(&self) -> JsonValue {
        self.system(SystemField::Kind)
    }

    pub fn version(&self) -> JsonValue {
        self.system(SystemField::Version)
    }

    pub fn created_at(&self) -> JsonValue {
        self.system(SystemField::CreatedAt)
    }

    pub fn updated_at(&self) -> JsonValue {
        self.system(SystemField::UpdatedAt)
    }

    pub fn deleted_at(&self) -> JsonValue {
        self.system(SystemField::DeletedAt)
    }

    pub fn valid_from(&self) -> JsonValue {
        self.system(SystemField::ValidFrom)
    }

    pub fn valid_to(&self) -> JsonValue {
        self.system(SystemField::ValidTo)
    }

    /// The whole row object. Disables selectivity for this alias.
    pub fn whole(&self) -> JsonValue {
        match &self.ctx.mode {
            Mode::Track { tracker, .. } => {
                tracker.record_whole(&self.alias);
                JsonValue::Object(Map::new())
            }
            Mode::Read { row } => row
                .aliases
                .get(&self.alias)
                .cloned()
                .unwrap_or(JsonValue::Null),
        }
    }

    /// Whether an optional traversal matched for this row. During tracking
    /// the configured branch value is returned (and the alias's id column is
    /// recorded so selective rows can answer), so both branches of a
    /// conditional projection are exercised across the two passes.
    pub fn present(&self) -> bool {
        match &self.ctx.mode {
            Mode::Track {
                tracker,
                optional_present,
            } => {
                tracker.record(&self.alias, TrackedField::System("id"));
                *optional_present
            }
            Mode::Read { row } => {
                let id_column = FieldRef::System {
                    alias: self.alias.clone(),
                    field: SystemField::Id,
                }
                .output_name();
                if let Some(value) = row.columns.get(&id_column) {
                    return !value.is_null();
                }
                !row.absent.contains(&self.alias)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tracking_records_fields_and_whole() {
        let tracker = FieldTracker::new();
        {
            let ctx = ProjectionCtx::tracking(&tracker, true);
            let p = ctx.alias("p");
            let _ = p.prop("name");
            let _ = p.id();
            let _ = ctx.alias("c").whole();
        }
        let requirements = tracker.requirements();
        match &requirements["p"] {
            AliasRequirement::Fields(fields) => {
                assert!(fields.contains(&TrackedField::Prop("name".to_string())));
                assert!(fields.contains(&TrackedField::System("id")));
            }
            other => panic!("expected fields, got {other:?}"),
        }
        assert_eq!(requirements["c"], AliasRequirement::Whole);
    }

    #[test]
    fn whole_wins_over_fields() {
        let tracker = FieldTracker::new();
        {
            let ctx = ProjectionCtx::tracking(&tracker, true);
            let _ = ctx.alias("p").prop("name");
            let _ = ctx.alias("p").whole();
            let _ = ctx.alias("p").prop("age");
        }
        assert_eq!(tracker.requirements()["p"], AliasRequirement::Whole);
    }

    #[test]
    fn reading_prefers_selective_columns() {
        let mut row = DecodedRow::default();
        row.columns.insert("p_name".to_string(), json!("ada"));
        row.aliases.insert(
            "p".to_string(),
            json!({"id": "n1", "props": {"name": "shadowed", "age": 36}}),
        );
        let ctx = ProjectionCtx::reading(&row);
        assert_eq!(ctx.alias("p").prop("name"), json!("ada"));
        // Falls through to the whole-row object when no column exists.
        assert_eq!(ctx.alias("p").prop("age"), json!(36));
        assert_eq!(ctx.alias("p").id(), json!("n1"));
    }

    #[test]
    fn absent_optional_alias() {
        let mut row = DecodedRow::default();
        row.absent.insert("friend".to_string());
        let ctx = ProjectionCtx::reading(&row);
        assert!(!ctx.alias("friend").present());
        assert_eq!(ctx.alias("friend").whole(), JsonValue::Null);
    }

    #[test]
    fn two_pass_union() {
        let first = FieldTracker::new();
        {
            let ctx = ProjectionCtx::tracking(&first, true);
            if ctx.alias("f").present() {
                let _ = ctx.alias("f").prop("name");
            } else {
                let _ = ctx.alias("p").prop("fallback");
            }
        }
        let second = FieldTracker::new();
        {
            let ctx = ProjectionCtx::tracking(&second, false);
            if ctx.alias("f").present() {
                let _ = ctx.alias("f").prop("name");
            } else {
                let _ = ctx.alias("p").prop("fallback");
            }
        }
        first.absorb(second);
        let requirements = first.requirements();
        assert!(requirements.contains_key("f"));
        assert!(requirements.contains_key("p"));
    }
}
