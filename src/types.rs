// Validated core types.
// Strongly-typed wrappers that cannot be constructed with invalid data, so
// downstream code never re-checks graph ids, kind names, or table names.

use anyhow::{bail, ensure, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::errors::TypeGraphError;

/// Reserved namespace used for graph-scoped uniqueness constraints.
pub const GRAPH_SCOPE_NAMESPACE: &str = "*";

/// Identifier of a graph within a shared store.
///
/// # Invariants
/// - Non-empty after trimming
/// - Length <= 128 characters
/// - No control characters
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GraphId {
    inner: String,
}

impl GraphId {
    const MAX_LENGTH: usize = 128;

    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        let trimmed = id.trim();
        ensure!(!trimmed.is_empty(), "graph id cannot be empty");
        ensure!(
            trimmed.len() <= Self::MAX_LENGTH,
            "graph id exceeds maximum length of {} characters",
            Self::MAX_LENGTH
        );
        ensure!(
            !trimmed.chars().any(|c| c.is_control()),
            "graph id cannot contain control characters"
        );
        Ok(Self {
            inner: trimmed.to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.inner
    }
}

impl fmt::Display for GraphId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

/// Opaque id of a node or edge. Ids are collision-resistant strings; callers
/// may supply their own or let the engine generate one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId {
    inner: String,
}

impl EntityId {
    const MAX_LENGTH: usize = 256;

    /// Generate a fresh collision-resistant id.
    pub fn generate() -> Self {
        Self {
            inner: Uuid::new_v4().simple().to_string(),
        }
    }

    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        ensure!(!id.is_empty(), "entity id cannot be empty");
        ensure!(
            id.len() <= Self::MAX_LENGTH,
            "entity id exceeds maximum length of {} characters",
            Self::MAX_LENGTH
        );
        ensure!(
            !id.chars().any(|c| c.is_control()),
            "entity id cannot contain control characters"
        );
        Ok(Self { inner: id })
    }

    pub fn as_str(&self) -> &str {
        &self.inner
    }

    pub fn into_string(self) -> String {
        self.inner
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

/// A declared kind name for nodes or edges (e.g. `Person`, `worksAt`).
///
/// # Invariants
/// - First character is an ASCII letter
/// - Remaining characters are ASCII alphanumeric or `_`
/// - Length <= 128 characters
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KindName {
    inner: String,
}

impl KindName {
    const MAX_LENGTH: usize = 128;

    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        ensure!(!name.is_empty(), "kind name cannot be empty");
        ensure!(
            name.len() <= Self::MAX_LENGTH,
            "kind name '{}' exceeds maximum length of {} characters",
            name,
            Self::MAX_LENGTH
        );
        let mut chars = name.chars();
        let first = chars.next().unwrap();
        ensure!(
            first.is_ascii_alphabetic(),
            "kind name '{}' must start with an ASCII letter",
            name
        );
        ensure!(
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_'),
            "kind name '{}' may only contain ASCII letters, digits and '_'",
            name
        );
        Ok(Self { inner: name })
    }

    pub fn as_str(&self) -> &str {
        &self.inner
    }
}

impl fmt::Display for KindName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

/// Names of the five tables backing one store. Multiple graphs may share the
/// tables; a store may also point each graph at its own set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableNames {
    pub nodes: String,
    pub edges: String,
    pub uniques: String,
    pub schema_versions: String,
    pub embeddings: String,
}

impl Default for TableNames {
    fn default() -> Self {
        Self {
            nodes: "nodes".to_string(),
            edges: "edges".to_string(),
            uniques: "uniques".to_string(),
            schema_versions: "schema_versions".to_string(),
            embeddings: "embeddings".to_string(),
        }
    }
}

impl TableNames {
    const MAX_LENGTH: usize = 63;

    /// Validate every table name against `^[A-Za-z_][A-Za-z0-9_$]*$` with a
    /// 63-character limit. Invalid names are a configuration fault.
    pub fn validate(&self) -> Result<()> {
        for name in [
            &self.nodes,
            &self.edges,
            &self.uniques,
            &self.schema_versions,
            &self.embeddings,
        ] {
            if !Self::is_valid_name(name) {
                bail!(TypeGraphError::configuration(format!(
                    "invalid table name '{name}'"
                )));
            }
        }
        let mut names = [
            self.nodes.as_str(),
            self.edges.as_str(),
            self.uniques.as_str(),
            self.schema_versions.as_str(),
            self.embeddings.as_str(),
        ];
        names.sort_unstable();
        if names.windows(2).any(|w| w[0] == w[1]) {
            bail!(TypeGraphError::configuration("table names must be distinct"));
        }
        Ok(())
    }

    fn is_valid_name(name: &str) -> bool {
        if name.is_empty() || name.len() > Self::MAX_LENGTH {
            return false;
        }
        let mut chars = name.chars();
        let first = chars.next().unwrap();
        if !(first.is_ascii_alphabetic() || first == '_') {
            return false;
        }
        chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
    }
}

/// The reader's choice of which rows are visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "mode", content = "at")]
pub enum TemporalMode {
    /// Live rows whose validity interval contains now (default).
    #[default]
    Current,
    /// Live rows whose validity interval contained the given instant.
    AsOf(DateTime<Utc>),
    /// Live rows regardless of validity interval.
    IncludeEnded,
    /// Every row, soft-deleted ones included.
    IncludeTombstones,
}

/// Bitemporal validity interval carried by nodes and edges.
///
/// `valid_to` of `None` means the row is live indefinitely.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validity {
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_to: Option<DateTime<Utc>>,
}

impl Validity {
    pub fn new(valid_from: Option<DateTime<Utc>>, valid_to: Option<DateTime<Utc>>) -> Result<Self> {
        if let (Some(from), Some(to)) = (valid_from, valid_to) {
            ensure!(to >= from, "valid_to must not precede valid_from");
        }
        Ok(Self {
            valid_from,
            valid_to,
        })
    }

    pub fn is_unbounded(&self) -> bool {
        self.valid_from.is_none() && self.valid_to.is_none()
    }
}

/// Millisecond-precision timestamp conversions. Both SQL dialects persist
/// instants as milliseconds-since-epoch BIGINT so row decoding is uniform.
pub fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graph_id_rejects_empty_and_control() {
        assert!(GraphId::new("  ").is_err());
        assert!(GraphId::new("a\u{0001}b").is_err());
        assert_eq!(GraphId::new(" g1 ").unwrap().as_str(), "g1");
    }

    #[test]
    fn kind_name_shape() {
        assert!(KindName::new("Person").is_ok());
        assert!(KindName::new("works_at2").is_ok());
        assert!(KindName::new("2bad").is_err());
        assert!(KindName::new("*").is_err());
        assert!(KindName::new("has-part").is_err());
    }

    #[test]
    fn table_names_validation() {
        assert!(TableNames::default().validate().is_ok());

        let mut custom = TableNames::default();
        custom.nodes = "my_nodes$2".to_string();
        assert!(custom.validate().is_ok());

        custom.nodes = "1nodes".to_string();
        assert!(custom.validate().is_err());

        custom.nodes = "x".repeat(64);
        assert!(custom.validate().is_err());

        custom.nodes = "edges".to_string();
        assert!(custom.validate().is_err());
    }

    #[test]
    fn validity_ordering() {
        let a = Utc.timestamp_millis_opt(1_000).single().unwrap();
        let b = Utc.timestamp_millis_opt(2_000).single().unwrap();
        assert!(Validity::new(Some(b), Some(a)).is_err());
        assert!(Validity::new(Some(a), Some(b)).is_ok());
        assert!(Validity::new(Some(a), None).is_ok());
    }

    #[test]
    fn millis_round_trip() {
        let now = Utc::now();
        let back = from_millis(to_millis(now));
        assert_eq!(to_millis(now), to_millis(back));
    }

    #[test]
    fn generated_ids_are_distinct() {
        assert_ne!(EntityId::generate(), EntityId::generate());
    }
}
