// Backend contract.
// The storage engine and query executor speak to a SQL store exclusively
// through these traits. Adapters implement plain CRUD over the five tables;
// every graph-level rule (constraints, delete behavior, uniqueness lifecycle)
// lives above this line in the engine.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use std::sync::Arc;

use crate::dialect::SqlDialect;
use crate::sql::{SqlRow, SqlStatement, SqlValue};
use crate::types::{TableNames, TemporalMode};

/// A persisted node row.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeRow {
    pub graph_id: String,
    pub kind: String,
    pub id: String,
    pub props: JsonValue,
    pub version: i64,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_to: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// A persisted edge row. Endpoints are (kind, id) references into the nodes
/// table; no declared foreign keys back them.
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeRow {
    pub graph_id: String,
    pub id: String,
    pub kind: String,
    pub from_kind: String,
    pub from_id: String,
    pub to_kind: String,
    pub to_id: String,
    pub props: JsonValue,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_to: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// A uniqueness claim. A row with `deleted_at = NULL` guarantees at most one
/// live owner for (graph_id, node_kind, constraint_name, key).
#[derive(Debug, Clone, PartialEq)]
pub struct UniqueRow {
    pub graph_id: String,
    /// Namespace the key is claimed under: a kind name, a subclass-root kind
    /// name, or `*` for graph-scoped constraints.
    pub node_kind: String,
    pub constraint_name: String,
    pub key: String,
    pub node_id: String,
    /// The owner's concrete kind (may differ from `node_kind` under subclass
    /// or graph scoping).
    pub concrete_kind: String,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// One published schema version. Exactly one row per graph is active.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaVersionRow {
    pub graph_id: String,
    pub version: i64,
    pub schema_hash: String,
    pub schema_doc: JsonValue,
    pub created_at: DateTime<Utc>,
    pub is_active: bool,
}

/// Partial update applied to a node row. `None` leaves a column untouched;
/// the nested `Option` writes NULL.
#[derive(Debug, Clone, Default)]
pub struct NodePatch {
    pub props: Option<JsonValue>,
    pub bump_version: bool,
    pub updated_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<Option<DateTime<Utc>>>,
    pub valid_from: Option<Option<DateTime<Utc>>>,
    pub valid_to: Option<Option<DateTime<Utc>>>,
}

/// Partial update applied to an edge row.
#[derive(Debug, Clone, Default)]
pub struct EdgePatch {
    pub props: Option<JsonValue>,
    pub updated_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<Option<DateTime<Utc>>>,
    pub valid_from: Option<Option<DateTime<Utc>>>,
    pub valid_to: Option<Option<DateTime<Utc>>>,
}

/// Which rows a filtering operation sees.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TemporalFilter {
    pub mode: TemporalMode,
}

impl TemporalFilter {
    pub fn current() -> Self {
        Self {
            mode: TemporalMode::Current,
        }
    }

    pub fn as_of(at: DateTime<Utc>) -> Self {
        Self {
            mode: TemporalMode::AsOf(at),
        }
    }

    pub fn include_ended() -> Self {
        Self {
            mode: TemporalMode::IncludeEnded,
        }
    }

    pub fn include_tombstones() -> Self {
        Self {
            mode: TemporalMode::IncludeTombstones,
        }
    }
}

/// Shared visibility predicate. SQL adapters mirror this logic as WHERE
/// clauses; the in-memory backend evaluates it directly.
pub fn row_visible(
    filter: TemporalFilter,
    deleted_at: Option<DateTime<Utc>>,
    valid_from: Option<DateTime<Utc>>,
    valid_to: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> bool {
    let at = match filter.mode {
        TemporalMode::IncludeTombstones => return true,
        TemporalMode::IncludeEnded => return deleted_at.is_none(),
        TemporalMode::Current => now,
        TemporalMode::AsOf(at) => at,
    };
    deleted_at.is_none()
        && valid_from.map_or(true, |from| from <= at)
        && valid_to.map_or(true, |to| to > at)
}

/// Feature flags a backend reports at construction.
#[derive(Debug, Clone, Copy)]
pub struct BackendCapabilities {
    pub transactions: bool,
    pub returning: bool,
    pub partial_indexes: bool,
    pub gin_indexes: bool,
    pub cte: bool,
    pub jsonb: bool,
    /// Whether `execute` accepts compiled SQL (the query pipeline needs it).
    pub compiled_sql: bool,
}

/// The operation set the engine requires of a SQL store.
///
/// # Invariants
/// - Mutations are visible to subsequent calls on the same handle.
/// - Filtering operations apply the given temporal filter; they never
///   hard-code visibility on their own.
/// - Batch operations are chunked internally against the dialect's bind
///   limit; callers pass any size.
#[async_trait]
pub trait GraphBackend: Send + Sync {
    fn dialect(&self) -> SqlDialect;
    fn capabilities(&self) -> BackendCapabilities;
    fn table_names(&self) -> &TableNames;

    // --- nodes ---

    async fn insert_node(&self, row: NodeRow) -> Result<()>;

    /// Insert many rows, preserving input order. Empty input is a no-op.
    async fn insert_nodes_batch(&self, rows: Vec<NodeRow>) -> Result<()>;

    async fn get_node(
        &self,
        graph_id: &str,
        kind: &str,
        id: &str,
        filter: TemporalFilter,
    ) -> Result<Option<NodeRow>>;

    /// Fetch nodes by id, optionally restricted to one kind. Result order is
    /// unspecified; the engine re-orders.
    async fn get_nodes(
        &self,
        graph_id: &str,
        kind: Option<&str>,
        ids: &[String],
        filter: TemporalFilter,
    ) -> Result<Vec<NodeRow>>;

    /// Apply a patch and return the updated row, or `None` when no row
    /// matches (tombstoned rows still match; the engine decides).
    async fn update_node(
        &self,
        graph_id: &str,
        kind: &str,
        id: &str,
        patch: NodePatch,
    ) -> Result<Option<NodeRow>>;

    /// Physically remove one node row.
    async fn purge_node(&self, graph_id: &str, kind: &str, id: &str) -> Result<()>;

    async fn find_nodes_by_kind(
        &self,
        graph_id: &str,
        kinds: &[String],
        filter: TemporalFilter,
        limit: Option<u32>,
        offset: Option<u32>,
    ) -> Result<Vec<NodeRow>>;

    async fn count_nodes_by_kind(
        &self,
        graph_id: &str,
        kinds: &[String],
        filter: TemporalFilter,
    ) -> Result<u64>;

    // --- edges ---

    async fn insert_edge(&self, row: EdgeRow) -> Result<()>;

    async fn insert_edges_batch(&self, rows: Vec<EdgeRow>) -> Result<()>;

    async fn get_edge(
        &self,
        graph_id: &str,
        id: &str,
        filter: TemporalFilter,
    ) -> Result<Option<EdgeRow>>;

    async fn update_edge(
        &self,
        graph_id: &str,
        id: &str,
        patch: EdgePatch,
    ) -> Result<Option<EdgeRow>>;

    /// Physically remove one edge row.
    async fn purge_edge(&self, graph_id: &str, id: &str) -> Result<()>;

    async fn find_edges_by_kind(
        &self,
        graph_id: &str,
        kinds: &[String],
        filter: TemporalFilter,
        limit: Option<u32>,
        offset: Option<u32>,
    ) -> Result<Vec<EdgeRow>>;

    async fn count_edges_by_kind(
        &self,
        graph_id: &str,
        kinds: &[String],
        filter: TemporalFilter,
    ) -> Result<u64>;

    /// Count live outgoing edges of one kind from one node. With
    /// `active_only`, only edges with `valid_to IS NULL` count.
    async fn count_edges_from(
        &self,
        graph_id: &str,
        edge_kind: &str,
        from_kind: &str,
        from_id: &str,
        active_only: bool,
    ) -> Result<u64>;

    async fn edge_exists_between(
        &self,
        graph_id: &str,
        edge_kind: &str,
        from_kind: &str,
        from_id: &str,
        to_kind: &str,
        to_id: &str,
    ) -> Result<bool>;

    /// Edges matching a kind between two specific endpoints.
    async fn find_edges_between(
        &self,
        graph_id: &str,
        edge_kind: &str,
        from_kind: &str,
        from_id: &str,
        to_kind: &str,
        to_id: &str,
        filter: TemporalFilter,
    ) -> Result<Vec<EdgeRow>>;

    /// Edges incident to a node at either endpoint.
    async fn find_edges_connected_to(
        &self,
        graph_id: &str,
        node_kind: &str,
        node_id: &str,
        filter: TemporalFilter,
    ) -> Result<Vec<EdgeRow>>;

    /// Physically remove every edge incident to a node.
    async fn purge_edges_connected_to(
        &self,
        graph_id: &str,
        node_kind: &str,
        node_id: &str,
    ) -> Result<()>;

    // --- uniques ---

    /// Atomic claim-or-resurrect of a uniqueness key:
    ///
    /// - no row → insert with this owner, live;
    /// - row owned by this node → clear `deleted_at`, refresh concrete kind;
    /// - row soft-deleted → take ownership, clear `deleted_at`;
    /// - row live under another owner → leave unchanged.
    ///
    /// Returns the row's final owning node id; the engine raises a
    /// uniqueness error when it differs from the intended owner.
    async fn insert_unique(&self, row: UniqueRow) -> Result<String>;

    async fn check_unique(
        &self,
        graph_id: &str,
        node_kind: &str,
        constraint_name: &str,
        key: &str,
        filter: TemporalFilter,
    ) -> Result<Option<UniqueRow>>;

    async fn check_unique_batch(
        &self,
        graph_id: &str,
        node_kind: &str,
        constraint_name: &str,
        keys: &[String],
        filter: TemporalFilter,
    ) -> Result<Vec<UniqueRow>>;

    /// Soft-delete one uniqueness claim so the key becomes reusable.
    async fn delete_unique(
        &self,
        graph_id: &str,
        node_kind: &str,
        constraint_name: &str,
        key: &str,
        deleted_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Soft-delete every claim owned by a node.
    async fn release_uniques_for_node(
        &self,
        graph_id: &str,
        node_id: &str,
        deleted_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Physically remove every claim owned by a node.
    async fn purge_uniques_for_node(&self, graph_id: &str, node_id: &str) -> Result<()>;

    // --- embeddings (orthogonal table, same soft-delete discipline) ---

    /// Physically remove embedding rows for a node.
    async fn purge_embeddings_for_node(
        &self,
        graph_id: &str,
        node_kind: &str,
        node_id: &str,
    ) -> Result<()>;

    // --- schema versions ---

    async fn insert_schema(&self, row: SchemaVersionRow) -> Result<()>;

    async fn get_active_schema(&self, graph_id: &str) -> Result<Option<SchemaVersionRow>>;

    async fn get_schema_version(
        &self,
        graph_id: &str,
        version: i64,
    ) -> Result<Option<SchemaVersionRow>>;

    /// Mark one version active and every other version inactive, preserving
    /// the at-most-one-active invariant.
    async fn set_active_schema(&self, graph_id: &str, version: i64) -> Result<()>;

    // --- maintenance ---

    /// Delete all rows of one graph in dependency order: embeddings,
    /// uniques, edges, nodes, schema versions.
    async fn clear_graph(&self, graph_id: &str) -> Result<()>;

    // --- execution ---

    /// Run compiled SQL and return decoded rows. Backends without
    /// `capabilities().compiled_sql` reject this.
    async fn execute(&self, statement: SqlStatement) -> Result<Vec<SqlRow>>;

    /// Prepared-query fast path; defaults to `execute`.
    async fn execute_raw(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>> {
        self.execute(SqlStatement::new(sql.to_string(), params.to_vec()))
            .await
    }

    // --- lifecycle ---

    /// Begin a transaction and return a transaction-scoped view. The view
    /// must not outlive its commit/rollback; later calls on it fail.
    async fn begin(&self) -> Result<Arc<dyn GraphTransaction>>;

    async fn close(&self) -> Result<()>;
}

/// A transaction-scoped backend view.
#[async_trait]
pub trait GraphTransaction: GraphBackend {
    async fn commit(&self) -> Result<()>;
    async fn rollback(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).single().unwrap()
    }

    #[test]
    fn visibility_modes() {
        let now = ts(10_000);
        // Live, unbounded validity: visible everywhere.
        assert!(row_visible(TemporalFilter::current(), None, None, None, now));

        // Tombstoned rows only show under include_tombstones.
        let deleted = Some(ts(5_000));
        assert!(!row_visible(TemporalFilter::current(), deleted, None, None, now));
        assert!(!row_visible(
            TemporalFilter::include_ended(),
            deleted,
            None,
            None,
            now
        ));
        assert!(row_visible(
            TemporalFilter::include_tombstones(),
            deleted,
            None,
            None,
            now
        ));

        // Ended validity hides under current but not include_ended.
        let ended = Some(ts(8_000));
        assert!(!row_visible(TemporalFilter::current(), None, None, ended, now));
        assert!(row_visible(
            TemporalFilter::include_ended(),
            None,
            None,
            ended,
            now
        ));

        // as_of sees the interval that contained the instant.
        assert!(row_visible(
            TemporalFilter::as_of(ts(7_000)),
            None,
            Some(ts(6_000)),
            ended,
            now
        ));
        assert!(!row_visible(
            TemporalFilter::as_of(ts(9_000)),
            None,
            Some(ts(6_000)),
            ended,
            now
        ));
    }
}
