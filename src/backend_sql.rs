// Shared statement builders for the SQL backend adapters.
// Both sqlx adapters emit the same statement shapes; only placeholders,
// boolean literals, and the JSON payload column type differ, and those come
// from the dialect strategy. Row decoding is shared too: SqlRow accessors
// normalize TEXT and JSONB payloads behind one interface.

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::contracts::{
    EdgePatch, EdgeRow, NodePatch, NodeRow, SchemaVersionRow, TemporalFilter, UniqueRow,
};
use crate::dialect::SqlDialect;
use crate::sql::{SqlRow, SqlStatement, SqlValue};
use crate::types::{from_millis, to_millis, TableNames, TemporalMode};

pub(crate) struct StatementBuilder {
    dialect: SqlDialect,
    sql: String,
    params: Vec<SqlValue>,
}

impl StatementBuilder {
    pub(crate) fn new(dialect: SqlDialect) -> Self {
        Self {
            dialect,
            sql: String::new(),
            params: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, text: &str) -> &mut Self {
        self.sql.push_str(text);
        self
    }

    /// Bind a value and append its placeholder.
    pub(crate) fn bind(&mut self, value: SqlValue) -> &mut Self {
        self.params.push(value);
        let placeholder = self.dialect.placeholder(self.params.len());
        self.sql.push_str(&placeholder);
        self
    }

    /// Append a comma-separated placeholder list.
    pub(crate) fn bind_list(&mut self, values: impl IntoIterator<Item = SqlValue>) -> &mut Self {
        let mut first = true;
        for value in values {
            if !first {
                self.sql.push_str(", ");
            }
            first = false;
            self.bind(value);
        }
        self
    }

    pub(crate) fn finish(self) -> SqlStatement {
        SqlStatement::new(self.sql, self.params)
    }
}

fn ts(value: Option<DateTime<Utc>>) -> SqlValue {
    match value {
        Some(at) => SqlValue::Int(to_millis(at)),
        None => SqlValue::Null,
    }
}

fn kinds_list(kinds: &[String]) -> impl Iterator<Item = SqlValue> + '_ {
    kinds.iter().map(|kind| SqlValue::Text(kind.clone()))
}

/// Append the temporal visibility predicate for rows carrying
/// deleted_at/valid_from/valid_to columns.
fn temporal(b: &mut StatementBuilder, filter: TemporalFilter) {
    match filter.mode {
        TemporalMode::IncludeTombstones => {}
        TemporalMode::IncludeEnded => {
            b.push(" AND deleted_at IS NULL");
        }
        TemporalMode::Current | TemporalMode::AsOf(_) => {
            let at = match filter.mode {
                TemporalMode::AsOf(at) => at,
                _ => Utc::now(),
            };
            b.push(" AND deleted_at IS NULL AND (valid_from IS NULL OR valid_from <= ");
            b.bind(SqlValue::Int(to_millis(at)));
            b.push(") AND (valid_to IS NULL OR valid_to > ");
            b.bind(SqlValue::Int(to_millis(at)));
            b.push(")");
        }
    }
}

/// Soft-delete-only visibility for uniques rows (no validity columns).
fn unique_visibility(b: &mut StatementBuilder, filter: TemporalFilter) {
    if !matches!(filter.mode, TemporalMode::IncludeTombstones) {
        b.push(" AND deleted_at IS NULL");
    }
}

// --- DDL ---

/// Bootstrap DDL for the five tables plus the indexes the engine leans on.
pub(crate) fn ddl(dialect: SqlDialect, t: &TableNames) -> Vec<String> {
    let (json_type, bool_type) = match dialect {
        SqlDialect::Sqlite => ("TEXT", "INTEGER"),
        SqlDialect::Postgres => ("JSONB", "BOOLEAN"),
    };
    let mut out = vec![
        format!(
            "CREATE TABLE IF NOT EXISTS {nodes} (\
             graph_id TEXT NOT NULL, kind TEXT NOT NULL, id TEXT NOT NULL, \
             props {json_type} NOT NULL, version BIGINT NOT NULL, \
             valid_from BIGINT, valid_to BIGINT, \
             created_at BIGINT NOT NULL, updated_at BIGINT NOT NULL, deleted_at BIGINT, \
             PRIMARY KEY (graph_id, kind, id))",
            nodes = t.nodes
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {edges} (\
             graph_id TEXT NOT NULL, id TEXT NOT NULL, kind TEXT NOT NULL, \
             from_kind TEXT NOT NULL, from_id TEXT NOT NULL, \
             to_kind TEXT NOT NULL, to_id TEXT NOT NULL, \
             props {json_type} NOT NULL, \
             valid_from BIGINT, valid_to BIGINT, \
             created_at BIGINT NOT NULL, updated_at BIGINT NOT NULL, deleted_at BIGINT, \
             PRIMARY KEY (graph_id, id))",
            edges = t.edges
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {uniques} (\
             graph_id TEXT NOT NULL, node_kind TEXT NOT NULL, \
             constraint_name TEXT NOT NULL, key TEXT NOT NULL, \
             node_id TEXT NOT NULL, concrete_kind TEXT NOT NULL, deleted_at BIGINT, \
             PRIMARY KEY (graph_id, node_kind, constraint_name, key))",
            uniques = t.uniques
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {schema_versions} (\
             graph_id TEXT NOT NULL, version BIGINT NOT NULL, \
             schema_hash TEXT NOT NULL, schema_doc {json_type} NOT NULL, \
             created_at BIGINT NOT NULL, is_active {bool_type} NOT NULL, \
             PRIMARY KEY (graph_id, version))",
            schema_versions = t.schema_versions
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {embeddings} (\
             graph_id TEXT NOT NULL, node_kind TEXT NOT NULL, node_id TEXT NOT NULL, \
             field_path TEXT NOT NULL, vector {json_type} NOT NULL, dims BIGINT NOT NULL, \
             deleted_at BIGINT, \
             PRIMARY KEY (graph_id, node_kind, node_id, field_path))",
            embeddings = t.embeddings
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {edges}_from_ix ON {edges} (graph_id, kind, from_kind, from_id)",
            edges = t.edges
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {edges}_to_ix ON {edges} (graph_id, kind, to_kind, to_id)",
            edges = t.edges
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {uniques}_owner_ix ON {uniques} (graph_id, node_id)",
            uniques = t.uniques
        ),
    ];
    // Both engines support partial indexes; keep the one-active-schema
    // invariant declared where the data lives.
    out.push(format!(
        "CREATE UNIQUE INDEX IF NOT EXISTS {sv}_active_ix ON {sv} (graph_id) WHERE is_active = {true_lit}",
        sv = t.schema_versions,
        true_lit = dialect.bool_literal(true),
    ));
    out
}

// --- nodes ---

const NODE_COLS: &str =
    "graph_id, kind, id, props, version, valid_from, valid_to, created_at, updated_at, deleted_at";

fn bind_node_values(b: &mut StatementBuilder, row: &NodeRow) {
    b.push("(");
    b.bind_list([
        SqlValue::Text(row.graph_id.clone()),
        SqlValue::Text(row.kind.clone()),
        SqlValue::Text(row.id.clone()),
        SqlValue::Json(row.props.clone()),
        SqlValue::Int(row.version),
        ts(row.valid_from),
        ts(row.valid_to),
        ts(Some(row.created_at)),
        ts(Some(row.updated_at)),
        ts(row.deleted_at),
    ]);
    b.push(")");
}

pub(crate) fn insert_node(dialect: SqlDialect, t: &TableNames, row: &NodeRow) -> SqlStatement {
    let mut b = StatementBuilder::new(dialect);
    b.push(&format!("INSERT INTO {} ({NODE_COLS}) VALUES ", t.nodes));
    bind_node_values(&mut b, row);
    b.finish()
}

/// Multi-row inserts, chunked against the dialect's bind-parameter limit.
pub(crate) fn insert_nodes_batch(
    dialect: SqlDialect,
    t: &TableNames,
    rows: &[NodeRow],
) -> Vec<SqlStatement> {
    let chunk_rows = dialect.batch_chunk_rows(10);
    rows.chunks(chunk_rows)
        .map(|chunk| {
            let mut b = StatementBuilder::new(dialect);
            b.push(&format!("INSERT INTO {} ({NODE_COLS}) VALUES ", t.nodes));
            for (i, row) in chunk.iter().enumerate() {
                if i > 0 {
                    b.push(", ");
                }
                bind_node_values(&mut b, row);
            }
            b.finish()
        })
        .collect()
}

pub(crate) fn get_node(
    dialect: SqlDialect,
    t: &TableNames,
    graph_id: &str,
    kind: &str,
    id: &str,
    filter: TemporalFilter,
) -> SqlStatement {
    let mut b = StatementBuilder::new(dialect);
    b.push(&format!("SELECT {NODE_COLS} FROM {} WHERE graph_id = ", t.nodes));
    b.bind(SqlValue::Text(graph_id.to_string()));
    b.push(" AND kind = ");
    b.bind(SqlValue::Text(kind.to_string()));
    b.push(" AND id = ");
    b.bind(SqlValue::Text(id.to_string()));
    temporal(&mut b, filter);
    b.finish()
}

pub(crate) fn get_nodes(
    dialect: SqlDialect,
    t: &TableNames,
    graph_id: &str,
    kind: Option<&str>,
    ids: &[String],
    filter: TemporalFilter,
) -> Vec<SqlStatement> {
    // Roughly ten slots are taken by the fixed predicates.
    let chunk = (dialect.max_bind_params() - 10).max(1);
    ids.chunks(chunk)
        .map(|ids| {
            let mut b = StatementBuilder::new(dialect);
            b.push(&format!("SELECT {NODE_COLS} FROM {} WHERE graph_id = ", t.nodes));
            b.bind(SqlValue::Text(graph_id.to_string()));
            if let Some(kind) = kind {
                b.push(" AND kind = ");
                b.bind(SqlValue::Text(kind.to_string()));
            }
            b.push(" AND id IN (");
            b.bind_list(ids.iter().map(|id| SqlValue::Text(id.clone())));
            b.push(")");
            temporal(&mut b, filter);
            b.finish()
        })
        .collect()
}

pub(crate) fn update_node(
    dialect: SqlDialect,
    t: &TableNames,
    graph_id: &str,
    kind: &str,
    id: &str,
    patch: &NodePatch,
) -> SqlStatement {
    let mut b = StatementBuilder::new(dialect);
    b.push(&format!("UPDATE {} SET ", t.nodes));
    let mut first = true;
    let mut set = |b: &mut StatementBuilder, column: &str, value: SqlValue, first: &mut bool| {
        if !*first {
            b.push(", ");
        }
        *first = false;
        b.push(column);
        b.push(" = ");
        b.bind(value);
    };
    if let Some(props) = &patch.props {
        set(&mut b, "props", SqlValue::Json(props.clone()), &mut first);
    }
    if let Some(updated_at) = patch.updated_at {
        set(&mut b, "updated_at", ts(Some(updated_at)), &mut first);
    }
    if let Some(deleted_at) = patch.deleted_at {
        set(&mut b, "deleted_at", ts(deleted_at), &mut first);
    }
    if let Some(valid_from) = patch.valid_from {
        set(&mut b, "valid_from", ts(valid_from), &mut first);
    }
    if let Some(valid_to) = patch.valid_to {
        set(&mut b, "valid_to", ts(valid_to), &mut first);
    }
    if patch.bump_version {
        if !first {
            b.push(", ");
        }
        first = false;
        b.push("version = version + 1");
    }
    if first {
        // Nothing to change; still touch the row so RETURNING yields it.
        b.push("version = version");
    }
    b.push(" WHERE graph_id = ");
    b.bind(SqlValue::Text(graph_id.to_string()));
    b.push(" AND kind = ");
    b.bind(SqlValue::Text(kind.to_string()));
    b.push(" AND id = ");
    b.bind(SqlValue::Text(id.to_string()));
    b.push(&format!(" RETURNING {NODE_COLS}"));
    b.finish()
}

pub(crate) fn purge_node(
    dialect: SqlDialect,
    t: &TableNames,
    graph_id: &str,
    kind: &str,
    id: &str,
) -> SqlStatement {
    let mut b = StatementBuilder::new(dialect);
    b.push(&format!("DELETE FROM {} WHERE graph_id = ", t.nodes));
    b.bind(SqlValue::Text(graph_id.to_string()));
    b.push(" AND kind = ");
    b.bind(SqlValue::Text(kind.to_string()));
    b.push(" AND id = ");
    b.bind(SqlValue::Text(id.to_string()));
    b.finish()
}

pub(crate) fn find_nodes_by_kind(
    dialect: SqlDialect,
    t: &TableNames,
    graph_id: &str,
    kinds: &[String],
    filter: TemporalFilter,
    limit: Option<u32>,
    offset: Option<u32>,
) -> SqlStatement {
    let mut b = StatementBuilder::new(dialect);
    b.push(&format!("SELECT {NODE_COLS} FROM {} WHERE graph_id = ", t.nodes));
    b.bind(SqlValue::Text(graph_id.to_string()));
    b.push(" AND kind IN (");
    b.bind_list(kinds_list(kinds));
    b.push(")");
    temporal(&mut b, filter);
    b.push(" ORDER BY kind, id");
    if let Some(limit) = limit {
        b.push(&format!(" LIMIT {limit}"));
    }
    if let Some(offset) = offset {
        b.push(&format!(" OFFSET {offset}"));
    }
    b.finish()
}

pub(crate) fn count_nodes_by_kind(
    dialect: SqlDialect,
    t: &TableNames,
    graph_id: &str,
    kinds: &[String],
    filter: TemporalFilter,
) -> SqlStatement {
    let mut b = StatementBuilder::new(dialect);
    b.push(&format!("SELECT COUNT(*) AS n FROM {} WHERE graph_id = ", t.nodes));
    b.bind(SqlValue::Text(graph_id.to_string()));
    b.push(" AND kind IN (");
    b.bind_list(kinds_list(kinds));
    b.push(")");
    temporal(&mut b, filter);
    b.finish()
}

// --- edges ---

const EDGE_COLS: &str = "graph_id, id, kind, from_kind, from_id, to_kind, to_id, props, \
                         valid_from, valid_to, created_at, updated_at, deleted_at";

fn bind_edge_values(b: &mut StatementBuilder, row: &EdgeRow) {
    b.push("(");
    b.bind_list([
        SqlValue::Text(row.graph_id.clone()),
        SqlValue::Text(row.id.clone()),
        SqlValue::Text(row.kind.clone()),
        SqlValue::Text(row.from_kind.clone()),
        SqlValue::Text(row.from_id.clone()),
        SqlValue::Text(row.to_kind.clone()),
        SqlValue::Text(row.to_id.clone()),
        SqlValue::Json(row.props.clone()),
        ts(row.valid_from),
        ts(row.valid_to),
        ts(Some(row.created_at)),
        ts(Some(row.updated_at)),
        ts(row.deleted_at),
    ]);
    b.push(")");
}

pub(crate) fn insert_edge(dialect: SqlDialect, t: &TableNames, row: &EdgeRow) -> SqlStatement {
    let mut b = StatementBuilder::new(dialect);
    b.push(&format!("INSERT INTO {} ({EDGE_COLS}) VALUES ", t.edges));
    bind_edge_values(&mut b, row);
    b.finish()
}

pub(crate) fn insert_edges_batch(
    dialect: SqlDialect,
    t: &TableNames,
    rows: &[EdgeRow],
) -> Vec<SqlStatement> {
    let chunk_rows = dialect.batch_chunk_rows(13);
    rows.chunks(chunk_rows)
        .map(|chunk| {
            let mut b = StatementBuilder::new(dialect);
            b.push(&format!("INSERT INTO {} ({EDGE_COLS}) VALUES ", t.edges));
            for (i, row) in chunk.iter().enumerate() {
                if i > 0 {
                    b.push(", ");
                }
                bind_edge_values(&mut b, row);
            }
            b.finish()
        })
        .collect()
}

pub(crate) fn get_edge(
    dialect: SqlDialect,
    t: &TableNames,
    graph_id: &str,
    id: &str,
    filter: TemporalFilter,
) -> SqlStatement {
    let mut b = StatementBuilder::new(dialect);
    b.push(&format!("SELECT {EDGE_COLS} FROM {} WHERE graph_id = ", t.edges));
    b.bind(SqlValue::Text(graph_id.to_string()));
    b.push(" AND id = ");
    b.bind(SqlValue::Text(id.to_string()));
    temporal(&mut b, filter);
    b.finish()
}

pub(crate) fn update_edge(
    dialect: SqlDialect,
    t: &TableNames,
    graph_id: &str,
    id: &str,
    patch: &EdgePatch,
) -> SqlStatement {
    let mut b = StatementBuilder::new(dialect);
    b.push(&format!("UPDATE {} SET ", t.edges));
    let mut first = true;
    let mut set = |b: &mut StatementBuilder, column: &str, value: SqlValue, first: &mut bool| {
        if !*first {
            b.push(", ");
        }
        *first = false;
        b.push(column);
        b.push(" = ");
        b.bind(value);
    };
    if let Some(props) = &patch.props {
        set(&mut b, "props", SqlValue::Json(props.clone()), &mut first);
    }
    if let Some(updated_at) = patch.updated_at {
        set(&mut b, "updated_at", ts(Some(updated_at)), &mut first);
    }
    if let Some(deleted_at) = patch.deleted_at {
        set(&mut b, "deleted_at", ts(deleted_at), &mut first);
    }
    if let Some(valid_from) = patch.valid_from {
        set(&mut b, "valid_from", ts(valid_from), &mut first);
    }
    if let Some(valid_to) = patch.valid_to {
        set(&mut b, "valid_to", ts(valid_to), &mut first);
    }
    if first {
        b.push("id = id");
    }
    b.push(" WHERE graph_id = ");
    b.bind(SqlValue::Text(graph_id.to_string()));
    b.push(" AND id = ");
    b.bind(SqlValue::Text(id.to_string()));
    b.push(&format!(" RETURNING {EDGE_COLS}"));
    b.finish()
}

pub(crate) fn purge_edge(
    dialect: SqlDialect,
    t: &TableNames,
    graph_id: &str,
    id: &str,
) -> SqlStatement {
    let mut b = StatementBuilder::new(dialect);
    b.push(&format!("DELETE FROM {} WHERE graph_id = ", t.edges));
    b.bind(SqlValue::Text(graph_id.to_string()));
    b.push(" AND id = ");
    b.bind(SqlValue::Text(id.to_string()));
    b.finish()
}

pub(crate) fn find_edges_by_kind(
    dialect: SqlDialect,
    t: &TableNames,
    graph_id: &str,
    kinds: &[String],
    filter: TemporalFilter,
    limit: Option<u32>,
    offset: Option<u32>,
) -> SqlStatement {
    let mut b = StatementBuilder::new(dialect);
    b.push(&format!("SELECT {EDGE_COLS} FROM {} WHERE graph_id = ", t.edges));
    b.bind(SqlValue::Text(graph_id.to_string()));
    b.push(" AND kind IN (");
    b.bind_list(kinds_list(kinds));
    b.push(")");
    temporal(&mut b, filter);
    b.push(" ORDER BY kind, id");
    if let Some(limit) = limit {
        b.push(&format!(" LIMIT {limit}"));
    }
    if let Some(offset) = offset {
        b.push(&format!(" OFFSET {offset}"));
    }
    b.finish()
}

pub(crate) fn count_edges_by_kind(
    dialect: SqlDialect,
    t: &TableNames,
    graph_id: &str,
    kinds: &[String],
    filter: TemporalFilter,
) -> SqlStatement {
    let mut b = StatementBuilder::new(dialect);
    b.push(&format!("SELECT COUNT(*) AS n FROM {} WHERE graph_id = ", t.edges));
    b.bind(SqlValue::Text(graph_id.to_string()));
    b.push(" AND kind IN (");
    b.bind_list(kinds_list(kinds));
    b.push(")");
    temporal(&mut b, filter);
    b.finish()
}

pub(crate) fn count_edges_from(
    dialect: SqlDialect,
    t: &TableNames,
    graph_id: &str,
    edge_kind: &str,
    from_kind: &str,
    from_id: &str,
    active_only: bool,
) -> SqlStatement {
    let mut b = StatementBuilder::new(dialect);
    b.push(&format!("SELECT COUNT(*) AS n FROM {} WHERE graph_id = ", t.edges));
    b.bind(SqlValue::Text(graph_id.to_string()));
    b.push(" AND kind = ");
    b.bind(SqlValue::Text(edge_kind.to_string()));
    b.push(" AND from_kind = ");
    b.bind(SqlValue::Text(from_kind.to_string()));
    b.push(" AND from_id = ");
    b.bind(SqlValue::Text(from_id.to_string()));
    b.push(" AND deleted_at IS NULL");
    if active_only {
        b.push(" AND valid_to IS NULL");
    }
    b.finish()
}

pub(crate) fn find_edges_between(
    dialect: SqlDialect,
    t: &TableNames,
    graph_id: &str,
    edge_kind: &str,
    from_kind: &str,
    from_id: &str,
    to_kind: &str,
    to_id: &str,
    filter: TemporalFilter,
) -> SqlStatement {
    let mut b = StatementBuilder::new(dialect);
    b.push(&format!("SELECT {EDGE_COLS} FROM {} WHERE graph_id = ", t.edges));
    b.bind(SqlValue::Text(graph_id.to_string()));
    b.push(" AND kind = ");
    b.bind(SqlValue::Text(edge_kind.to_string()));
    b.push(" AND from_kind = ");
    b.bind(SqlValue::Text(from_kind.to_string()));
    b.push(" AND from_id = ");
    b.bind(SqlValue::Text(from_id.to_string()));
    b.push(" AND to_kind = ");
    b.bind(SqlValue::Text(to_kind.to_string()));
    b.push(" AND to_id = ");
    b.bind(SqlValue::Text(to_id.to_string()));
    temporal(&mut b, filter);
    b.finish()
}

pub(crate) fn find_edges_connected_to(
    dialect: SqlDialect,
    t: &TableNames,
    graph_id: &str,
    node_kind: &str,
    node_id: &str,
    filter: TemporalFilter,
) -> SqlStatement {
    let mut b = StatementBuilder::new(dialect);
    b.push(&format!("SELECT {EDGE_COLS} FROM {} WHERE graph_id = ", t.edges));
    b.bind(SqlValue::Text(graph_id.to_string()));
    b.push(" AND ((from_kind = ");
    b.bind(SqlValue::Text(node_kind.to_string()));
    b.push(" AND from_id = ");
    b.bind(SqlValue::Text(node_id.to_string()));
    b.push(") OR (to_kind = ");
    b.bind(SqlValue::Text(node_kind.to_string()));
    b.push(" AND to_id = ");
    b.bind(SqlValue::Text(node_id.to_string()));
    b.push("))");
    temporal(&mut b, filter);
    b.finish()
}

pub(crate) fn purge_edges_connected_to(
    dialect: SqlDialect,
    t: &TableNames,
    graph_id: &str,
    node_kind: &str,
    node_id: &str,
) -> SqlStatement {
    let mut b = StatementBuilder::new(dialect);
    b.push(&format!("DELETE FROM {} WHERE graph_id = ", t.edges));
    b.bind(SqlValue::Text(graph_id.to_string()));
    b.push(" AND ((from_kind = ");
    b.bind(SqlValue::Text(node_kind.to_string()));
    b.push(" AND from_id = ");
    b.bind(SqlValue::Text(node_id.to_string()));
    b.push(") OR (to_kind = ");
    b.bind(SqlValue::Text(node_kind.to_string()));
    b.push(" AND to_id = ");
    b.bind(SqlValue::Text(node_id.to_string()));
    b.push("))");
    b.finish()
}

// --- uniques ---

const UNIQUE_COLS: &str =
    "graph_id, node_kind, constraint_name, key, node_id, concrete_kind, deleted_at";

/// The atomic claim-or-resurrect upsert. A single INSERT .. ON CONFLICT DO
/// UPDATE with RETURNING, so there is no read-then-write race: ownership
/// transfers only when the existing row is soft-deleted or already ours.
pub(crate) fn insert_unique(dialect: SqlDialect, t: &TableNames, row: &UniqueRow) -> SqlStatement {
    let u = &t.uniques;
    let mut b = StatementBuilder::new(dialect);
    b.push(&format!("INSERT INTO {u} ({UNIQUE_COLS}) VALUES ("));
    b.bind_list([
        SqlValue::Text(row.graph_id.clone()),
        SqlValue::Text(row.node_kind.clone()),
        SqlValue::Text(row.constraint_name.clone()),
        SqlValue::Text(row.key.clone()),
        SqlValue::Text(row.node_id.clone()),
        SqlValue::Text(row.concrete_kind.clone()),
        ts(row.deleted_at),
    ]);
    b.push(&format!(
        ") ON CONFLICT (graph_id, node_kind, constraint_name, key) DO UPDATE SET \
         node_id = CASE WHEN {u}.deleted_at IS NOT NULL OR {u}.node_id = excluded.node_id \
         THEN excluded.node_id ELSE {u}.node_id END, \
         concrete_kind = CASE WHEN {u}.deleted_at IS NOT NULL OR {u}.node_id = excluded.node_id \
         THEN excluded.concrete_kind ELSE {u}.concrete_kind END, \
         deleted_at = CASE WHEN {u}.deleted_at IS NOT NULL OR {u}.node_id = excluded.node_id \
         THEN NULL ELSE {u}.deleted_at END \
         RETURNING node_id"
    ));
    b.finish()
}

pub(crate) fn check_unique(
    dialect: SqlDialect,
    t: &TableNames,
    graph_id: &str,
    node_kind: &str,
    constraint_name: &str,
    key: &str,
    filter: TemporalFilter,
) -> SqlStatement {
    let mut b = StatementBuilder::new(dialect);
    b.push(&format!("SELECT {UNIQUE_COLS} FROM {} WHERE graph_id = ", t.uniques));
    b.bind(SqlValue::Text(graph_id.to_string()));
    b.push(" AND node_kind = ");
    b.bind(SqlValue::Text(node_kind.to_string()));
    b.push(" AND constraint_name = ");
    b.bind(SqlValue::Text(constraint_name.to_string()));
    b.push(" AND key = ");
    b.bind(SqlValue::Text(key.to_string()));
    unique_visibility(&mut b, filter);
    b.finish()
}

pub(crate) fn check_unique_batch(
    dialect: SqlDialect,
    t: &TableNames,
    graph_id: &str,
    node_kind: &str,
    constraint_name: &str,
    keys: &[String],
    filter: TemporalFilter,
) -> Vec<SqlStatement> {
    let chunk = (dialect.max_bind_params() - 10).max(1);
    keys.chunks(chunk)
        .map(|keys| {
            let mut b = StatementBuilder::new(dialect);
            b.push(&format!("SELECT {UNIQUE_COLS} FROM {} WHERE graph_id = ", t.uniques));
            b.bind(SqlValue::Text(graph_id.to_string()));
            b.push(" AND node_kind = ");
            b.bind(SqlValue::Text(node_kind.to_string()));
            b.push(" AND constraint_name = ");
            b.bind(SqlValue::Text(constraint_name.to_string()));
            b.push(" AND key IN (");
            b.bind_list(keys.iter().map(|key| SqlValue::Text(key.clone())));
            b.push(")");
            unique_visibility(&mut b, filter);
            b.finish()
        })
        .collect()
}

pub(crate) fn delete_unique(
    dialect: SqlDialect,
    t: &TableNames,
    graph_id: &str,
    node_kind: &str,
    constraint_name: &str,
    key: &str,
    deleted_at: DateTime<Utc>,
) -> SqlStatement {
    let mut b = StatementBuilder::new(dialect);
    b.push(&format!("UPDATE {} SET deleted_at = ", t.uniques));
    b.bind(ts(Some(deleted_at)));
    b.push(" WHERE graph_id = ");
    b.bind(SqlValue::Text(graph_id.to_string()));
    b.push(" AND node_kind = ");
    b.bind(SqlValue::Text(node_kind.to_string()));
    b.push(" AND constraint_name = ");
    b.bind(SqlValue::Text(constraint_name.to_string()));
    b.push(" AND key = ");
    b.bind(SqlValue::Text(key.to_string()));
    b.finish()
}

pub(crate) fn release_uniques_for_node(
    dialect: SqlDialect,
    t: &TableNames,
    graph_id: &str,
    node_id: &str,
    deleted_at: DateTime<Utc>,
) -> SqlStatement {
    let mut b = StatementBuilder::new(dialect);
    b.push(&format!("UPDATE {} SET deleted_at = ", t.uniques));
    b.bind(ts(Some(deleted_at)));
    b.push(" WHERE graph_id = ");
    b.bind(SqlValue::Text(graph_id.to_string()));
    b.push(" AND node_id = ");
    b.bind(SqlValue::Text(node_id.to_string()));
    b.push(" AND deleted_at IS NULL");
    b.finish()
}

pub(crate) fn purge_uniques_for_node(
    dialect: SqlDialect,
    t: &TableNames,
    graph_id: &str,
    node_id: &str,
) -> SqlStatement {
    let mut b = StatementBuilder::new(dialect);
    b.push(&format!("DELETE FROM {} WHERE graph_id = ", t.uniques));
    b.bind(SqlValue::Text(graph_id.to_string()));
    b.push(" AND node_id = ");
    b.bind(SqlValue::Text(node_id.to_string()));
    b.finish()
}

pub(crate) fn purge_embeddings_for_node(
    dialect: SqlDialect,
    t: &TableNames,
    graph_id: &str,
    node_kind: &str,
    node_id: &str,
) -> SqlStatement {
    let mut b = StatementBuilder::new(dialect);
    b.push(&format!("DELETE FROM {} WHERE graph_id = ", t.embeddings));
    b.bind(SqlValue::Text(graph_id.to_string()));
    b.push(" AND node_kind = ");
    b.bind(SqlValue::Text(node_kind.to_string()));
    b.push(" AND node_id = ");
    b.bind(SqlValue::Text(node_id.to_string()));
    b.finish()
}

// --- schema versions ---

const SCHEMA_COLS: &str = "graph_id, version, schema_hash, schema_doc, created_at, is_active";

pub(crate) fn insert_schema(
    dialect: SqlDialect,
    t: &TableNames,
    row: &SchemaVersionRow,
) -> SqlStatement {
    let mut b = StatementBuilder::new(dialect);
    b.push(&format!(
        "INSERT INTO {} ({SCHEMA_COLS}) VALUES (",
        t.schema_versions
    ));
    b.bind_list([
        SqlValue::Text(row.graph_id.clone()),
        SqlValue::Int(row.version),
        SqlValue::Text(row.schema_hash.clone()),
        SqlValue::Json(row.schema_doc.clone()),
        ts(Some(row.created_at)),
        SqlValue::Bool(row.is_active),
    ]);
    b.push(")");
    b.finish()
}

pub(crate) fn get_active_schema(
    dialect: SqlDialect,
    t: &TableNames,
    graph_id: &str,
) -> SqlStatement {
    let mut b = StatementBuilder::new(dialect);
    b.push(&format!(
        "SELECT {SCHEMA_COLS} FROM {} WHERE graph_id = ",
        t.schema_versions
    ));
    b.bind(SqlValue::Text(graph_id.to_string()));
    b.push(&format!(" AND is_active = {}", dialect.bool_literal(true)));
    b.finish()
}

pub(crate) fn get_schema_version(
    dialect: SqlDialect,
    t: &TableNames,
    graph_id: &str,
    version: i64,
) -> SqlStatement {
    let mut b = StatementBuilder::new(dialect);
    b.push(&format!(
        "SELECT {SCHEMA_COLS} FROM {} WHERE graph_id = ",
        t.schema_versions
    ));
    b.bind(SqlValue::Text(graph_id.to_string()));
    b.push(" AND version = ");
    b.bind(SqlValue::Int(version));
    b.finish()
}

/// Two statements: deactivate everything, then activate the target. Run in
/// order (ideally inside the caller's transaction) to keep the at-most-one
/// invariant.
pub(crate) fn set_active_schema(
    dialect: SqlDialect,
    t: &TableNames,
    graph_id: &str,
    version: i64,
) -> Vec<SqlStatement> {
    let mut deactivate = StatementBuilder::new(dialect);
    deactivate.push(&format!(
        "UPDATE {} SET is_active = {} WHERE graph_id = ",
        t.schema_versions,
        dialect.bool_literal(false)
    ));
    deactivate.bind(SqlValue::Text(graph_id.to_string()));

    let mut activate = StatementBuilder::new(dialect);
    activate.push(&format!(
        "UPDATE {} SET is_active = {} WHERE graph_id = ",
        t.schema_versions,
        dialect.bool_literal(true)
    ));
    activate.bind(SqlValue::Text(graph_id.to_string()));
    activate.push(" AND version = ");
    activate.bind(SqlValue::Int(version));

    vec![deactivate.finish(), activate.finish()]
}

/// Clear one graph in dependency order: embeddings, uniques, edges, nodes,
/// schema versions.
pub(crate) fn clear_graph(dialect: SqlDialect, t: &TableNames, graph_id: &str) -> Vec<SqlStatement> {
    [
        &t.embeddings,
        &t.uniques,
        &t.edges,
        &t.nodes,
        &t.schema_versions,
    ]
    .into_iter()
    .map(|table| {
        let mut b = StatementBuilder::new(dialect);
        b.push(&format!("DELETE FROM {table} WHERE graph_id = "));
        b.bind(SqlValue::Text(graph_id.to_string()));
        b.finish()
    })
    .collect()
}

// --- row decoding (shared by both adapters) ---

fn opt_ts(row: &SqlRow, column: &str) -> Result<Option<DateTime<Utc>>> {
    Ok(row.opt_i64(column)?.map(from_millis))
}

fn req_ts(row: &SqlRow, column: &str) -> Result<DateTime<Utc>> {
    Ok(from_millis(row.required_i64(column)?))
}

pub(crate) fn node_row_from(row: &SqlRow) -> Result<NodeRow> {
    Ok(NodeRow {
        graph_id: row.required_str("graph_id")?.to_string(),
        kind: row.required_str("kind")?.to_string(),
        id: row.required_str("id")?.to_string(),
        props: row.required("props")?.as_json()?,
        version: row.required_i64("version")?,
        valid_from: opt_ts(row, "valid_from")?,
        valid_to: opt_ts(row, "valid_to")?,
        created_at: req_ts(row, "created_at")?,
        updated_at: req_ts(row, "updated_at")?,
        deleted_at: opt_ts(row, "deleted_at")?,
    })
}

pub(crate) fn edge_row_from(row: &SqlRow) -> Result<EdgeRow> {
    Ok(EdgeRow {
        graph_id: row.required_str("graph_id")?.to_string(),
        id: row.required_str("id")?.to_string(),
        kind: row.required_str("kind")?.to_string(),
        from_kind: row.required_str("from_kind")?.to_string(),
        from_id: row.required_str("from_id")?.to_string(),
        to_kind: row.required_str("to_kind")?.to_string(),
        to_id: row.required_str("to_id")?.to_string(),
        props: row.required("props")?.as_json()?,
        valid_from: opt_ts(row, "valid_from")?,
        valid_to: opt_ts(row, "valid_to")?,
        created_at: req_ts(row, "created_at")?,
        updated_at: req_ts(row, "updated_at")?,
        deleted_at: opt_ts(row, "deleted_at")?,
    })
}

pub(crate) fn unique_row_from(row: &SqlRow) -> Result<UniqueRow> {
    Ok(UniqueRow {
        graph_id: row.required_str("graph_id")?.to_string(),
        node_kind: row.required_str("node_kind")?.to_string(),
        constraint_name: row.required_str("constraint_name")?.to_string(),
        key: row.required_str("key")?.to_string(),
        node_id: row.required_str("node_id")?.to_string(),
        concrete_kind: row.required_str("concrete_kind")?.to_string(),
        deleted_at: opt_ts(row, "deleted_at")?,
    })
}

pub(crate) fn schema_row_from(row: &SqlRow) -> Result<SchemaVersionRow> {
    let is_active = row
        .required("is_active")?
        .as_bool()
        .ok_or_else(|| crate::errors::TypeGraphError::database("decode_row", "is_active is not boolean"))?;
    Ok(SchemaVersionRow {
        graph_id: row.required_str("graph_id")?.to_string(),
        version: row.required_i64("version")?,
        schema_hash: row.required_str("schema_hash")?.to_string(),
        schema_doc: row.required("schema_doc")?.as_json()?,
        created_at: req_ts(row, "created_at")?,
        is_active,
    })
}
