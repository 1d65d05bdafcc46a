// In-memory backend.
// A complete GraphBackend over process-local maps, used for embedded
// deployments that need graph semantics without a SQL engine and for
// deterministic tests. Transactions snapshot the whole state and restore it
// on rollback; isolation relies on the engine's one-at-a-time call
// discipline, matching synchronous in-process drivers.
//
// The one gap is compiled-SQL execution: the query pipeline needs a real SQL
// engine, so `execute` reports the missing capability.

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use crate::contracts::{
    row_visible, BackendCapabilities, EdgePatch, EdgeRow, GraphBackend, GraphTransaction,
    NodePatch, NodeRow, SchemaVersionRow, TemporalFilter, UniqueRow,
};
use crate::dialect::SqlDialect;
use crate::errors::TypeGraphError;
use crate::sql::{SqlRow, SqlStatement};
use crate::types::TableNames;

type NodeKey = (String, String, String);
type EdgeKey = (String, String);
type UniqueKey = (String, String, String, String);
type SchemaKey = (String, i64);
type EmbeddingKey = (String, String, String, String);

#[derive(Debug, Clone, Default)]
struct MemoryState {
    nodes: BTreeMap<NodeKey, NodeRow>,
    edges: BTreeMap<EdgeKey, EdgeRow>,
    uniques: BTreeMap<UniqueKey, UniqueRow>,
    schemas: BTreeMap<SchemaKey, SchemaVersionRow>,
    embeddings: BTreeMap<EmbeddingKey, JsonValue>,
}

struct MemoryInner {
    state: Mutex<MemoryState>,
    table_names: TableNames,
}

/// Process-local backend. Cloned handles share state; `begin` hands out a
/// transaction view over the same state.
pub struct MemoryBackend {
    inner: Arc<MemoryInner>,
    tx: Option<TxGuard>,
}

struct TxGuard {
    snapshot: Mutex<Option<MemoryState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_table_names(TableNames::default())
    }

    pub fn with_table_names(table_names: TableNames) -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                state: Mutex::new(MemoryState::default()),
                table_names,
            }),
            tx: None,
        }
    }

    fn check_open(&self) -> Result<()> {
        if let Some(guard) = &self.tx {
            if guard.snapshot.lock().is_none() {
                bail!(TypeGraphError::database(
                    "transaction",
                    "transaction already committed or rolled back",
                ));
            }
        }
        Ok(())
    }

    fn node_visible(row: &NodeRow, filter: TemporalFilter, now: DateTime<Utc>) -> bool {
        row_visible(filter, row.deleted_at, row.valid_from, row.valid_to, now)
    }

    fn edge_visible(row: &EdgeRow, filter: TemporalFilter, now: DateTime<Utc>) -> bool {
        row_visible(filter, row.deleted_at, row.valid_from, row.valid_to, now)
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GraphBackend for MemoryBackend {
    fn dialect(&self) -> SqlDialect {
        // Compiled SQL is rejected anyway; report the more permissive
        // parameter budget.
        SqlDialect::Sqlite
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            transactions: true,
            returning: false,
            partial_indexes: false,
            gin_indexes: false,
            cte: false,
            jsonb: false,
            compiled_sql: false,
        }
    }

    fn table_names(&self) -> &TableNames {
        &self.inner.table_names
    }

    async fn insert_node(&self, row: NodeRow) -> Result<()> {
        self.check_open()?;
        let key = (row.graph_id.clone(), row.kind.clone(), row.id.clone());
        let mut state = self.inner.state.lock();
        if state.nodes.contains_key(&key) {
            bail!(TypeGraphError::database(
                "insert_node",
                format!("node {}/{} already exists", row.kind, row.id),
            ));
        }
        state.nodes.insert(key, row);
        Ok(())
    }

    async fn insert_nodes_batch(&self, rows: Vec<NodeRow>) -> Result<()> {
        for row in rows {
            self.insert_node(row).await?;
        }
        Ok(())
    }

    async fn get_node(
        &self,
        graph_id: &str,
        kind: &str,
        id: &str,
        filter: TemporalFilter,
    ) -> Result<Option<NodeRow>> {
        self.check_open()?;
        let now = Utc::now();
        let state = self.inner.state.lock();
        let key = (graph_id.to_string(), kind.to_string(), id.to_string());
        Ok(state
            .nodes
            .get(&key)
            .filter(|row| Self::node_visible(row, filter, now))
            .cloned())
    }

    async fn get_nodes(
        &self,
        graph_id: &str,
        kind: Option<&str>,
        ids: &[String],
        filter: TemporalFilter,
    ) -> Result<Vec<NodeRow>> {
        self.check_open()?;
        let now = Utc::now();
        let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let state = self.inner.state.lock();
        Ok(state
            .nodes
            .values()
            .filter(|row| row.graph_id == graph_id)
            .filter(|row| kind.map_or(true, |k| row.kind == k))
            .filter(|row| wanted.contains(row.id.as_str()))
            .filter(|row| Self::node_visible(row, filter, now))
            .cloned()
            .collect())
    }

    async fn update_node(
        &self,
        graph_id: &str,
        kind: &str,
        id: &str,
        patch: NodePatch,
    ) -> Result<Option<NodeRow>> {
        self.check_open()?;
        let key = (graph_id.to_string(), kind.to_string(), id.to_string());
        let mut state = self.inner.state.lock();
        let Some(row) = state.nodes.get_mut(&key) else {
            return Ok(None);
        };
        if let Some(props) = patch.props {
            row.props = props;
        }
        if patch.bump_version {
            row.version += 1;
        }
        if let Some(updated_at) = patch.updated_at {
            row.updated_at = updated_at;
        }
        if let Some(deleted_at) = patch.deleted_at {
            row.deleted_at = deleted_at;
        }
        if let Some(valid_from) = patch.valid_from {
            row.valid_from = valid_from;
        }
        if let Some(valid_to) = patch.valid_to {
            row.valid_to = valid_to;
        }
        Ok(Some(row.clone()))
    }

    async fn purge_node(&self, graph_id: &str, kind: &str, id: &str) -> Result<()> {
        self.check_open()?;
        let key = (graph_id.to_string(), kind.to_string(), id.to_string());
        self.inner.state.lock().nodes.remove(&key);
        Ok(())
    }

    async fn find_nodes_by_kind(
        &self,
        graph_id: &str,
        kinds: &[String],
        filter: TemporalFilter,
        limit: Option<u32>,
        offset: Option<u32>,
    ) -> Result<Vec<NodeRow>> {
        self.check_open()?;
        let now = Utc::now();
        let kind_set: HashSet<&str> = kinds.iter().map(String::as_str).collect();
        let state = self.inner.state.lock();
        let rows = state
            .nodes
            .values()
            .filter(|row| row.graph_id == graph_id)
            .filter(|row| kind_set.contains(row.kind.as_str()))
            .filter(|row| Self::node_visible(row, filter, now))
            .skip(offset.unwrap_or(0) as usize);
        Ok(match limit {
            Some(n) => rows.take(n as usize).cloned().collect(),
            None => rows.cloned().collect(),
        })
    }

    async fn count_nodes_by_kind(
        &self,
        graph_id: &str,
        kinds: &[String],
        filter: TemporalFilter,
    ) -> Result<u64> {
        let rows = self
            .find_nodes_by_kind(graph_id, kinds, filter, None, None)
            .await?;
        Ok(rows.len() as u64)
    }

    async fn insert_edge(&self, row: EdgeRow) -> Result<()> {
        self.check_open()?;
        let key = (row.graph_id.clone(), row.id.clone());
        let mut state = self.inner.state.lock();
        if state.edges.contains_key(&key) {
            bail!(TypeGraphError::database(
                "insert_edge",
                format!("edge '{}' already exists", row.id),
            ));
        }
        state.edges.insert(key, row);
        Ok(())
    }

    async fn insert_edges_batch(&self, rows: Vec<EdgeRow>) -> Result<()> {
        for row in rows {
            self.insert_edge(row).await?;
        }
        Ok(())
    }

    async fn get_edge(
        &self,
        graph_id: &str,
        id: &str,
        filter: TemporalFilter,
    ) -> Result<Option<EdgeRow>> {
        self.check_open()?;
        let now = Utc::now();
        let state = self.inner.state.lock();
        let key = (graph_id.to_string(), id.to_string());
        Ok(state
            .edges
            .get(&key)
            .filter(|row| Self::edge_visible(row, filter, now))
            .cloned())
    }

    async fn update_edge(
        &self,
        graph_id: &str,
        id: &str,
        patch: EdgePatch,
    ) -> Result<Option<EdgeRow>> {
        self.check_open()?;
        let key = (graph_id.to_string(), id.to_string());
        let mut state = self.inner.state.lock();
        let Some(row) = state.edges.get_mut(&key) else {
            return Ok(None);
        };
        if let Some(props) = patch.props {
            row.props = props;
        }
        if let Some(updated_at) = patch.updated_at {
            row.updated_at = updated_at;
        }
        if let Some(deleted_at) = patch.deleted_at {
            row.deleted_at = deleted_at;
        }
        if let Some(valid_from) = patch.valid_from {
            row.valid_from = valid_from;
        }
        if let Some(valid_to) = patch.valid_to {
            row.valid_to = valid_to;
        }
        Ok(Some(row.clone()))
    }

    async fn purge_edge(&self, graph_id: &str, id: &str) -> Result<()> {
        self.check_open()?;
        let key = (graph_id.to_string(), id.to_string());
        self.inner.state.lock().edges.remove(&key);
        Ok(())
    }

    async fn find_edges_by_kind(
        &self,
        graph_id: &str,
        kinds: &[String],
        filter: TemporalFilter,
        limit: Option<u32>,
        offset: Option<u32>,
    ) -> Result<Vec<EdgeRow>> {
        self.check_open()?;
        let now = Utc::now();
        let kind_set: HashSet<&str> = kinds.iter().map(String::as_str).collect();
        let state = self.inner.state.lock();
        let rows = state
            .edges
            .values()
            .filter(|row| row.graph_id == graph_id)
            .filter(|row| kind_set.contains(row.kind.as_str()))
            .filter(|row| Self::edge_visible(row, filter, now))
            .skip(offset.unwrap_or(0) as usize);
        Ok(match limit {
            Some(n) => rows.take(n as usize).cloned().collect(),
            None => rows.cloned().collect(),
        })
    }

    async fn count_edges_by_kind(
        &self,
        graph_id: &str,
        kinds: &[String],
        filter: TemporalFilter,
    ) -> Result<u64> {
        let rows = self
            .find_edges_by_kind(graph_id, kinds, filter, None, None)
            .await?;
        Ok(rows.len() as u64)
    }

    async fn count_edges_from(
        &self,
        graph_id: &str,
        edge_kind: &str,
        from_kind: &str,
        from_id: &str,
        active_only: bool,
    ) -> Result<u64> {
        self.check_open()?;
        let state = self.inner.state.lock();
        Ok(state
            .edges
            .values()
            .filter(|row| row.graph_id == graph_id)
            .filter(|row| row.kind == edge_kind)
            .filter(|row| row.from_kind == from_kind && row.from_id == from_id)
            .filter(|row| row.deleted_at.is_none())
            .filter(|row| !active_only || row.valid_to.is_none())
            .count() as u64)
    }

    async fn edge_exists_between(
        &self,
        graph_id: &str,
        edge_kind: &str,
        from_kind: &str,
        from_id: &str,
        to_kind: &str,
        to_id: &str,
    ) -> Result<bool> {
        self.check_open()?;
        let state = self.inner.state.lock();
        Ok(state.edges.values().any(|row| {
            row.graph_id == graph_id
                && row.kind == edge_kind
                && row.from_kind == from_kind
                && row.from_id == from_id
                && row.to_kind == to_kind
                && row.to_id == to_id
                && row.deleted_at.is_none()
        }))
    }

    async fn find_edges_between(
        &self,
        graph_id: &str,
        edge_kind: &str,
        from_kind: &str,
        from_id: &str,
        to_kind: &str,
        to_id: &str,
        filter: TemporalFilter,
    ) -> Result<Vec<EdgeRow>> {
        self.check_open()?;
        let now = Utc::now();
        let state = self.inner.state.lock();
        Ok(state
            .edges
            .values()
            .filter(|row| {
                row.graph_id == graph_id
                    && row.kind == edge_kind
                    && row.from_kind == from_kind
                    && row.from_id == from_id
                    && row.to_kind == to_kind
                    && row.to_id == to_id
            })
            .filter(|row| Self::edge_visible(row, filter, now))
            .cloned()
            .collect())
    }

    async fn find_edges_connected_to(
        &self,
        graph_id: &str,
        node_kind: &str,
        node_id: &str,
        filter: TemporalFilter,
    ) -> Result<Vec<EdgeRow>> {
        self.check_open()?;
        let now = Utc::now();
        let state = self.inner.state.lock();
        Ok(state
            .edges
            .values()
            .filter(|row| row.graph_id == graph_id)
            .filter(|row| {
                (row.from_kind == node_kind && row.from_id == node_id)
                    || (row.to_kind == node_kind && row.to_id == node_id)
            })
            .filter(|row| Self::edge_visible(row, filter, now))
            .cloned()
            .collect())
    }

    async fn purge_edges_connected_to(
        &self,
        graph_id: &str,
        node_kind: &str,
        node_id: &str,
    ) -> Result<()> {
        self.check_open()?;
        let mut state = self.inner.state.lock();
        state.edges.retain(|_, row| {
            row.graph_id != graph_id
                || !((row.from_kind == node_kind && row.from_id == node_id)
                    || (row.to_kind == node_kind && row.to_id == node_id))
        });
        Ok(())
    }

    async fn insert_unique(&self, row: UniqueRow) -> Result<String> {
        self.check_open()?;
        let key = (
            row.graph_id.clone(),
            row.node_kind.clone(),
            row.constraint_name.clone(),
            row.key.clone(),
        );
        let mut state = self.inner.state.lock();
        match state.uniques.get_mut(&key) {
            None => {
                let owner = row.node_id.clone();
                state.uniques.insert(key, row);
                Ok(owner)
            }
            Some(existing) if existing.node_id == row.node_id => {
                existing.deleted_at = None;
                existing.concrete_kind = row.concrete_kind;
                Ok(existing.node_id.clone())
            }
            Some(existing) if existing.deleted_at.is_some() => {
                existing.node_id = row.node_id;
                existing.concrete_kind = row.concrete_kind;
                existing.deleted_at = None;
                Ok(existing.node_id.clone())
            }
            Some(existing) => Ok(existing.node_id.clone()),
        }
    }

    async fn check_unique(
        &self,
        graph_id: &str,
        node_kind: &str,
        constraint_name: &str,
        key: &str,
        filter: TemporalFilter,
    ) -> Result<Option<UniqueRow>> {
        self.check_open()?;
        let now = Utc::now();
        let state = self.inner.state.lock();
        let map_key = (
            graph_id.to_string(),
            node_kind.to_string(),
            constraint_name.to_string(),
            key.to_string(),
        );
        Ok(state
            .uniques
            .get(&map_key)
            .filter(|row| row_visible(filter, row.deleted_at, None, None, now))
            .cloned())
    }

    async fn check_unique_batch(
        &self,
        graph_id: &str,
        node_kind: &str,
        constraint_name: &str,
        keys: &[String],
        filter: TemporalFilter,
    ) -> Result<Vec<UniqueRow>> {
        let mut out = Vec::new();
        for key in keys {
            if let Some(row) = self
                .check_unique(graph_id, node_kind, constraint_name, key, filter)
                .await?
            {
                out.push(row);
            }
        }
        Ok(out)
    }

    async fn delete_unique(
        &self,
        graph_id: &str,
        node_kind: &str,
        constraint_name: &str,
        key: &str,
        deleted_at: DateTime<Utc>,
    ) -> Result<()> {
        self.check_open()?;
        let map_key = (
            graph_id.to_string(),
            node_kind.to_string(),
            constraint_name.to_string(),
            key.to_string(),
        );
        let mut state = self.inner.state.lock();
        if let Some(row) = state.uniques.get_mut(&map_key) {
            row.deleted_at = Some(deleted_at);
        }
        Ok(())
    }

    async fn release_uniques_for_node(
        &self,
        graph_id: &str,
        node_id: &str,
        deleted_at: DateTime<Utc>,
    ) -> Result<()> {
        self.check_open()?;
        let mut state = self.inner.state.lock();
        for row in state.uniques.values_mut() {
            if row.graph_id == graph_id && row.node_id == node_id && row.deleted_at.is_none() {
                row.deleted_at = Some(deleted_at);
            }
        }
        Ok(())
    }

    async fn purge_uniques_for_node(&self, graph_id: &str, node_id: &str) -> Result<()> {
        self.check_open()?;
        let mut state = self.inner.state.lock();
        state
            .uniques
            .retain(|_, row| !(row.graph_id == graph_id && row.node_id == node_id));
        Ok(())
    }

    async fn purge_embeddings_for_node(
        &self,
        graph_id: &str,
        node_kind: &str,
        node_id: &str,
    ) -> Result<()> {
        self.check_open()?;
        let mut state = self.inner.state.lock();
        state.embeddings.retain(|(graph, kind, id, _), _| {
            !(graph == graph_id && kind == node_kind && id == node_id)
        });
        Ok(())
    }

    async fn insert_schema(&self, row: SchemaVersionRow) -> Result<()> {
        self.check_open()?;
        let key = (row.graph_id.clone(), row.version);
        let mut state = self.inner.state.lock();
        if state.schemas.contains_key(&key) {
            bail!(TypeGraphError::database(
                "insert_schema",
                format!("schema version {} already exists", row.version),
            ));
        }
        if row.is_active {
            for existing in state.schemas.values_mut() {
                if existing.graph_id == row.graph_id {
                    existing.is_active = false;
                }
            }
        }
        state.schemas.insert(key, row);
        Ok(())
    }

    async fn get_active_schema(&self, graph_id: &str) -> Result<Option<SchemaVersionRow>> {
        self.check_open()?;
        let state = self.inner.state.lock();
        Ok(state
            .schemas
            .values()
            .find(|row| row.graph_id == graph_id && row.is_active)
            .cloned())
    }

    async fn get_schema_version(
        &self,
        graph_id: &str,
        version: i64,
    ) -> Result<Option<SchemaVersionRow>> {
        self.check_open()?;
        let state = self.inner.state.lock();
        Ok(state
            .schemas
            .get(&(graph_id.to_string(), version))
            .cloned())
    }

    async fn set_active_schema(&self, graph_id: &str, version: i64) -> Result<()> {
        self.check_open()?;
        let mut state = self.inner.state.lock();
        if !state.schemas.contains_key(&(graph_id.to_string(), version)) {
            bail!(TypeGraphError::database(
                "set_active_schema",
                format!("schema version {version} does not exist"),
            ));
        }
        for row in state.schemas.values_mut() {
            if row.graph_id == graph_id {
                row.is_active = row.version == version;
            }
        }
        Ok(())
    }

    async fn clear_graph(&self, graph_id: &str) -> Result<()> {
        self.check_open()?;
        let mut state = self.inner.state.lock();
        state.embeddings.retain(|(graph, ..), _| graph != graph_id);
        state.uniques.retain(|_, row| row.graph_id != graph_id);
        state.edges.retain(|_, row| row.graph_id != graph_id);
        state.nodes.retain(|_, row| row.graph_id != graph_id);
        state.schemas.retain(|_, row| row.graph_id != graph_id);
        Ok(())
    }

    async fn execute(&self, _statement: SqlStatement) -> Result<Vec<SqlRow>> {
        bail!(TypeGraphError::configuration(
            "the memory backend does not execute compiled SQL; use a SQL backend for queries",
        ));
    }

    async fn begin(&self) -> Result<Arc<dyn GraphTransaction>> {
        if self.tx.is_some() {
            bail!(TypeGraphError::configuration(
                "nested transactions are not supported",
            ));
        }
        let snapshot = self.inner.state.lock().clone();
        Ok(Arc::new(MemoryBackend {
            inner: Arc::clone(&self.inner),
            tx: Some(TxGuard {
                snapshot: Mutex::new(Some(snapshot)),
            }),
        }))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl GraphTransaction for MemoryBackend {
    async fn commit(&self) -> Result<()> {
        let Some(guard) = &self.tx else {
            bail!(TypeGraphError::database(
                "commit",
                "not a transaction handle",
            ));
        };
        if guard.snapshot.lock().take().is_none() {
            bail!(TypeGraphError::database(
                "commit",
                "transaction already finished",
            ));
        }
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        let Some(guard) = &self.tx else {
            bail!(TypeGraphError::database(
                "rollback",
                "not a transaction handle",
            ));
        };
        let Some(snapshot) = guard.snapshot.lock().take() else {
            bail!(TypeGraphError::database(
                "rollback",
                "transaction already finished",
            ));
        };
        *self.inner.state.lock() = snapshot;
        Ok(())
    }
}
