// SQLite backend adapter.
// sqlx-based GraphBackend over an embedded SQLite database. Statement shapes
// come from backend_sql; this file only binds parameters, runs statements,
// and decodes rows. The pool is capped at one connection: in-memory
// databases are per-connection, and the engine serializes backend calls on
// synchronous in-process drivers anyway.

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row, Sqlite, Transaction};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::backend_sql;
use crate::contracts::{
    BackendCapabilities, EdgePatch, EdgeRow, GraphBackend, GraphTransaction, NodePatch, NodeRow,
    SchemaVersionRow, TemporalFilter, UniqueRow,
};
use crate::dialect::{SharedStatementCache, SqlDialect};
use crate::errors::TypeGraphError;
use crate::sql::{SqlRow, SqlStatement, SqlValue};
use crate::types::TableNames;

const STATEMENT_CACHE_CAPACITY: usize = 256;

enum Conn {
    Pool(SqlitePool),
    Tx(Mutex<Option<Transaction<'static, Sqlite>>>),
}

/// Embedded SQLite store.
pub struct SqliteBackend {
    conn: Arc<Conn>,
    table_names: TableNames,
    statements: SharedStatementCache<u64>,
}

impl SqliteBackend {
    /// Open (creating if missing) a database at the given sqlx URL, e.g.
    /// `sqlite://graph.db` or `sqlite::memory:`.
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with(url, TableNames::default()).await
    }

    pub async fn connect_with(url: &str, table_names: TableNames) -> Result<Self> {
        table_names.validate()?;
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let backend = Self {
            conn: Arc::new(Conn::Pool(pool)),
            table_names,
            statements: SharedStatementCache::new(STATEMENT_CACHE_CAPACITY),
        };
        backend.ensure_schema().await?;
        Ok(backend)
    }

    /// A fresh in-memory database.
    pub async fn in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:").await
    }

    /// Distinct statements seen recently (bounded LRU).
    pub fn tracked_statements(&self) -> usize {
        self.statements.len()
    }

    /// Override the statement-tracking cache capacity.
    pub fn statement_tracking_capacity(mut self, capacity: usize) -> Self {
        self.statements = SharedStatementCache::new(capacity);
        self
    }

    async fn ensure_schema(&self) -> Result<()> {
        for statement in backend_sql::ddl(SqlDialect::Sqlite, &self.table_names) {
            self.run(&SqlStatement::new(statement, Vec::new())).await?;
        }
        debug!("sqlite schema ensured");
        Ok(())
    }

    /// Track statement reuse so cold statements surface in debug logs.
    fn track(&self, sql: &str) {
        let hits = self.statements.get(sql).unwrap_or(0);
        if hits == 0 {
            debug!(sql, "first execution of statement");
        }
        self.statements.insert(sql.to_string(), hits + 1);
    }

    async fn run(&self, statement: &SqlStatement) -> Result<Vec<SqliteRow>> {
        self.track(&statement.sql);
        let query = bind_all(&statement.sql, &statement.params);
        let result = match &*self.conn {
            Conn::Pool(pool) => query.fetch_all(pool).await,
            Conn::Tx(lock) => {
                let mut guard = lock.lock().await;
                let tx = guard.as_mut().ok_or_else(|| {
                    TypeGraphError::database(
                        "transaction",
                        "transaction already committed or rolled back",
                    )
                })?;
                query.fetch_all(&mut **tx).await
            }
        };
        result.map_err(|e| TypeGraphError::database("sqlite", e.to_string()).into())
    }

    async fn run_all(&self, statements: &[SqlStatement]) -> Result<()> {
        for statement in statements {
            self.run(statement).await?;
        }
        Ok(())
    }

    async fn fetch_rows(&self, statement: &SqlStatement) -> Result<Vec<SqlRow>> {
        Ok(self
            .run(statement)
            .await?
            .iter()
            .map(decode_dynamic)
            .collect())
    }

    async fn fetch_nodes(&self, statement: &SqlStatement) -> Result<Vec<NodeRow>> {
        self.fetch_rows(statement)
            .await?
            .iter()
            .map(backend_sql::node_row_from)
            .collect()
    }

    async fn fetch_edges(&self, statement: &SqlStatement) -> Result<Vec<EdgeRow>> {
        self.fetch_rows(statement)
            .await?
            .iter()
            .map(backend_sql::edge_row_from)
            .collect()
    }

    async fn fetch_count(&self, statement: &SqlStatement) -> Result<u64> {
        let rows = self.fetch_rows(statement).await?;
        let row = rows.first().ok_or_else(|| {
            TypeGraphError::database("count", "count query returned no rows")
        })?;
        Ok(row.required_i64("n")? as u64)
    }
}

fn bind_all<'q>(
    sql: &'q str,
    params: &'q [SqlValue],
) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
    let mut query = sqlx::query(sql);
    for param in params {
        query = match param {
            SqlValue::Null => query.bind(None::<String>),
            SqlValue::Bool(value) => query.bind(*value),
            SqlValue::Int(value) => query.bind(*value),
            SqlValue::Float(value) => query.bind(*value),
            SqlValue::Text(value) => query.bind(value.clone()),
            // JSON persists as TEXT on this dialect.
            SqlValue::Json(value) => {
                query.bind(serde_json::to_string(value).unwrap_or_else(|_| "null".to_string()))
            }
        };
    }
    query
}

/// SQLite values are dynamically typed; probe integer, real, then text.
fn decode_dynamic(row: &SqliteRow) -> SqlRow {
    let mut out = SqlRow::default();
    for column in row.columns() {
        let index = column.ordinal();
        let value = if let Ok(Some(v)) = row.try_get::<Option<i64>, _>(index) {
            SqlValue::Int(v)
        } else if let Ok(Some(v)) = row.try_get::<Option<f64>, _>(index) {
            SqlValue::Float(v)
        } else if let Ok(Some(v)) = row.try_get::<Option<String>, _>(index) {
            SqlValue::Text(v)
        } else {
            SqlValue::Null
        };
        out.insert(column.name().to_string(), value);
    }
    out
}

#[async_trait]
impl GraphBackend for SqliteBackend {
    fn dialect(&self) -> SqlDialect {
        SqlDialect::Sqlite
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            transactions: true,
            returning: true,
            partial_indexes: true,
            gin_indexes: false,
            cte: true,
            jsonb: false,
            compiled_sql: true,
        }
    }

    fn table_names(&self) -> &TableNames {
        &self.table_names
    }

    async fn insert_node(&self, row: NodeRow) -> Result<()> {
        let statement = backend_sql::insert_node(self.dialect(), &self.table_names, &row);
        self.run(&statement).await.map(|_| ())
    }

    async fn insert_nodes_batch(&self, rows: Vec<NodeRow>) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let statements = backend_sql::insert_nodes_batch(self.dialect(), &self.table_names, &rows);
        self.run_all(&statements).await
    }

    async fn get_node(
        &self,
        graph_id: &str,
        kind: &str,
        id: &str,
        filter: TemporalFilter,
    ) -> Result<Option<NodeRow>> {
        let statement =
            backend_sql::get_node(self.dialect(), &self.table_names, graph_id, kind, id, filter);
        Ok(self.fetch_nodes(&statement).await?.into_iter().next())
    }

    async fn get_nodes(
        &self,
        graph_id: &str,
        kind: Option<&str>,
        ids: &[String],
        filter: TemporalFilter,
    ) -> Result<Vec<NodeRow>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for statement in
            backend_sql::get_nodes(self.dialect(), &self.table_names, graph_id, kind, ids, filter)
        {
            out.extend(self.fetch_nodes(&statement).await?);
        }
        Ok(out)
    }

    async fn update_node(
        &self,
        graph_id: &str,
        kind: &str,
        id: &str,
        patch: NodePatch,
    ) -> Result<Option<NodeRow>> {
        let statement = backend_sql::update_node(
            self.dialect(),
            &self.table_names,
            graph_id,
            kind,
            id,
            &patch,
        );
        Ok(self.fetch_nodes(&statement).await?.into_iter().next())
    }

    async fn purge_node(&self, graph_id: &str, kind: &str, id: &str) -> Result<()> {
        let statement =
            backend_sql::purge_node(self.dialect(), &self.table_names, graph_id, kind, id);
        self.run(&statement).await.map(|_| ())
    }

    async fn find_nodes_by_kind(
        &self,
        graph_id: &str,
        kinds: &[String],
        filter: TemporalFilter,
        limit: Option<u32>,
        offset: Option<u32>,
    ) -> Result<Vec<NodeRow>> {
        let statement = backend_sql::find_nodes_by_kind(
            self.dialect(),
            &self.table_names,
            graph_id,
            kinds,
            filter,
            limit,
            offset,
        );
        self.fetch_nodes(&statement).await
    }

    async fn count_nodes_by_kind(
        &self,
        graph_id: &str,
        kinds: &[String],
        filter: TemporalFilter,
    ) -> Result<u64> {
        let statement = backend_sql::count_nodes_by_kind(
            self.dialect(),
            &self.table_names,
            graph_id,
            kinds,
            filter,
        );
        self.fetch_count(&statement).await
    }

    async fn insert_edge(&self, row: EdgeRow) -> Result<()> {
        let statement = backend_sql::insert_edge(self.dialect(), &self.table_names, &row);
        self.run(&statement).await.map(|_| ())
    }

    async fn insert_edges_batch(&self, rows: Vec<EdgeRow>) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let statements = backend_sql::insert_edges_batch(self.dialect(), &self.table_names, &rows);
        self.run_all(&statements).await
    }

    async fn get_edge(
        &self,
        graph_id: &str,
        id: &str,
        filter: TemporalFilter,
    ) -> Result<Option<EdgeRow>> {
        let statement =
            backend_sql::get_edge(self.dialect(), &self.table_names, graph_id, id, filter);
        Ok(self.fetch_edges(&statement).await?.into_iter().next())
    }

    async fn update_edge(
        &self,
        graph_id: &str,
        id: &str,
        patch: EdgePatch,
    ) -> Result<Option<EdgeRow>> {
        let statement =
            backend_sql::update_edge(self.dialect(), &self.table_names, graph_id, id, &patch);
        Ok(self.fetch_edges(&statement).await?.into_iter().next())
    }

    async fn purge_edge(&self, graph_id: &str, id: &str) -> Result<()> {
        let statement = backend_sql::purge_edge(self.dialect(), &self.table_names, graph_id, id);
        self.run(&statement).await.map(|_| ())
    }

    async fn find_edges_by_kind(
        &self,
        graph_id: &str,
        kinds: &[String],
        filter: TemporalFilter,
        limit: Option<u32>,
        offset: Option<u32>,
    ) -> Result<Vec<EdgeRow>> {
        let statement = backend_sql::find_edges_by_kind(
            self.dialect(),
            &self.table_names,
            graph_id,
            kinds,
            filter,
            limit,
            offset,
        );
        self.fetch_edges(&statement).await
    }

    async fn count_edges_by_kind(
        &self,
        graph_id: &str,
        kinds: &[String],
        filter: TemporalFilter,
    ) -> Result<u64> {
        let statement = backend_sql::count_edges_by_kind(
            self.dialect(),
            &self.table_names,
            graph_id,
            kinds,
            filter,
        );
        self.fetch_count(&statement).await
    }

    async fn count_edges_from(
        &self,
        graph_id: &str,
        edge_kind: &str,
        from_kind: &str,
        from_id: &str,
        active_only: bool,
    ) -> Result<u64> {
        let statement = backend_sql::count_edges_from(
            self.dialect(),
            &self.table_names,
            graph_id,
            edge_kind,
            from_kind,
            from_id,
            active_only,
        );
        self.fetch_count(&statement).await
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
        let rows = self
            .find_edges_between(
                graph_id,
                edge_kind,
                from_kind,
                from_id,
                to_kind,
                to_id,
                TemporalFilter::include_ended(),
            )
            .await?;
        Ok(!rows.is_empty())
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
        let statement = backend_sql::find_edges_between(
            self.dialect(),
            &self.table_names,
            graph_id,
            edge_kind,
            from_kind,
            from_id,
            to_kind,
            to_id,
            filter,
        );
        self.fetch_edges(&statement).await
    }

    async fn find_edges_connected_to(
        &self,
        graph_id: &str,
        node_kind: &str,
        node_id: &str,
        filter: TemporalFilter,
    ) -> Result<Vec<EdgeRow>> {
        let statement = backend_sql::find_edges_connected_to(
            self.dialect(),
            &self.table_names,
            graph_id,
            node_kind,
            node_id,
            filter,
        );
        self.fetch_edges(&statement).await
    }

    async fn purge_edges_connected_to(
        &self,
        graph_id: &str,
        node_kind: &str,
        node_id: &str,
    ) -> Result<()> {
        let statement = backend_sql::purge_edges_connected_to(
            self.dialect(),
            &self.table_names,
            graph_id,
            node_kind,
            node_id,
        );
        self.run(&statement).await.map(|_| ())
    }

    async fn insert_unique(&self, row: UniqueRow) -> Result<String> {
        let statement = backend_sql::insert_unique(self.dialect(), &self.table_names, &row);
        let rows = self.fetch_rows(&statement).await?;
        let row = rows.first().ok_or_else(|| {
            TypeGraphError::database("insert_unique", "upsert returned no row")
        })?;
        Ok(row.required_str("node_id")?.to_string())
    }

    async fn check_unique(
        &self,
        graph_id: &str,
        node_kind: &str,
        constraint_name: &str,
        key: &str,
        filter: TemporalFilter,
    ) -> Result<Option<UniqueRow>> {
        let statement = backend_sql::check_unique(
            self.dialect(),
            &self.table_names,
            graph_id,
            node_kind,
            constraint_name,
            key,
            filter,
        );
        let rows = self.fetch_rows(&statement).await?;
        rows.first().map(backend_sql::unique_row_from).transpose()
    }

    async fn check_unique_batch(
        &self,
        graph_id: &str,
        node_kind: &str,
        constraint_name: &str,
        keys: &[String],
        filter: TemporalFilter,
    ) -> Result<Vec<UniqueRow>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for statement in backend_sql::check_unique_batch(
            self.dialect(),
            &self.table_names,
            graph_id,
            node_kind,
            constraint_name,
            keys,
            filter,
        ) {
            for row in self.fetch_rows(&statement).await? {
                out.push(backend_sql::unique_row_from(&row)?);
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
        let statement = backend_sql::delete_unique(
            self.dialect(),
            &self.table_names,
            graph_id,
            node_kind,
            constraint_name,
            key,
            deleted_at,
        );
        self.run(&statement).await.map(|_| ())
    }

    async fn release_uniques_for_node(
        &self,
        graph_id: &str,
        node_id: &str,
        deleted_at: DateTime<Utc>,
    ) -> Result<()> {
        let statement = backend_sql::release_uniques_for_node(
            self.dialect(),
            &self.table_names,
            graph_id,
            node_id,
            deleted_at,
        );
        self.run(&statement).await.map(|_| ())
    }

    async fn purge_uniques_for_node(&self, graph_id: &str, node_id: &str) -> Result<()> {
        let statement = backend_sql::purge_uniques_for_node(
            self.dialect(),
            &self.table_names,
            graph_id,
            node_id,
        );
        self.run(&statement).await.map(|_| ())
    }

    async fn purge_embeddings_for_node(
        &self,
        graph_id: &str,
        node_kind: &str,
        node_id: &str,
    ) -> Result<()> {
        let statement = backend_sql::purge_embeddings_for_node(
            self.dialect(),
            &self.table_names,
            graph_id,
            node_kind,
            node_id,
        );
        self.run(&statement).await.map(|_| ())
    }

    async fn insert_schema(&self, row: SchemaVersionRow) -> Result<()> {
        let statement = backend_sql::insert_schema(self.dialect(), &self.table_names, &row);
        self.run(&statement).await.map(|_| ())
    }

    async fn get_active_schema(&self, graph_id: &str) -> Result<Option<SchemaVersionRow>> {
        let statement =
            backend_sql::get_active_schema(self.dialect(), &self.table_names, graph_id);
        let rows = self.fetch_rows(&statement).await?;
        rows.first().map(backend_sql::schema_row_from).transpose()
    }

    async fn get_schema_version(
        &self,
        graph_id: &str,
        version: i64,
    ) -> Result<Option<SchemaVersionRow>> {
        let statement =
            backend_sql::get_schema_version(self.dialect(), &self.table_names, graph_id, version);
        let rows = self.fetch_rows(&statement).await?;
        rows.first().map(backend_sql::schema_row_from).transpose()
    }

    async fn set_active_schema(&self, graph_id: &str, version: i64) -> Result<()> {
        let statements =
            backend_sql::set_active_schema(self.dialect(), &self.table_names, graph_id, version);
        self.run_all(&statements).await
    }

    async fn clear_graph(&self, graph_id: &str) -> Result<()> {
        let statements = backend_sql::clear_graph(self.dialect(), &self.table_names, graph_id);
        self.run_all(&statements).await
    }

    async fn execute(&self, statement: SqlStatement) -> Result<Vec<SqlRow>> {
        self.fetch_rows(&statement).await
    }

    async fn begin(&self) -> Result<Arc<dyn GraphTransaction>> {
        match &*self.conn {
            Conn::Pool(pool) => {
                let tx = pool.begin().await?;
                Ok(Arc::new(SqliteBackend {
                    conn: Arc::new(Conn::Tx(Mutex::new(Some(tx)))),
                    table_names: self.table_names.clone(),
                    statements: self.statements.clone(),
                }))
            }
            Conn::Tx(_) => bail!(TypeGraphError::configuration(
                "nested transactions are not supported",
            )),
        }
    }

    async fn close(&self) -> Result<()> {
        if let Conn::Pool(pool) = &*self.conn {
            pool.close().await;
        }
        Ok(())
    }
}

#[async_trait]
impl GraphTransaction for SqliteBackend {
    async fn commit(&self) -> Result<()> {
        let Conn::Tx(lock) = &*self.conn else {
            bail!(TypeGraphError::database("commit", "not a transaction handle"));
        };
        let tx = lock.lock().await.take().ok_or_else(|| {
            TypeGraphError::database("commit", "transaction already finished")
        })?;
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        let Conn::Tx(lock) = &*self.conn else {
            bail!(TypeGraphError::database("rollback", "not a transaction handle"));
        };
        let tx = lock.lock().await.take().ok_or_else(|| {
            TypeGraphError::database("rollback", "transaction already finished")
        })?;
        tx.rollback().await?;
        Ok(())
    }
}
