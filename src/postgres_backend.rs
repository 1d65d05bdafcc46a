// PostgreSQL backend adapter.
// sqlx-based GraphBackend over a PostgreSQL pool. Statement shapes come from
// backend_sql with `$n` placeholders; props and schema documents persist as
// JSONB and arrive pre-parsed from the driver.

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions, PgRow};
use sqlx::{Column, Postgres, Row, Transaction, TypeInfo};
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
    Pool(PgPool),
    Tx(Mutex<Option<Transaction<'static, Postgres>>>),
}

/// PostgreSQL-backed store.
pub struct PostgresBackend {
    conn: Arc<Conn>,
    table_names: TableNames,
    statements: SharedStatementCache<u64>,
}

impl PostgresBackend {
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with(url, TableNames::default()).await
    }

    pub async fn connect_with(url: &str, table_names: TableNames) -> Result<Self> {
        table_names.validate()?;
        let pool = PgPoolOptions::new().connect(url).await?;
        Self::from_pool(pool, table_names).await
    }

    pub async fn from_pool(pool: PgPool, table_names: TableNames) -> Result<Self> {
        table_names.validate()?;
        let backend = Self {
            conn: Arc::new(Conn::Pool(pool)),
            table_names,
            statements: SharedStatementCache::new(STATEMENT_CACHE_CAPACITY),
        };
        backend.ensure_schema().await?;
        Ok(backend)
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
        for statement in backend_sql::ddl(SqlDialect::Postgres, &self.table_names) {
            self.run(&SqlStatement::new(statement, Vec::new())).await?;
        }
        debug!("postgres schema ensured");
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

    async fn run(&self, statement: &SqlStatement) -> Result<Vec<PgRow>> {
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
        result.map_err(|e| TypeGraphError::database("postgres", e.to_string()).into())
    }

    async fn run_all(&self, statements: &[SqlStatement]) -> Result<()> {
        for statement in statements {
            self.run(statement).await?;
        }
        Ok(())
    }

    async fn fetch_rows(&self, statement: &SqlStatement) -> Result<Vec<SqlRow>> {
        self.run(statement).await?.iter().map(decode_dynamic).collect()
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
) -> sqlx::query::Query<'q, Postgres, PgArguments> {
    let mut query = sqlx::query(sql);
    for param in params {
        query = match param {
            SqlValue::Null => query.bind(None::<String>),
            SqlValue::Bool(value) => query.bind(*value),
            SqlValue::Int(value) => query.bind(*value),
            SqlValue::Float(value) => query.bind(*value),
            SqlValue::Text(value) => query.bind(value.clone()),
            // Binds as JSONB on this dialect.
            SqlValue::Json(value) => query.bind(value.clone()),
        };
    }
    query
}

/// Decode by declared column type; PostgreSQL result columns are typed.
fn decode_dynamic(row: &PgRow) -> Result<SqlRow> {
    let mut out = SqlRow::default();
    for column in row.columns() {
        let index = column.ordinal();
        let value = match column.type_info().name() {
            "INT8" => row
                .try_get::<Option<i64>, _>(index)?
                .map(SqlValue::Int)
                .unwrap_or(SqlValue::Null),
            "INT4" => row
                .try_get::<Option<i32>, _>(index)?
                .map(|v| SqlValue::Int(i64::from(v)))
                .unwrap_or(SqlValue::Null),
            "INT2" => row
                .try_get::<Option<i16>, _>(index)?
                .map(|v| SqlValue::Int(i64::from(v)))
                .unwrap_or(SqlValue::Null),
            "FLOAT8" => row
                .try_get::<Option<f64>, _>(index)?
                .map(SqlValue::Float)
                .unwrap_or(SqlValue::Null),
            "FLOAT4" => row
                .try_get::<Option<f32>, _>(index)?
                .map(|v| SqlValue::Float(f64::from(v)))
                .unwrap_or(SqlValue::Null),
            "BOOL" => row
                .try_get::<Option<bool>, _>(index)?
                .map(SqlValue::Bool)
                .unwrap_or(SqlValue::Null),
            "JSON" | "JSONB" => row
                .try_get::<Option<JsonValue>, _>(index)?
                .map(SqlValue::Json)
                .unwrap_or(SqlValue::Null),
            _ => row
                .try_get::<Option<String>, _>(index)?
                .map(SqlValue::Text)
                .unwrap_or(SqlValue::Null),
        };
        out.insert(column.name().to_string(), value);
    }
    Ok(out)
}

#[async_trait]
impl GraphBackend for PostgresBackend {
    fn dialect(&self) -> SqlDialect {
        SqlDialect::Postgres
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            transactions: true,
            returning: true,
            partial_indexes: true,
            gin_indexes: true,
            cte: true,
            jsonb: true,
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
                Ok(Arc::new(PostgresBackend {
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
impl GraphTransaction for PostgresBackend {
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
