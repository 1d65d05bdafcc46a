// Query executor.
// Runs compiled SQL through the backend and assembles projection outputs:
// smart-select resolution (tracking pass), row decoding per shape, cursor
// pagination, lazy streaming, and prepared queries with validated bindings.

use anyhow::{bail, Result};
use base64::{engine::general_purpose::STANDARD_NO_PAD as BASE64_NO_PAD, Engine as _};
use futures::stream::{self, Stream, TryStreamExt};
use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;

use crate::errors::TypeGraphError;
use crate::field_tracker::{AliasRequirement, DecodedRow, FieldTracker, ProjectionCtx, TrackedField};
use crate::graph_store::GraphStore;
use crate::query_ast::{
    FieldRef, OutputBinding, ParamType, Projection, QueryAst, SystemField,
};
use crate::query_builder::{GraphQuery, ProjectionFn};
use crate::query_compiler::{
    ColumnDecode, CompileOptions, CompiledOrderKey, CompiledQuery, QueryCompiler, RowShape,
};
use crate::sql::{SqlRow, SqlValue};
use crate::types::from_millis;

/// One materialized result row: output binding (or alias) name to value.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRow {
    values: Map<String, JsonValue>,
}

impl ResultRow {
    fn new(values: Map<String, JsonValue>) -> Self {
        Self { values }
    }

    pub fn get(&self, name: &str) -> Option<&JsonValue> {
        self.values.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn into_value(self) -> JsonValue {
        JsonValue::Object(self.values)
    }

    /// Deserialize the row into a typed struct.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(JsonValue::Object(self.values.clone())).map_err(|e| {
            TypeGraphError::validation("row", format!("row does not match target type: {e}")).into()
        })
    }
}

/// One page of cursor pagination. `has_next_page` refers to the paging
/// direction (forward for `first`, backward for `last`).
#[derive(Debug, Clone)]
pub struct Page {
    pub rows: Vec<ResultRow>,
    pub has_next_page: bool,
    pub has_prev_page: bool,
    pub next_cursor: Option<String>,
}

/// Cursor-pagination arguments: exactly one of `first`/`last`.
#[derive(Debug, Clone, Default)]
pub struct PageArgs {
    pub first: Option<u64>,
    pub after: Option<String>,
    pub last: Option<u64>,
    pub before: Option<String>,
}

impl PageArgs {
    pub fn first(count: u64) -> Self {
        Self {
            first: Some(count),
            ..Self::default()
        }
    }

    pub fn last(count: u64) -> Self {
        Self {
            last: Some(count),
            ..Self::default()
        }
    }

    pub fn after(mut self, cursor: impl Into<String>) -> Self {
        self.after = Some(cursor.into());
        self
    }

    pub fn before(mut self, cursor: impl Into<String>) -> Self {
        self.before = Some(cursor.into());
        self
    }
}

/// Opaque cursor: base64 of the canonical JSON array of ORDER BY key values.
pub fn encode_cursor(values: &[JsonValue]) -> String {
    let json = serde_json::to_string(values).expect("JSON values always serialize");
    BASE64_NO_PAD.encode(json.as_bytes())
}

pub fn decode_cursor(cursor: &str, expected_len: usize) -> Result<Vec<JsonValue>> {
    let bytes = BASE64_NO_PAD.decode(cursor.as_bytes()).map_err(|_| {
        TypeGraphError::validation("cursor", "cursor is not valid base64")
    })?;
    let values: Vec<JsonValue> = serde_json::from_slice(&bytes).map_err(|_| {
        TypeGraphError::validation("cursor", "cursor does not decode to a JSON array")
    })?;
    if values.len() != expected_len {
        bail!(TypeGraphError::validation(
            "cursor",
            format!(
                "cursor carries {} values but the query orders by {expected_len} keys",
                values.len()
            ),
        ));
    }
    for value in &values {
        if value.is_object() || value.is_array() {
            bail!(TypeGraphError::validation(
                "cursor",
                "cursor components must be scalar values",
            ));
        }
    }
    Ok(values)
}

struct FetchedRow {
    row: ResultRow,
    order_values: Vec<JsonValue>,
}

impl GraphQuery {
    /// Compile without executing; inspect the SQL and parameters.
    pub fn compile(&self) -> Result<CompiledQuery> {
        let ast = self.resolved_ast()?;
        self.compile_ast(&ast, &CompileOptions::default())
    }

    /// Run the query and materialize every row.
    pub async fn execute(&self) -> Result<Vec<ResultRow>> {
        let fetched = self.fetch(&CompileOptions::default()).await?;
        Ok(fetched.into_iter().map(|f| f.row).collect())
    }

    /// Cursor pagination. Requires at least one ORDER BY key.
    pub async fn paginate(&self, args: PageArgs) -> Result<Page> {
        let (count, cursor_text, reverse) = match (args.first, args.last) {
            (Some(count), None) => (count, args.after.clone(), false),
            (None, Some(count)) => (count, args.before.clone(), true),
            _ => bail!(TypeGraphError::validation(
                "paginate",
                "exactly one of first/last must be provided",
            )),
        };
        if args.first.is_some() && args.before.is_some()
            || args.last.is_some() && args.after.is_some()
        {
            bail!(TypeGraphError::validation(
                "paginate",
                "after pairs with first, before pairs with last",
            ));
        }
        if self.ast.order_by.is_empty() {
            bail!(TypeGraphError::validation(
                "paginate",
                "cursor pagination requires at least one ORDER BY key",
            ));
        }

        let cursor = cursor_text
            .as_deref()
            .map(|text| decode_cursor(text, self.ast.order_by.len()))
            .transpose()?;

        let options = CompileOptions {
            cursor,
            take: Some(count + 1),
            reverse,
        };
        let mut fetched = self.fetch(&options).await?;

        let has_more = fetched.len() as u64 > count;
        if has_more {
            fetched.truncate(count as usize);
        }
        let next_cursor = fetched
            .last()
            .map(|row| encode_cursor(&row.order_values));
        if reverse {
            // Rows were fetched in flipped order; restore the query's order.
            fetched.reverse();
        }
        Ok(Page {
            rows: fetched.into_iter().map(|f| f.row).collect(),
            has_next_page: has_more,
            has_prev_page: cursor_text.is_some(),
            next_cursor,
        })
    }

    /// A lazy, finite stream of rows: `paginate` looped with the given batch
    /// size. Dropping the stream early issues no further fetches.
    pub fn stream(&self, batch_size: u64) -> impl Stream<Item = Result<ResultRow>> {
        let query = self.clone();
        let batch = batch_size.max(1);
        stream::try_unfold(
            (query, None::<String>, false),
            move |(query, cursor, done)| async move {
                if done {
                    return Ok::<_, anyhow::Error>(None);
                }
                let mut args = PageArgs::first(batch);
                if let Some(cursor) = cursor {
                    args = args.after(cursor);
                }
                let page = query.paginate(args).await?;
                let next_cursor = page.next_cursor.clone();
                let finished = !page.has_next_page;
                let rows = stream::iter(page.rows.into_iter().map(Ok::<_, anyhow::Error>));
                Ok(Some((rows, (query, next_cursor, finished))))
            },
        )
        .try_flatten()
    }

    /// Compile once into a reusable prepared query with named parameters.
    pub fn prepare(&self) -> Result<PreparedQuery> {
        let ast = self.resolved_ast()?;
        let compiled = self.compile_ast(&ast, &CompileOptions::default())?;
        let descriptor = compiled.param_names();
        Ok(PreparedQuery {
            store: self.store.clone(),
            ast,
            compiled,
            descriptor,
            projection_fn: self.projection_fn.clone(),
        })
    }

    fn compile_ast(&self, ast: &QueryAst, options: &CompileOptions) -> Result<CompiledQuery> {
        let backend = self.store.backend();
        let compiler = QueryCompiler {
            registry: self.store.registry().as_ref(),
            dialect: backend.dialect(),
            table_names: backend.table_names(),
            graph_id: self.store.graph_id(),
        };
        compiler.compile(ast, options)
    }

    async fn fetch(&self, options: &CompileOptions) -> Result<Vec<FetchedRow>> {
        let ast = self.resolved_ast()?;
        let compiled = self.compile_ast(&ast, options)?;
        let backend = self.store.backend();
        if !backend.capabilities().compiled_sql {
            bail!(TypeGraphError::configuration(
                "this backend does not execute compiled SQL",
            ));
        }
        let statement = compiled.statement()?;
        let sql_rows = backend.execute(statement).await?;
        decode_rows(
            sql_rows,
            &compiled.shape,
            &compiled.order_keys,
            &ast,
            self.projection_fn.as_ref(),
        )
    }

    /// Resolve the smart-select callback (when present) into a concrete
    /// projection by running the tracking pass(es).
    fn resolved_ast(&self) -> Result<QueryAst> {
        let Some(callback) = &self.projection_fn else {
            return Ok(self.ast.clone());
        };

        let tracker = FieldTracker::new();
        {
            let ctx = ProjectionCtx::tracking(&tracker, true);
            let _ = callback(&ctx);
        }
        if self.ast.traversals.iter().any(|step| step.optional) {
            let second = FieldTracker::new();
            {
                let ctx = ProjectionCtx::tracking(&second, false);
                let _ = callback(&ctx);
            }
            tracker.absorb(second);
        }
        let requirements = tracker.requirements();

        let mut ast = self.ast.clone();
        let introduced: Vec<String> = ast
            .introduced_aliases()
            .into_iter()
            .map(str::to_string)
            .collect();

        if requirements.is_empty() {
            ast.projection = Projection::Aliases(introduced);
            return Ok(ast);
        }

        let any_whole = requirements
            .values()
            .any(|requirement| matches!(requirement, AliasRequirement::Whole));
        if any_whole {
            // Whole-alias access disables selectivity: fall back to full rows
            // for every accessed alias, in introduction order.
            let accessed: Vec<String> = introduced
                .iter()
                .filter(|alias| requirements.contains_key(*alias))
                .cloned()
                .collect();
            ast.projection = Projection::Aliases(accessed);
            return Ok(ast);
        }

        let mut bindings = Vec::new();
        for alias in &introduced {
            let Some(AliasRequirement::Fields(fields)) = requirements.get(alias) else {
                continue;
            };
            for tracked in fields {
                let field = match tracked {
                    TrackedField::Prop(path) => FieldRef::Prop {
                        alias: alias.clone(),
                        path: path.clone(),
                    },
                    TrackedField::System(column) => {
                        let system = SystemField::from_column(column).ok_or_else(|| {
                            TypeGraphError::invariant(format!(
                                "tracked unknown system column '{column}'"
                            ))
                        })?;
                        FieldRef::System {
                            alias: alias.clone(),
                            field: system,
                        }
                    }
                };
                bindings.push(OutputBinding {
                    name: field.output_name(),
                    field,
                });
            }
        }
        ast.projection = Projection::Fields(bindings);
        Ok(ast)
    }
}

/// A compiled query plus its binding descriptor and reusable decode plan.
pub struct PreparedQuery {
    store: GraphStore,
    ast: QueryAst,
    compiled: CompiledQuery,
    descriptor: Vec<(String, ParamType)>,
    projection_fn: Option<ProjectionFn>,
}

impl PreparedQuery {
    pub fn sql(&self) -> &str {
        &self.compiled.sql
    }

    /// Parameter names and nominal types, in first-appearance order.
    pub fn bindings(&self) -> &[(String, ParamType)] {
        &self.descriptor
    }

    /// Execute with named bindings. Extra keys, missing keys, nulls, and
    /// type mismatches are all rejected before any SQL runs.
    pub async fn execute(&self, bindings: &HashMap<String, JsonValue>) -> Result<Vec<ResultRow>> {
        for key in bindings.keys() {
            if !self.descriptor.iter().any(|(name, _)| name == key) {
                bail!(TypeGraphError::validation(
                    format!("param.{key}"),
                    "query declares no such parameter",
                ));
            }
        }
        let mut encoded: HashMap<String, SqlValue> = HashMap::new();
        for (name, ty) in &self.descriptor {
            let value = bindings.get(name).ok_or_else(|| {
                TypeGraphError::validation(format!("param.{name}"), "missing binding")
            })?;
            let sql_value = match (ty, value) {
                (_, JsonValue::Null) => bail!(TypeGraphError::validation(
                    format!("param.{name}"),
                    "bindings cannot be null; use is_null predicates instead",
                )),
                (ParamType::Text, JsonValue::String(s)) => SqlValue::Text(s.clone()),
                (ParamType::Number, JsonValue::Number(n)) => {
                    if let Some(int) = n.as_i64() {
                        SqlValue::Int(int)
                    } else {
                        let float = n.as_f64().filter(|f| f.is_finite()).ok_or_else(|| {
                            TypeGraphError::validation(
                                format!("param.{name}"),
                                "number binding must be finite",
                            )
                        })?;
                        SqlValue::Float(float)
                    }
                }
                (ParamType::Boolean, JsonValue::Bool(flag)) => SqlValue::Bool(*flag),
                (ty, other) => bail!(TypeGraphError::validation(
                    format!("param.{name}"),
                    format!("expected a {} binding, got {other}", ty.name()),
                )),
            };
            encoded.insert(name.clone(), sql_value);
        }

        let statement = self.compiled.bind(&encoded)?;
        let backend = self.store.backend();
        if !backend.capabilities().compiled_sql {
            bail!(TypeGraphError::configuration(
                "this backend does not execute compiled SQL",
            ));
        }
        let sql_rows = backend
            .execute_raw(&statement.sql, &statement.params)
            .await?;
        let fetched = decode_rows(
            sql_rows,
            &self.compiled.shape,
            &self.compiled.order_keys,
            &self.ast,
            self.projection_fn.as_ref(),
        )?;
        Ok(fetched.into_iter().map(|f| f.row).collect())
    }
}

// --- row decoding ---

fn decode_rows(
    sql_rows: Vec<SqlRow>,
    shape: &RowShape,
    order_keys: &[CompiledOrderKey],
    ast: &QueryAst,
    projection_fn: Option<&ProjectionFn>,
) -> Result<Vec<FetchedRow>> {
    let mut out = Vec::with_capacity(sql_rows.len());
    for sql_row in sql_rows {
        // Cursor values come from the raw columns, before any prettifying.
        let mut order_values = Vec::with_capacity(order_keys.len());
        for key in order_keys {
            let value = sql_row
                .get(&key.output)
                .cloned()
                .unwrap_or(SqlValue::Null)
                .into_json();
            order_values.push(value);
        }

        let decoded = decode_shape(&sql_row, shape)?;
        let row = match projection_fn {
            Some(callback) => {
                let ctx = ProjectionCtx::reading(&decoded);
                match callback(&ctx) {
                    JsonValue::Object(map) => ResultRow::new(map),
                    other => {
                        let mut map = Map::new();
                        map.insert("value".to_string(), other);
                        ResultRow::new(map)
                    }
                }
            }
            None => assemble_row(decoded, shape, ast),
        };
        out.push(FetchedRow { row, order_values });
    }
    Ok(out)
}

fn decode_shape(sql_row: &SqlRow, shape: &RowShape) -> Result<DecodedRow> {
    let mut decoded = DecodedRow::default();
    match shape {
        RowShape::Selective(columns) => {
            for column in columns {
                let raw = sql_row.get(&column.output).cloned().unwrap_or(SqlValue::Null);
                let value = decode_column(raw, column.decode)?;
                decoded.columns.insert(column.output.clone(), value);
            }
        }
        RowShape::FullRows(roles) => {
            for role in roles {
                let object = if role.recursive {
                    decode_recursive_alias(sql_row, &role.alias)?
                } else if role.is_edge {
                    decode_edge_alias(sql_row, &role.alias)?
                } else {
                    decode_node_alias(sql_row, &role.alias)?
                };
                match object {
                    Some(object) => {
                        decoded.aliases.insert(role.alias.clone(), object);
                    }
                    None => {
                        decoded.absent.insert(role.alias.clone());
                        decoded
                            .aliases
                            .insert(role.alias.clone(), JsonValue::Null);
                    }
                }
            }
        }
        RowShape::Aggregate(names) => {
            for name in names {
                let value = sql_row.get(name).cloned().unwrap_or(SqlValue::Null);
                decoded.columns.insert(name.clone(), value.into_json());
            }
        }
    }
    Ok(decoded)
}

/// Assemble the default (no-callback) output row.
fn assemble_row(decoded: DecodedRow, shape: &RowShape, ast: &QueryAst) -> ResultRow {
    let mut map = Map::new();
    match shape {
        RowShape::Selective(columns) => {
            for column in columns {
                let value = decoded
                    .columns
                    .get(&column.output)
                    .cloned()
                    .unwrap_or(JsonValue::Null);
                map.insert(column.output.clone(), value);
            }
        }
        RowShape::FullRows(_) => {
            for (alias, object) in &decoded.aliases {
                map.insert(alias.clone(), object.clone());
            }
            // Surface requested depth/path bindings under their own names.
            for step in &ast.traversals {
                if let Some(recursion) = &step.recursion {
                    let source = decoded.aliases.get(&step.edge_alias);
                    if let Some(name) = &recursion.depth_binding {
                        let depth = source
                            .and_then(|o| o.get("depth"))
                            .cloned()
                            .unwrap_or(JsonValue::Null);
                        map.insert(name.clone(), depth);
                    }
                    if let Some(name) = &recursion.path_binding {
                        let path = source
                            .and_then(|o| o.get("path"))
                            .cloned()
                            .unwrap_or(JsonValue::Null);
                        map.insert(name.clone(), path);
                    }
                }
            }
        }
        RowShape::Aggregate(names) => {
            for name in names {
                let value = decoded
                    .columns
                    .get(name)
                    .cloned()
                    .unwrap_or(JsonValue::Null);
                map.insert(name.clone(), value);
            }
        }
    }
    ResultRow::new(map)
}

fn decode_column(raw: SqlValue, decode: ColumnDecode) -> Result<JsonValue> {
    Ok(match decode {
        ColumnDecode::Timestamp => match raw {
            SqlValue::Null => JsonValue::Null,
            SqlValue::Int(ms) => JsonValue::String(from_millis(ms).to_rfc3339()),
            other => other.into_json(),
        },
        ColumnDecode::PropValue => decode_prop_value(raw),
        ColumnDecode::Scalar => raw.into_json(),
    })
}

/// SQLite's json_extract yields structures as JSON text; PostgreSQL's `#>`
/// yields parsed jsonb. Normalize both to parsed values.
fn decode_prop_value(raw: SqlValue) -> JsonValue {
    match raw {
        SqlValue::Json(value) => value,
        SqlValue::Text(text) => {
            let trimmed = text.trim_start();
            if trimmed.starts_with('{') || trimmed.starts_with('[') {
                serde_json::from_str(&text).unwrap_or(JsonValue::String(text))
            } else {
                JsonValue::String(text)
            }
        }
        other => other.into_json(),
    }
}

fn decode_node_alias(sql_row: &SqlRow, alias: &str) -> Result<Option<JsonValue>> {
    let id = match sql_row.opt_str(&format!("{alias}_id"))? {
        Some(id) => id.to_string(),
        None => return Ok(None),
    };
    let mut object = Map::new();
    object.insert("id".to_string(), JsonValue::String(id));
    object.insert(
        "kind".to_string(),
        JsonValue::String(sql_row.required_str(&format!("{alias}_kind"))?.to_string()),
    );
    object.insert(
        "props".to_string(),
        sql_row
            .required(&format!("{alias}_props"))?
            .as_json()?,
    );
    object.insert(
        "version".to_string(),
        JsonValue::from(sql_row.required_i64(&format!("{alias}_version"))?),
    );
    insert_timestamps(&mut object, sql_row, alias)?;
    Ok(Some(JsonValue::Object(object)))
}

fn decode_edge_alias(sql_row: &SqlRow, alias: &str) -> Result<Option<JsonValue>> {
    let id = match sql_row.opt_str(&format!("{alias}_id"))? {
        Some(id) => id.to_string(),
        None => return Ok(None),
    };
    let mut object = Map::new();
    object.insert("id".to_string(), JsonValue::String(id));
    for column in ["kind", "from_kind", "from_id", "to_kind", "to_id"] {
        object.insert(
            column.to_string(),
            JsonValue::String(
                sql_row
                    .required_str(&format!("{alias}_{column}"))?
                    .to_string(),
            ),
        );
    }
    object.insert(
        "props".to_string(),
        sql_row
            .required(&format!("{alias}_props"))?
            .as_json()?,
    );
    insert_timestamps(&mut object, sql_row, alias)?;
    Ok(Some(JsonValue::Object(object)))
}

fn decode_recursive_alias(sql_row: &SqlRow, alias: &str) -> Result<Option<JsonValue>> {
    let depth = match sql_row.opt_i64(&format!("{alias}_depth"))? {
        Some(depth) => depth,
        None => return Ok(None),
    };
    let mut object = Map::new();
    object.insert("depth".to_string(), JsonValue::from(depth));
    if let Some(path) = sql_row.opt_str(&format!("{alias}_path"))? {
        object.insert("path".to_string(), JsonValue::String(path.to_string()));
    }
    Ok(Some(JsonValue::Object(object)))
}

fn insert_timestamps(object: &mut Map<String, JsonValue>, sql_row: &SqlRow, alias: &str) -> Result<()> {
    for column in ["created_at", "updated_at", "deleted_at", "valid_from", "valid_to"] {
        let value = match sql_row.opt_i64(&format!("{alias}_{column}"))? {
            Some(ms) => JsonValue::String(from_millis(ms).to_rfc3339()),
            None => JsonValue::Null,
        };
        object.insert(column.to_string(), value);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cursor_round_trip() {
        let values = vec![json!("ada"), json!(42)];
        let cursor = encode_cursor(&values);
        assert_eq!(decode_cursor(&cursor, 2).unwrap(), values);
    }

    #[test]
    fn cursor_rejects_garbage_and_shape_mismatch() {
        assert!(decode_cursor("!!!not-base64!!!", 1).is_err());

        let cursor = encode_cursor(&[json!(1)]);
        assert!(decode_cursor(&cursor, 2).is_err());

        let nested = encode_cursor(&[json!({"a": 1})]);
        assert!(decode_cursor(&nested, 1).is_err());

        let not_array = BASE64_NO_PAD.encode(b"{\"a\":1}");
        assert!(decode_cursor(&not_array, 1).is_err());
    }

    #[test]
    fn prop_value_normalization() {
        assert_eq!(
            decode_prop_value(SqlValue::Text("plain".to_string())),
            json!("plain")
        );
        assert_eq!(
            decode_prop_value(SqlValue::Text(r#"{"a":1}"#.to_string())),
            json!({"a": 1})
        );
        assert_eq!(decode_prop_value(SqlValue::Int(7)), json!(7));
        assert_eq!(
            decode_prop_value(SqlValue::Json(json!([1, 2]))),
            json!([1, 2])
        );
    }
}
