// Query compiler.
// Turns a QueryAst into dialect-specific SQL built from one CTE per alias:
// the source CTE filters nodes by kind and temporal mode, each traversal
// contributes an edge CTE and a target CTE, and the final SELECT wires them
// together with JOINs (LEFT for optional steps). Recursive traversals become
// recursive CTEs carrying a visited path for cycle detection. Predicates
// touching a single alias are pushed into that alias's CTE; everything else
// lands in the terminal WHERE.

use anyhow::{bail, Result};
use chrono::Utc;
use serde_json::Value as JsonValue;
use std::collections::{HashMap, HashSet};

use crate::dialect::SqlDialect;
use crate::errors::TypeGraphError;
use crate::query_ast::{
    AggOutput, AggTarget, CompareOp, Direction, Expr, FieldRef, Operand, OrderKey, ParamType,
    Projection, QueryAst, SourceSpec, TraversalStep,
};
use crate::registry::KindRegistry;
use crate::sql::{SqlStatement, SqlValue};
use crate::types::{to_millis, TableNames, TemporalMode};

/// A bind slot: either a literal fixed at compile time or a named parameter
/// resolved at execution time.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamEntry {
    Value(SqlValue),
    Named { name: String, ty: ParamType },
}

/// How the executor decodes one selective output column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnDecode {
    /// A prop value (typed JSON extraction).
    PropValue,
    /// Milliseconds-since-epoch system timestamp.
    Timestamp,
    /// Plain scalar column.
    Scalar,
}

#[derive(Debug, Clone)]
pub struct SelectiveColumn {
    pub output: String,
    pub decode: ColumnDecode,
}

/// The role one alias plays in a full-row projection.
#[derive(Debug, Clone)]
pub struct AliasRole {
    pub alias: String,
    pub is_edge: bool,
    pub recursive: bool,
    pub optional: bool,
}

/// Shape of the result rows, driving the executor's decoder.
#[derive(Debug, Clone)]
pub enum RowShape {
    Selective(Vec<SelectiveColumn>),
    FullRows(Vec<AliasRole>),
    Aggregate(Vec<String>),
}

/// An ORDER BY key as compiled: the output column it surfaces as, the raw
/// SQL expression (usable in WHERE for cursor bounds), and its direction.
#[derive(Debug, Clone)]
pub struct CompiledOrderKey {
    pub output: String,
    pub expr: String,
    pub descending: bool,
    /// Cursor bounds for prop keys bind as JSON on jsonb dialects.
    pub is_prop: bool,
}

/// A fully compiled query.
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    pub sql: String,
    pub params: Vec<ParamEntry>,
    pub shape: RowShape,
    pub order_keys: Vec<CompiledOrderKey>,
}

impl CompiledQuery {
    /// Named parameters in first-appearance order, deduplicated.
    pub fn param_names(&self) -> Vec<(String, ParamType)> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for entry in &self.params {
            if let ParamEntry::Named { name, ty } = entry {
                if seen.insert(name.clone()) {
                    out.push((name.clone(), *ty));
                }
            }
        }
        out
    }

    /// Materialize a statement. Fails if named parameters remain unbound.
    pub fn statement(&self) -> Result<SqlStatement> {
        let mut params = Vec::with_capacity(self.params.len());
        for entry in &self.params {
            match entry {
                ParamEntry::Value(value) => params.push(value.clone()),
                ParamEntry::Named { name, .. } => bail!(TypeGraphError::validation(
                    format!("param.{name}"),
                    "query has unbound parameters; use prepare() and bind them",
                )),
            }
        }
        Ok(SqlStatement::new(self.sql.clone(), params))
    }

    /// Materialize a statement with named parameters substituted.
    pub fn bind(&self, bindings: &HashMap<String, SqlValue>) -> Result<SqlStatement> {
        let mut params = Vec::with_capacity(self.params.len());
        for entry in &self.params {
            match entry {
                ParamEntry::Value(value) => params.push(value.clone()),
                ParamEntry::Named { name, .. } => {
                    let value = bindings.get(name).ok_or_else(|| {
                        TypeGraphError::validation(
                            format!("param.{name}"),
                            "missing binding for parameter",
                        )
                    })?;
                    params.push(value.clone());
                }
            }
        }
        Ok(SqlStatement::new(self.sql.clone(), params))
    }
}

/// Cursor-driven compile options applied by paginate/stream.
#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    /// Lexicographic lower/upper bound from a decoded cursor, aligned with
    /// the ORDER BY keys.
    pub cursor: Option<Vec<JsonValue>>,
    /// Row budget overriding the AST's limit (page size + 1).
    pub take: Option<u64>,
    /// Flip every ORDER BY direction (backward pagination).
    pub reverse: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AliasKind {
    Node,
    Edge,
    RecursiveEdge,
}

#[derive(Debug, Clone)]
struct AliasInfo {
    cte: String,
    kind: AliasKind,
    optional: bool,
}

/// Compiles ASTs against one registry + dialect + table layout.
pub struct QueryCompiler<'a> {
    pub registry: &'a KindRegistry,
    pub dialect: SqlDialect,
    pub table_names: &'a TableNames,
    pub graph_id: &'a str,
}

impl<'a> QueryCompiler<'a> {
    pub fn compile(&self, ast: &QueryAst, options: &CompileOptions) -> Result<CompiledQuery> {
        let mut emitter = Emitter {
            compiler: self,
            params: Vec::new(),
            ctes: Vec::new(),
            has_recursive: false,
            subquery_counter: 0,
        };
        let unit = emitter.emit_compound(ast, "", options, true)?;
        let mut sql = String::new();
        if !emitter.ctes.is_empty() {
            sql.push_str("WITH ");
            if emitter.has_recursive {
                sql.push_str("RECURSIVE ");
            }
            sql.push_str(&emitter.ctes.join(", "));
            sql.push(' ');
        }
        sql.push_str(&unit.select);
        let (sql, params) = finalize_placeholders(&sql, emitter.params, self.dialect)?;
        Ok(CompiledQuery {
            sql,
            params,
            shape: unit.shape,
            order_keys: unit.order_keys,
        })
    }
}

/// Interim marker wrapping a parameter slot index during emission.
///
/// Subquery and set-operation CTEs are hoisted into the one leading WITH
/// list, so params accumulate in evaluation order, not textual order.
/// Placeholders are therefore assigned only here, by scanning the assembled
/// text: each marker becomes the dialect placeholder for its textual
/// position and the parameter vector is permuted to match, which keeps
/// SQLite's positional `?` binding and PostgreSQL's `$n` numbering correct.
const PARAM_MARK: char = '\u{0002}';

fn param_marker(index: usize) -> String {
    format!("{PARAM_MARK}{index}{PARAM_MARK}")
}

fn finalize_placeholders(
    sql: &str,
    params: Vec<ParamEntry>,
    dialect: SqlDialect,
) -> Result<(String, Vec<ParamEntry>)> {
    let mut out = String::with_capacity(sql.len());
    let mut ordered = Vec::with_capacity(params.len());
    let mut bound = vec![false; params.len()];
    let mut rest = sql;
    while let Some(start) = rest.find(PARAM_MARK) {
        out.push_str(&rest[..start]);
        let after = &rest[start + PARAM_MARK.len_utf8()..];
        let end = after
            .find(PARAM_MARK)
            .ok_or_else(|| TypeGraphError::invariant("unterminated parameter marker"))?;
        let index: usize = after[..end]
            .parse()
            .map_err(|_| TypeGraphError::invariant("malformed parameter marker"))?;
        let entry = params
            .get(index)
            .cloned()
            .ok_or_else(|| TypeGraphError::invariant("parameter marker out of range"))?;
        if std::mem::replace(&mut bound[index], true) {
            bail!(TypeGraphError::invariant("parameter slot bound twice"));
        }
        ordered.push(entry);
        out.push_str(&dialect.placeholder(ordered.len()));
        rest = &after[end + PARAM_MARK.len_utf8()..];
    }
    out.push_str(rest);
    if ordered.len() != params.len() {
        bail!(TypeGraphError::invariant("unbound parameter slots"));
    }
    Ok((out, ordered))
}

struct CompiledUnit {
    select: String,
    shape: RowShape,
    order_keys: Vec<CompiledOrderKey>,
    column_count: usize,
}

struct Emitter<'a> {
    compiler: &'a QueryCompiler<'a>,
    params: Vec<ParamEntry>,
    ctes: Vec<String>,
    has_recursive: bool,
    subquery_counter: usize,
}

const NODE_COLUMNS: [&str; 9] = [
    "id",
    "kind",
    "props",
    "version",
    "valid_from",
    "valid_to",
    "created_at",
    "updated_at",
    "deleted_at",
];

const EDGE_COLUMNS: [&str; 12] = [
    "id",
    "kind",
    "from_kind",
    "from_id",
    "to_kind",
    "to_id",
    "props",
    "valid_from",
    "valid_to",
    "created_at",
    "updated_at",
    "deleted_at",
];

impl<'a> Emitter<'a> {
    fn dialect(&self) -> SqlDialect {
        self.compiler.dialect
    }

    fn push_value(&mut self, value: SqlValue) -> String {
        self.params.push(ParamEntry::Value(value));
        param_marker(self.params.len() - 1)
    }

    fn push_named(&mut self, name: &str, ty: ParamType) -> String {
        self.params.push(ParamEntry::Named {
            name: name.to_string(),
            ty,
        });
        param_marker(self.params.len() - 1)
    }

    /// Compile a query and any set-operation chain hanging off it. Member
    /// units keep their ORDER BY/LIMIT suppressed (`inline_tail = false`);
    /// only the outermost statement may carry an inline tail.
    fn emit_compound(
        &mut self,
        ast: &QueryAst,
        prefix: &str,
        options: &CompileOptions,
        inline_tail: bool,
    ) -> Result<CompiledUnit> {
        let Some(set_op) = &ast.set_op else {
            return self.emit_unit(ast, prefix, options, inline_tail);
        };

        if options.cursor.is_some() {
            bail!(TypeGraphError::validation(
                "paginate",
                "cursor pagination over set operations is not supported",
            ));
        }

        let left = self.emit_unit(ast, prefix, &CompileOptions::default(), false)?;
        let right_prefix = format!("{prefix}r_");
        let right =
            self.emit_compound(&set_op.right, &right_prefix, &CompileOptions::default(), false)?;

        if left.column_count != right.column_count {
            bail!(TypeGraphError::validation(
                "setOperation",
                format!(
                    "projection arity mismatch: left has {} columns, right has {}",
                    left.column_count, right.column_count
                ),
            ));
        }

        let mut select = format!(
            "{} {} {}",
            left.select,
            set_op.operator.keyword(),
            right.select
        );
        if inline_tail {
            if !left.order_keys.is_empty() {
                let keys: Vec<String> = left
                    .order_keys
                    .iter()
                    .map(|key| {
                        format!(
                            "\"{}\" {}",
                            key.output,
                            if key.descending { "DESC" } else { "ASC" }
                        )
                    })
                    .collect();
                select.push_str(&format!(" ORDER BY {}", keys.join(", ")));
            }
            if let Some(limit) = set_op.limit {
                select.push_str(&format!(" LIMIT {limit}"));
            }
            if let Some(offset) = set_op.offset {
                select.push_str(&format!(" OFFSET {offset}"));
            }
        }

        Ok(CompiledUnit {
            select,
            shape: left.shape,
            order_keys: left.order_keys,
            column_count: left.column_count,
        })
    }

    /// Compile one query without its set-operation chain.
    fn emit_unit(
        &mut self,
        ast: &QueryAst,
        prefix: &str,
        options: &CompileOptions,
        inline_tail: bool,
    ) -> Result<CompiledUnit> {
        let aliases = self.collect_aliases(ast, prefix)?;
        let (pushdown, terminal) = self.split_predicates(ast, &aliases)?;

        self.emit_source_cte(&ast.source, ast, prefix, pushdown.get(ast.source.alias.as_str()))?;
        for step in &ast.traversals {
            self.emit_traversal_ctes(step, ast, prefix, &aliases, &pushdown)?;
        }

        let mut from = format!(
            "FROM {} {}",
            aliases[ast.source.alias.as_str()].cte, ast.source.alias
        );
        let mut where_clauses: Vec<String> = Vec::new();

        for step in &ast.traversals {
            self.emit_joins(step, &aliases, &mut from, &mut where_clauses)?;
        }

        for expr in &terminal {
            let rendered = self.render_expr(expr, &aliases)?;
            where_clauses.push(rendered);
        }

        let mut order_keys = self.compile_order_keys(&ast.order_by, &aliases, options.reverse)?;
        if !inline_tail {
            // A compound's outer ORDER BY can only reference output columns,
            // so member ordering must map onto selected fields.
            remap_compound_order_keys(ast, &mut order_keys)?;
        }

        if let Some(cursor) = &options.cursor {
            if order_keys.is_empty() {
                bail!(TypeGraphError::validation(
                    "paginate",
                    "cursor pagination requires at least one ORDER BY key",
                ));
            }
            if cursor.len() != order_keys.len() {
                bail!(TypeGraphError::validation(
                    "cursor",
                    format!(
                        "cursor carries {} values but the query orders by {} keys",
                        cursor.len(),
                        order_keys.len()
                    ),
                ));
            }
            let clause = self.cursor_clause(cursor, &order_keys)?;
            where_clauses.push(clause);
        }

        let (select_list, shape, column_count, group_having) =
            self.emit_projection(ast, &aliases, &order_keys, inline_tail)?;

        let mut select = format!("SELECT {select_list} {from}");
        if !where_clauses.is_empty() {
            select.push_str(&format!(" WHERE {}", where_clauses.join(" AND ")));
        }
        if let Some(group_having) = group_having {
            select.push_str(&group_having);
        }
        if inline_tail {
            if !order_keys.is_empty() {
                // Aggregations order by the grouped expression; row shapes
                // order by the output column, which is always part of the
                // select list.
                let by_expr = matches!(&ast.projection, Projection::Aggregate { .. });
                let keys: Vec<String> = order_keys
                    .iter()
                    .map(|key| {
                        let target = if by_expr {
                            key.expr.clone()
                        } else {
                            format!("\"{}\"", key.output)
                        };
                        format!("{target} {}", if key.descending { "DESC" } else { "ASC" })
                    })
                    .collect();
                select.push_str(&format!(" ORDER BY {}", keys.join(", ")));
            }

            let limit = options.take.or(ast.pagination.limit);
            if let Some(limit) = limit {
                select.push_str(&format!(" LIMIT {limit}"));
            }
            if options.take.is_none() {
                if let Some(offset) = ast.pagination.offset {
                    select.push_str(&format!(" OFFSET {offset}"));
                }
            }
        }

        Ok(CompiledUnit {
            select,
            shape,
            order_keys,
            column_count,
        })
    }

    // --- alias table ---

    fn collect_aliases(
        &self,
        ast: &QueryAst,
        prefix: &str,
    ) -> Result<HashMap<String, AliasInfo>> {
        let mut aliases: HashMap<String, AliasInfo> = HashMap::new();

        insert_alias(
            &mut aliases,
            &ast.source.alias,
            AliasInfo {
                cte: format!("{prefix}cte_{}", ast.source.alias),
                kind: AliasKind::Node,
                optional: false,
            },
        )?;

        for step in &ast.traversals {
            let Some(upstream) = aliases.get(step.join_from_alias.as_str()) else {
                bail!(TypeGraphError::validation(
                    format!("alias.{}", step.join_from_alias),
                    "traversal joins from an alias that was never introduced",
                ));
            };
            let optional = step.optional || upstream.optional;
            insert_alias(
                &mut aliases,
                &step.edge_alias,
                AliasInfo {
                    cte: format!("{prefix}cte_{}", step.edge_alias),
                    kind: if step.recursion.is_some() {
                        AliasKind::RecursiveEdge
                    } else {
                        AliasKind::Edge
                    },
                    optional,
                },
            )?;
            insert_alias(
                &mut aliases,
                &step.to.alias,
                AliasInfo {
                    cte: format!("{prefix}cte_{}", step.to.alias),
                    kind: AliasKind::Node,
                    optional,
                },
            )?;
        }
        Ok(aliases)
    }

    // --- predicate classification ---

    fn split_predicates<'e>(
        &self,
        ast: &'e QueryAst,
        aliases: &HashMap<String, AliasInfo>,
    ) -> Result<(HashMap<String, Vec<&'e Expr>>, Vec<&'e Expr>)> {
        let mut pushdown: HashMap<String, Vec<&Expr>> = HashMap::new();
        let mut terminal: Vec<&Expr> = Vec::new();

        let conjuncts: Vec<&Expr> = match &ast.predicate {
            None => Vec::new(),
            Some(Expr::And(exprs)) => exprs.iter().collect(),
            Some(expr) => vec![expr],
        };

        for expr in conjuncts {
            let referenced = expr.referenced_aliases();
            for alias in &referenced {
                let Some(info) = aliases.get(alias) else {
                    bail!(TypeGraphError::validation(
                        format!("alias.{alias}"),
                        "predicate references an alias the query never introduces",
                    ));
                };
                if info.kind == AliasKind::RecursiveEdge {
                    bail!(TypeGraphError::validation(
                        format!("alias.{alias}"),
                        "predicates on recursive traversal edges are not supported; use hop bounds",
                    ));
                }
            }
            if referenced.len() == 1 && !expr.contains_subquery() {
                let alias = referenced.into_iter().next().unwrap();
                pushdown.entry(alias).or_default().push(expr);
            } else {
                terminal.push(expr);
            }
        }
        Ok((pushdown, terminal))
    }

    // --- CTE emission ---

    fn temporal_clause(&mut self, table_alias: &str, temporal: TemporalMode) -> String {
        match temporal {
            TemporalMode::IncludeTombstones => String::new(),
            TemporalMode::IncludeEnded => format!(" AND {table_alias}.deleted_at IS NULL"),
            TemporalMode::Current | TemporalMode::AsOf(_) => {
                let at = match temporal {
                    TemporalMode::AsOf(at) => at,
                    _ => Utc::now(),
                };
                let p1 = self.push_value(SqlValue::Int(to_millis(at)));
                let p2 = self.push_value(SqlValue::Int(to_millis(at)));
                format!(
                    " AND {table_alias}.deleted_at IS NULL AND ({table_alias}.valid_from IS NULL OR {table_alias}.valid_from <= {p1}) AND ({table_alias}.valid_to IS NULL OR {table_alias}.valid_to > {p2})"
                )
            }
        }
    }

    fn kind_list(&mut self, kinds: &[String]) -> String {
        let placeholders: Vec<String> = kinds
            .iter()
            .map(|kind| self.push_value(SqlValue::Text(kind.clone())))
            .collect();
        placeholders.join(", ")
    }

    fn expand_node_kinds(&self, spec: &SourceSpec) -> Result<Vec<String>> {
        let mut out = Vec::new();
        for kind in &spec.kinds {
            if !self.compiler.registry.is_node_kind(kind) {
                bail!(TypeGraphError::KindNotFound { kind: kind.clone() });
            }
            if spec.include_subclasses {
                for expanded in self.compiler.registry.expand_sub_classes(kind) {
                    if !out.contains(&expanded) {
                        out.push(expanded);
                    }
                }
            } else if !out.contains(kind) {
                out.push(kind.clone());
            }
        }
        if out.is_empty() {
            bail!(TypeGraphError::validation(
                "source",
                "query source declares no kinds",
            ));
        }
        Ok(out)
    }

    fn emit_source_cte(
        &mut self,
        spec: &SourceSpec,
        ast: &QueryAst,
        prefix: &str,
        pushed: Option<&Vec<&Expr>>,
    ) -> Result<()> {
        let kinds = self.expand_node_kinds(spec)?;
        let cte = format!("{prefix}cte_{}", spec.alias);
        let graph = self.push_value(SqlValue::Text(self.compiler.graph_id.to_string()));
        let kind_list = self.kind_list(&kinds);
        let temporal = self.temporal_clause("t", ast.temporal);
        let mut sql = format!(
            "SELECT t.{} FROM {} t WHERE t.graph_id = {graph} AND t.kind IN ({kind_list}){temporal}",
            NODE_COLUMNS.join(", t."),
            self.compiler.table_names.nodes,
        );
        if let Some(exprs) = pushed {
            let aliases = single_alias_map(&spec.alias, AliasKind::Node);
            for expr in exprs {
                let rendered = self.render_expr_with(expr, &aliases, "t")?;
                sql.push_str(&format!(" AND {rendered}"));
            }
        }
        self.ctes.push(format!("{cte} AS ({sql})"));
        Ok(())
    }

    fn emit_traversal_ctes(
        &mut self,
        step: &TraversalStep,
        ast: &QueryAst,
        prefix: &str,
        aliases: &HashMap<String, AliasInfo>,
        pushdown: &HashMap<String, Vec<&Expr>>,
    ) -> Result<()> {
        for kind in &step.edge_kinds {
            if !self.compiler.registry.is_edge_kind(kind) {
                bail!(TypeGraphError::KindNotFound { kind: kind.clone() });
            }
        }
        // Expansion happens before any recursion is compiled, so implied and
        // inverse kinds participate in every recursive step.
        let edge_kinds = self
            .compiler
            .registry
            .expand_edge_kinds(&step.edge_kinds, step.expansion);

        match &step.recursion {
            None => {
                let cte = format!("{prefix}cte_{}", step.edge_alias);
                let graph = self.push_value(SqlValue::Text(self.compiler.graph_id.to_string()));
                let kind_list = self.kind_list(&edge_kinds);
                let temporal = self.temporal_clause("t", ast.temporal);
                let mut sql = format!(
                    "SELECT t.{} FROM {} t WHERE t.graph_id = {graph} AND t.kind IN ({kind_list}){temporal}",
                    EDGE_COLUMNS.join(", t."),
                    self.compiler.table_names.edges,
                );
                if let Some(exprs) = pushdown.get(step.edge_alias.as_str()) {
                    let alias_map = single_alias_map(&step.edge_alias, AliasKind::Edge);
                    for expr in exprs {
                        let rendered = self.render_expr_with(expr, &alias_map, "t")?;
                        sql.push_str(&format!(" AND {rendered}"));
                    }
                }
                self.ctes.push(format!("{cte} AS ({sql})"));
            }
            Some(recursion) => {
                self.has_recursive = true;
                let cte = format!("{prefix}cte_{}", step.edge_alias);
                let from_cte = &aliases[step.join_from_alias.as_str()].cte;

                // Anchor: the zero-hop row for every starting node.
                let anchor = format!(
                    "SELECT s.kind AS start_kind, s.id AS start_id, s.kind AS end_kind, s.id AS end_id, 0 AS depth, ',' || s.kind || ':' || s.id || ',' AS path FROM {from_cte} s"
                );

                let graph = self.push_value(SqlValue::Text(self.compiler.graph_id.to_string()));
                let kind_list = self.kind_list(&edge_kinds);
                let temporal = self.temporal_clause("e", ast.temporal);
                let (join_kind, join_id, next_kind, next_id) = match step.direction {
                    Direction::Out => ("e.from_kind", "e.from_id", "e.to_kind", "e.to_id"),
                    Direction::In => ("e.to_kind", "e.to_id", "e.from_kind", "e.from_id"),
                };
                let token = format!("{next_kind} || ':' || {next_id}");
                let cycle_guard = match self.dialect() {
                    SqlDialect::Sqlite => {
                        format!("instr(r.path, ',' || {token} || ',') = 0")
                    }
                    SqlDialect::Postgres => {
                        format!("strpos(r.path, ',' || {token} || ',') = 0")
                    }
                };
                let mut recursive_arm = format!(
                    "SELECT r.start_kind, r.start_id, {next_kind}, {next_id}, r.depth + 1, r.path || {next_kind} || ':' || {next_id} || ',' FROM {cte} r JOIN {} e ON e.graph_id = {graph} AND e.kind IN ({kind_list}) AND {join_kind} = r.end_kind AND {join_id} = r.end_id{temporal} WHERE {cycle_guard}",
                    self.compiler.table_names.edges,
                );
                if let Some(max_hops) = recursion.max_hops {
                    let p = self.push_value(SqlValue::Int(i64::from(max_hops)));
                    recursive_arm.push_str(&format!(" AND r.depth < {p}"));
                }
                self.ctes
                    .push(format!("{cte} AS ({anchor} UNION ALL {recursive_arm})"));
            }
        }

        // Target CTE: nodes restricted to the (possibly derived) kind set.
        let target_kinds = self.resolve_target_kinds(step)?;
        let cte = format!("{prefix}cte_{}", step.to.alias);
        let graph = self.push_value(SqlValue::Text(self.compiler.graph_id.to_string()));
        let kind_list = self.kind_list(&target_kinds);
        let temporal = self.temporal_clause("t", ast.temporal);
        let mut sql = format!(
            "SELECT t.{} FROM {} t WHERE t.graph_id = {graph} AND t.kind IN ({kind_list}){temporal}",
            NODE_COLUMNS.join(", t."),
            self.compiler.table_names.nodes,
        );
        if let Some(exprs) = pushdown.get(step.to.alias.as_str()) {
            let alias_map = single_alias_map(&step.to.alias, AliasKind::Node);
            for expr in exprs {
                let rendered = self.render_expr_with(expr, &alias_map, "t")?;
                sql.push_str(&format!(" AND {rendered}"));
            }
        }
        self.ctes.push(format!("{cte} AS ({sql})"));
        Ok(())
    }

    /// Target kinds: explicit on the step, otherwise derived from the edge
    /// registrations' endpoint declarations.
    fn resolve_target_kinds(&self, step: &TraversalStep) -> Result<Vec<String>> {
        if !step.to.kinds.is_empty() {
            return self.expand_node_kinds(&step.to);
        }
        let mut out = Vec::new();
        for edge_kind in &step.edge_kinds {
            let registration = self.compiler.registry.edge_registration(edge_kind)?;
            let declared = match step.direction {
                Direction::Out => &registration.to_kinds,
                Direction::In => &registration.from_kinds,
            };
            for kind in declared {
                for expanded in self.compiler.registry.expand_sub_classes(kind) {
                    if !out.contains(&expanded) {
                        out.push(expanded);
                    }
                }
            }
        }
        if out.is_empty() {
            bail!(TypeGraphError::invariant(
                "traversal target resolved to an empty kind set",
            ));
        }
        Ok(out)
    }

    fn emit_joins(
        &mut self,
        step: &TraversalStep,
        aliases: &HashMap<String, AliasInfo>,
        from: &mut String,
        where_clauses: &mut Vec<String>,
    ) -> Result<()> {
        let info = &aliases[step.edge_alias.as_str()];
        let target = &aliases[step.to.alias.as_str()];
        let join_kw = if info.optional { "LEFT JOIN" } else { "JOIN" };
        let e = &step.edge_alias;
        let t = &step.to.alias;
        let p = &step.join_from_alias;

        match &step.recursion {
            None => {
                let (near_kind, near_id, far_kind, far_id) = match step.direction {
                    Direction::Out => ("from_kind", "from_id", "to_kind", "to_id"),
                    Direction::In => ("to_kind", "to_id", "from_kind", "from_id"),
                };
                from.push_str(&format!(
                    " {join_kw} {} {e} ON {e}.{near_kind} = {p}.kind AND {e}.{near_id} = {p}.id",
                    info.cte
                ));
                from.push_str(&format!(
                    " {join_kw} {} {t} ON {t}.kind = {e}.{far_kind} AND {t}.id = {e}.{far_id}",
                    target.cte
                ));
            }
            Some(recursion) => {
                let mut on_clause = format!(
                    "{e}.start_kind = {p}.kind AND {e}.start_id = {p}.id",
                );
                let min_filter = if recursion.min_hops > 0 {
                    Some(format!("{e}.depth >= {}", recursion.min_hops))
                } else {
                    None
                };
                if info.optional {
                    if let Some(filter) = &min_filter {
                        on_clause.push_str(&format!(" AND {filter}"));
                    }
                } else if let Some(filter) = min_filter {
                    where_clauses.push(filter);
                }
                from.push_str(&format!(" {join_kw} {} {e} ON {on_clause}", info.cte));
                from.push_str(&format!(
                    " {join_kw} {} {t} ON {t}.kind = {e}.end_kind AND {t}.id = {e}.end_id",
                    target.cte
                ));
            }
        }
        Ok(())
    }

    // --- projection ---

    fn emit_projection(
        &mut self,
        ast: &QueryAst,
        aliases: &HashMap<String, AliasInfo>,
        order_keys: &[CompiledOrderKey],
        ride_along: bool,
    ) -> Result<(String, RowShape, usize, Option<String>)> {
        match &ast.projection {
            Projection::Fields(bindings) => {
                let mut columns = Vec::new();
                let mut select_parts = Vec::new();
                let mut seen_outputs = HashSet::new();
                for binding in bindings {
                    self.require_alias(binding.field.alias(), aliases)?;
                    let expr = self.projection_expr(&binding.field, aliases)?;
                    select_parts.push(format!("{expr} AS \"{}\"", binding.name));
                    seen_outputs.insert(binding.name.clone());
                    columns.push(SelectiveColumn {
                        output: binding.name.clone(),
                        decode: decode_kind(&binding.field),
                    });
                }
                // ORDER BY keys ride along even when not selected, so cursor
                // pagination can read them back. Compound members skip this:
                // their ordering is remapped onto selected outputs instead,
                // keeping both sides' arity equal.
                if ride_along {
                    for key in order_keys {
                        if seen_outputs.insert(key.output.clone()) {
                            select_parts.push(format!("{} AS \"{}\"", key.expr, key.output));
                            columns.push(SelectiveColumn {
                                output: key.output.clone(),
                                decode: if key.is_prop {
                                    ColumnDecode::PropValue
                                } else {
                                    ColumnDecode::Scalar
                                },
                            });
                        }
                    }
                }
                let count = columns.len();
                Ok((
                    select_parts.join(", "),
                    RowShape::Selective(columns),
                    count,
                    None,
                ))
            }
            Projection::Aliases(list) => {
                let mut roles = Vec::new();
                let mut select_parts = Vec::new();
                for alias in list {
                    let info = self.require_alias(alias, aliases)?.clone();
                    match info.kind {
                        AliasKind::Node => {
                            for column in NODE_COLUMNS {
                                select_parts
                                    .push(format!("{alias}.{column} AS \"{alias}_{column}\""));
                            }
                            roles.push(AliasRole {
                                alias: alias.clone(),
                                is_edge: false,
                                recursive: false,
                                optional: info.optional,
                            });
                        }
                        AliasKind::Edge => {
                            for column in EDGE_COLUMNS {
                                select_parts
                                    .push(format!("{alias}.{column} AS \"{alias}_{column}\""));
                            }
                            roles.push(AliasRole {
                                alias: alias.clone(),
                                is_edge: true,
                                recursive: false,
                                optional: info.optional,
                            });
                        }
                        AliasKind::RecursiveEdge => {
                            select_parts.push(format!("{alias}.depth AS \"{alias}_depth\""));
                            select_parts.push(format!("{alias}.path AS \"{alias}_path\""));
                            roles.push(AliasRole {
                                alias: alias.clone(),
                                is_edge: true,
                                recursive: true,
                                optional: info.optional,
                            });
                        }
                    }
                }
                let mut count = select_parts.len();
                let mut select = select_parts.join(", ");
                if ride_along {
                    for key in order_keys {
                        if !select.contains(&format!("\"{}\"", key.output)) {
                            select.push_str(&format!(", {} AS \"{}\"", key.expr, key.output));
                            count += 1;
                        }
                    }
                }
                Ok((select, RowShape::FullRows(roles), count, None))
            }
            Projection::Aggregate {
                outputs,
                group_by,
                having,
            } => {
                let mut select_parts = Vec::new();
                let mut names = Vec::new();
                for output in outputs {
                    match output {
                        AggOutput::Group { name, field } => {
                            self.require_alias(field.alias(), aliases)?;
                            let expr = self.projection_expr(field, aliases)?;
                            select_parts.push(format!("{expr} AS \"{name}\""));
                            names.push(name.clone());
                        }
                        AggOutput::Agg { name, func, target } => {
                            let arithmetic = matches!(
                                func,
                                crate::query_ast::AggFunc::Sum | crate::query_ast::AggFunc::Avg
                            );
                            let inner = match target {
                                AggTarget::Field(field) => {
                                    self.require_alias(field.alias(), aliases)?;
                                    let expr = self.projection_expr(field, aliases)?;
                                    match field {
                                        FieldRef::Prop { .. } => {
                                            self.dialect().numeric_cast(&expr)
                                        }
                                        FieldRef::System { .. } if arithmetic => {
                                            self.dialect().numeric_cast(&expr)
                                        }
                                        FieldRef::System { .. } => expr,
                                    }
                                }
                                AggTarget::Alias(alias) => {
                                    self.require_alias(alias, aliases)?;
                                    format!("{alias}.id")
                                }
                            };
                            let rendered = match func {
                                crate::query_ast::AggFunc::CountDistinct => {
                                    format!("COUNT(DISTINCT {inner})")
                                }
                                other => format!("{}({inner})", other.sql_name()),
                            };
                            select_parts.push(format!("{rendered} AS \"{name}\""));
                            names.push(name.clone());
                        }
                    }
                }

                let mut tail = String::new();
                if !group_by.is_empty() {
                    let mut exprs = Vec::new();
                    for field in group_by {
                        self.require_alias(field.alias(), aliases)?;
                        exprs.push(self.projection_expr(field, aliases)?);
                    }
                    tail.push_str(&format!(" GROUP BY {}", exprs.join(", ")));
                }
                if let Some(having) = having {
                    let rendered = self.render_expr(having, aliases)?;
                    tail.push_str(&format!(" HAVING {rendered}"));
                }
                let count = names.len();
                Ok((
                    select_parts.join(", "),
                    RowShape::Aggregate(names),
                    count,
                    Some(tail),
                ))
            }
        }
    }

    fn require_alias<'m>(
        &self,
        alias: &str,
        aliases: &'m HashMap<String, AliasInfo>,
    ) -> Result<&'m AliasInfo> {
        aliases.get(alias).ok_or_else(|| {
            TypeGraphError::validation(
                format!("alias.{alias}"),
                "projection references an alias the query never introduces",
            )
            .into()
        })
    }

    // --- order keys & cursors ---

    fn compile_order_keys(
        &mut self,
        keys: &[OrderKey],
        aliases: &HashMap<String, AliasInfo>,
        reverse: bool,
    ) -> Result<Vec<CompiledOrderKey>> {
        let mut out = Vec::new();
        for key in keys {
            self.require_alias(key.field.alias(), aliases)?;
            let expr = self.projection_expr(&key.field, aliases)?;
            out.push(CompiledOrderKey {
                output: key.field.output_name(),
                expr,
                descending: key.descending != reverse,
                is_prop: matches!(key.field, FieldRef::Prop { .. }),
            });
        }
        Ok(out)
    }

    /// Lexicographic tuple comparison against a cursor boundary:
    /// `(k1 > c1) OR (k1 = c1 AND k2 < c2) OR ...` per key direction.
    fn cursor_clause(
        &mut self,
        cursor: &[JsonValue],
        order_keys: &[CompiledOrderKey],
    ) -> Result<String> {
        let mut alternatives = Vec::new();
        for boundary in 0..order_keys.len() {
            let mut conjuncts = Vec::new();
            for (key, value) in order_keys.iter().zip(cursor.iter()).take(boundary) {
                let placeholder = self.cursor_value(key, value);
                conjuncts.push(format!("{} = {placeholder}", key.expr));
            }
            let key = &order_keys[boundary];
            let value = &cursor[boundary];
            let placeholder = self.cursor_value(key, value);
            let op = if key.descending { "<" } else { ">" };
            conjuncts.push(format!("{} {op} {placeholder}", key.expr));
            alternatives.push(format!("({})", conjuncts.join(" AND ")));
        }
        Ok(format!("({})", alternatives.join(" OR ")))
    }

    fn cursor_value(&mut self, key: &CompiledOrderKey, value: &JsonValue) -> String {
        // Prop keys compare as JSON on jsonb dialects so numbers order
        // numerically; scalar keys bind natively.
        if key.is_prop && self.dialect().supports_jsonb() {
            self.push_value(SqlValue::Json(value.clone()))
        } else {
            self.push_value(SqlValue::from_json(value))
        }
    }

    // --- expression rendering ---

    fn projection_expr(
        &mut self,
        field: &FieldRef,
        aliases: &HashMap<String, AliasInfo>,
    ) -> Result<String> {
        match field {
            FieldRef::Prop { alias, path } => {
                if aliases.get(alias).map(|info| info.kind) == Some(AliasKind::RecursiveEdge) {
                    // Recursive traversals expose only their depth and path.
                    return match path.as_str() {
                        "depth" | "path" => Ok(format!("{alias}.{path}")),
                        other => bail!(TypeGraphError::validation(
                            format!("alias.{alias}"),
                            format!("recursive traversals expose 'depth' and 'path', not '{other}'"),
                        )),
                    };
                }
                let segments = validated_segments(path)?;
                Ok(self.json_extract_value(&format!("{alias}.props"), &segments))
            }
            FieldRef::System { alias, field } => Ok(format!("{alias}.{}", field.column())),
        }
    }

    /// Typed JSON extraction for projections and ordering: SQLite's
    /// json_extract already yields SQL values; PostgreSQL keeps jsonb.
    fn json_extract_value(&self, column: &str, segments: &[&str]) -> String {
        match self.dialect() {
            SqlDialect::Sqlite => self.dialect().json_extract(column, segments),
            SqlDialect::Postgres => {
                let braced = segments.join(",");
                format!("({column} #> '{{{braced}}}')")
            }
        }
    }

    fn render_expr(&mut self, expr: &Expr, aliases: &HashMap<String, AliasInfo>) -> Result<String> {
        self.render_expr_inner(expr, aliases, None)
    }

    /// Render with every alias rewritten to one table alias (CTE-internal
    /// pushdown).
    fn render_expr_with(
        &mut self,
        expr: &Expr,
        aliases: &HashMap<String, AliasInfo>,
        table_alias: &str,
    ) -> Result<String> {
        self.render_expr_inner(expr, aliases, Some(table_alias))
    }

    fn render_expr_inner(
        &mut self,
        expr: &Expr,
        aliases: &HashMap<String, AliasInfo>,
        rewrite: Option<&str>,
    ) -> Result<String> {
        match expr {
            Expr::Compare { op, left, right } => {
                let numeric = operand_is_numeric(left) || operand_is_numeric(right);
                let left_sql = self.render_operand(left, aliases, rewrite, numeric)?;
                let right_sql = self.render_operand(right, aliases, rewrite, numeric)?;
                Ok(match op {
                    CompareOp::Eq => format!("{left_sql} = {right_sql}"),
                    CompareOp::Ne => format!("{left_sql} <> {right_sql}"),
                    CompareOp::Lt => format!("{left_sql} < {right_sql}"),
                    CompareOp::Le => format!("{left_sql} <= {right_sql}"),
                    CompareOp::Gt => format!("{left_sql} > {right_sql}"),
                    CompareOp::Ge => format!("{left_sql} >= {right_sql}"),
                    CompareOp::Like => format!("{left_sql} LIKE {right_sql}"),
                    CompareOp::Contains => {
                        format!("{left_sql} LIKE '%' || {right_sql} || '%'")
                    }
                    CompareOp::StartsWith => format!("{left_sql} LIKE {right_sql} || '%'"),
                    CompareOp::EndsWith => format!("{left_sql} LIKE '%' || {right_sql}"),
                })
            }
            Expr::Between { field, low, high } => {
                let numeric = operand_is_numeric(low) || operand_is_numeric(high);
                let field_sql = self.render_operand(field, aliases, rewrite, numeric)?;
                let low_sql = self.render_operand(low, aliases, rewrite, numeric)?;
                let high_sql = self.render_operand(high, aliases, rewrite, numeric)?;
                Ok(format!("{field_sql} BETWEEN {low_sql} AND {high_sql}"))
            }
            Expr::InList { field, values } => {
                if values.is_empty() {
                    return Ok("1 = 0".to_string());
                }
                let numeric = values.iter().any(operand_is_numeric);
                let field_sql = self.render_operand(field, aliases, rewrite, numeric)?;
                let mut rendered = Vec::with_capacity(values.len());
                for value in values {
                    rendered.push(self.render_operand(value, aliases, rewrite, numeric)?);
                }
                Ok(format!("{field_sql} IN ({})", rendered.join(", ")))
            }
            Expr::IsNull { field } => {
                let sql = self.render_operand(field, aliases, rewrite, false)?;
                Ok(format!("{sql} IS NULL"))
            }
            Expr::IsNotNull { field } => {
                let sql = self.render_operand(field, aliases, rewrite, false)?;
                Ok(format!("{sql} IS NOT NULL"))
            }
            Expr::Exists { subquery, negated } => {
                let select = self.emit_subquery(subquery)?;
                Ok(if *negated {
                    format!("NOT EXISTS ({select})")
                } else {
                    format!("EXISTS ({select})")
                })
            }
            Expr::InSubquery {
                field,
                subquery,
                negated,
            } => {
                if !matches!(&subquery.projection, Projection::Fields(b) if b.len() == 1) {
                    bail!(TypeGraphError::validation(
                        "subquery",
                        "IN subqueries must project exactly one field",
                    ));
                }
                let field_sql = self.render_operand(field, aliases, rewrite, false)?;
                let select = self.emit_subquery(subquery)?;
                Ok(if *negated {
                    format!("{field_sql} NOT IN ({select})")
                } else {
                    format!("{field_sql} IN ({select})")
                })
            }
            Expr::And(exprs) => {
                let parts = self.render_all(exprs, aliases, rewrite)?;
                Ok(format!("({})", parts.join(" AND ")))
            }
            Expr::Or(exprs) => {
                let parts = self.render_all(exprs, aliases, rewrite)?;
                Ok(format!("({})", parts.join(" OR ")))
            }
            Expr::Not(inner) => {
                let sql = self.render_expr_inner(inner, aliases, rewrite)?;
                Ok(format!("NOT ({sql})"))
            }
        }
    }

    fn render_all(
        &mut self,
        exprs: &[Expr],
        aliases: &HashMap<String, AliasInfo>,
        rewrite: Option<&str>,
    ) -> Result<Vec<String>> {
        if exprs.is_empty() {
            bail!(TypeGraphError::invariant("empty boolean connective"));
        }
        exprs
            .iter()
            .map(|expr| self.render_expr_inner(expr, aliases, rewrite))
            .collect()
    }

    fn render_operand(
        &mut self,
        operand: &Operand,
        aliases: &HashMap<String, AliasInfo>,
        rewrite: Option<&str>,
        numeric: bool,
    ) -> Result<String> {
        match operand {
            Operand::Field(field) => {
                self.require_alias(field.alias(), aliases)?;
                let qualifier = rewrite.unwrap_or(field.alias());
                match field {
                    FieldRef::Prop { path, .. } => {
                        let segments = validated_segments(path)?;
                        let expr = self
                            .dialect()
                            .json_extract(&format!("{qualifier}.props"), &segments);
                        Ok(if numeric {
                            self.dialect().numeric_cast(&expr)
                        } else {
                            expr
                        })
                    }
                    FieldRef::System { field, .. } => Ok(format!("{qualifier}.{}", field.column())),
                }
            }
            Operand::Literal(JsonValue::Bool(flag)) => {
                Ok(self.dialect().bool_literal(*flag).to_string())
            }
            Operand::Literal(value) => Ok(self.push_value(SqlValue::from_json(value))),
            Operand::Param { name, ty } => {
                validate_identifier(name, "parameter name")?;
                Ok(self.push_named(name, *ty))
            }
        }
    }

    /// Compile a nested query and return its SELECT; its CTEs join the outer
    /// WITH list under a fresh prefix. Parenthesized subqueries may carry
    /// their own ORDER BY/LIMIT, so the inline tail stays on.
    fn emit_subquery(&mut self, subquery: &QueryAst) -> Result<String> {
        self.subquery_counter += 1;
        let prefix = format!("sq{}_", self.subquery_counter);
        let unit = self.emit_compound(subquery, &prefix, &CompileOptions::default(), true)?;
        Ok(unit.select)
    }
}

/// Rewrite a compound member's ORDER BY keys onto its selected output
/// columns; ordering a set operation by something neither side projects has
/// no valid SQL rendering.
fn remap_compound_order_keys(ast: &QueryAst, order_keys: &mut [CompiledOrderKey]) -> Result<()> {
    for (key, order) in order_keys.iter_mut().zip(ast.order_by.iter()) {
        let output = match &ast.projection {
            Projection::Fields(bindings) => bindings
                .iter()
                .find(|binding| binding.field == order.field)
                .map(|binding| binding.name.clone()),
            Projection::Aliases(aliases) => match &order.field {
                FieldRef::System { alias, .. } if aliases.contains(alias) => {
                    Some(order.field.output_name())
                }
                _ => None,
            },
            Projection::Aggregate { outputs, .. } => outputs.iter().find_map(|output| {
                match output {
                    AggOutput::Group { name, field } if *field == order.field => Some(name.clone()),
                    _ => None,
                }
            }),
        };
        let Some(output) = output else {
            bail!(TypeGraphError::validation(
                "orderBy",
                "set-operation ordering must reference a field the projection selects",
            ));
        };
        key.output = output;
    }
    Ok(())
}

fn insert_alias(
    aliases: &mut HashMap<String, AliasInfo>,
    alias: &str,
    info: AliasInfo,
) -> Result<()> {
    validate_identifier(alias, "alias")?;
    if aliases.insert(alias.to_string(), info).is_some() {
        bail!(TypeGraphError::validation(
            format!("alias.{alias}"),
            "alias introduced more than once",
        ));
    }
    Ok(())
}

fn single_alias_map(alias: &str, kind: AliasKind) -> HashMap<String, AliasInfo> {
    let mut map = HashMap::new();
    map.insert(
        alias.to_string(),
        AliasInfo {
            cte: String::new(),
            kind,
            optional: false,
        },
    );
    map
}

fn decode_kind(field: &FieldRef) -> ColumnDecode {
    match field {
        FieldRef::Prop { .. } => ColumnDecode::PropValue,
        FieldRef::System { field, .. } => {
            if field.is_timestamp() {
                ColumnDecode::Timestamp
            } else {
                ColumnDecode::Scalar
            }
        }
    }
}

fn operand_is_numeric(operand: &Operand) -> bool {
    matches!(operand, Operand::Literal(JsonValue::Number(_)))
        || matches!(
            operand,
            Operand::Param {
                ty: ParamType::Number,
                ..
            }
        )
}

fn validate_identifier(name: &str, what: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if !valid {
        bail!(TypeGraphError::validation(
            what.to_string(),
            format!("'{name}' is not a valid identifier"),
        ));
    }
    Ok(())
}

/// Prop path segments restricted to identifier characters; anything else
/// could escape the JSON path literal.
fn validated_segments(path: &str) -> Result<Vec<&str>> {
    let segments = crate::validation::paths::segments(path)?;
    for segment in &segments {
        if !segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            bail!(TypeGraphError::validation(
                "path",
                format!("prop path segment '{segment}' contains unsupported characters"),
            ));
        }
    }
    Ok(segments)
}
