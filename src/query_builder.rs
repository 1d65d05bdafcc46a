// Query builder.
// A fluent, immutable constructor for the query AST. Every method consumes
// the builder and returns a new value; clone first to fork a query. The
// expression DSL (field/sys/lit/param plus comparison methods) builds the
// predicate tree, and Hop describes traversal steps.

use anyhow::{bail, Result};
use serde_json::Value as JsonValue;
use std::sync::Arc;

use crate::errors::TypeGraphError;
use crate::field_tracker::ProjectionCtx;
use crate::graph_store::GraphStore;
use crate::query_ast::{
    AggFunc, AggOutput, AggTarget, CompareOp, Direction, Expr, FieldRef, Operand, OrderKey,
    ParamType, Projection, QueryAst, Recursion, SetOp, SetOperator, SourceSpec, SystemField,
    TraversalStep,
};
use crate::registry::EdgeExpansion;
use crate::types::TemporalMode;

/// Projection callback used by smart select; run twice (track then decode).
pub type ProjectionFn = Arc<dyn Fn(&ProjectionCtx) -> JsonValue + Send + Sync>;

/// A prop field reference for projections and ordering.
pub fn prop(alias: &str, path: &str) -> FieldRef {
    FieldRef::Prop {
        alias: alias.to_string(),
        path: path.to_string(),
    }
}

/// A system-column reference for projections and ordering.
pub fn sysf(alias: &str, field: SystemField) -> FieldRef {
    FieldRef::System {
        alias: alias.to_string(),
        field,
    }
}

/// A prop field operand for predicates.
pub fn field(alias: &str, path: &str) -> Operand {
    Operand::Field(prop(alias, path))
}

/// A system-column operand for predicates.
pub fn sys(alias: &str, field: SystemField) -> Operand {
    Operand::Field(sysf(alias, field))
}

/// A literal operand.
pub fn lit(value: impl Into<JsonValue>) -> Operand {
    Operand::Literal(value.into())
}

/// A named parameter operand for prepared queries.
pub fn param(name: &str, ty: ParamType) -> Operand {
    Operand::Param {
        name: name.to_string(),
        ty,
    }
}

impl From<FieldRef> for Operand {
    fn from(field: FieldRef) -> Self {
        Operand::Field(field)
    }
}

impl From<&str> for Operand {
    fn from(value: &str) -> Self {
        Operand::Literal(JsonValue::String(value.to_string()))
    }
}

impl From<String> for Operand {
    fn from(value: String) -> Self {
        Operand::Literal(JsonValue::String(value))
    }
}

impl From<i64> for Operand {
    fn from(value: i64) -> Self {
        Operand::Literal(JsonValue::from(value))
    }
}

impl From<f64> for Operand {
    fn from(value: f64) -> Self {
        Operand::Literal(JsonValue::from(value))
    }
}

impl From<bool> for Operand {
    fn from(value: bool) -> Self {
        Operand::Literal(JsonValue::Bool(value))
    }
}

impl Operand {
    fn compare(self, op: CompareOp, other: impl Into<Operand>) -> Expr {
        Expr::Compare {
            op,
            left: self,
            right: other.into(),
        }
    }

    pub fn eq(self, other: impl Into<Operand>) -> Expr {
        self.compare(CompareOp::Eq, other)
    }

    pub fn ne(self, other: impl Into<Operand>) -> Expr {
        self.compare(CompareOp::Ne, other)
    }

    pub fn lt(self, other: impl Into<Operand>) -> Expr {
        self.compare(CompareOp::Lt, other)
    }

    pub fn le(self, other: impl Into<Operand>) -> Expr {
        self.compare(CompareOp::Le, other)
    }

    pub fn gt(self, other: impl Into<Operand>) -> Expr {
        self.compare(CompareOp::Gt, other)
    }

    pub fn ge(self, other: impl Into<Operand>) -> Expr {
        self.compare(CompareOp::Ge, other)
    }

    pub fn like(self, pattern: impl Into<Operand>) -> Expr {
        self.compare(CompareOp::Like, pattern)
    }

    pub fn contains(self, needle: impl Into<Operand>) -> Expr {
        self.compare(CompareOp::Contains, needle)
    }

    pub fn starts_with(self, prefix: impl Into<Operand>) -> Expr {
        self.compare(CompareOp::StartsWith, prefix)
    }

    pub fn ends_with(self, suffix: impl Into<Operand>) -> Expr {
        self.compare(CompareOp::EndsWith, suffix)
    }

    pub fn between(self, low: impl Into<Operand>, high: impl Into<Operand>) -> Expr {
        Expr::Between {
            field: self,
            low: low.into(),
            high: high.into(),
        }
    }

    pub fn in_list(self, values: impl IntoIterator<Item = impl Into<Operand>>) -> Expr {
        Expr::InList {
            field: self,
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_null(self) -> Expr {
        Expr::IsNull { field: self }
    }

    pub fn is_not_null(self) -> Expr {
        Expr::IsNotNull { field: self }
    }

    pub fn in_subquery(self, subquery: GraphQuery) -> Expr {
        Expr::InSubquery {
            field: self,
            subquery: Box::new(subquery.ast),
            negated: false,
        }
    }

    pub fn not_in_subquery(self, subquery: GraphQuery) -> Expr {
        Expr::InSubquery {
            field: self,
            subquery: Box::new(subquery.ast),
            negated: true,
        }
    }
}

pub fn and(exprs: impl IntoIterator<Item = Expr>) -> Expr {
    Expr::And(exprs.into_iter().collect())
}

pub fn or(exprs: impl IntoIterator<Item = Expr>) -> Expr {
    Expr::Or(exprs.into_iter().collect())
}

pub fn not(expr: Expr) -> Expr {
    Expr::Not(Box::new(expr))
}

pub fn exists(subquery: GraphQuery) -> Expr {
    Expr::Exists {
        subquery: Box::new(subquery.ast),
        negated: false,
    }
}

pub fn not_exists(subquery: GraphQuery) -> Expr {
    Expr::Exists {
        subquery: Box::new(subquery.ast),
        negated: true,
    }
}

impl AggOutput {
    /// COUNT over a whole alias (rows where the alias matched).
    pub fn count(name: impl Into<String>, alias: impl Into<String>) -> Self {
        Self::Agg {
            name: name.into(),
            func: AggFunc::Count,
            target: AggTarget::Alias(alias.into()),
        }
    }

    pub fn count_field(name: impl Into<String>, field: FieldRef) -> Self {
        Self::Agg {
            name: name.into(),
            func: AggFunc::Count,
            target: AggTarget::Field(field),
        }
    }

    pub fn count_distinct(name: impl Into<String>, field: FieldRef) -> Self {
        Self::Agg {
            name: name.into(),
            func: AggFunc::CountDistinct,
            target: AggTarget::Field(field),
        }
    }

    pub fn sum(name: impl Into<String>, field: FieldRef) -> Self {
        Self::Agg {
            name: name.into(),
            func: AggFunc::Sum,
            target: AggTarget::Field(field),
        }
    }

    pub fn avg(name: impl Into<String>, field: FieldRef) -> Self {
        Self::Agg {
            name: name.into(),
            func: AggFunc::Avg,
            target: AggTarget::Field(field),
        }
    }

    pub fn min(name: impl Into<String>, field: FieldRef) -> Self {
        Self::Agg {
            name: name.into(),
            func: AggFunc::Min,
            target: AggTarget::Field(field),
        }
    }

    pub fn max(name: impl Into<String>, field: FieldRef) -> Self {
        Self::Agg {
            name: name.into(),
            func: AggFunc::Max,
            target: AggTarget::Field(field),
        }
    }

    pub fn group(name: impl Into<String>, field: FieldRef) -> Self {
        Self::Group {
            name: name.into(),
            field,
        }
    }
}

/// One traversal step descriptor. Unset aliases are assigned automatically
/// (`e{n}` for edges, `t{n}` for targets, joining from the previous target).
#[derive(Debug, Clone)]
pub struct Hop {
    edge_kinds: Vec<String>,
    direction: Direction,
    optional: bool,
    expansion: EdgeExpansion,
    recursion: Option<Recursion>,
    edge_alias: Option<String>,
    from_alias: Option<String>,
    target_alias: Option<String>,
    target_kinds: Vec<String>,
    target_include_subclasses: bool,
}

impl Hop {
    fn new(kind: impl Into<String>, direction: Direction) -> Self {
        Self {
            edge_kinds: vec![kind.into()],
            direction,
            optional: false,
            expansion: EdgeExpansion::None,
            recursion: None,
            edge_alias: None,
            from_alias: None,
            target_alias: None,
            target_kinds: Vec::new(),
            target_include_subclasses: false,
        }
    }

    /// Follow edges of this kind outward (from → to).
    pub fn out(kind: impl Into<String>) -> Self {
        Self::new(kind, Direction::Out)
    }

    /// Follow edges of this kind inward (to → from).
    pub fn inbound(kind: impl Into<String>) -> Self {
        Self::new(kind, Direction::In)
    }

    /// Also match this edge kind.
    pub fn also_kind(mut self, kind: impl Into<String>) -> Self {
        self.edge_kinds.push(kind.into());
        self
    }

    pub fn edge_alias(mut self, alias: impl Into<String>) -> Self {
        self.edge_alias = Some(alias.into());
        self
    }

    /// Join from a specific earlier alias instead of the previous target.
    pub fn from(mut self, alias: impl Into<String>) -> Self {
        self.from_alias = Some(alias.into());
        self
    }

    pub fn to(mut self, alias: impl Into<String>) -> Self {
        self.target_alias = Some(alias.into());
        self
    }

    /// Restrict target node kinds (default: the edge's declared endpoints).
    pub fn to_kinds(mut self, kinds: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.target_kinds = kinds.into_iter().map(Into::into).collect();
        self
    }

    pub fn include_subclasses(mut self) -> Self {
        self.target_include_subclasses = true;
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Also follow the registered inverse edge kind.
    pub fn expand_inverse(mut self) -> Self {
        self.expansion = EdgeExpansion::Inverse;
        self
    }

    /// Also follow every edge kind that implies one of the named kinds.
    pub fn expand_implying(mut self) -> Self {
        self.expansion = EdgeExpansion::Implying;
        self
    }

    /// Make the traversal variable-length with the given hop bounds.
    pub fn recursive(mut self, min_hops: u32, max_hops: Option<u32>) -> Self {
        self.recursion = Some(Recursion {
            min_hops,
            max_hops,
            depth_binding: None,
            path_binding: None,
        });
        self
    }

    /// Bind the recursion depth to an output name.
    pub fn depth_as(mut self, name: impl Into<String>) -> Self {
        if let Some(recursion) = &mut self.recursion {
            recursion.depth_binding = Some(name.into());
        }
        self
    }

    /// Bind the visited path to an output name.
    pub fn path_as(mut self, name: impl Into<String>) -> Self {
        if let Some(recursion) = &mut self.recursion {
            recursion.path_binding = Some(name.into());
        }
        self
    }
}

/// A typed graph query bound to a store. Immutable: builder methods return
/// new values, so prepared queries can hold stable ASTs.
pub struct GraphQuery {
    pub(crate) store: GraphStore,
    pub(crate) ast: QueryAst,
    pub(crate) projection_fn: Option<ProjectionFn>,
}

impl Clone for GraphQuery {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            ast: self.ast.clone(),
            projection_fn: self.projection_fn.clone(),
        }
    }
}

impl GraphStore {
    /// Start a query over one node kind. The source alias defaults to `src`;
    /// set it with [`GraphQuery::alias`] before referencing it.
    pub fn query(&self, kind: impl Into<String>) -> GraphQuery {
        GraphQuery {
            store: self.clone(),
            ast: QueryAst::new(SourceSpec {
                alias: "src".to_string(),
                kinds: vec![kind.into()],
                include_subclasses: false,
            }),
            projection_fn: None,
        }
    }

    /// Start a query over several node kinds.
    pub fn query_kinds(&self, kinds: impl IntoIterator<Item = impl Into<String>>) -> GraphQuery {
        GraphQuery {
            store: self.clone(),
            ast: QueryAst::new(SourceSpec {
                alias: "src".to_string(),
                kinds: kinds.into_iter().map(Into::into).collect(),
                include_subclasses: false,
            }),
            projection_fn: None,
        }
    }
}

impl GraphQuery {
    pub fn ast(&self) -> &QueryAst {
        &self.ast
    }

    /// Rename the source alias. Do this before predicates or traversals
    /// reference it.
    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        let alias = alias.into();
        let old = std::mem::replace(&mut self.ast.source.alias, alias.clone());
        if let Projection::Aliases(list) = &mut self.ast.projection {
            for entry in list.iter_mut() {
                if *entry == old {
                    *entry = alias.clone();
                }
            }
        }
        self
    }

    /// Expand the source kinds to include subclasses.
    pub fn include_subclasses(mut self) -> Self {
        self.ast.source.include_subclasses = true;
        self
    }

    /// AND a predicate onto the query.
    pub fn filter(mut self, expr: Expr) -> Self {
        self.ast.and_predicate(expr);
        self
    }

    /// Add a traversal step.
    pub fn traverse(mut self, hop: Hop) -> Self {
        let step_index = self.ast.traversals.len();
        let from_alias = hop.from_alias.unwrap_or_else(|| {
            self.ast
                .traversals
                .last()
                .map(|step| step.to.alias.clone())
                .unwrap_or_else(|| self.ast.source.alias.clone())
        });
        let edge_alias = hop
            .edge_alias
            .unwrap_or_else(|| format!("e{step_index}"));
        let target_alias = hop
            .target_alias
            .unwrap_or_else(|| format!("t{step_index}"));
        self.ast.traversals.push(TraversalStep {
            edge_alias,
            edge_kinds: hop.edge_kinds,
            direction: hop.direction,
            optional: hop.optional,
            join_from_alias: from_alias,
            expansion: hop.expansion,
            recursion: hop.recursion,
            to: SourceSpec {
                alias: target_alias.clone(),
                kinds: hop.target_kinds,
                include_subclasses: hop.target_include_subclasses,
            },
        });
        // The default projection follows the frontier: source plus every
        // traversal target.
        if let Projection::Aliases(list) = &mut self.ast.projection {
            if !list.contains(&target_alias) {
                list.push(target_alias);
            }
        }
        self
    }

    pub fn order_by(mut self, field: FieldRef, descending: bool) -> Self {
        self.ast.order_by.push(OrderKey { field, descending });
        self
    }

    /// Row limit; applies to the set-operation result when one is attached.
    pub fn limit(mut self, limit: u64) -> Self {
        match &mut self.ast.set_op {
            Some(set_op) => set_op.limit = Some(limit),
            None => self.ast.pagination.limit = Some(limit),
        }
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        match &mut self.ast.set_op {
            Some(set_op) => set_op.offset = Some(offset),
            None => self.ast.pagination.offset = Some(offset),
        }
        self
    }

    pub fn temporal(mut self, mode: TemporalMode) -> Self {
        self.ast.temporal = mode;
        self
    }

    pub fn include_tombstones(self) -> Self {
        self.temporal(TemporalMode::IncludeTombstones)
    }

    /// Project explicit scalar fields.
    pub fn select<N: Into<String>>(
        mut self,
        bindings: impl IntoIterator<Item = (N, FieldRef)>,
    ) -> Self {
        self.ast.projection = Projection::Fields(
            bindings
                .into_iter()
                .map(|(name, field)| crate::query_ast::OutputBinding {
                    name: name.into(),
                    field,
                })
                .collect(),
        );
        self.projection_fn = None;
        self
    }

    /// Project whole rows for the given aliases.
    pub fn select_aliases(mut self, aliases: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.ast.projection = Projection::Aliases(aliases.into_iter().map(Into::into).collect());
        self.projection_fn = None;
        self
    }

    /// Project through a callback. The callback runs once against a tracking
    /// proxy to learn the touched fields (twice when the query has optional
    /// traversals) and then once per row; when every touched alias resolves
    /// to known fields the compiled SELECT is selective.
    pub fn select_with(
        mut self,
        projection: impl Fn(&ProjectionCtx) -> JsonValue + Send + Sync + 'static,
    ) -> Self {
        self.projection_fn = Some(Arc::new(projection));
        self
    }

    /// Switch to an aggregation projection.
    pub fn aggregate(mut self, outputs: impl IntoIterator<Item = AggOutput>) -> Self {
        self.ast.projection = Projection::Aggregate {
            outputs: outputs.into_iter().collect(),
            group_by: Vec::new(),
            having: None,
        };
        self.projection_fn = None;
        self
    }

    pub fn group_by(mut self, fields: impl IntoIterator<Item = FieldRef>) -> Self {
        if let Projection::Aggregate { group_by, .. } = &mut self.ast.projection {
            group_by.extend(fields);
        }
        self
    }

    pub fn having(mut self, expr: Expr) -> Self {
        if let Projection::Aggregate { having, .. } = &mut self.ast.projection {
            *having = Some(expr);
        }
        self
    }

    fn combine(mut self, operator: SetOperator, other: GraphQuery) -> Result<Self> {
        if other.projection_fn.is_some() {
            bail!(TypeGraphError::validation(
                "setOperation",
                "the right side of a set operation must use an explicit projection",
            ));
        }
        self.ast.set_op = Some(SetOp {
            operator,
            right: Box::new(other.ast),
            limit: None,
            offset: None,
        });
        Ok(self)
    }

    pub fn union(self, other: GraphQuery) -> Result<Self> {
        self.combine(SetOperator::Union, other)
    }

    pub fn union_all(self, other: GraphQuery) -> Result<Self> {
        self.combine(SetOperator::UnionAll, other)
    }

    pub fn intersect(self, other: GraphQuery) -> Result<Self> {
        self.combine(SetOperator::Intersect, other)
    }

    pub fn except(self, other: GraphQuery) -> Result<Self> {
        self.combine(SetOperator::Except, other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dsl_builds_expected_predicates() {
        let expr = and([
            field("p", "name").eq("ada"),
            field("p", "age").ge(lit(30)),
            or([
                sys("p", SystemField::Version).gt(lit(1)),
                field("p", "flag").is_null(),
            ]),
        ]);
        match expr {
            Expr::And(parts) => {
                assert_eq!(parts.len(), 3);
                assert!(matches!(
                    parts[0],
                    Expr::Compare {
                        op: CompareOp::Eq,
                        ..
                    }
                ));
            }
            other => panic!("expected And, got {other:?}"),
        }
    }

    #[test]
    fn hop_defaults() {
        let hop = Hop::out("knows").recursive(1, Some(3)).depth_as("hops");
        assert_eq!(hop.direction, Direction::Out);
        let recursion = hop.recursion.unwrap();
        assert_eq!(recursion.min_hops, 1);
        assert_eq!(recursion.max_hops, Some(3));
        assert_eq!(recursion.depth_binding.as_deref(), Some("hops"));
    }
}
