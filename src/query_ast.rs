// Query AST.
// A closed set of tagged variants describing one graph query: the starting
// source, traversal steps, predicates, projection, ordering, pagination,
// temporal mode, and set operations. The compiler switches over these
// exhaustively; adding a variant is a compile-time event everywhere.

use serde_json::Value as JsonValue;
use std::collections::BTreeSet;

use crate::registry::EdgeExpansion;
use crate::types::TemporalMode;

/// Columns every node and edge row carries outside the props payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemField {
    Id,
    Kind,
    CreatedAt,
    UpdatedAt,
    DeletedAt,
    ValidFrom,
    ValidTo,
    Version,
}

impl SystemField {
    pub fn column(&self) -> &'static str {
        match self {
            Self::Id => "id",
            Self::Kind => "kind",
            Self::CreatedAt => "created_at",
            Self::UpdatedAt => "updated_at",
            Self::DeletedAt => "deleted_at",
            Self::ValidFrom => "valid_from",
            Self::ValidTo => "valid_to",
            Self::Version => "version",
        }
    }

    pub fn from_column(column: &str) -> Option<Self> {
        Some(match column {
            "id" => Self::Id,
            "kind" => Self::Kind,
            "created_at" => Self::CreatedAt,
            "updated_at" => Self::UpdatedAt,
            "deleted_at" => Self::DeletedAt,
            "valid_from" => Self::ValidFrom,
            "valid_to" => Self::ValidTo,
            "version" => Self::Version,
            _ => return None,
        })
    }

    pub fn is_timestamp(&self) -> bool {
        matches!(
            self,
            Self::CreatedAt | Self::UpdatedAt | Self::DeletedAt | Self::ValidFrom | Self::ValidTo
        )
    }
}

/// A field reference: a prop path or a system column of one alias.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldRef {
    Prop { alias: String, path: String },
    System { alias: String, field: SystemField },
}

impl FieldRef {
    pub fn alias(&self) -> &str {
        match self {
            Self::Prop { alias, .. } | Self::System { alias, .. } => alias,
        }
    }

    /// Deterministic output column name: `{alias}_{path}` for props,
    /// `{alias}_{column}` for system fields.
    pub fn output_name(&self) -> String {
        match self {
            Self::Prop { alias, path } => format!("{alias}_{path}"),
            Self::System { alias, field } => format!("{alias}_{}", field.column()),
        }
    }
}

/// Nominal type of a prepared-query parameter, checked at bind time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    Text,
    Number,
    Boolean,
}

impl ParamType {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Number => "number",
            Self::Boolean => "boolean",
        }
    }
}

/// One side of a comparison.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Field(FieldRef),
    Literal(JsonValue),
    Param { name: String, ty: ParamType },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Like,
    Contains,
    StartsWith,
    EndsWith,
}

/// Predicate tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Compare {
        op: CompareOp,
        left: Operand,
        right: Operand,
    },
    Between {
        field: Operand,
        low: Operand,
        high: Operand,
    },
    InList {
        field: Operand,
        values: Vec<Operand>,
    },
    IsNull {
        field: Operand,
    },
    IsNotNull {
        field: Operand,
    },
    Exists {
        subquery: Box<QueryAst>,
        negated: bool,
    },
    InSubquery {
        field: Operand,
        subquery: Box<QueryAst>,
        negated: bool,
    },
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
}

impl Expr {
    /// Aliases this expression touches, excluding subquery-internal ones.
    pub fn referenced_aliases(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_aliases(&mut out);
        out
    }

    fn collect_aliases(&self, out: &mut BTreeSet<String>) {
        let mut operand = |op: &Operand, out: &mut BTreeSet<String>| {
            if let Operand::Field(field) = op {
                out.insert(field.alias().to_string());
            }
        };
        match self {
            Self::Compare { left, right, .. } => {
                operand(left, out);
                operand(right, out);
            }
            Self::Between { field, low, high } => {
                operand(field, out);
                operand(low, out);
                operand(high, out);
            }
            Self::InList { field, values } => {
                operand(field, out);
                for value in values {
                    operand(value, out);
                }
            }
            Self::IsNull { field } | Self::IsNotNull { field } => operand(field, out),
            Self::Exists { .. } => {}
            Self::InSubquery { field, .. } => operand(field, out),
            Self::And(exprs) | Self::Or(exprs) => {
                for expr in exprs {
                    expr.collect_aliases(out);
                }
            }
            Self::Not(expr) => expr.collect_aliases(out),
        }
    }

    /// Whether this expression (outside nested subqueries' own trees)
    /// contains a subquery; such conjuncts never push down.
    pub fn contains_subquery(&self) -> bool {
        match self {
            Self::Exists { .. } | Self::InSubquery { .. } => true,
            Self::And(exprs) | Self::Or(exprs) => exprs.iter().any(Expr::contains_subquery),
            Self::Not(expr) => expr.contains_subquery(),
            _ => false,
        }
    }
}

/// The rows a query starts from, or a traversal's target shape.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceSpec {
    pub alias: String,
    pub kinds: Vec<String>,
    pub include_subclasses: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Out,
    In,
}

/// Variable-length traversal bounds. `min_hops = 0` admits the starting node
/// itself; `max_hops = None` recurses until fixpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct Recursion {
    pub min_hops: u32,
    pub max_hops: Option<u32>,
    pub depth_binding: Option<String>,
    pub path_binding: Option<String>,
}

/// One traversal step from an existing alias to a new edge alias and target
/// alias.
#[derive(Debug, Clone, PartialEq)]
pub struct TraversalStep {
    pub edge_alias: String,
    pub edge_kinds: Vec<String>,
    pub direction: Direction,
    pub optional: bool,
    pub join_from_alias: String,
    pub expansion: EdgeExpansion,
    pub recursion: Option<Recursion>,
    pub to: SourceSpec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggFunc {
    Count,
    CountDistinct,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggFunc {
    pub fn sql_name(&self) -> &'static str {
        match self {
            Self::Count | Self::CountDistinct => "COUNT",
            Self::Sum => "SUM",
            Self::Avg => "AVG",
            Self::Min => "MIN",
            Self::Max => "MAX",
        }
    }
}

/// What an aggregate function ranges over: a field or a whole alias
/// (counting rows where the alias matched).
#[derive(Debug, Clone, PartialEq)]
pub enum AggTarget {
    Field(FieldRef),
    Alias(String),
}

/// One output of an aggregation projection.
#[derive(Debug, Clone, PartialEq)]
pub enum AggOutput {
    /// Plain field, must also appear in `group_by`.
    Group { name: String, field: FieldRef },
    Agg {
        name: String,
        func: AggFunc,
        target: AggTarget,
    },
}

/// The query's output shape.
#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    /// Whole rows for these aliases (the fallback shape).
    Aliases(Vec<String>),
    /// Scalar bindings only; compiles to a selective SELECT.
    Fields(Vec<OutputBinding>),
    Aggregate {
        outputs: Vec<AggOutput>,
        group_by: Vec<FieldRef>,
        having: Option<Expr>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutputBinding {
    pub name: String,
    pub field: FieldRef,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderKey {
    pub field: FieldRef,
    pub descending: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Pagination {
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOperator {
    Union,
    UnionAll,
    Intersect,
    Except,
}

impl SetOperator {
    pub fn keyword(&self) -> &'static str {
        match self {
            Self::Union => "UNION",
            Self::UnionAll => "UNION ALL",
            Self::Intersect => "INTERSECT",
            Self::Except => "EXCEPT",
        }
    }
}

/// A set operation combining this query with another; `limit`/`offset`
/// apply to the combined result.
#[derive(Debug, Clone, PartialEq)]
pub struct SetOp {
    pub operator: SetOperator,
    pub right: Box<QueryAst>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// The complete description of one query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryAst {
    pub source: SourceSpec,
    pub traversals: Vec<TraversalStep>,
    pub predicate: Option<Expr>,
    pub projection: Projection,
    pub order_by: Vec<OrderKey>,
    pub pagination: Pagination,
    pub temporal: TemporalMode,
    pub set_op: Option<SetOp>,
}

impl QueryAst {
    pub fn new(source: SourceSpec) -> Self {
        let alias = source.alias.clone();
        Self {
            source,
            traversals: Vec::new(),
            predicate: None,
            projection: Projection::Aliases(vec![alias]),
            order_by: Vec::new(),
            pagination: Pagination::default(),
            temporal: TemporalMode::Current,
            set_op: None,
        }
    }

    /// All aliases this query introduces, in introduction order.
    pub fn introduced_aliases(&self) -> Vec<&str> {
        let mut out = vec![self.source.alias.as_str()];
        for step in &self.traversals {
            out.push(step.edge_alias.as_str());
            out.push(step.to.alias.as_str());
        }
        out
    }

    /// AND another predicate onto the existing one.
    pub fn and_predicate(&mut self, expr: Expr) {
        self.predicate = Some(match self.predicate.take() {
            None => expr,
            Some(Expr::And(mut exprs)) => {
                exprs.push(expr);
                Expr::And(exprs)
            }
            Some(existing) => Expr::And(vec![existing, expr]),
        });
    }
}
