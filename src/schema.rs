// Schema vocabulary.
// Declarative descriptions of node kinds, edge kinds, and the graph binding
// them together. Pure data with fluent builders; the registry compiles a
// GraphDef into its queryable, closure-bearing form.

use anyhow::{bail, ensure, Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::errors::TypeGraphError;
use crate::ontology::OntologyRelation;
use crate::types::KindName;
use crate::validation::{AnyProps, PropValidator};

/// Edge cardinality enforced at insert time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Cardinality {
    /// Unlimited edges of this kind between any endpoints.
    #[default]
    Many,
    /// At most one live outgoing edge of this kind per source node.
    One,
    /// At most one outgoing edge with `valid_to IS NULL` per source node.
    OneActive,
    /// At most one live edge per (from, to) pair.
    Unique,
}

impl Cardinality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Many => "many",
            Self::One => "one",
            Self::OneActive => "oneActive",
            Self::Unique => "unique",
        }
    }
}

impl fmt::Display for Cardinality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happens to incident edges when a node is soft-deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeleteBehavior {
    /// Refuse the delete while any live incident edge exists.
    #[default]
    Restrict,
    /// Soft-delete every live incident edge along with the node.
    Cascade,
    /// Detach the node by soft-deleting its live incident edges.
    Disconnect,
}

impl DeleteBehavior {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Restrict => "restrict",
            Self::Cascade => "cascade",
            Self::Disconnect => "disconnect",
        }
    }
}

/// Namespace a uniqueness constraint claims its keys in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UniqueScope {
    /// Keys are unique among nodes of exactly the declaring kind.
    #[default]
    Kind,
    /// Keys are unique among the declaring kind and all its subclasses.
    KindWithSubclasses,
    /// Keys are unique across the whole graph.
    Graph,
}

/// Key comparison mode for uniqueness constraints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum KeyCollation {
    /// Verbatim byte comparison.
    #[default]
    Binary,
    /// String components are lowercased before comparison.
    CaseInsensitive,
}

/// A named uniqueness constraint over an ordered list of prop paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniqueConstraint {
    pub name: String,
    pub fields: Vec<String>,
    pub scope: UniqueScope,
    pub collation: KeyCollation,
}

impl UniqueConstraint {
    pub fn new(
        name: impl Into<String>,
        fields: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            name: name.into(),
            fields: fields.into_iter().map(Into::into).collect(),
            scope: UniqueScope::default(),
            collation: KeyCollation::default(),
        }
    }

    pub fn scope(mut self, scope: UniqueScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn case_insensitive(mut self) -> Self {
        self.collation = KeyCollation::CaseInsensitive;
        self
    }

    fn check(&self, kind: &str) -> Result<()> {
        ensure!(
            !self.name.is_empty(),
            "unique constraint on '{kind}' has an empty name"
        );
        ensure!(
            !self.fields.is_empty(),
            "unique constraint '{}' on '{kind}' declares no fields",
            self.name
        );
        for field in &self.fields {
            crate::validation::paths::segments(field)
                .with_context(|| format!("unique constraint '{}' on '{kind}'", self.name))?;
        }
        Ok(())
    }
}

/// A node kind: its name plus the validator applied to every prop payload.
#[derive(Clone)]
pub struct NodeType {
    pub kind: String,
    pub validator: Arc<dyn PropValidator>,
}

impl NodeType {
    pub fn new(kind: impl Into<String>, validator: Arc<dyn PropValidator>) -> Result<Self> {
        let kind = KindName::new(kind)?;
        Ok(Self {
            kind: kind.as_str().to_string(),
            validator,
        })
    }

    /// Node kind accepting any JSON object payload.
    pub fn any(kind: impl Into<String>) -> Result<Self> {
        Self::new(kind, Arc::new(AnyProps))
    }
}

impl fmt::Debug for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeType").field("kind", &self.kind).finish()
    }
}

/// An edge kind: name plus an optional prop validator (edges may be bare).
#[derive(Clone)]
pub struct EdgeType {
    pub kind: String,
    pub validator: Option<Arc<dyn PropValidator>>,
}

impl EdgeType {
    pub fn new(kind: impl Into<String>, validator: Arc<dyn PropValidator>) -> Result<Self> {
        let kind = KindName::new(kind)?;
        Ok(Self {
            kind: kind.as_str().to_string(),
            validator: Some(validator),
        })
    }

    pub fn any(kind: impl Into<String>) -> Result<Self> {
        let kind = KindName::new(kind)?;
        Ok(Self {
            kind: kind.as_str().to_string(),
            validator: None,
        })
    }
}

impl fmt::Debug for EdgeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EdgeType").field("kind", &self.kind).finish()
    }
}

/// Binds a node type into a graph with delete behavior and uniqueness rules.
#[derive(Debug, Clone)]
pub struct NodeRegistration {
    pub node_type: NodeType,
    pub on_delete: DeleteBehavior,
    pub unique: Vec<UniqueConstraint>,
}

impl NodeRegistration {
    pub fn new(node_type: NodeType) -> Self {
        Self {
            node_type,
            on_delete: DeleteBehavior::default(),
            unique: Vec::new(),
        }
    }

    pub fn on_delete(mut self, behavior: DeleteBehavior) -> Self {
        self.on_delete = behavior;
        self
    }

    pub fn with_unique(mut self, constraint: UniqueConstraint) -> Self {
        self.unique.push(constraint);
        self
    }

    pub fn kind(&self) -> &str {
        &self.node_type.kind
    }
}

/// Binds an edge type into a graph with endpoint kinds and cardinality.
#[derive(Debug, Clone)]
pub struct EdgeRegistration {
    pub edge_type: EdgeType,
    pub from_kinds: Vec<String>,
    pub to_kinds: Vec<String>,
    pub cardinality: Cardinality,
}

impl EdgeRegistration {
    pub fn new(
        edge_type: EdgeType,
        from_kinds: impl IntoIterator<Item = impl Into<String>>,
        to_kinds: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            edge_type,
            from_kinds: from_kinds.into_iter().map(Into::into).collect(),
            to_kinds: to_kinds.into_iter().map(Into::into).collect(),
            cardinality: Cardinality::default(),
        }
    }

    pub fn cardinality(mut self, cardinality: Cardinality) -> Self {
        self.cardinality = cardinality;
        self
    }

    pub fn kind(&self) -> &str {
        &self.edge_type.kind
    }
}

/// A declarative description of one graph: its kinds and ontology.
///
/// Registration order is preserved; the schema document and the registry both
/// iterate kinds in declaration order.
#[derive(Debug, Clone, Default)]
pub struct GraphDef {
    pub name: String,
    pub nodes: IndexMap<String, NodeRegistration>,
    pub edges: IndexMap<String, EdgeRegistration>,
    pub ontology: Vec<OntologyRelation>,
}

impl GraphDef {
    pub fn builder(name: impl Into<String>) -> GraphDefBuilder {
        GraphDefBuilder {
            name: name.into(),
            nodes: IndexMap::new(),
            edges: IndexMap::new(),
            ontology: Vec::new(),
        }
    }
}

/// Fluent constructor for [`GraphDef`]. Local shape checks happen here;
/// cross-kind checks (endpoint references, ontology targets, implication
/// cycles) happen when the registry is built.
pub struct GraphDefBuilder {
    name: String,
    nodes: IndexMap<String, NodeRegistration>,
    edges: IndexMap<String, EdgeRegistration>,
    ontology: Vec<OntologyRelation>,
}

impl GraphDefBuilder {
    pub fn node(mut self, registration: NodeRegistration) -> Result<Self> {
        let kind = registration.kind().to_string();
        for constraint in &registration.unique {
            constraint.check(&kind)?;
        }
        let mut seen = std::collections::HashSet::new();
        for constraint in &registration.unique {
            if !seen.insert(constraint.name.as_str()) {
                bail!(TypeGraphError::configuration(format!(
                    "duplicate unique constraint '{}' on kind '{kind}'",
                    constraint.name
                )));
            }
        }
        if self.nodes.insert(kind.clone(), registration).is_some() {
            bail!(TypeGraphError::configuration(format!(
                "node kind '{kind}' registered twice"
            )));
        }
        Ok(self)
    }

    pub fn edge(mut self, registration: EdgeRegistration) -> Result<Self> {
        let kind = registration.kind().to_string();
        ensure!(
            !registration.from_kinds.is_empty(),
            "edge kind '{kind}' declares no from-kinds"
        );
        ensure!(
            !registration.to_kinds.is_empty(),
            "edge kind '{kind}' declares no to-kinds"
        );
        if self.edges.insert(kind.clone(), registration).is_some() {
            bail!(TypeGraphError::configuration(format!(
                "edge kind '{kind}' registered twice"
            )));
        }
        Ok(self)
    }

    pub fn relation(mut self, relation: OntologyRelation) -> Self {
        self.ontology.push(relation);
        self
    }

    pub fn build(self) -> Result<GraphDef> {
        ensure!(!self.name.is_empty(), "graph definition needs a name");
        Ok(GraphDef {
            name: self.name,
            nodes: self.nodes,
            edges: self.edges,
            ontology: self.ontology,
        })
    }
}
