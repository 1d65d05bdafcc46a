// Kind registry.
// Compiles a GraphDef once into an immutable index with every closure the
// storage engine and query compiler need: reflexive-transitive subclass sets,
// symmetric disjointness, symmetric edge inverses, and transitive implication
// closures. Shared read-only by every store and query.

use anyhow::{bail, Result};
use indexmap::IndexMap;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use serde_json::Value as JsonValue;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use crate::errors::TypeGraphError;
use crate::ontology::OntologyRelation;
use crate::schema::{
    EdgeRegistration, GraphDef, KeyCollation, NodeRegistration, UniqueConstraint, UniqueScope,
};
use crate::schema_doc::canonical_string;
use crate::types::GRAPH_SCOPE_NAMESPACE;
use crate::validation::paths;

/// Separator joining unique-key components. A control character keeps it out
/// of ordinary textual prop values.
pub const UNIQUE_KEY_SEPARATOR: char = '\u{0001}';

/// How a traversal widens its edge-kind set before compilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EdgeExpansion {
    /// Only the named edge kinds.
    #[default]
    None,
    /// Also follow the registered inverse of each kind.
    Inverse,
    /// Follow the reflexive-transitive inverse implication closure: every
    /// kind whose presence implies one of the named kinds.
    Implying,
}

/// A uniqueness constraint resolved against a concrete node kind: the
/// namespace is the `node_kind` column value its keys are claimed under.
#[derive(Debug, Clone)]
pub struct ResolvedConstraint {
    pub namespace: String,
    pub declared_on: String,
    pub constraint: UniqueConstraint,
}

/// Immutable, precomputed view over a [`GraphDef`].
#[derive(Debug)]
pub struct KindRegistry {
    graph_name: String,
    nodes: IndexMap<String, NodeRegistration>,
    edges: IndexMap<String, EdgeRegistration>,
    ontology: Vec<OntologyRelation>,
    sub_class_descendants: HashMap<String, Vec<String>>,
    sub_class_ancestors: HashMap<String, Vec<String>>,
    disjoint_with: HashMap<String, BTreeSet<String>>,
    inverse_edge: HashMap<String, String>,
    implied_edges: HashMap<String, Vec<String>>,
    implying_edges: HashMap<String, Vec<String>>,
}

impl KindRegistry {
    pub fn new(def: GraphDef) -> Result<Self> {
        let GraphDef {
            name,
            nodes,
            edges,
            ontology,
        } = def;

        for registration in edges.values() {
            for endpoint in registration
                .from_kinds
                .iter()
                .chain(registration.to_kinds.iter())
            {
                if !nodes.contains_key(endpoint) {
                    bail!(TypeGraphError::configuration(format!(
                        "edge kind '{}' references undeclared node kind '{endpoint}'",
                        registration.kind()
                    )));
                }
            }
        }

        let mut sub_class_children: HashMap<String, Vec<String>> = HashMap::new();
        let mut sub_class_parents: HashMap<String, Vec<String>> = HashMap::new();
        let mut disjoint_with: HashMap<String, BTreeSet<String>> = HashMap::new();
        let mut inverse_edge: HashMap<String, String> = HashMap::new();
        let mut implies_direct: HashMap<String, Vec<String>> = HashMap::new();

        let node_kind = |kind: &str| nodes.contains_key(kind);
        let edge_kind = |kind: &str| edges.contains_key(kind);
        let known = |kind: &str| node_kind(kind) || edge_kind(kind);

        for relation in &ontology {
            let [a, b] = relation.kinds();
            for kind in [a, b] {
                if !known(kind) {
                    bail!(TypeGraphError::configuration(format!(
                        "ontology relation references undeclared kind '{kind}'"
                    )));
                }
            }
            match relation {
                OntologyRelation::SubClassOf { child, parent } => {
                    require_node_kinds(relation, &nodes, [child, parent])?;
                    sub_class_children
                        .entry(parent.clone())
                        .or_default()
                        .push(child.clone());
                    sub_class_parents
                        .entry(child.clone())
                        .or_default()
                        .push(parent.clone());
                }
                OntologyRelation::DisjointWith { left, right } => {
                    require_node_kinds(relation, &nodes, [left, right])?;
                    disjoint_with
                        .entry(left.clone())
                        .or_default()
                        .insert(right.clone());
                    disjoint_with
                        .entry(right.clone())
                        .or_default()
                        .insert(left.clone());
                }
                OntologyRelation::EquivalentTo { left, right } => {
                    if node_kind(left) && node_kind(right) {
                        // Mutual subclassing: each kind includes the other's
                        // descendants.
                        sub_class_children
                            .entry(left.clone())
                            .or_default()
                            .push(right.clone());
                        sub_class_children
                            .entry(right.clone())
                            .or_default()
                            .push(left.clone());
                        sub_class_parents
                            .entry(left.clone())
                            .or_default()
                            .push(right.clone());
                        sub_class_parents
                            .entry(right.clone())
                            .or_default()
                            .push(left.clone());
                    } else if edge_kind(left) && edge_kind(right) {
                        // Mutual implication.
                        implies_direct
                            .entry(left.clone())
                            .or_default()
                            .push(right.clone());
                        implies_direct
                            .entry(right.clone())
                            .or_default()
                            .push(left.clone());
                    } else {
                        bail!(TypeGraphError::configuration(format!(
                            "equivalentTo('{left}', '{right}') must relate two node kinds or two edge kinds"
                        )));
                    }
                }
                OntologyRelation::InverseOf { forward, inverse } => {
                    require_edge_kinds(relation, &edges, [forward, inverse])?;
                    for (from, to) in [(forward, inverse), (inverse, forward)] {
                        if let Some(existing) = inverse_edge.get(from.as_str()) {
                            if existing != to {
                                bail!(TypeGraphError::configuration(format!(
                                    "edge kind '{from}' declared inverse of both '{existing}' and '{to}'"
                                )));
                            }
                        }
                        inverse_edge.insert(from.clone(), to.clone());
                    }
                }
                OntologyRelation::Implies {
                    premise,
                    conclusion,
                } => {
                    require_edge_kinds(relation, &edges, [premise, conclusion])?;
                    implies_direct
                        .entry(premise.clone())
                        .or_default()
                        .push(conclusion.clone());
                }
                // Annotation-only relations: preserved in the schema document,
                // no closure semantics.
                OntologyRelation::SameAs { .. }
                | OntologyRelation::DifferentFrom { .. }
                | OntologyRelation::PartOf { .. }
                | OntologyRelation::HasPart { .. }
                | OntologyRelation::Broader { .. }
                | OntologyRelation::Narrower { .. }
                | OntologyRelation::RelatedTo { .. } => {}
            }
        }

        check_implication_cycles(&edges, &implies_direct)?;

        let mut sub_class_descendants = HashMap::new();
        let mut sub_class_ancestors = HashMap::new();
        for kind in nodes.keys() {
            sub_class_descendants.insert(kind.clone(), reachable(kind, &sub_class_children));
            sub_class_ancestors.insert(kind.clone(), reachable(kind, &sub_class_parents));
        }

        let mut implying_direct: HashMap<String, Vec<String>> = HashMap::new();
        for (premise, conclusions) in &implies_direct {
            for conclusion in conclusions {
                implying_direct
                    .entry(conclusion.clone())
                    .or_default()
                    .push(premise.clone());
            }
        }

        let mut implied_edges = HashMap::new();
        let mut implying_edges = HashMap::new();
        for kind in edges.keys() {
            implied_edges.insert(kind.clone(), reachable_strict(kind, &implies_direct));
            implying_edges.insert(kind.clone(), reachable_strict(kind, &implying_direct));
        }

        Ok(Self {
            graph_name: name,
            nodes,
            edges,
            ontology,
            sub_class_descendants,
            sub_class_ancestors,
            disjoint_with,
            inverse_edge,
            implied_edges,
            implying_edges,
        })
    }

    pub fn graph_name(&self) -> &str {
        &self.graph_name
    }

    pub fn node_kinds(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    pub fn edge_kinds(&self) -> impl Iterator<Item = &str> {
        self.edges.keys().map(String::as_str)
    }

    pub fn ontology(&self) -> &[OntologyRelation] {
        &self.ontology
    }

    pub fn node_registration(&self, kind: &str) -> Result<&NodeRegistration> {
        self.nodes.get(kind).ok_or_else(|| {
            TypeGraphError::KindNotFound {
                kind: kind.to_string(),
            }
            .into()
        })
    }

    pub fn edge_registration(&self, kind: &str) -> Result<&EdgeRegistration> {
        self.edges.get(kind).ok_or_else(|| {
            TypeGraphError::KindNotFound {
                kind: kind.to_string(),
            }
            .into()
        })
    }

    pub fn is_node_kind(&self, kind: &str) -> bool {
        self.nodes.contains_key(kind)
    }

    pub fn is_edge_kind(&self, kind: &str) -> bool {
        self.edges.contains_key(kind)
    }

    /// Reflexive-transitive set of descendant kinds, the kind itself first.
    pub fn expand_sub_classes(&self, kind: &str) -> Vec<String> {
        self.sub_class_descendants
            .get(kind)
            .cloned()
            .unwrap_or_else(|| vec![kind.to_string()])
    }

    /// Reflexive-transitive set of ancestor kinds, the kind itself first.
    pub fn sub_class_ancestors(&self, kind: &str) -> Vec<String> {
        self.sub_class_ancestors
            .get(kind)
            .cloned()
            .unwrap_or_else(|| vec![kind.to_string()])
    }

    /// Kinds declared disjoint with this one (symmetric, possibly empty).
    pub fn disjoint_with(&self, kind: &str) -> Vec<String> {
        self.disjoint_with
            .get(kind)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// The registered inverse of an edge kind, if any (symmetric).
    pub fn inverse_edge(&self, kind: &str) -> Option<&str> {
        self.inverse_edge.get(kind).map(String::as_str)
    }

    /// Transitive forward implication closure, excluding the kind itself.
    pub fn implied_edges(&self, kind: &str) -> &[String] {
        self.implied_edges.get(kind).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Transitive inverse implication closure, excluding the kind itself.
    pub fn implying_edges(&self, kind: &str) -> &[String] {
        self.implying_edges
            .get(kind)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Reflexive-transitive inverse implication closure: the kind plus every
    /// kind that implies it.
    pub fn expand_implying_edges(&self, kind: &str) -> Vec<String> {
        let mut out = vec![kind.to_string()];
        for implying in self.implying_edges(kind) {
            if !out.contains(implying) {
                out.push(implying.clone());
            }
        }
        out
    }

    /// Widen a traversal's edge-kind set per the requested expansion mode.
    /// The expansion happens before any recursive CTE is compiled, so the
    /// widened set participates in every recursive step.
    pub fn expand_edge_kinds(&self, kinds: &[String], expansion: EdgeExpansion) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        let mut push = |kind: String, out: &mut Vec<String>| {
            if !out.contains(&kind) {
                out.push(kind);
            }
        };
        for kind in kinds {
            push(kind.clone(), &mut out);
            match expansion {
                EdgeExpansion::None => {}
                EdgeExpansion::Inverse => {
                    if let Some(inverse) = self.inverse_edge(kind) {
                        push(inverse.to_string(), &mut out);
                    }
                }
                EdgeExpansion::Implying => {
                    for implying in self.implying_edges(kind) {
                        push(implying.clone(), &mut out);
                    }
                }
            }
        }
        out
    }

    /// Find the named constraint applicable to `kind`, searching the kind
    /// itself and then its ancestors (inherited constraints apply through
    /// `KindWithSubclasses` and `Graph` scopes).
    pub fn unique_constraint(&self, kind: &str, name: &str) -> Result<ResolvedConstraint> {
        for resolved in self.constraints_for_kind(kind)? {
            if resolved.constraint.name == name {
                return Ok(resolved);
            }
        }
        bail!(TypeGraphError::ConstraintNotFound {
            kind: kind.to_string(),
            constraint: name.to_string(),
        });
    }

    /// Every uniqueness constraint a node of `kind` must satisfy, with the
    /// namespace its keys are claimed under.
    pub fn constraints_for_kind(&self, kind: &str) -> Result<Vec<ResolvedConstraint>> {
        self.node_registration(kind)?;
        let mut out = Vec::new();
        for ancestor in self.sub_class_ancestors(kind) {
            let registration = self.node_registration(&ancestor)?;
            for constraint in &registration.unique {
                let namespace = match constraint.scope {
                    UniqueScope::Kind => {
                        if ancestor != kind {
                            continue;
                        }
                        kind.to_string()
                    }
                    UniqueScope::KindWithSubclasses => ancestor.clone(),
                    UniqueScope::Graph => GRAPH_SCOPE_NAMESPACE.to_string(),
                };
                out.push(ResolvedConstraint {
                    namespace,
                    declared_on: ancestor.clone(),
                    constraint: constraint.clone(),
                });
            }
        }
        Ok(out)
    }

    /// Derive the canonical key string for a constraint from a prop payload.
    /// Components follow the declared field order, joined by a control-char
    /// separator; non-string values serialize as canonical JSON and
    /// case-insensitive constraints lowercase string components.
    pub fn resolve_unique_key(
        &self,
        constraint: &UniqueConstraint,
        props: &JsonValue,
    ) -> Result<String> {
        let mut components = Vec::with_capacity(constraint.fields.len());
        for field in &constraint.fields {
            let value = paths::get(props, field).ok_or_else(|| TypeGraphError::Validation {
                subject: format!("props.{field}"),
                reason: format!(
                    "unique constraint '{}' requires field '{field}'",
                    constraint.name
                ),
            })?;
            let component = match value {
                JsonValue::String(s) => s.clone(),
                other => canonical_string(other),
            };
            let component = match constraint.collation {
                KeyCollation::Binary => component,
                KeyCollation::CaseInsensitive => component.to_lowercase(),
            };
            components.push(component);
        }
        Ok(components.join(&UNIQUE_KEY_SEPARATOR.to_string()))
    }
}

fn require_node_kinds<'a>(
    relation: &OntologyRelation,
    nodes: &IndexMap<String, NodeRegistration>,
    kinds: [&'a String; 2],
) -> Result<()> {
    for kind in kinds {
        if !nodes.contains_key(kind) {
            bail!(TypeGraphError::configuration(format!(
                "{relation:?} requires node kinds, but '{kind}' is not one"
            )));
        }
    }
    Ok(())
}

fn require_edge_kinds<'a>(
    relation: &OntologyRelation,
    edges: &IndexMap<String, EdgeRegistration>,
    kinds: [&'a String; 2],
) -> Result<()> {
    for kind in kinds {
        if !edges.contains_key(kind) {
            bail!(TypeGraphError::configuration(format!(
                "{relation:?} requires edge kinds, but '{kind}' is not one"
            )));
        }
    }
    Ok(())
}

/// Reflexive-transitive reachability in declaration order (BFS), start first.
fn reachable(start: &str, adjacency: &HashMap<String, Vec<String>>) -> Vec<String> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut out = Vec::new();
    let mut queue = VecDeque::new();
    seen.insert(start);
    out.push(start.to_string());
    queue.push_back(start);
    while let Some(current) = queue.pop_front() {
        if let Some(next) = adjacency.get(current) {
            for kind in next {
                if seen.insert(kind.as_str()) {
                    out.push(kind.clone());
                    queue.push_back(kind.as_str());
                }
            }
        }
    }
    out
}

/// Transitive reachability excluding the start kind itself.
fn reachable_strict(start: &str, adjacency: &HashMap<String, Vec<String>>) -> Vec<String> {
    reachable(start, adjacency)
        .into_iter()
        .filter(|kind| kind != start)
        .collect()
}

/// Implication must stay acyclic apart from mutually-implying (equivalent)
/// pairs; anything longer is a configuration fault.
fn check_implication_cycles(
    edges: &IndexMap<String, EdgeRegistration>,
    implies_direct: &HashMap<String, Vec<String>>,
) -> Result<()> {
    let mut graph: DiGraph<&str, ()> = DiGraph::new();
    let mut index: HashMap<&str, NodeIndex> = HashMap::new();
    for kind in edges.keys() {
        index.insert(kind.as_str(), graph.add_node(kind.as_str()));
    }
    for (premise, conclusions) in implies_direct {
        let from = index[premise.as_str()];
        for conclusion in conclusions {
            graph.add_edge(from, index[conclusion.as_str()], ());
        }
    }
    for component in tarjan_scc(&graph) {
        if component.len() > 2 {
            let members: Vec<&str> = component.iter().map(|ix| graph[*ix]).collect();
            bail!(TypeGraphError::configuration(format!(
                "implication cycle among edge kinds {members:?}"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{EdgeType, NodeType};

    fn registry() -> KindRegistry {
        let def = GraphDef::builder("test")
            .node(NodeRegistration::new(NodeType::any("Agent").unwrap()))
            .unwrap()
            .node(NodeRegistration::new(NodeType::any("Person").unwrap()))
            .unwrap()
            .node(NodeRegistration::new(NodeType::any("Employee").unwrap()))
            .unwrap()
            .node(NodeRegistration::new(NodeType::any("Company").unwrap()))
            .unwrap()
            .edge(EdgeRegistration::new(
                EdgeType::any("manages").unwrap(),
                ["Person"],
                ["Person"],
            ))
            .unwrap()
            .edge(EdgeRegistration::new(
                EdgeType::any("managedBy").unwrap(),
                ["Person"],
                ["Person"],
            ))
            .unwrap()
            .edge(EdgeRegistration::new(
                EdgeType::any("knows").unwrap(),
                ["Person"],
                ["Person"],
            ))
            .unwrap()
            .relation(OntologyRelation::sub_class_of("Person", "Agent"))
            .relation(OntologyRelation::sub_class_of("Employee", "Person"))
            .relation(OntologyRelation::disjoint_with("Person", "Company"))
            .relation(OntologyRelation::inverse_of("manages", "managedBy"))
            .relation(OntologyRelation::implies("manages", "knows"))
            .build()
            .unwrap();
        KindRegistry::new(def).unwrap()
    }

    #[test]
    fn subclass_closure_is_reflexive_transitive() {
        let reg = registry();
        assert_eq!(
            reg.expand_sub_classes("Agent"),
            vec!["Agent", "Person", "Employee"]
        );
        assert_eq!(reg.expand_sub_classes("Employee"), vec!["Employee"]);
        assert_eq!(
            reg.sub_class_ancestors("Employee"),
            vec!["Employee", "Person", "Agent"]
        );
    }

    #[test]
    fn disjointness_is_symmetric() {
        let reg = registry();
        assert_eq!(reg.disjoint_with("Person"), vec!["Company"]);
        assert_eq!(reg.disjoint_with("Company"), vec!["Person"]);
        assert!(reg.disjoint_with("Agent").is_empty());
    }

    #[test]
    fn inverse_is_symmetric() {
        let reg = registry();
        assert_eq!(reg.inverse_edge("manages"), Some("managedBy"));
        assert_eq!(reg.inverse_edge("managedBy"), Some("manages"));
        assert_eq!(reg.inverse_edge("knows"), None);
    }

    #[test]
    fn implication_closures_are_mutual_inverses() {
        let reg = registry();
        assert_eq!(reg.implied_edges("manages"), ["knows".to_string()]);
        assert_eq!(reg.implying_edges("knows"), ["manages".to_string()]);
        assert_eq!(
            reg.expand_implying_edges("knows"),
            vec!["knows", "manages"]
        );
    }

    #[test]
    fn implication_cycle_is_rejected() {
        let def = GraphDef::builder("cyclic")
            .node(NodeRegistration::new(NodeType::any("N").unwrap()))
            .unwrap()
            .edge(EdgeRegistration::new(EdgeType::any("a").unwrap(), ["N"], ["N"]))
            .unwrap()
            .edge(EdgeRegistration::new(EdgeType::any("b").unwrap(), ["N"], ["N"]))
            .unwrap()
            .edge(EdgeRegistration::new(EdgeType::any("c").unwrap(), ["N"], ["N"]))
            .unwrap()
            .relation(OntologyRelation::implies("a", "b"))
            .relation(OntologyRelation::implies("b", "c"))
            .relation(OntologyRelation::implies("c", "a"))
            .build()
            .unwrap();
        let err = KindRegistry::new(def).unwrap_err();
        let tg = err.downcast_ref::<TypeGraphError>().unwrap();
        assert_eq!(tg.tag(), "configuration");
    }

    #[test]
    fn equivalent_edge_pair_is_allowed() {
        let def = GraphDef::builder("equiv")
            .node(NodeRegistration::new(NodeType::any("N").unwrap()))
            .unwrap()
            .edge(EdgeRegistration::new(EdgeType::any("a").unwrap(), ["N"], ["N"]))
            .unwrap()
            .edge(EdgeRegistration::new(EdgeType::any("b").unwrap(), ["N"], ["N"]))
            .unwrap()
            .relation(OntologyRelation::equivalent_to("a", "b"))
            .build()
            .unwrap();
        let reg = KindRegistry::new(def).unwrap();
        assert_eq!(reg.implied_edges("a"), ["b".to_string()]);
        assert_eq!(reg.implied_edges("b"), ["a".to_string()]);
    }

    #[test]
    fn unique_key_resolution() {
        let constraint = UniqueConstraint::new("email", ["email"]).case_insensitive();
        let reg = registry();
        let key = reg
            .resolve_unique_key(&constraint, &serde_json::json!({"email": "Ada@Example.COM"}))
            .unwrap();
        assert_eq!(key, "ada@example.com");

        let compound = UniqueConstraint::new("name_age", ["name", "age"]);
        let key = reg
            .resolve_unique_key(&compound, &serde_json::json!({"name": "Ada", "age": 36}))
            .unwrap();
        assert_eq!(key, format!("Ada{}36", UNIQUE_KEY_SEPARATOR));

        let missing = reg.resolve_unique_key(&compound, &serde_json::json!({"name": "Ada"}));
        assert!(missing.is_err());
    }

    #[test]
    fn scoped_constraint_namespaces() {
        let def = GraphDef::builder("scoped")
            .node(
                NodeRegistration::new(NodeType::any("Agent").unwrap()).with_unique(
                    UniqueConstraint::new("handle", ["handle"])
                        .scope(UniqueScope::KindWithSubclasses),
                ),
            )
            .unwrap()
            .node(
                NodeRegistration::new(NodeType::any("Person").unwrap())
                    .with_unique(UniqueConstraint::new("ssn", ["ssn"]).scope(UniqueScope::Graph)),
            )
            .unwrap()
            .relation(OntologyRelation::sub_class_of("Person", "Agent"))
            .build()
            .unwrap();
        let reg = KindRegistry::new(def).unwrap();

        let resolved = reg.constraints_for_kind("Person").unwrap();
        let namespaces: Vec<(&str, &str)> = resolved
            .iter()
            .map(|r| (r.constraint.name.as_str(), r.namespace.as_str()))
            .collect();
        assert!(namespaces.contains(&("ssn", GRAPH_SCOPE_NAMESPACE)));
        assert!(namespaces.contains(&("handle", "Agent")));

        // Kind-scoped constraints do not reach subclasses.
        let agent_only = reg.constraints_for_kind("Agent").unwrap();
        assert_eq!(agent_only.len(), 1);
        assert_eq!(agent_only[0].namespace, "Agent");
    }
}
