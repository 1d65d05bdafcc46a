// Ontology relations.
// Declarative meta-relations between kinds. The registry compiles the
// closure-bearing variants (subClassOf, disjointWith, equivalentTo,
// inverseOf, implies); the rest are carried into the schema document as
// annotations.

use serde::{Deserialize, Serialize};

/// A single ontological statement relating one or two kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "relation")]
pub enum OntologyRelation {
    /// `child` is a subclass of `parent` (node kinds).
    SubClassOf { child: String, parent: String },
    /// No id may exist live under both kinds (node kinds, symmetric).
    DisjointWith { left: String, right: String },
    /// Mutual subclassing for node kinds; mutual implication for edge kinds.
    EquivalentTo { left: String, right: String },
    SameAs { left: String, right: String },
    DifferentFrom { left: String, right: String },
    /// Traversing `forward` out equals traversing `inverse` in (edge kinds,
    /// symmetric).
    InverseOf { forward: String, inverse: String },
    /// Every `premise` edge implies a `conclusion` edge (edge kinds,
    /// transitive).
    Implies { premise: String, conclusion: String },
    PartOf { part: String, whole: String },
    HasPart { whole: String, part: String },
    Broader { narrower: String, broader: String },
    Narrower { broader: String, narrower: String },
    RelatedTo { left: String, right: String },
}

impl OntologyRelation {
    pub fn sub_class_of(child: impl Into<String>, parent: impl Into<String>) -> Self {
        Self::SubClassOf {
            child: child.into(),
            parent: parent.into(),
        }
    }

    pub fn disjoint_with(left: impl Into<String>, right: impl Into<String>) -> Self {
        Self::DisjointWith {
            left: left.into(),
            right: right.into(),
        }
    }

    pub fn equivalent_to(left: impl Into<String>, right: impl Into<String>) -> Self {
        Self::EquivalentTo {
            left: left.into(),
            right: right.into(),
        }
    }

    pub fn same_as(left: impl Into<String>, right: impl Into<String>) -> Self {
        Self::SameAs {
            left: left.into(),
            right: right.into(),
        }
    }

    pub fn different_from(left: impl Into<String>, right: impl Into<String>) -> Self {
        Self::DifferentFrom {
            left: left.into(),
            right: right.into(),
        }
    }

    pub fn inverse_of(forward: impl Into<String>, inverse: impl Into<String>) -> Self {
        Self::InverseOf {
            forward: forward.into(),
            inverse: inverse.into(),
        }
    }

    pub fn implies(premise: impl Into<String>, conclusion: impl Into<String>) -> Self {
        Self::Implies {
            premise: premise.into(),
            conclusion: conclusion.into(),
        }
    }

    pub fn part_of(part: impl Into<String>, whole: impl Into<String>) -> Self {
        Self::PartOf {
            part: part.into(),
            whole: whole.into(),
        }
    }

    pub fn has_part(whole: impl Into<String>, part: impl Into<String>) -> Self {
        Self::HasPart {
            whole: whole.into(),
            part: part.into(),
        }
    }

    pub fn broader(narrower: impl Into<String>, broader: impl Into<String>) -> Self {
        Self::Broader {
            narrower: narrower.into(),
            broader: broader.into(),
        }
    }

    pub fn narrower(broader: impl Into<String>, narrower: impl Into<String>) -> Self {
        Self::Narrower {
            broader: broader.into(),
            narrower: narrower.into(),
        }
    }

    pub fn related_to(left: impl Into<String>, right: impl Into<String>) -> Self {
        Self::RelatedTo {
            left: left.into(),
            right: right.into(),
        }
    }

    /// The kinds this relation mentions, in declaration order.
    pub fn kinds(&self) -> [&str; 2] {
        match self {
            Self::SubClassOf { child, parent } => [child, parent],
            Self::DisjointWith { left, right }
            | Self::EquivalentTo { left, right }
            | Self::SameAs { left, right }
            | Self::DifferentFrom { left, right }
            | Self::RelatedTo { left, right } => [left, right],
            Self::InverseOf { forward, inverse } => [forward, inverse],
            Self::Implies {
                premise,
                conclusion,
            } => [premise, conclusion],
            Self::PartOf { part, whole } => [part, whole],
            Self::HasPart { whole, part } => [whole, part],
            Self::Broader { narrower, broader } => [narrower, broader],
            Self::Narrower { broader, narrower } => [broader, narrower],
        }
    }
}
