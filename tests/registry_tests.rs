// Tests for the kind registry: closure computation, ontology validation,
// and uniqueness key resolution.

use anyhow::Result;
use serde_json::json;
use typegraph::registry::UNIQUE_KEY_SEPARATOR;
use typegraph::{
    EdgeRegistration, EdgeType, GraphDef, KeyCollation, KindRegistry, NodeRegistration, NodeType,
    OntologyRelation, TypeGraphError, UniqueConstraint, UniqueScope,
};

fn social_graph() -> Result<KindRegistry> {
    let def = GraphDef::builder("social")
        .node(NodeRegistration::new(NodeType::any("Agent")?))?
        .node(NodeRegistration::new(NodeType::any("Person")?))?
        .node(NodeRegistration::new(NodeType::any("Employee")?))?
        .node(NodeRegistration::new(NodeType::any("Contractor")?))?
        .node(NodeRegistration::new(NodeType::any("Company")?))?
        .edge(EdgeRegistration::new(
            EdgeType::any("knows")?,
            ["Person"],
            ["Person"],
        ))?
        .edge(EdgeRegistration::new(
            EdgeType::any("manages")?,
            ["Person"],
            ["Person"],
        ))?
        .edge(EdgeRegistration::new(
            EdgeType::any("managedBy")?,
            ["Person"],
            ["Person"],
        ))?
        .edge(EdgeRegistration::new(
            EdgeType::any("mentors")?,
            ["Person"],
            ["Person"],
        ))?
        .relation(OntologyRelation::sub_class_of("Person", "Agent"))
        .relation(OntologyRelation::sub_class_of("Employee", "Person"))
        .relation(OntologyRelation::sub_class_of("Contractor", "Person"))
        .relation(OntologyRelation::disjoint_with("Person", "Company"))
        .relation(OntologyRelation::inverse_of("manages", "managedBy"))
        .relation(OntologyRelation::implies("manages", "knows"))
        .relation(OntologyRelation::implies("mentors", "knows"))
        .build()?;
    KindRegistry::new(def)
}

#[test]
fn subclass_expansion_is_a_fixed_point() -> Result<()> {
    let registry = social_graph()?;

    // Reflexive: every kind contains itself.
    for kind in ["Agent", "Person", "Employee", "Contractor", "Company"] {
        assert!(registry.expand_sub_classes(kind).contains(&kind.to_string()));
    }

    // Transitive through Person.
    let agents = registry.expand_sub_classes("Agent");
    assert_eq!(agents.len(), 4);
    for kind in ["Agent", "Person", "Employee", "Contractor"] {
        assert!(agents.contains(&kind.to_string()));
    }
    assert!(!agents.contains(&"Company".to_string()));

    // Expanding any member of the closure stays inside the closure.
    for kind in &agents {
        for expanded in registry.expand_sub_classes(kind) {
            assert!(agents.contains(&expanded));
        }
    }
    Ok(())
}

#[test]
fn implication_closures_are_mutual_inverses() -> Result<()> {
    let registry = social_graph()?;

    // Forward closure of each implying kind reaches "knows"; the inverse
    // closure of "knows" lists exactly those kinds.
    let mut implying = registry.implying_edges("knows").to_vec();
    implying.sort();
    assert_eq!(implying, vec!["manages".to_string(), "mentors".to_string()]);

    for premise in ["manages", "mentors"] {
        assert!(registry
            .implied_edges(premise)
            .contains(&"knows".to_string()));
        for conclusion in registry.implied_edges(premise) {
            assert!(registry
                .implying_edges(&conclusion)
                .contains(&premise.to_string()));
        }
    }

    let expanded = registry.expand_implying_edges("knows");
    assert_eq!(expanded[0], "knows");
    assert_eq!(expanded.len(), 3);
    Ok(())
}

#[test]
fn transitive_implication_chain() -> Result<()> {
    let def = GraphDef::builder("chain")
        .node(NodeRegistration::new(NodeType::any("N")?))?
        .edge(EdgeRegistration::new(EdgeType::any("a")?, ["N"], ["N"]))?
        .edge(EdgeRegistration::new(EdgeType::any("b")?, ["N"], ["N"]))?
        .edge(EdgeRegistration::new(EdgeType::any("c")?, ["N"], ["N"]))?
        .relation(OntologyRelation::implies("a", "b"))
        .relation(OntologyRelation::implies("b", "c"))
        .build()?;
    let registry = KindRegistry::new(def)?;
    assert_eq!(
        registry.implied_edges("a"),
        ["b".to_string(), "c".to_string()]
    );
    assert_eq!(
        registry.implying_edges("c"),
        ["b".to_string(), "a".to_string()]
    );
    Ok(())
}

#[test]
fn implication_cycle_is_a_configuration_error() -> Result<()> {
    let def = GraphDef::builder("cyclic")
        .node(NodeRegistration::new(NodeType::any("N")?))?
        .edge(EdgeRegistration::new(EdgeType::any("a")?, ["N"], ["N"]))?
        .edge(EdgeRegistration::new(EdgeType::any("b")?, ["N"], ["N"]))?
        .edge(EdgeRegistration::new(EdgeType::any("c")?, ["N"], ["N"]))?
        .relation(OntologyRelation::implies("a", "b"))
        .relation(OntologyRelation::implies("b", "c"))
        .relation(OntologyRelation::implies("c", "a"))
        .build()?;
    let err = KindRegistry::new(def).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<TypeGraphError>(),
        Some(TypeGraphError::Configuration { .. })
    ));
    Ok(())
}

#[test]
fn ontology_rejects_undeclared_and_miscategorized_kinds() -> Result<()> {
    let undeclared = GraphDef::builder("bad")
        .node(NodeRegistration::new(NodeType::any("A")?))?
        .relation(OntologyRelation::sub_class_of("A", "Ghost"))
        .build()?;
    assert!(KindRegistry::new(undeclared).is_err());

    // subClassOf over edge kinds is invalid.
    let miscategorized = GraphDef::builder("bad")
        .node(NodeRegistration::new(NodeType::any("A")?))?
        .edge(EdgeRegistration::new(EdgeType::any("e")?, ["A"], ["A"]))?
        .relation(OntologyRelation::sub_class_of("e", "A"))
        .build()?;
    assert!(KindRegistry::new(miscategorized).is_err());
    Ok(())
}

#[test]
fn endpoint_kinds_must_be_declared() -> Result<()> {
    let def = GraphDef::builder("bad")
        .node(NodeRegistration::new(NodeType::any("A")?))?
        .edge(EdgeRegistration::new(EdgeType::any("e")?, ["A"], ["Ghost"]))?
        .build()?;
    assert!(KindRegistry::new(def).is_err());
    Ok(())
}

#[test]
fn conflicting_inverse_declarations_are_rejected() -> Result<()> {
    let def = GraphDef::builder("bad")
        .node(NodeRegistration::new(NodeType::any("N")?))?
        .edge(EdgeRegistration::new(EdgeType::any("a")?, ["N"], ["N"]))?
        .edge(EdgeRegistration::new(EdgeType::any("b")?, ["N"], ["N"]))?
        .edge(EdgeRegistration::new(EdgeType::any("c")?, ["N"], ["N"]))?
        .relation(OntologyRelation::inverse_of("a", "b"))
        .relation(OntologyRelation::inverse_of("a", "c"))
        .build()?;
    assert!(KindRegistry::new(def).is_err());
    Ok(())
}

#[test]
fn case_insensitive_keys_collide() -> Result<()> {
    let registry = social_graph()?;
    let constraint = UniqueConstraint::new("email", ["email"]).case_insensitive();
    let upper = registry.resolve_unique_key(&constraint, &json!({"email": "ALICE@example.com"}))?;
    let lower = registry.resolve_unique_key(&constraint, &json!({"email": "alice@example.com"}))?;
    assert_eq!(upper, lower);

    let binary = UniqueConstraint::new("email", ["email"]);
    assert_eq!(binary.collation, KeyCollation::Binary);
    let upper = registry.resolve_unique_key(&binary, &json!({"email": "ALICE@example.com"}))?;
    let lower = registry.resolve_unique_key(&binary, &json!({"email": "alice@example.com"}))?;
    assert_ne!(upper, lower);
    Ok(())
}

#[test]
fn compound_keys_follow_declared_field_order() -> Result<()> {
    let registry = social_graph()?;
    let constraint = UniqueConstraint::new("name_city", ["name", "address.city"]);
    let key = registry.resolve_unique_key(
        &constraint,
        &json!({"name": "Ada", "address": {"city": "London"}}),
    )?;
    assert_eq!(key, format!("Ada{UNIQUE_KEY_SEPARATOR}London"));

    // Non-string components serialize canonically.
    let numeric = UniqueConstraint::new("pair", ["a", "b"]);
    let key = registry.resolve_unique_key(&numeric, &json!({"a": 10, "b": true}))?;
    assert_eq!(key, format!("10{UNIQUE_KEY_SEPARATOR}true"));
    Ok(())
}

#[test]
fn graph_scope_uses_reserved_namespace() -> Result<()> {
    let def = GraphDef::builder("scoped")
        .node(
            NodeRegistration::new(NodeType::any("User")?)
                .with_unique(UniqueConstraint::new("handle", ["handle"]).scope(UniqueScope::Graph)),
        )?
        .build()?;
    let registry = KindRegistry::new(def)?;
    let resolved = registry.unique_constraint("User", "handle")?;
    assert_eq!(resolved.namespace, "*");
    assert_eq!(resolved.declared_on, "User");

    let missing = registry.unique_constraint("User", "nope");
    assert!(matches!(
        missing.unwrap_err().downcast_ref::<TypeGraphError>(),
        Some(TypeGraphError::ConstraintNotFound { .. })
    ));
    Ok(())
}

#[test]
fn subclasses_inherit_scoped_constraints() -> Result<()> {
    let def = GraphDef::builder("scoped")
        .node(
            NodeRegistration::new(NodeType::any("Agent")?).with_unique(
                UniqueConstraint::new("handle", ["handle"]).scope(UniqueScope::KindWithSubclasses),
            ),
        )?
        .node(NodeRegistration::new(NodeType::any("Person")?))?
        .relation(OntologyRelation::sub_class_of("Person", "Agent"))
        .build()?;
    let registry = KindRegistry::new(def)?;

    // A Person carries the Agent-declared constraint under the Agent
    // namespace, so Agents and Persons share one key space.
    let resolved = registry.unique_constraint("Person", "handle")?;
    assert_eq!(resolved.namespace, "Agent");
    Ok(())
}

mod key_properties {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        // Key resolution is deterministic and injective over the separator.
        #[test]
        fn key_is_deterministic(name in "[a-zA-Z0-9@. ]{0,40}", city in "[a-zA-Z ]{0,20}") {
            let registry = social_graph().unwrap();
            let constraint = UniqueConstraint::new("k", ["name", "city"]);
            let props = json!({"name": name, "city": city});
            let first = registry.resolve_unique_key(&constraint, &props).unwrap();
            let second = registry.resolve_unique_key(&constraint, &props).unwrap();
            prop_assert_eq!(&first, &second);
            prop_assert_eq!(first.matches(UNIQUE_KEY_SEPARATOR).count(), 1);
        }

        #[test]
        fn case_insensitive_is_idempotent(email in "[a-zA-Z0-9@.]{1,40}") {
            let registry = social_graph().unwrap();
            let constraint = UniqueConstraint::new("email", ["email"]).case_insensitive();
            let key = registry
                .resolve_unique_key(&constraint, &json!({ "email": email }))
                .unwrap();
            let again = registry
                .resolve_unique_key(&constraint, &json!({ "email": key.clone() }))
                .unwrap();
            prop_assert_eq!(key, again);
        }
    }
}
