// Storage-engine tests over the in-memory backend: constraint enforcement,
// soft-delete behaviors, uniqueness lifecycle, temporal filtering, and
// transactions.

use anyhow::Result;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use typegraph::{
    Cardinality, CreateEdge, CreateNode, DeleteBehavior, EdgeRegistration, EdgeType, FieldType,
    FindOptions, GraphDef, GraphStore, KindRegistry, MemoryBackend, NodeRef, NodeRegistration,
    NodeType, OntologyRelation, PropSchema, StoreConfig, TemporalFilter, TypeGraphError,
    UniqueConstraint,
};

fn graph_def() -> Result<GraphDef> {
    GraphDef::builder("hr")
        .node(
            NodeRegistration::new(NodeType::new(
                "Person",
                Arc::new(
                    PropSchema::new()
                        .required("name", FieldType::String)
                        .field("age", FieldType::Number)
                        .field("email", FieldType::String),
                ),
            )?)
            .on_delete(DeleteBehavior::Cascade),
        )?
        .node(
            NodeRegistration::new(NodeType::any("User")?).with_unique(
                UniqueConstraint::new("email", ["email"]).case_insensitive(),
            ),
        )?
        .node(NodeRegistration::new(NodeType::any("Company")?))?
        .node(NodeRegistration::new(NodeType::any("Passport")?))?
        .node(NodeRegistration::new(NodeType::any("Document")?))?
        .edge(
            EdgeRegistration::new(EdgeType::any("worksAt")?, ["Person"], ["Company"])
                .cardinality(Cardinality::Many),
        )?
        .edge(
            EdgeRegistration::new(EdgeType::any("hasPassport")?, ["Person"], ["Passport"])
                .cardinality(Cardinality::One),
        )?
        .edge(
            EdgeRegistration::new(EdgeType::any("endorses")?, ["Person"], ["Person"])
                .cardinality(Cardinality::Unique),
        )?
        .relation(OntologyRelation::disjoint_with("Person", "Company"))
        .build()
}

async fn store() -> Result<GraphStore> {
    let registry = Arc::new(KindRegistry::new(graph_def()?)?);
    let backend = Arc::new(MemoryBackend::new());
    GraphStore::new(registry, backend, StoreConfig::builder("g1").build()?)
}

#[tokio::test]
async fn create_then_get_round_trips_props() -> Result<()> {
    let store = store().await?;
    let created = store
        .create_node(CreateNode::new(
            "Person",
            json!({"name": "Ada", "age": 36}),
        ))
        .await?;
    assert_eq!(created.version, 1);
    assert!(created.deleted_at.is_none());

    let fetched = store.get_node("Person", &created.id).await?.unwrap();
    assert_eq!(fetched.props, json!({"name": "Ada", "age": 36}));
    assert_eq!(fetched.created_at, created.created_at);
    Ok(())
}

#[tokio::test]
async fn validation_failures_surface_as_validation_errors() -> Result<()> {
    let store = store().await?;
    let err = store
        .create_node(CreateNode::new("Person", json!({"age": 36})))
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<TypeGraphError>(),
        Some(TypeGraphError::Validation { .. })
    ));

    let err = store
        .create_node(CreateNode::new("Ghost", json!({})))
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<TypeGraphError>(),
        Some(TypeGraphError::KindNotFound { .. })
    ));
    Ok(())
}

#[tokio::test]
async fn update_bumps_version_and_merges_props() -> Result<()> {
    let store = store().await?;
    let created = store
        .create_node(CreateNode::new(
            "Person",
            json!({"name": "Ada", "age": 36}),
        ))
        .await?;

    let updated = store
        .update_node("Person", &created.id, json!({"age": 37}))
        .await?;
    assert_eq!(updated.version, 2);
    assert_eq!(updated.props, json!({"name": "Ada", "age": 37}));
    assert_eq!(updated.created_at, created.created_at);

    // Updating is equivalent to creating with the merged payload.
    let direct = store
        .create_node(CreateNode::new(
            "Person",
            json!({"name": "Ada", "age": 37}),
        ))
        .await?;
    assert_eq!(direct.props, updated.props);
    Ok(())
}

#[tokio::test]
async fn soft_delete_hides_by_default_and_shows_with_tombstones() -> Result<()> {
    let store = store().await?;
    let node = store
        .create_node(CreateNode::new("Person", json!({"name": "Ada"})))
        .await?;

    store.delete_node("Person", &node.id).await?;
    assert!(store.get_node("Person", &node.id).await?.is_none());

    let tombstone = store
        .get_node_with("Person", &node.id, TemporalFilter::include_tombstones())
        .await?
        .unwrap();
    assert!(tombstone.deleted_at.is_some());
    Ok(())
}

#[tokio::test]
async fn restrict_blocks_delete_while_edges_exist() -> Result<()> {
    let registry = Arc::new(KindRegistry::new(
        GraphDef::builder("restrictive")
            .node(NodeRegistration::new(NodeType::any("Person")?))?
            .node(NodeRegistration::new(NodeType::any("Company")?))?
            .edge(EdgeRegistration::new(
                EdgeType::any("worksAt")?,
                ["Person"],
                ["Company"],
            ))?
            .build()?,
    )?);
    let store = GraphStore::new(
        registry,
        Arc::new(MemoryBackend::new()),
        StoreConfig::builder("g1").build()?,
    )?;

    let person = store
        .create_node(CreateNode::new("Person", json!({})))
        .await?;
    let company = store
        .create_node(CreateNode::new("Company", json!({})))
        .await?;
    let edge = store
        .create_edge(CreateEdge::new(
            "worksAt",
            NodeRef::from(&person),
            NodeRef::from(&company),
        ))
        .await?;

    let err = store.delete_node("Person", &person.id).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<TypeGraphError>(),
        Some(TypeGraphError::RestrictedDelete { live_edges: 1, .. })
    ));

    store.delete_edge(&edge.id).await?;
    store.delete_node("Person", &person.id).await?;
    Ok(())
}

#[tokio::test]
async fn cascade_delete_tombstones_edges_and_keeps_neighbors() -> Result<()> {
    let store = store().await?;
    let person = store
        .create_node(CreateNode::new("Person", json!({"name": "Ada"})))
        .await?;
    let first = store
        .create_node(CreateNode::new("Company", json!({"name": "Acme"})))
        .await?;
    let second = store
        .create_node(CreateNode::new("Company", json!({"name": "Umbrella"})))
        .await?;

    let e1 = store
        .create_edge(CreateEdge::new(
            "worksAt",
            NodeRef::from(&person),
            NodeRef::from(&first),
        ))
        .await?;
    let e2 = store
        .create_edge(CreateEdge::new(
            "worksAt",
            NodeRef::from(&person),
            NodeRef::from(&second),
        ))
        .await?;

    store.delete_node("Person", &person.id).await?;

    for edge_id in [&e1.id, &e2.id] {
        assert!(store.get_edge(edge_id).await?.is_none());
        let tombstone = store
            .get_edge_with(edge_id, TemporalFilter::include_tombstones())
            .await?
            .unwrap();
        assert!(tombstone.deleted_at.is_some());
    }
    // Companies are untouched.
    assert!(store.get_node("Company", &first.id).await?.is_some());
    assert!(store.get_node("Company", &second.id).await?.is_some());
    Ok(())
}

#[tokio::test]
async fn cardinality_one_frees_slot_after_delete() -> Result<()> {
    let store = store().await?;
    let person = store
        .create_node(CreateNode::new("Person", json!({"name": "Ada"})))
        .await?;
    let p1 = store
        .create_node(CreateNode::new("Passport", json!({})))
        .await?;
    let p2 = store
        .create_node(CreateNode::new("Passport", json!({})))
        .await?;

    let edge = store
        .create_edge(CreateEdge::new(
            "hasPassport",
            NodeRef::from(&person),
            NodeRef::from(&p1),
        ))
        .await?;

    let err = store
        .create_edge(CreateEdge::new(
            "hasPassport",
            NodeRef::from(&person),
            NodeRef::from(&p2),
        ))
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<TypeGraphError>(),
        Some(TypeGraphError::Cardinality { .. })
    ));

    store.delete_edge(&edge.id).await?;
    store
        .create_edge(CreateEdge::new(
            "hasPassport",
            NodeRef::from(&person),
            NodeRef::from(&p2),
        ))
        .await?;

    assert!(
        store
            .count_edges_from("hasPassport", &NodeRef::from(&person), false)
            .await?
            <= 1
    );
    Ok(())
}

#[tokio::test]
async fn unique_cardinality_blocks_duplicate_pairs() -> Result<()> {
    let store = store().await?;
    let a = store
        .create_node(CreateNode::new("Person", json!({"name": "A"})))
        .await?;
    let b = store
        .create_node(CreateNode::new("Person", json!({"name": "B"})))
        .await?;

    store
        .create_edge(CreateEdge::new(
            "endorses",
            NodeRef::from(&a),
            NodeRef::from(&b),
        ))
        .await?;
    let err = store
        .create_edge(CreateEdge::new(
            "endorses",
            NodeRef::from(&a),
            NodeRef::from(&b),
        ))
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<TypeGraphError>(),
        Some(TypeGraphError::Cardinality { .. })
    ));

    // The reverse direction is a different pair.
    store
        .create_edge(CreateEdge::new(
            "endorses",
            NodeRef::from(&b),
            NodeRef::from(&a),
        ))
        .await?;
    Ok(())
}

#[tokio::test]
async fn endpoint_kind_and_existence_are_enforced() -> Result<()> {
    let store = store().await?;
    let person = store
        .create_node(CreateNode::new("Person", json!({"name": "Ada"})))
        .await?;
    let document = store
        .create_node(CreateNode::new("Document", json!({})))
        .await?;

    // Document is not a declared target of worksAt.
    let err = store
        .create_edge(CreateEdge::new(
            "worksAt",
            NodeRef::from(&person),
            NodeRef::from(&document),
        ))
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<TypeGraphError>(),
        Some(TypeGraphError::Endpoint { .. })
    ));

    // Declared kind but missing node.
    let err = store
        .create_edge(CreateEdge::new(
            "worksAt",
            NodeRef::from(&person),
            NodeRef::new("Company", "ghost"),
        ))
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<TypeGraphError>(),
        Some(TypeGraphError::Endpoint { .. })
    ));
    Ok(())
}

#[tokio::test]
async fn uniqueness_is_case_insensitive_and_released_on_delete() -> Result<()> {
    let store = store().await?;
    let first = store
        .create_node(CreateNode::new(
            "User",
            json!({"email": "alice@example.com"}),
        ))
        .await?;

    let err = store
        .create_node(CreateNode::new(
            "User",
            json!({"email": "ALICE@EXAMPLE.COM"}),
        ))
        .await
        .unwrap_err();
    match err.downcast_ref::<TypeGraphError>() {
        Some(TypeGraphError::Uniqueness { owner, .. }) => assert_eq!(owner, &first.id),
        other => panic!("expected uniqueness error, got {other:?}"),
    }

    store.delete_node("User", &first.id).await?;
    store
        .create_node(CreateNode::new(
            "User",
            json!({"email": "ALICE@EXAMPLE.COM"}),
        ))
        .await?;
    Ok(())
}

#[tokio::test]
async fn unique_key_migrates_on_update() -> Result<()> {
    let store = store().await?;
    let user = store
        .create_node(CreateNode::new("User", json!({"email": "a@example.com"})))
        .await?;
    store
        .update_node("User", &user.id, json!({"email": "b@example.com"}))
        .await?;

    // The old key is free again; the new key is taken.
    store
        .create_node(CreateNode::new("User", json!({"email": "a@example.com"})))
        .await?;
    let err = store
        .create_node(CreateNode::new("User", json!({"email": "b@example.com"})))
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<TypeGraphError>(),
        Some(TypeGraphError::Uniqueness { .. })
    ));
    Ok(())
}

#[tokio::test]
async fn find_by_unique_sees_only_live_rows() -> Result<()> {
    let store = store().await?;
    let user = store
        .create_node(CreateNode::new("User", json!({"email": "a@example.com"})))
        .await?;

    let found = store
        .find_by_unique("User", "email", &json!({"email": "A@EXAMPLE.COM"}))
        .await?
        .unwrap();
    assert_eq!(found.id, user.id);

    store.delete_node("User", &user.id).await?;
    assert!(store
        .find_by_unique("User", "email", &json!({"email": "a@example.com"}))
        .await?
        .is_none());
    Ok(())
}

#[tokio::test]
async fn disjoint_kinds_reject_shared_ids() -> Result<()> {
    let store = store().await?;
    store
        .create_node(CreateNode::new("Person", json!({"name": "Ada"})).id("shared"))
        .await?;
    let err = store
        .create_node(CreateNode::new("Company", json!({})).id("shared"))
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<TypeGraphError>(),
        Some(TypeGraphError::Disjoint { .. })
    ));
    Ok(())
}

#[tokio::test]
async fn empty_bulk_inputs_short_circuit() -> Result<()> {
    let store = store().await?;
    assert!(store.create_nodes(Vec::new()).await?.is_empty());
    assert!(store.get_nodes("Person", &[]).await?.is_empty());
    assert!(store.bulk_find_or_create_nodes(Vec::new()).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn get_nodes_preserves_input_order() -> Result<()> {
    let store = store().await?;
    let a = store
        .create_node(CreateNode::new("Person", json!({"name": "A"})))
        .await?;
    let b = store
        .create_node(CreateNode::new("Person", json!({"name": "B"})))
        .await?;
    let rows = store
        .get_nodes(
            "Person",
            &[b.id.clone(), "missing".to_string(), a.id.clone()],
        )
        .await?;
    let ids: Vec<&str> = rows.iter().map(|row| row.id.as_str()).collect();
    assert_eq!(ids, vec![b.id.as_str(), a.id.as_str()]);
    Ok(())
}

#[tokio::test]
async fn find_nodes_by_kind_respects_temporal_filter() -> Result<()> {
    let store = store().await?;
    let live = store
        .create_node(CreateNode::new("Person", json!({"name": "Live"})))
        .await?;
    let dead = store
        .create_node(CreateNode::new("Person", json!({"name": "Dead"})))
        .await?;
    store.delete_node("Person", &dead.id).await?;

    let current = store
        .find_nodes_by_kind("Person", FindOptions::default())
        .await?;
    assert_eq!(current.len(), 1);
    assert_eq!(current[0].id, live.id);

    let all = store
        .find_nodes_by_kind(
            "Person",
            FindOptions {
                filter: TemporalFilter::include_tombstones(),
                ..FindOptions::default()
            },
        )
        .await?;
    assert_eq!(all.len(), 2);
    Ok(())
}

#[tokio::test]
async fn transaction_rolls_back_on_error() -> Result<()> {
    let store = store().await?;
    let result: Result<()> = store
        .transaction(|tx| {
            Box::pin(async move {
                tx.create_node(CreateNode::new("Person", json!({"name": "Ghost"})))
                    .await?;
                anyhow::bail!("boom");
            })
        })
        .await;
    assert!(result.is_err());
    assert_eq!(store.count_nodes_by_kind("Person", false).await?, 0);

    store
        .transaction(|tx| {
            Box::pin(async move {
                tx.create_node(CreateNode::new("Person", json!({"name": "Kept"})))
                    .await?;
                Ok(())
            })
        })
        .await?;
    assert_eq!(store.count_nodes_by_kind("Person", false).await?, 1);
    Ok(())
}

#[tokio::test]
async fn hard_delete_removes_every_trace() -> Result<()> {
    let store = store().await?;
    let user = store
        .create_node(CreateNode::new("User", json!({"email": "a@example.com"})))
        .await?;

    store.hard_delete_node("User", &user.id).await?;
    assert!(store
        .get_node_with("User", &user.id, TemporalFilter::include_tombstones())
        .await?
        .is_none());

    // The key is claimable again because the claim row is gone entirely.
    store
        .create_node(CreateNode::new("User", json!({"email": "a@example.com"})))
        .await?;
    Ok(())
}

#[tokio::test]
async fn clear_resets_the_graph() -> Result<()> {
    let store = store().await?;
    let person = store
        .create_node(CreateNode::new("Person", json!({"name": "Ada"})))
        .await?;
    let company = store
        .create_node(CreateNode::new("Company", json!({})))
        .await?;
    store
        .create_edge(CreateEdge::new(
            "worksAt",
            NodeRef::from(&person),
            NodeRef::from(&company),
        ))
        .await?;
    store.publish_schema().await?;

    store.clear().await?;
    assert_eq!(store.count_nodes_by_kind("Person", false).await?, 0);
    assert_eq!(store.count_edges_by_kind("worksAt").await?, 0);
    assert!(store.active_schema().await?.is_none());
    Ok(())
}

#[tokio::test]
async fn schema_publishing_is_idempotent_per_hash() -> Result<()> {
    let store = store().await?;
    let first = store.publish_schema().await?;
    assert_eq!(first.version, 1);
    assert!(first.is_active);

    let again = store.publish_schema().await?;
    assert_eq!(again.version, 1);
    assert!(store.schema_drift().await?.is_none());

    let fetched = store.schema_version(1).await?.unwrap();
    assert_eq!(fetched.schema_hash, first.schema_hash);
    Ok(())
}

#[tokio::test]
async fn validity_intervals_gate_current_reads() -> Result<()> {
    use chrono::{Duration, Utc};
    let store = store().await?;
    let past = Utc::now() - Duration::hours(2);
    let ended = Utc::now() - Duration::hours(1);

    let node = store
        .create_node(
            CreateNode::new("Person", json!({"name": "Past"}))
                .validity(typegraph::Validity::new(Some(past), Some(ended))?),
        )
        .await?;

    assert!(store.get_node("Person", &node.id).await?.is_none());
    assert!(store
        .get_node_with("Person", &node.id, TemporalFilter::include_ended())
        .await?
        .is_some());
    assert!(store
        .get_node_with(
            "Person",
            &node.id,
            TemporalFilter::as_of(past + Duration::minutes(30)),
        )
        .await?
        .is_some());
    Ok(())
}
