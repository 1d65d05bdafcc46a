// End-to-end tests against an in-memory SQLite database: the storage engine
// and the full query pipeline (compilation, execution, recursion, smart
// select, pagination, streaming, prepared queries, set operations).

use anyhow::Result;
use futures::TryStreamExt;
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use std::sync::Arc;
use typegraph::{
    field, param, prop, AggOutput, Cardinality, CreateEdge, CreateNode, DeleteBehavior,
    EdgeRegistration, EdgeType, GraphDef, GraphStore, Hop, KindRegistry, NodeRef,
    NodeRegistration, NodeType, OntologyRelation, PageArgs, ParamType, SqliteBackend, StoreConfig,
    TypeGraphError, UniqueConstraint,
};

fn graph_def() -> Result<GraphDef> {
    GraphDef::builder("social")
        .node(NodeRegistration::new(NodeType::any("Person")?).on_delete(DeleteBehavior::Cascade))?
        .node(NodeRegistration::new(NodeType::any("Company")?))?
        .node(NodeRegistration::new(NodeType::any("Passport")?))?
        .node(NodeRegistration::new(NodeType::any("Item")?))?
        .node(
            NodeRegistration::new(NodeType::any("User")?).with_unique(
                UniqueConstraint::new("email", ["email"]).case_insensitive(),
            ),
        )?
        .edge(EdgeRegistration::new(
            EdgeType::any("knows")?,
            ["Person"],
            ["Person"],
        ))?
        .edge(EdgeRegistration::new(
            EdgeType::any("worksAt")?,
            ["Person"],
            ["Company"],
        ))?
        .edge(
            EdgeRegistration::new(EdgeType::any("hasPassport")?, ["Person"], ["Passport"])
                .cardinality(Cardinality::One),
        )?
        .relation(OntologyRelation::disjoint_with("Person", "Company"))
        .build()
}

async fn store() -> Result<GraphStore> {
    let registry = Arc::new(KindRegistry::new(graph_def()?)?);
    let backend = Arc::new(SqliteBackend::in_memory().await?);
    GraphStore::new(registry, backend, StoreConfig::builder("g1").build()?)
}

async fn person(store: &GraphStore, name: &str) -> Result<typegraph::NodeRow> {
    store
        .create_node(CreateNode::new("Person", json!({"name": name})))
        .await
}

#[tokio::test]
async fn node_lifecycle_against_sqlite() -> Result<()> {
    let store = store().await?;
    let ada = person(&store, "Ada").await?;

    let fetched = store.get_node("Person", &ada.id).await?.unwrap();
    assert_eq!(fetched.props, json!({"name": "Ada"}));
    assert_eq!(fetched.version, 1);

    let updated = store
        .update_node("Person", &ada.id, json!({"age": 36}))
        .await?;
    assert_eq!(updated.version, 2);
    assert_eq!(updated.props, json!({"name": "Ada", "age": 36}));

    store.delete_node("Person", &ada.id).await?;
    assert!(store.get_node("Person", &ada.id).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn cardinality_one_scenario() -> Result<()> {
    let store = store().await?;
    let p1 = person(&store, "P1").await?;
    let p2 = store
        .create_node(CreateNode::new("Passport", json!({})))
        .await?;
    let p3 = store
        .create_node(CreateNode::new("Passport", json!({})))
        .await?;

    let edge = store
        .create_edge(CreateEdge::new(
            "hasPassport",
            NodeRef::from(&p1),
            NodeRef::from(&p2),
        ))
        .await?;
    let err = store
        .create_edge(CreateEdge::new(
            "hasPassport",
            NodeRef::from(&p1),
            NodeRef::from(&p3),
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
            NodeRef::from(&p1),
            NodeRef::from(&p3),
        ))
        .await?;
    Ok(())
}

#[tokio::test]
async fn case_insensitive_uniqueness_scenario() -> Result<()> {
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
    assert!(matches!(
        err.downcast_ref::<TypeGraphError>(),
        Some(TypeGraphError::Uniqueness { .. })
    ));

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
async fn basic_query_with_filter_and_traversal() -> Result<()> {
    let store = store().await?;
    let ada = person(&store, "Ada").await?;
    let bob = person(&store, "Bob").await?;
    let acme = store
        .create_node(CreateNode::new("Company", json!({"name": "Acme"})))
        .await?;
    store
        .create_edge(CreateEdge::new(
            "worksAt",
            NodeRef::from(&ada),
            NodeRef::from(&acme),
        ))
        .await?;
    let _ = bob;

    let rows = store
        .query("Person")
        .alias("p")
        .filter(field("p", "name").eq("Ada"))
        .traverse(Hop::out("worksAt").edge_alias("w").to("c"))
        .select([("person", prop("p", "name")), ("company", prop("c", "name"))])
        .execute()
        .await?;

    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("person"), Some(&json!("Ada")));
    assert_eq!(rows[0].get("company"), Some(&json!("Acme")));
    Ok(())
}

#[tokio::test]
async fn recursive_traversal_with_cycle_terminates() -> Result<()> {
    let store = store().await?;
    let alice = person(&store, "Alice").await?;
    let bob = person(&store, "Bob").await?;
    let charlie = person(&store, "Charlie").await?;

    for (from, to) in [(&alice, &bob), (&bob, &charlie), (&charlie, &alice)] {
        store
            .create_edge(CreateEdge::new(
                "knows",
                NodeRef::from(from),
                NodeRef::from(to),
            ))
            .await?;
    }

    let rows = store
        .query("Person")
        .alias("p")
        .filter(field("p", "name").eq("Alice"))
        .traverse(Hop::out("knows").edge_alias("k").to("f").recursive(1, None))
        .select([("friend", prop("f", "name")), ("depth", prop("k", "depth"))])
        .execute()
        .await?;

    let mut friends: Vec<String> = rows
        .iter()
        .map(|row| row.get("friend").unwrap().as_str().unwrap().to_string())
        .collect();
    friends.sort();
    // Alice's transitive circle is exactly {Bob, Charlie}; the cycle back to
    // Alice is cut by the visited-path guard.
    assert_eq!(friends, vec!["Bob".to_string(), "Charlie".to_string()]);

    let depths: HashMap<String, i64> = rows
        .iter()
        .map(|row| {
            (
                row.get("friend").unwrap().as_str().unwrap().to_string(),
                row.get("depth").unwrap().as_i64().unwrap(),
            )
        })
        .collect();
    assert_eq!(depths["Bob"], 1);
    assert_eq!(depths["Charlie"], 2);
    Ok(())
}

#[tokio::test]
async fn bounded_recursion_respects_hop_limits() -> Result<()> {
    let store = store().await?;
    let a = person(&store, "A").await?;
    let b = person(&store, "B").await?;
    let c = person(&store, "C").await?;
    let d = person(&store, "D").await?;
    for (from, to) in [(&a, &b), (&b, &c), (&c, &d)] {
        store
            .create_edge(CreateEdge::new(
                "knows",
                NodeRef::from(from),
                NodeRef::from(to),
            ))
            .await?;
    }

    let names = |rows: Vec<typegraph::ResultRow>| {
        let mut out: Vec<String> = rows
            .iter()
            .map(|row| row.get("friend").unwrap().as_str().unwrap().to_string())
            .collect();
        out.sort();
        out
    };

    let within_two = store
        .query("Person")
        .alias("p")
        .filter(field("p", "name").eq("A"))
        .traverse(Hop::out("knows").edge_alias("k").to("f").recursive(1, Some(2)))
        .select([("friend", prop("f", "name"))])
        .execute()
        .await?;
    assert_eq!(names(within_two), vec!["B".to_string(), "C".to_string()]);

    // min_hops skips the first ring.
    let ring_two_plus = store
        .query("Person")
        .alias("p")
        .filter(field("p", "name").eq("A"))
        .traverse(Hop::out("knows").edge_alias("k").to("f").recursive(2, Some(3)))
        .select([("friend", prop("f", "name"))])
        .execute()
        .await?;
    assert_eq!(names(ring_two_plus), vec!["C".to_string(), "D".to_string()]);

    // max_hops = 0 with min_hops = 0 yields only the start node.
    let only_start = store
        .query("Person")
        .alias("p")
        .filter(field("p", "name").eq("A"))
        .traverse(Hop::out("knows").edge_alias("k").to("f").recursive(0, Some(0)))
        .select([("friend", prop("f", "name"))])
        .execute()
        .await?;
    assert_eq!(names(only_start), vec!["A".to_string()]);
    Ok(())
}

#[tokio::test]
async fn smart_select_matches_full_projection() -> Result<()> {
    let store = store().await?;
    for name in ["Ada", "Bob", "Cleo"] {
        person(&store, name).await?;
    }

    let selective = store
        .query("Person")
        .alias("p")
        .select_with(|ctx| json!({"name": ctx.alias("p").prop("name")}))
        .order_by(prop("p", "name"), false)
        .execute()
        .await?;

    let full = store
        .query("Person")
        .alias("p")
        .select_aliases(["p"])
        .order_by(prop("p", "name"), false)
        .execute()
        .await?;

    assert_eq!(selective.len(), full.len());
    for (lean, fat) in selective.iter().zip(full.iter()) {
        let from_full = fat.get("p").unwrap().get("props").unwrap().get("name");
        assert_eq!(lean.get("name"), from_full);
    }
    Ok(())
}

#[tokio::test]
async fn optional_traversal_keeps_unmatched_rows() -> Result<()> {
    let store = store().await?;
    let ada = person(&store, "Ada").await?;
    let _bob = person(&store, "Bob").await?;
    let acme = store
        .create_node(CreateNode::new("Company", json!({"name": "Acme"})))
        .await?;
    store
        .create_edge(CreateEdge::new(
            "worksAt",
            NodeRef::from(&ada),
            NodeRef::from(&acme),
        ))
        .await?;

    let rows = store
        .query("Person")
        .alias("p")
        .traverse(Hop::out("worksAt").edge_alias("w").to("c").optional())
        .select_with(|ctx| {
            let employer = if ctx.alias("c").present() {
                ctx.alias("c").prop("name")
            } else {
                JsonValue::Null
            };
            json!({"name": ctx.alias("p").prop("name"), "employer": employer})
        })
        .order_by(prop("p", "name"), false)
        .execute()
        .await?;

    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].get("name"), Some(&json!("Ada")));
    assert_eq!(rows[0].get("employer"), Some(&json!("Acme")));
    assert_eq!(rows[1].get("name"), Some(&json!("Bob")));
    assert_eq!(rows[1].get("employer"), Some(&json!(null)));
    Ok(())
}

#[tokio::test]
async fn cursor_pagination_covers_every_row_once() -> Result<()> {
    let store = store().await?;
    for i in 0..25 {
        store
            .create_node(CreateNode::new("Item", json!({"idx": i})))
            .await?;
    }

    let query = store
        .query("Item")
        .alias("i")
        .select([("idx", prop("i", "idx"))])
        .order_by(prop("i", "idx"), false);

    let mut seen = Vec::new();
    let mut cursor: Option<String> = None;
    let mut pages = 0;
    loop {
        let mut args = PageArgs::first(5);
        if let Some(cursor) = &cursor {
            args = args.after(cursor.clone());
        }
        let page = query.paginate(args).await?;
        pages += 1;
        assert!(page.rows.len() <= 5);
        assert_eq!(page.has_prev_page, seen.len() > 0);
        for row in &page.rows {
            seen.push(row.get("idx").unwrap().as_i64().unwrap());
        }
        if !page.has_next_page {
            break;
        }
        cursor = page.next_cursor.clone();
    }

    assert_eq!(pages, 5);
    assert_eq!(seen, (0..25).collect::<Vec<i64>>());
    Ok(())
}

#[tokio::test]
async fn streaming_yields_the_same_multiset_as_execute() -> Result<()> {
    let store = store().await?;
    for i in 0..13 {
        store
            .create_node(CreateNode::new("Item", json!({"idx": i})))
            .await?;
    }

    let query = store
        .query("Item")
        .alias("i")
        .select([("idx", prop("i", "idx"))])
        .order_by(prop("i", "idx"), false);

    let executed: Vec<i64> = query
        .execute()
        .await?
        .iter()
        .map(|row| row.get("idx").unwrap().as_i64().unwrap())
        .collect();

    let streamed: Vec<i64> = query
        .stream(4)
        .try_collect::<Vec<_>>()
        .await?
        .iter()
        .map(|row| row.get("idx").unwrap().as_i64().unwrap())
        .collect();

    assert_eq!(streamed, executed);
    Ok(())
}

#[tokio::test]
async fn prepared_execution_equals_inline_literals() -> Result<()> {
    let store = store().await?;
    for (name, age) in [("Ada", 36), ("Bob", 25), ("Cleo", 41)] {
        store
            .create_node(CreateNode::new(
                "Person",
                json!({"name": name, "age": age}),
            ))
            .await?;
    }

    let prepared = store
        .query("Person")
        .alias("p")
        .filter(field("p", "age").ge(param("min_age", ParamType::Number)))
        .select([("name", prop("p", "name"))])
        .order_by(prop("p", "name"), false)
        .prepare()?;

    let bindings = HashMap::from([("min_age".to_string(), json!(30))]);
    let via_prepared: Vec<JsonValue> = prepared
        .execute(&bindings)
        .await?
        .iter()
        .map(|row| row.get("name").unwrap().clone())
        .collect();

    let direct: Vec<JsonValue> = store
        .query("Person")
        .alias("p")
        .filter(field("p", "age").ge(typegraph::lit(30)))
        .select([("name", prop("p", "name"))])
        .order_by(prop("p", "name"), false)
        .execute()
        .await?
        .iter()
        .map(|row| row.get("name").unwrap().clone())
        .collect();

    assert_eq!(via_prepared, direct);
    assert_eq!(via_prepared, vec![json!("Ada"), json!("Cleo")]);

    // Re-execution with different bindings reuses the compiled plan.
    let looser = HashMap::from([("min_age".to_string(), json!(20))]);
    assert_eq!(prepared.execute(&looser).await?.len(), 3);
    Ok(())
}

#[tokio::test]
async fn set_operations_follow_sql_semantics() -> Result<()> {
    let store = store().await?;
    for (name, age) in [("Ada", 25), ("Bob", 35), ("Cleo", 45)] {
        store
            .create_node(CreateNode::new(
                "Person",
                json!({"name": name, "age": age}),
            ))
            .await?;
    }

    let names = |rows: Vec<typegraph::ResultRow>| {
        let mut out: Vec<String> = rows
            .iter()
            .map(|row| row.get("name").unwrap().as_str().unwrap().to_string())
            .collect();
        out.sort();
        out
    };

    let older = || {
        store
            .query("Person")
            .alias("p")
            .filter(field("p", "age").ge(typegraph::lit(30)))
            .select([("name", prop("p", "name"))])
    };
    let younger = || {
        store
            .query("Person")
            .alias("p")
            .filter(field("p", "age").le(typegraph::lit(40)))
            .select([("name", prop("p", "name"))])
    };

    // union dedupes the overlap (Bob).
    let union = names(older().union(younger())?.execute().await?);
    assert_eq!(union, vec!["Ada", "Bob", "Cleo"]);

    // union all keeps the duplicate.
    let union_all = names(older().union_all(younger())?.execute().await?);
    assert_eq!(union_all, vec!["Ada", "Bob", "Bob", "Cleo"]);

    let intersect = names(older().intersect(younger())?.execute().await?);
    assert_eq!(intersect, vec!["Bob"]);

    let except = names(older().except(younger())?.execute().await?);
    assert_eq!(except, vec!["Cleo"]);

    // An ordered union sorts the combined result through one outer clause.
    let ordered: Vec<String> = older()
        .union(younger())?
        .order_by(prop("p", "name"), false)
        .execute()
        .await?
        .iter()
        .map(|row| row.get("name").unwrap().as_str().unwrap().to_string())
        .collect();
    assert_eq!(ordered, vec!["Ada", "Bob", "Cleo"]);
    Ok(())
}

#[tokio::test]
async fn subquery_predicates_bind_in_textual_order() -> Result<()> {
    let store = store().await?;
    let ada = person(&store, "Ada").await?;
    let bob = person(&store, "Bob").await?;
    store
        .create_edge(CreateEdge::new(
            "knows",
            NodeRef::from(&ada),
            NodeRef::from(&bob),
        ))
        .await?;

    // The OR conjunct's literals bind in the statement body while the
    // subquery's CTE (and its bound kind) is hoisted ahead of them; a
    // positionally mis-bound statement would match nothing here.
    let inner = store
        .query("Person")
        .alias("q")
        .filter(field("q", "name").eq("Bob"))
        .select([("id", typegraph::sysf("q", typegraph::SystemField::Id))]);
    let rows = store
        .query("Person")
        .alias("p")
        .traverse(Hop::out("knows").edge_alias("k").to("f"))
        .filter(typegraph::or([
            field("p", "name").eq("Ada"),
            field("f", "name").eq("Nobody"),
        ]))
        .filter(typegraph::sys("f", typegraph::SystemField::Id).in_subquery(inner))
        .select([("person", prop("p", "name")), ("friend", prop("f", "name"))])
        .execute()
        .await?;

    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("person"), Some(&json!("Ada")));
    assert_eq!(rows[0].get("friend"), Some(&json!("Bob")));
    Ok(())
}

#[tokio::test]
async fn aggregation_groups_and_counts() -> Result<()> {
    let store = store().await?;
    for (name, city) in [
        ("Ada", "london"),
        ("Bob", "york"),
        ("Cleo", "london"),
        ("Dan", "york"),
        ("Eve", "london"),
    ] {
        store
            .create_node(CreateNode::new(
                "Person",
                json!({"name": name, "city": city}),
            ))
            .await?;
    }

    let rows = store
        .query("Person")
        .alias("p")
        .aggregate([
            AggOutput::group("city", prop("p", "city")),
            AggOutput::count("n", "p"),
        ])
        .group_by([prop("p", "city")])
        .order_by(prop("p", "city"), false)
        .execute()
        .await?;

    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].get("city"), Some(&json!("london")));
    assert_eq!(rows[0].get("n"), Some(&json!(3)));
    assert_eq!(rows[1].get("city"), Some(&json!("york")));
    assert_eq!(rows[1].get("n"), Some(&json!(2)));
    Ok(())
}

#[tokio::test]
async fn hard_delete_runs_in_a_transaction() -> Result<()> {
    let store = store().await?;
    let ada = person(&store, "Ada").await?;
    let acme = store
        .create_node(CreateNode::new("Company", json!({"name": "Acme"})))
        .await?;
    store
        .create_edge(CreateEdge::new(
            "worksAt",
            NodeRef::from(&ada),
            NodeRef::from(&acme),
        ))
        .await?;

    store.hard_delete_node("Person", &ada.id).await?;
    assert!(store
        .get_node_with(
            "Person",
            &ada.id,
            typegraph::TemporalFilter::include_tombstones(),
        )
        .await?
        .is_none());
    assert!(store
        .find_edges_connected_to(&NodeRef::from(&acme))
        .await?
        .is_empty());
    Ok(())
}

#[tokio::test]
async fn schema_versions_persist_round_trip() -> Result<()> {
    let store = store().await?;
    let published = store.publish_schema().await?;
    let active = store.active_schema().await?.unwrap();
    assert_eq!(active.version, published.version);
    assert_eq!(active.schema_hash, published.schema_hash);
    assert!(active.schema_doc.get("nodes").is_some());
    assert!(store.schema_drift().await?.is_none());
    Ok(())
}

#[tokio::test]
async fn backward_pagination_walks_in_reverse() -> Result<()> {
    let store = store().await?;
    for i in 0..9 {
        store
            .create_node(CreateNode::new("Item", json!({"idx": i})))
            .await?;
    }

    let query = store
        .query("Item")
        .alias("i")
        .select([("idx", prop("i", "idx"))])
        .order_by(prop("i", "idx"), false);

    let last_page = query.paginate(PageArgs::last(3)).await?;
    let idxs: Vec<i64> = last_page
        .rows
        .iter()
        .map(|row| row.get("idx").unwrap().as_i64().unwrap())
        .collect();
    // Rows come back in the query's declared order.
    assert_eq!(idxs, vec![6, 7, 8]);
    assert!(last_page.has_next_page);

    let previous = query
        .paginate(PageArgs::last(3).before(last_page.next_cursor.unwrap()))
        .await?;
    let idxs: Vec<i64> = previous
        .rows
        .iter()
        .map(|row| row.get("idx").unwrap().as_i64().unwrap())
        .collect();
    assert_eq!(idxs, vec![3, 4, 5]);
    Ok(())
}
