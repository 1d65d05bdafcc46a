// Compiler tests: generated SQL shapes, predicate pushdown, recursion,
// expansion, set operations, smart select, and prepared-query binding
// validation. No database is needed; assertions run against the SQL text and
// parameter lists.

use anyhow::Result;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use typegraph::query_compiler::{CompileOptions, ParamEntry, QueryCompiler, RowShape};
use typegraph::{
    and, field, lit, param, prop, sys, sysf, Cardinality, EdgeRegistration, EdgeType, GraphDef,
    GraphStore, Hop, KindRegistry, MemoryBackend, NodeRegistration, NodeType, OntologyRelation,
    PageArgs, ParamType, SqlDialect, SqlValue, StoreConfig, SystemField, TableNames,
    TypeGraphError,
};

fn registry() -> Result<Arc<KindRegistry>> {
    let def = GraphDef::builder("social")
        .node(NodeRegistration::new(NodeType::any("Agent")?))?
        .node(NodeRegistration::new(NodeType::any("Person")?))?
        .node(NodeRegistration::new(NodeType::any("Employee")?))?
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
        .edge(
            EdgeRegistration::new(EdgeType::any("worksAt")?, ["Person"], ["Company"])
                .cardinality(Cardinality::Many),
        )?
        .relation(OntologyRelation::sub_class_of("Person", "Agent"))
        .relation(OntologyRelation::sub_class_of("Employee", "Person"))
        .relation(OntologyRelation::inverse_of("manages", "managedBy"))
        .relation(OntologyRelation::implies("manages", "knows"))
        .build()?;
    Ok(Arc::new(KindRegistry::new(def)?))
}

fn store() -> Result<GraphStore> {
    GraphStore::new(
        registry()?,
        Arc::new(MemoryBackend::new()),
        StoreConfig::builder("g1").build()?,
    )
}

fn text_params(params: &[ParamEntry]) -> Vec<String> {
    params
        .iter()
        .filter_map(|entry| match entry {
            ParamEntry::Value(SqlValue::Text(text)) => Some(text.clone()),
            _ => None,
        })
        .collect()
}

#[test]
fn source_cte_filters_kind_and_tombstones() -> Result<()> {
    let store = store()?;
    let compiled = store.query("Person").alias("p").compile()?;

    assert!(compiled.sql.starts_with("WITH cte_p AS (SELECT"));
    assert!(compiled.sql.contains("t.kind IN (?)"));
    assert!(compiled.sql.contains("t.deleted_at IS NULL"));
    assert!(compiled.sql.contains("FROM cte_p p"));
    assert!(text_params(&compiled.params).contains(&"Person".to_string()));
    Ok(())
}

#[test]
fn include_subclasses_expands_the_kind_list() -> Result<()> {
    let store = store()?;
    let compiled = store
        .query("Agent")
        .alias("a")
        .include_subclasses()
        .compile()?;
    assert!(compiled.sql.contains("t.kind IN (?, ?, ?)"));
    let params = text_params(&compiled.params);
    for kind in ["Agent", "Person", "Employee"] {
        assert!(params.contains(&kind.to_string()));
    }
    Ok(())
}

#[test]
fn single_alias_predicates_push_into_the_cte() -> Result<()> {
    let store = store()?;
    let compiled = store
        .query("Person")
        .alias("p")
        .traverse(Hop::out("worksAt").edge_alias("w").to("c"))
        .filter(field("p", "name").eq("ada"))
        .filter(field("p", "age").gt(lit(30)))
        .compile()?;

    // Both predicates land inside cte_p, before the final SELECT.
    let cte_end = compiled.sql.find(") SELECT").unwrap();
    let cte_p = &compiled.sql[..compiled.sql.find("cte_w").unwrap().min(cte_end)];
    assert!(cte_p.contains("json_extract(t.props, '$.name') = ?"));
    assert!(cte_p.contains("json_extract(t.props, '$.age') > ?"));

    let final_select = &compiled.sql[cte_end..];
    assert!(!final_select.contains("$.name"));
    Ok(())
}

#[test]
fn mixed_alias_predicates_stay_in_the_terminal_where() -> Result<()> {
    let store = store()?;
    let compiled = store
        .query("Person")
        .alias("p")
        .traverse(Hop::out("knows").edge_alias("k").to("f"))
        .filter(field("p", "city").eq(field("f", "city")))
        .compile()?;

    let final_select = &compiled.sql[compiled.sql.rfind(" WHERE ").unwrap()..];
    assert!(final_select.contains("json_extract(p.props, '$.city') = json_extract(f.props, '$.city')"));
    Ok(())
}

#[test]
fn traversal_joins_edges_and_targets() -> Result<()> {
    let store = store()?;
    let compiled = store
        .query("Person")
        .alias("p")
        .traverse(Hop::out("worksAt").edge_alias("w").to("c"))
        .compile()?;

    assert!(compiled
        .sql
        .contains("JOIN cte_w w ON w.from_kind = p.kind AND w.from_id = p.id"));
    assert!(compiled
        .sql
        .contains("JOIN cte_c c ON c.kind = w.to_kind AND c.id = w.to_id"));
    Ok(())
}

#[test]
fn inbound_traversals_swap_endpoint_columns() -> Result<()> {
    let store = store()?;
    let compiled = store
        .query("Company")
        .alias("c")
        .traverse(Hop::inbound("worksAt").edge_alias("w").to("p"))
        .compile()?;
    assert!(compiled
        .sql
        .contains("JOIN cte_w w ON w.to_kind = c.kind AND w.to_id = c.id"));
    assert!(compiled
        .sql
        .contains("JOIN cte_p p ON p.kind = w.from_kind AND p.id = w.from_id"));
    Ok(())
}

#[test]
fn optional_traversals_use_left_joins() -> Result<()> {
    let store = store()?;
    let compiled = store
        .query("Person")
        .alias("p")
        .traverse(Hop::out("worksAt").edge_alias("w").to("c").optional())
        .compile()?;
    assert!(compiled.sql.contains("LEFT JOIN cte_w"));
    assert!(compiled.sql.contains("LEFT JOIN cte_c"));
    Ok(())
}

#[test]
fn inverse_expansion_widens_the_edge_kind_set() -> Result<()> {
    let store = store()?;
    let compiled = store
        .query("Person")
        .alias("p")
        .traverse(Hop::out("manages").edge_alias("m").to("q").expand_inverse())
        .compile()?;
    let params = text_params(&compiled.params);
    assert!(params.contains(&"manages".to_string()));
    assert!(params.contains(&"managedBy".to_string()));
    Ok(())
}

#[test]
fn implying_expansion_feeds_the_recursive_cte() -> Result<()> {
    let store = store()?;
    let compiled = store
        .query("Person")
        .alias("p")
        .traverse(
            Hop::out("knows")
                .edge_alias("k")
                .to("f")
                .expand_implying()
                .recursive(1, Some(4)),
        )
        .compile()?;

    assert!(compiled.sql.starts_with("WITH RECURSIVE"));
    // The widened kind set ("knows" plus the implying "manages") is bound in
    // the recursive arm, so it participates in every step.
    let params = text_params(&compiled.params);
    assert!(params.contains(&"knows".to_string()));
    assert!(params.contains(&"manages".to_string()));
    Ok(())
}

#[test]
fn recursive_cte_carries_depth_and_cycle_guard() -> Result<()> {
    let store = store()?;
    let compiled = store
        .query("Person")
        .alias("p")
        .traverse(Hop::out("knows").edge_alias("k").to("f").recursive(1, Some(3)))
        .compile()?;

    assert!(compiled.sql.contains("0 AS depth"));
    assert!(compiled.sql.contains("UNION ALL"));
    assert!(compiled.sql.contains("r.depth + 1"));
    assert!(compiled.sql.contains("instr(r.path,"));
    assert!(compiled.sql.contains("r.depth < ?"));
    assert!(compiled.sql.contains("k.depth >= 1"));
    assert!(compiled
        .sql
        .contains("JOIN cte_k k ON k.start_kind = p.kind AND k.start_id = p.id"));
    assert!(compiled
        .sql
        .contains("JOIN cte_f f ON f.kind = k.end_kind AND f.id = k.end_id"));
    Ok(())
}

#[test]
fn zero_hop_recursion_compiles_to_anchor_only() -> Result<()> {
    let store = store()?;
    let compiled = store
        .query("Person")
        .alias("p")
        .traverse(Hop::out("knows").edge_alias("k").to("f").recursive(0, Some(0)))
        .compile()?;
    // max_hops = 0 stops before the first recursive step; min_hops = 0 keeps
    // the zero-hop anchor row, so only the start node survives.
    assert!(compiled.sql.contains("r.depth < ?"));
    assert!(!compiled.sql.contains("k.depth >= "));
    Ok(())
}

#[test]
fn predicates_on_recursive_edges_are_rejected() -> Result<()> {
    let store = store()?;
    let err = store
        .query("Person")
        .alias("p")
        .traverse(Hop::out("knows").edge_alias("k").to("f").recursive(1, None))
        .filter(field("k", "weight").gt(lit(1)))
        .compile()
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<TypeGraphError>(),
        Some(TypeGraphError::Validation { .. })
    ));
    Ok(())
}

#[test]
fn unknown_aliases_fail_compilation() -> Result<()> {
    let store = store()?;
    let err = store
        .query("Person")
        .alias("p")
        .filter(field("ghost", "name").eq("x"))
        .compile()
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<TypeGraphError>(),
        Some(TypeGraphError::Validation { .. })
    ));
    Ok(())
}

#[test]
fn selective_projection_skips_the_payload() -> Result<()> {
    let store = store()?;
    let compiled = store
        .query("Person")
        .alias("p")
        .select([("name", prop("p", "name"))])
        .compile()?;

    assert!(compiled
        .sql
        .contains("json_extract(p.props, '$.name') AS \"name\""));
    let select_list = &compiled.sql[compiled.sql.find(") SELECT").unwrap()
        ..compiled.sql.find("FROM cte_p").unwrap()];
    assert!(!select_list.contains("props"));
    assert!(matches!(compiled.shape, RowShape::Selective(_)));
    Ok(())
}

#[test]
fn smart_select_tracks_fields_through_the_callback() -> Result<()> {
    let store = store()?;
    let compiled = store
        .query("Person")
        .alias("p")
        .select_with(|ctx| json!({"name": ctx.alias("p").prop("name")}))
        .compile()?;

    assert!(compiled.sql.contains("AS \"p_name\""));
    let select_list = &compiled.sql[compiled.sql.find(") SELECT").unwrap()
        ..compiled.sql.find("FROM cte_p").unwrap()];
    assert!(!select_list.contains("p_props"));
    assert!(!select_list.contains("p.props AS"));
    Ok(())
}

#[test]
fn whole_alias_access_falls_back_to_full_rows() -> Result<()> {
    let store = store()?;
    let compiled = store
        .query("Person")
        .alias("p")
        .select_with(|ctx| ctx.alias("p").whole())
        .compile()?;
    assert!(compiled.sql.contains("p.props AS \"p_props\""));
    assert!(matches!(compiled.shape, RowShape::FullRows(_)));
    Ok(())
}

#[test]
fn order_keys_ride_along_with_selective_projections() -> Result<()> {
    let store = store()?;
    let compiled = store
        .query("Person")
        .alias("p")
        .select([("name", prop("p", "name"))])
        .order_by(prop("p", "age"), false)
        .compile()?;
    assert!(compiled.sql.contains("AS \"p_age\""));
    assert!(compiled.sql.contains("ORDER BY \"p_age\" ASC"));
    Ok(())
}

#[test]
fn boolean_literals_follow_the_dialect() -> Result<()> {
    let store = store()?;
    let compiled = store
        .query("Person")
        .alias("p")
        .filter(field("p", "active").eq(lit(true)))
        .compile()?;
    assert!(compiled.sql.contains("= 1"));

    let registry = registry()?;
    let table_names = TableNames::default();
    let pg = QueryCompiler {
        registry: registry.as_ref(),
        dialect: SqlDialect::Postgres,
        table_names: &table_names,
        graph_id: "g1",
    };
    let ast = store
        .query("Person")
        .alias("p")
        .filter(field("p", "active").eq(lit(true)))
        .ast()
        .clone();
    let compiled = pg.compile(&ast, &CompileOptions::default())?;
    assert!(compiled.sql.contains("= TRUE"));
    assert!(compiled.sql.contains("$1"));
    assert!(compiled.sql.contains("(t.props #>> '{active}')"));
    Ok(())
}

#[test]
fn postgres_recursion_uses_strpos() -> Result<()> {
    let registry = registry()?;
    let table_names = TableNames::default();
    let pg = QueryCompiler {
        registry: registry.as_ref(),
        dialect: SqlDialect::Postgres,
        table_names: &table_names,
        graph_id: "g1",
    };
    let store = store()?;
    let ast = store
        .query("Person")
        .alias("p")
        .traverse(Hop::out("knows").edge_alias("k").to("f").recursive(1, None))
        .ast()
        .clone();
    let compiled = pg.compile(&ast, &CompileOptions::default())?;
    assert!(compiled.sql.contains("strpos(r.path,"));
    assert!(!compiled.sql.contains("instr("));
    Ok(())
}

#[test]
fn set_operations_concatenate_and_check_arity() -> Result<()> {
    let store = store()?;
    let left = store
        .query("Person")
        .alias("p")
        .select([("name", prop("p", "name"))]);
    let right = store
        .query("Employee")
        .alias("p")
        .select([("name", prop("p", "name"))]);
    let compiled = left.clone().union(right)?.limit(10).compile()?;
    assert!(compiled.sql.contains(" UNION SELECT"));
    assert!(compiled.sql.contains("r_cte_p"));
    assert!(compiled.sql.ends_with("LIMIT 10"));

    let mismatched = store.query("Employee").alias("q").select([
        ("name", prop("q", "name")),
        ("age", prop("q", "age")),
    ]);
    let err = left.union(mismatched)?.compile().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<TypeGraphError>(),
        Some(TypeGraphError::Validation { .. })
    ));
    Ok(())
}

#[test]
fn set_operations_emit_a_single_outer_order_clause() -> Result<()> {
    let store = store()?;
    let older = store
        .query("Person")
        .alias("p")
        .filter(field("p", "age").ge(lit(30)))
        .select([("name", prop("p", "name"))])
        .order_by(prop("p", "name"), false);
    let younger = store
        .query("Person")
        .alias("p")
        .filter(field("p", "age").le(lit(40)))
        .select([("name", prop("p", "name"))]);

    let compiled = older.union(younger)?.compile()?;
    let union_pos = compiled.sql.find(" UNION ").unwrap();
    // No inline ORDER BY may precede the set operator; the compound carries
    // exactly one, mapped onto the selected output name.
    assert!(!compiled.sql[..union_pos].contains("ORDER BY"));
    assert!(compiled.sql.ends_with("ORDER BY \"name\" ASC"));
    Ok(())
}

#[test]
fn set_operation_ordering_must_use_selected_fields() -> Result<()> {
    let store = store()?;
    let left = store
        .query("Person")
        .alias("p")
        .select([("name", prop("p", "name"))])
        .order_by(sysf("p", SystemField::CreatedAt), false);
    let right = store
        .query("Person")
        .alias("p")
        .select([("name", prop("p", "name"))]);
    let err = left.union(right)?.compile().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<TypeGraphError>(),
        Some(TypeGraphError::Validation { .. })
    ));
    Ok(())
}

#[test]
fn hoisted_subquery_params_keep_textual_order() -> Result<()> {
    let store = store()?;
    let inner = store
        .query("Employee")
        .alias("e")
        .select([("id", sysf("e", SystemField::Id))]);
    let compiled = store
        .query("Person")
        .alias("p")
        .traverse(Hop::out("knows").edge_alias("k").to("f"))
        // Multi-alias, so this conjunct stays in the terminal WHERE and its
        // literals bind in the statement body.
        .filter(typegraph::or([
            field("p", "name").eq("ada"),
            field("f", "name").eq("bob"),
        ]))
        .filter(sys("p", SystemField::Id).in_subquery(inner))
        .compile()?;

    // The subquery CTE is hoisted ahead of the body text, so its bound kind
    // must come before the body literals in parameter order.
    let params = text_params(&compiled.params);
    let employee = params.iter().position(|p| p == "Employee").unwrap();
    let ada = params.iter().position(|p| p == "ada").unwrap();
    let bob = params.iter().position(|p| p == "bob").unwrap();
    assert!(employee < ada);
    assert!(ada < bob);

    // Every positional placeholder pairs with exactly one parameter.
    assert_eq!(compiled.sql.matches('?').count(), compiled.params.len());
    Ok(())
}

#[test]
fn subqueries_share_the_with_list() -> Result<()> {
    let store = store()?;
    let inner = store
        .query("Employee")
        .alias("e")
        .select([("id", sysf("e", SystemField::Id))]);
    let compiled = store
        .query("Person")
        .alias("p")
        .filter(sys("p", SystemField::Id).in_subquery(inner))
        .compile()?;
    assert!(compiled.sql.contains("sq1_cte_e"));
    assert!(compiled.sql.contains("p.id IN (SELECT"));
    Ok(())
}

#[test]
fn aggregation_projects_groups_and_functions() -> Result<()> {
    use typegraph::AggOutput;
    let store = store()?;
    let compiled = store
        .query("Person")
        .alias("p")
        .aggregate([
            AggOutput::group("city", prop("p", "city")),
            AggOutput::count("n", "p"),
        ])
        .group_by([prop("p", "city")])
        .compile()?;
    assert!(compiled.sql.contains("COUNT(p.id) AS \"n\""));
    assert!(compiled.sql.contains("GROUP BY json_extract(p.props, '$.city')"));
    Ok(())
}

#[tokio::test]
async fn pagination_requires_an_order_key() -> Result<()> {
    let store = store()?;
    let err = store
        .query("Person")
        .alias("p")
        .paginate(PageArgs::first(5))
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<TypeGraphError>(),
        Some(TypeGraphError::Validation { .. })
    ));
    Ok(())
}

#[tokio::test]
async fn corrupt_cursors_are_rejected() -> Result<()> {
    let store = store()?;
    let query = store
        .query("Person")
        .alias("p")
        .order_by(prop("p", "name"), false);
    let err = query
        .paginate(PageArgs::first(5).after("@@not-a-cursor@@"))
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<TypeGraphError>(),
        Some(TypeGraphError::Validation { .. })
    ));
    Ok(())
}

#[test]
fn cursor_rewrite_adds_tuple_comparison() -> Result<()> {
    let store = store()?;
    let ast = store
        .query("Person")
        .alias("p")
        .order_by(prop("p", "name"), false)
        .order_by(sysf("p", SystemField::CreatedAt), true)
        .ast()
        .clone();
    let registry = registry()?;
    let table_names = TableNames::default();
    let compiler = QueryCompiler {
        registry: registry.as_ref(),
        dialect: SqlDialect::Sqlite,
        table_names: &table_names,
        graph_id: "g1",
    };
    let compiled = compiler.compile(
        &ast,
        &CompileOptions {
            cursor: Some(vec![json!("ada"), json!(1000)]),
            take: Some(6),
            reverse: false,
        },
    )?;
    assert!(compiled
        .sql
        .contains("(json_extract(p.props, '$.name') > ?) OR (json_extract(p.props, '$.name') = ? AND p.created_at < ?)"));
    assert!(compiled.sql.contains("LIMIT 6"));
    Ok(())
}

#[tokio::test]
async fn prepared_queries_validate_bindings() -> Result<()> {
    let store = store()?;
    let prepared = store
        .query("Person")
        .alias("p")
        .filter(field("p", "name").eq(param("name", ParamType::Text)))
        .filter(field("p", "age").ge(param("min_age", ParamType::Number)))
        .prepare()?;

    let names: Vec<&str> = prepared
        .bindings()
        .iter()
        .map(|(name, _)| name.as_str())
        .collect();
    assert_eq!(names, vec!["name", "min_age"]);

    let valid: HashMap<String, serde_json::Value> = HashMap::from([
        ("name".to_string(), json!("ada")),
        ("min_age".to_string(), json!(30)),
    ]);

    // Missing key.
    let mut missing = valid.clone();
    missing.remove("min_age");
    assert!(prepared.execute(&missing).await.is_err());

    // Extra key.
    let mut extra = valid.clone();
    extra.insert("extra".to_string(), json!(1));
    assert!(prepared.execute(&extra).await.is_err());

    // Null binding.
    let mut null = valid.clone();
    null.insert("name".to_string(), serde_json::Value::Null);
    assert!(prepared.execute(&null).await.is_err());

    // Type mismatch.
    let mut mistyped = valid.clone();
    mistyped.insert("min_age".to_string(), json!("thirty"));
    let err = prepared.execute(&mistyped).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<TypeGraphError>(),
        Some(TypeGraphError::Validation { .. })
    ));
    Ok(())
}

#[test]
fn unbound_parameters_block_direct_execution() -> Result<()> {
    let store = store()?;
    let compiled = store
        .query("Person")
        .alias("p")
        .filter(field("p", "name").eq(param("name", ParamType::Text)))
        .compile()?;
    assert!(compiled.statement().is_err());
    Ok(())
}

#[test]
fn complex_predicates_render_connectives() -> Result<()> {
    let store = store()?;
    let compiled = store
        .query("Person")
        .alias("p")
        .filter(and([
            field("p", "name").starts_with("A"),
            typegraph::or([
                field("p", "age").between(lit(20), lit(40)),
                field("p", "age").is_null(),
            ]),
            typegraph::not(field("p", "city").in_list(["york", "bath"])),
        ]))
        .compile()?;
    assert!(compiled.sql.contains("LIKE ? || '%'"));
    assert!(compiled.sql.contains("BETWEEN"));
    assert!(compiled.sql.contains("IS NULL"));
    assert!(compiled.sql.contains("NOT ("));
    assert!(compiled.sql.contains("IN (?, ?)"));
    Ok(())
}
