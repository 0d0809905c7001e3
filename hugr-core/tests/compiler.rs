use hugr_core::permissions::AuthContext;
use hugr_core::pushdown;
use hugr_core::pushdown::Placement;
use hugr_core::query_plan::Compiler;
use hugr_core::query_plan::CompilerOptions;
use hugr_core::query_plan::OperationKind;
use hugr_core::query_plan::ShapeNode;
use hugr_core::shape;
use hugr_core::source::Capabilities;
use hugr_core::source::SourceKind;
use hugr_core::sql::SqlStatement;
use hugr_core::sql::render_statement;
use indexmap::IndexMap;
use pretty_assertions::assert_eq;
use serde_json_bytes::ByteString;
use serde_json_bytes::Map;
use serde_json_bytes::Value;
use serde_json_bytes::json;

use crate::fixtures;

fn no_variables() -> Map<ByteString, Value> {
    Map::new()
}

fn row(pairs: &[(&str, Value)]) -> shape::Row {
    pairs
        .iter()
        .map(|(k, v)| (ByteString::from(k.to_owned()), v.clone()))
        .collect()
}

#[test]
fn filter_sort_paginate_compiles_to_one_statement() {
    let snapshot = fixtures::shop_snapshot();
    let permissions = fixtures::open_permissions();
    let auth = AuthContext::anonymous("admin");
    let compiler = Compiler::new(&snapshot, &permissions, &auth, CompilerOptions::default());

    let compiled = compiler
        .compile(
            r#"{
              orders(
                filter: { status: { eq: "pending" } }
                order_by: [{ field: "total", direction: DESC }]
                limit: 1
              ) { id total }
            }"#,
            None,
            &no_variables(),
        )
        .expect("operation should compile");

    assert_eq!(compiled.kind, OperationKind::Query);
    assert_eq!(compiled.roots.len(), 1);
    let root = &compiled.roots[0];
    let rendered = render_statement(&root.statement, &root.params);
    assert_eq!(
        rendered.text,
        "SELECT \"t0\".\"id\" AS \"c0\", \"t0\".\"total\" AS \"c1\" \
         FROM \"shop\".\"orders\" AS \"t0\" \
         WHERE \"t0\".\"status\" = $1 \
         ORDER BY \"t0\".\"total\" DESC LIMIT 1"
    );
    assert_eq!(rendered.params, vec![json!("pending")]);

    // Scripted engine rows shape into the expected response.
    let rows = vec![row(&[("c0", json!(3)), ("c1", json!(200.0))])];
    assert_eq!(
        shape::shape_rows(&root.shape, &rows),
        json!([{"id": 3, "total": 200.0}])
    );
}

#[test]
fn variables_bind_into_filters() {
    let snapshot = fixtures::shop_snapshot();
    let permissions = fixtures::open_permissions();
    let auth = AuthContext::anonymous("admin");
    let compiler = Compiler::new(&snapshot, &permissions, &auth, CompilerOptions::default());

    let mut variables = Map::new();
    variables.insert(ByteString::from("wanted".to_owned()), json!("completed"));
    let compiled = compiler
        .compile(
            r#"query($wanted: String) {
              orders(filter: { status: { eq: $wanted } }) { id }
            }"#,
            None,
            &variables,
        )
        .expect("operation should compile");
    assert_eq!(compiled.roots[0].params, vec![json!("completed")]);
}

#[test]
fn bucket_aggregation_with_time_bucket() {
    let snapshot = fixtures::shop_snapshot();
    let permissions = fixtures::open_permissions();
    let auth = AuthContext::anonymous("admin");
    let compiler = Compiler::new(&snapshot, &permissions, &auth, CompilerOptions::default());

    let compiled = compiler
        .compile(
            r#"{
              orders_bucket_aggregation {
                key { month: created_at(bucket: month) }
                aggregations { _rows_count total { sum } }
              }
            }"#,
            None,
            &no_variables(),
        )
        .expect("operation should compile");

    let root = &compiled.roots[0];
    let rendered = render_statement(&root.statement, &root.params);
    assert_eq!(
        rendered.text,
        "SELECT date_trunc('month', \"t0\".\"created_at\") AS \"c0\", \
         count(*) AS \"c1\", sum(\"t0\".\"total\") AS \"c2\" \
         FROM \"shop\".\"orders\" AS \"t0\" \
         GROUP BY date_trunc('month', \"t0\".\"created_at\") \
         ORDER BY date_trunc('month', \"t0\".\"created_at\")"
    );

    let rows = vec![
        row(&[("c0", json!("2024-01-01")), ("c1", json!(2)), ("c2", json!(150.0))]),
        row(&[("c0", json!("2024-02-01")), ("c1", json!(1)), ("c2", json!(200.0))]),
    ];
    assert_eq!(
        shape::shape_rows(&root.shape, &rows),
        json!([
            {"key": {"month": "2024-01-01"}, "aggregations": {"_rows_count": 2, "total": {"sum": 150.0}}},
            {"key": {"month": "2024-02-01"}, "aggregations": {"_rows_count": 1, "total": {"sum": 200.0}}},
        ])
    );
}

#[test]
fn sorting_by_unselected_aggregation_is_rejected() {
    let snapshot = fixtures::shop_snapshot();
    let permissions = fixtures::open_permissions();
    let auth = AuthContext::anonymous("admin");
    let compiler = Compiler::new(&snapshot, &permissions, &auth, CompilerOptions::default());

    let err = compiler
        .compile(
            r#"{
              orders_bucket_aggregation(order_by: [{ field: "aggregations.total.avg" }]) {
                key { status }
                aggregations { total { sum } }
              }
            }"#,
            None,
            &no_variables(),
        )
        .expect_err("sorting by an unselected aggregation should fail");
    assert!(err.to_string().contains("aggregations.total.avg"));
}

#[test]
fn relation_any_of_filter_becomes_exists() {
    let snapshot = fixtures::shop_snapshot();
    let permissions = fixtures::open_permissions();
    let auth = AuthContext::anonymous("admin");
    let compiler = Compiler::new(&snapshot, &permissions, &auth, CompilerOptions::default());

    let compiled = compiler
        .compile(
            r#"{
              customers(filter: { orders: { any_of: { status: { eq: "pending" } } } }) {
                id name
              }
            }"#,
            None,
            &no_variables(),
        )
        .expect("operation should compile");

    let root = &compiled.roots[0];
    let rendered = render_statement(&root.statement, &root.params);
    assert_eq!(
        rendered.text,
        "SELECT \"t0\".\"id\" AS \"c0\", \"t0\".\"name\" AS \"c1\" \
         FROM \"shop\".\"customers\" AS \"t0\" \
         WHERE EXISTS (SELECT 1 AS \"one\" FROM \"shop\".\"orders\" AS \"f1\" \
         WHERE (\"t0\".\"id\" = \"f1\".\"customer_id\" AND \"f1\".\"status\" = $1))"
    );

    let rows = vec![row(&[("c0", json!(1)), ("c1", json!("A"))])];
    assert_eq!(
        shape::shape_rows(&root.shape, &rows),
        json!([{"id": 1, "name": "A"}])
    );
}

#[test]
fn nested_relation_rows_group_under_their_parent() {
    let snapshot = fixtures::shop_snapshot();
    let permissions = fixtures::open_permissions();
    let auth = AuthContext::anonymous("admin");
    let compiler = Compiler::new(&snapshot, &permissions, &auth, CompilerOptions::default());

    let compiled = compiler
        .compile(
            r#"{ customers { id orders { id status } } }"#,
            None,
            &no_variables(),
        )
        .expect("operation should compile");
    let root = &compiled.roots[0];
    let rendered = render_statement(&root.statement, &root.params);
    assert!(
        rendered.text.contains("LEFT JOIN \"shop\".\"orders\" AS \"t1\""),
        "expected a left join, got: {}",
        rendered.text
    );

    let rows = vec![
        row(&[("c0", json!(1)), ("c1", json!(10)), ("c2", json!("pending"))]),
        row(&[("c0", json!(1)), ("c1", json!(11)), ("c2", json!("done"))]),
        row(&[("c0", json!(2)), ("c1", Value::Null), ("c2", Value::Null)]),
    ];
    assert_eq!(
        shape::shape_rows(&root.shape, &rows),
        json!([
            {"id": 1, "orders": [
                {"id": 10, "status": "pending"},
                {"id": 11, "status": "done"},
            ]},
            {"id": 2, "orders": []},
        ])
    );
}

#[test]
fn nested_pagination_uses_a_row_number_window() {
    let snapshot = fixtures::shop_snapshot();
    let permissions = fixtures::open_permissions();
    let auth = AuthContext::anonymous("admin");
    let compiler = Compiler::new(&snapshot, &permissions, &auth, CompilerOptions::default());

    let compiled = compiler
        .compile(
            r#"{ customers { id orders(nested_limit: 2, nested_offset: 1) { id } } }"#,
            None,
            &no_variables(),
        )
        .expect("operation should compile");
    let rendered = render_statement(&compiled.roots[0].statement, &compiled.roots[0].params);
    assert!(
        rendered.text.contains("ROW_NUMBER() OVER (PARTITION BY"),
        "expected a window, got: {}",
        rendered.text
    );
    assert!(
        rendered.text.contains("\"_rn\" > 1") && rendered.text.contains("\"_rn\" <= 3"),
        "expected window bounds, got: {}",
        rendered.text
    );
}

#[test]
fn ad_hoc_join_crosses_sources() {
    let snapshot = fixtures::two_source_snapshot();
    let permissions = fixtures::open_permissions();
    let auth = AuthContext::anonymous("admin");
    let compiler = Compiler::new(&snapshot, &permissions, &auth, CompilerOptions::default());

    let compiled = compiler
        .compile(
            r#"{
              customers {
                id
                email
                _join(fields: ["email"]) {
                  sessions(fields: ["user_email"]) { count }
                }
              }
            }"#,
            None,
            &no_variables(),
        )
        .expect("operation should compile");

    let root = &compiled.roots[0];
    let rendered = render_statement(&root.statement, &root.params);
    assert!(
        rendered
            .text
            .contains("LEFT JOIN \"auth\".\"sessions\" AS \"t1\" ON \"t0\".\"email\" = \"t1\".\"user_email\""),
        "expected the equality join, got: {}",
        rendered.text
    );

    // Each user row carries its session rows joined on email equality.
    let rows = vec![
        row(&[
            ("c0", json!(1)),
            ("c1", json!("a@example.com")),
            ("c2", json!(10)),
            ("c3", json!(5)),
        ]),
        row(&[
            ("c0", json!(2)),
            ("c1", json!("b@example.com")),
            ("c2", Value::Null),
            ("c3", Value::Null),
        ]),
    ];
    assert_eq!(
        shape::shape_rows(&root.shape, &rows),
        json!([
            {"id": 1, "email": "a@example.com", "_join": {"sessions": [{"count": 5}]}},
            {"id": 2, "email": "b@example.com", "_join": {"sessions": []}},
        ])
    );

    // The cross-source join demotes push-down to local execution; each leaf
    // scan stays remotely executable.
    let mut capabilities = IndexMap::new();
    capabilities.insert(
        "shop".to_owned(),
        Capabilities::for_kind(SourceKind::Postgres),
    );
    capabilities.insert(
        "auth".to_owned(),
        Capabilities::for_kind(SourceKind::Postgres),
    );
    let partitioned = pushdown::partition(&root.plan, &capabilities);
    assert_eq!(partitioned.placement, Placement::Local);
    assert_eq!(partitioned.fragments.len(), 2);
}

#[test]
fn ad_hoc_join_requires_matching_field_types() {
    let snapshot = fixtures::two_source_snapshot();
    let permissions = fixtures::open_permissions();
    let auth = AuthContext::anonymous("admin");
    let compiler = Compiler::new(&snapshot, &permissions, &auth, CompilerOptions::default());

    let err = compiler
        .compile(
            r#"{
              customers {
                id
                _join(fields: ["id"]) {
                  sessions(fields: ["user_email"]) { count }
                }
              }
            }"#,
            None,
            &no_variables(),
        )
        .expect_err("Int vs String join should fail");
    assert!(err.to_string().contains("expected \"Int\""));
}

#[test]
fn single_source_select_is_marked_remote() {
    let snapshot = fixtures::shop_snapshot();
    let permissions = fixtures::open_permissions();
    let auth = AuthContext::anonymous("admin");
    let compiler = Compiler::new(&snapshot, &permissions, &auth, CompilerOptions::default());

    let compiled = compiler
        .compile(
            r#"{ customers { id orders { id } } }"#,
            None,
            &no_variables(),
        )
        .expect("operation should compile");
    let mut capabilities = IndexMap::new();
    capabilities.insert(
        "shop".to_owned(),
        Capabilities::for_kind(SourceKind::Postgres),
    );
    let partitioned = pushdown::partition(&compiled.roots[0].plan, &capabilities);
    assert_eq!(
        partitioned.placement,
        Placement::Remote {
            source: "shop".to_owned()
        }
    );
}

#[test]
fn depth_limit_is_enforced() {
    let snapshot = fixtures::shop_snapshot();
    let permissions = fixtures::open_permissions();
    let auth = AuthContext::anonymous("admin");
    let compiler = Compiler::new(
        &snapshot,
        &permissions,
        &auth,
        CompilerOptions { max_depth: 2 },
    );

    let err = compiler
        .compile(
            r#"{ customers { orders { customer { orders { id } } } } }"#,
            None,
            &no_variables(),
        )
        .expect_err("depth should be exceeded");
    assert!(err.to_string().contains("exceeds the configured maximum"));
}

#[test]
fn version_root_answers_without_sql() {
    let snapshot = fixtures::shop_snapshot();
    let permissions = fixtures::open_permissions();
    let auth = AuthContext::anonymous("admin");
    let compiler = Compiler::new(&snapshot, &permissions, &auth, CompilerOptions::default());

    let compiled = compiler
        .compile(r#"{ _version }"#, None, &no_variables())
        .expect("operation should compile");
    let root = &compiled.roots[0];
    assert!(matches!(root.shape, ShapeNode::Constant { .. }));
    assert!(matches!(root.statement, SqlStatement::Select(_)));
}

#[test]
fn by_pk_lookup_compiles_to_key_equality() {
    let snapshot = fixtures::shop_snapshot();
    let permissions = fixtures::open_permissions();
    let auth = AuthContext::anonymous("admin");
    let compiler = Compiler::new(&snapshot, &permissions, &auth, CompilerOptions::default());

    let compiled = compiler
        .compile(r#"{ orders_by_pk(id: 3) { id total } }"#, None, &no_variables())
        .expect("operation should compile");
    let root = &compiled.roots[0];
    let rendered = render_statement(&root.statement, &root.params);
    assert_eq!(
        rendered.text,
        "SELECT \"t0\".\"id\" AS \"c0\", \"t0\".\"total\" AS \"c1\" \
         FROM \"shop\".\"orders\" AS \"t0\" WHERE \"t0\".\"id\" = $1"
    );
    assert_eq!(root.params, vec![json!(3)]);
    let rows = vec![row(&[("c0", json!(3)), ("c1", json!(200.0))])];
    assert_eq!(
        shape::shape_rows(&root.shape, &rows),
        json!({"id": 3, "total": 200.0})
    );
}
