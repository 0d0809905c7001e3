use hugr_core::error::SingleHugrError;
use hugr_core::permissions::AuthContext;
use hugr_core::query_plan::Compiler;
use hugr_core::query_plan::CompilerOptions;
use hugr_core::query_plan::OperationKind;
use hugr_core::shape;
use hugr_core::sql::render_statement;
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

fn author_auth() -> AuthContext {
    let mut auth = AuthContext::anonymous("user");
    auth.user_id = Some("9".to_owned());
    auth
}

#[test]
fn insert_merges_role_defaults() {
    let snapshot = fixtures::shop_snapshot();
    let permissions = fixtures::author_permissions();
    let auth = author_auth();
    let compiler = Compiler::new(&snapshot, &permissions, &auth, CompilerOptions::default());

    let compiled = compiler
        .compile(
            r#"mutation {
              insert_articles(data: { title: "X" }) { id author_id status }
            }"#,
            None,
            &no_variables(),
        )
        .expect("mutation should compile");

    assert_eq!(compiled.kind, OperationKind::Mutation);
    let root = &compiled.roots[0];
    let rendered = render_statement(&root.statement, &root.params);
    assert_eq!(
        rendered.text,
        "WITH _mut AS (INSERT INTO \"shop\".\"articles\" (\"title\", \"author_id\", \"status\") \
         VALUES ($1, $2, $3) RETURNING \"id\", \"title\", \"author_id\", \"status\") \
         SELECT \"_mut\".\"id\" AS \"c0\", \"_mut\".\"author_id\" AS \"c1\", \"_mut\".\"status\" AS \"c2\" \
         FROM \"_mut\" AS \"_mut\""
    );
    assert_eq!(root.params, vec![json!("X"), json!("9"), json!("draft")]);

    let rows = vec![row(&[
        ("c0", json!(17)),
        ("c1", json!(9)),
        ("c2", json!("draft")),
    ])];
    assert_eq!(
        shape::shape_rows(&root.shape, &rows),
        json!({"id": 17, "author_id": 9, "status": "draft"})
    );
}

#[test]
fn user_supplied_field_conflicting_with_defaults_is_rejected() {
    let snapshot = fixtures::shop_snapshot();
    let permissions = fixtures::author_permissions();
    let auth = author_auth();
    let compiler = Compiler::new(&snapshot, &permissions, &auth, CompilerOptions::default());

    let err = compiler
        .compile(
            r#"mutation {
              insert_articles(data: { title: "X", author_id: 1 }) { id }
            }"#,
            None,
            &no_variables(),
        )
        .expect_err("conflicting author_id should be rejected");
    assert!(
        err.errors()
            .iter()
            .any(|e| matches!(e, SingleHugrError::PermissionConflict { .. })),
        "expected a permission conflict, got: {err}"
    );
}

#[test]
fn update_returns_affected_rows_and_returning_shape() {
    let snapshot = fixtures::shop_snapshot();
    let permissions = fixtures::open_permissions();
    let auth = AuthContext::anonymous("admin");
    let compiler = Compiler::new(&snapshot, &permissions, &auth, CompilerOptions::default());

    let compiled = compiler
        .compile(
            r#"mutation {
              update_orders(
                filter: { status: { eq: "pending" } }
                data: { status: "completed" }
              ) { affected_rows returning { id status } }
            }"#,
            None,
            &no_variables(),
        )
        .expect("mutation should compile");

    let root = &compiled.roots[0];
    let rendered = render_statement(&root.statement, &root.params);
    assert!(
        rendered
            .text
            .starts_with("WITH _mut AS (UPDATE \"shop\".\"orders\" SET \"status\" = $1 WHERE"),
        "unexpected statement: {}",
        rendered.text
    );
    assert!(rendered.text.contains("RETURNING"));
    assert_eq!(root.params, vec![json!("completed"), json!("pending")]);

    let rows = vec![
        row(&[("c0", json!(2)), ("c1", json!(1)), ("c2", json!("completed"))]),
        row(&[("c0", json!(2)), ("c1", json!(3)), ("c2", json!("completed"))]),
    ];
    assert_eq!(
        shape::shape_rows(&root.shape, &rows),
        json!({
            "affected_rows": 2,
            "returning": [
                {"id": 1, "status": "completed"},
                {"id": 3, "status": "completed"},
            ]
        })
    );
}

#[test]
fn update_with_zero_matches_still_shapes_a_result() {
    let snapshot = fixtures::shop_snapshot();
    let permissions = fixtures::open_permissions();
    let auth = AuthContext::anonymous("admin");
    let compiler = Compiler::new(&snapshot, &permissions, &auth, CompilerOptions::default());

    let compiled = compiler
        .compile(
            r#"mutation {
              update_orders(filter: { id: { eq: -1 } }, data: { status: "x" }) {
                affected_rows returning { id }
              }
            }"#,
            None,
            &no_variables(),
        )
        .expect("mutation should compile");
    // The count row survives the left join even when RETURNING is empty.
    let rows = vec![row(&[
        ("c0", json!(0)),
        ("c1", Value::Null),
    ])];
    assert_eq!(
        shape::shape_rows(&compiled.roots[0].shape, &rows),
        json!({"affected_rows": 0, "returning": []})
    );
}

#[test]
fn delete_applies_combined_filter() {
    let snapshot = fixtures::shop_snapshot();
    let permissions = fixtures::open_permissions();
    let auth = AuthContext::anonymous("admin");
    let compiler = Compiler::new(&snapshot, &permissions, &auth, CompilerOptions::default());

    let compiled = compiler
        .compile(
            r#"mutation {
              delete_orders(filter: { status: { eq: "cancelled" } }) { affected_rows }
            }"#,
            None,
            &no_variables(),
        )
        .expect("mutation should compile");
    let rendered = render_statement(&compiled.roots[0].statement, &compiled.roots[0].params);
    assert!(
        rendered
            .text
            .starts_with("WITH _mut AS (DELETE FROM \"shop\".\"orders\" WHERE"),
        "unexpected statement: {}",
        rendered.text
    );
}

#[test]
fn mutations_on_views_are_rejected() {
    let sdl = r#"
    type daily_sales @view(name: "daily_sales") {
      day: Date
      total: Float
    }
    "#;
    let mut assembler = hugr_core::schema::Assembler::new();
    assembler.add_source(
        fixtures::data_source("shop", hugr_core::source::SourceKind::Postgres),
        vec![fixtures::catalog("shop", "shop/views.graphql", sdl)],
    );
    let snapshot = assembler.assemble(1).expect("schema should assemble");
    // Views get no generated mutations at all.
    assert!(
        snapshot
            .metadata()
            .root_field("Mutation", "insert_daily_sales")
            .is_none()
    );
}
