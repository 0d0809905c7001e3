use hugr_core::error::SingleHugrError;
use hugr_core::permissions::AuthContext;
use hugr_core::permissions::Permission;
use hugr_core::permissions::PermissionSet;
use hugr_core::permissions::Role;
use hugr_core::query_plan::Compiler;
use hugr_core::query_plan::CompilerOptions;
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

fn tenant_auth() -> AuthContext {
    let mut auth = AuthContext::anonymous("tenant_user");
    auth.claims.insert("tenant_id".to_owned(), json!(42));
    auth
}

#[test]
fn role_filter_applies_at_the_root() {
    let snapshot = fixtures::shop_snapshot();
    let permissions = fixtures::tenant_permissions();
    let auth = tenant_auth();
    let compiler = Compiler::new(&snapshot, &permissions, &auth, CompilerOptions::default());

    let compiled = compiler
        .compile(r#"{ customers { id } }"#, None, &no_variables())
        .expect("operation should compile");
    let root = &compiled.roots[0];
    let rendered = render_statement(&root.statement, &root.params);
    assert_eq!(
        rendered.text,
        "SELECT \"t0\".\"id\" AS \"c0\" FROM \"shop\".\"customers\" AS \"t0\" \
         WHERE \"t0\".\"tenant_id\" = $1"
    );
    assert_eq!(root.params, vec![json!(42)]);
}

#[test]
fn role_filter_applies_at_every_occurrence_of_the_type() {
    let snapshot = fixtures::shop_snapshot();
    let permissions = fixtures::tenant_permissions();
    let auth = tenant_auth();
    let compiler = Compiler::new(&snapshot, &permissions, &auth, CompilerOptions::default());

    // The same tenant filter lands inside the relation join: filtering
    // customers also filters orders.customer.
    let compiled = compiler
        .compile(r#"{ orders { id customer { id } } }"#, None, &no_variables())
        .expect("operation should compile");
    let root = &compiled.roots[0];
    let rendered = render_statement(&root.statement, &root.params);
    assert!(
        rendered
            .text
            .contains("LEFT JOIN \"shop\".\"customers\" AS \"t1\" ON (\"t0\".\"customer_id\" = \"t1\".\"id\" AND \"t1\".\"tenant_id\" = $1)"),
        "expected the overlay filter inside the join, got: {}",
        rendered.text
    );
}

#[test]
fn role_filter_applies_inside_relation_filters() {
    let snapshot = fixtures::shop_snapshot();
    let permissions = fixtures::tenant_permissions();
    let auth = tenant_auth();
    let compiler = Compiler::new(&snapshot, &permissions, &auth, CompilerOptions::default());

    // Filtering orders by their customer still sees only the tenant's
    // customers inside the EXISTS.
    let compiled = compiler
        .compile(
            r#"{ orders(filter: { customer: { name: { eq: "A" } } }) { id } }"#,
            None,
            &no_variables(),
        )
        .expect("operation should compile");
    let rendered = render_statement(&compiled.roots[0].statement, &compiled.roots[0].params);
    assert!(
        rendered.text.contains("\"tenant_id\" = $1"),
        "expected the overlay filter inside the semijoin, got: {}",
        rendered.text
    );
    assert_eq!(
        compiled.roots[0].params,
        vec![json!(42), json!("A")]
    );
}

#[test]
fn missing_claim_fails_the_bind() {
    let snapshot = fixtures::shop_snapshot();
    let permissions = fixtures::tenant_permissions();
    let auth = AuthContext::anonymous("tenant_user");
    let compiler = Compiler::new(&snapshot, &permissions, &auth, CompilerOptions::default());

    let err = compiler
        .compile(r#"{ customers { id } }"#, None, &no_variables())
        .expect_err("missing tenant_id claim should fail");
    assert!(
        err.errors()
            .iter()
            .any(|e| matches!(e, SingleHugrError::PermissionBind { .. })),
        "expected a bind error, got: {err}"
    );
}

#[test]
fn disabled_field_denies_the_operation() {
    let snapshot = fixtures::shop_snapshot();
    let permissions = PermissionSet::new(
        5,
        [Role {
            name: "restricted".to_owned(),
            description: String::new(),
            disabled: false,
        }],
        [Permission {
            role: "restricted".to_owned(),
            type_name: "customers".to_owned(),
            field_name: "email".to_owned(),
            hidden: false,
            disabled: true,
            filter: None,
            data: None,
        }],
    );
    let auth = AuthContext::anonymous("restricted");
    let compiler = Compiler::new(&snapshot, &permissions, &auth, CompilerOptions::default());

    let err = compiler
        .compile(r#"{ customers { id email } }"#, None, &no_variables())
        .expect_err("selecting a disabled field should fail");
    assert!(
        err.errors()
            .iter()
            .any(|e| matches!(e, SingleHugrError::PermissionDenied)),
        "expected permission denied, got: {err}"
    );
}

#[test]
fn hidden_field_is_elided_from_fragment_spreads() {
    let snapshot = fixtures::shop_snapshot();
    let permissions = PermissionSet::new(
        6,
        [Role {
            name: "partner".to_owned(),
            description: String::new(),
            disabled: false,
        }],
        [Permission {
            role: "partner".to_owned(),
            type_name: "customers".to_owned(),
            field_name: "email".to_owned(),
            hidden: true,
            disabled: false,
            filter: None,
            data: None,
        }],
    );
    let auth = AuthContext::anonymous("partner");
    let compiler = Compiler::new(&snapshot, &permissions, &auth, CompilerOptions::default());

    let compiled = compiler
        .compile(
            r#"
            query { customers { ...details } }
            fragment details on customers { id email }
            "#,
            None,
            &no_variables(),
        )
        .expect("operation should compile");
    let rendered = render_statement(&compiled.roots[0].statement, &compiled.roots[0].params);
    assert!(
        !rendered.text.contains("email"),
        "hidden field should be elided from fragment selections, got: {}",
        rendered.text
    );

    // An explicit path selection still reaches the field.
    let compiled = compiler
        .compile(r#"{ customers { id email } }"#, None, &no_variables())
        .expect("operation should compile");
    let rendered = render_statement(&compiled.roots[0].statement, &compiled.roots[0].params);
    assert!(rendered.text.contains("email"));
}
