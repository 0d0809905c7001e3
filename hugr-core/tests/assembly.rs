use hugr_core::error::SingleHugrError;
use hugr_core::schema::Assembler;
use hugr_core::source::SourceKind;
use pretty_assertions::assert_eq;

use crate::fixtures;

#[test]
fn assembly_is_deterministic_across_runs_and_input_order() {
    let first = fixtures::two_source_snapshot();
    let second = fixtures::two_source_snapshot();
    assert_eq!(first.sdl(), second.sdl());
    assert_eq!(first.hash(), second.hash());

    // Reversed registration order produces the same schema.
    let mut assembler = Assembler::new();
    assembler.add_source(
        fixtures::data_source("auth", SourceKind::Postgres),
        vec![fixtures::catalog("auth", "auth/schema.graphql", fixtures::AUTH_SDL)],
    );
    assembler.add_source(
        fixtures::data_source("shop", SourceKind::Postgres),
        vec![fixtures::catalog("shop", "shop/schema.graphql", fixtures::SHOP_SDL)],
    );
    let reversed = assembler.assemble(1).expect("schema should assemble");
    assert_eq!(first.sdl(), reversed.sdl());
}

#[test]
fn generates_root_fields_and_derived_types() {
    let snapshot = fixtures::shop_snapshot();
    let schema = snapshot.schema();
    for type_name in [
        "orders",
        "orders_filter",
        "orders_list_filter",
        "orders_aggregations",
        "orders_bucket_aggregation_key",
        "orders_bucket_aggregation",
        "insert_orders_input",
        "update_orders_input",
        "orders_mutation_result",
        "orders_join",
        "OrderBy",
        "String_filter_input",
        "Float_aggregation",
    ] {
        assert!(
            schema.types.contains_key(type_name),
            "expected type {type_name} in the assembled schema"
        );
    }

    let meta = snapshot.metadata();
    for root in [
        "Query.orders",
        "Query.orders_by_pk",
        "Query.orders_aggregation",
        "Query.orders_bucket_aggregation",
        "Mutation.insert_orders",
        "Mutation.update_orders",
        "Mutation.delete_orders",
    ] {
        let (parent, field) = root.split_once('.').expect("root key format");
        assert!(
            meta.root_field(parent, field).is_some(),
            "expected root field {root}"
        );
    }
}

#[test]
fn back_relation_is_installed_on_the_target() {
    let snapshot = fixtures::shop_snapshot();
    let customers = snapshot
        .metadata()
        .object("customers")
        .expect("customers should exist");
    let orders_relation = customers
        .field("orders")
        .and_then(|f| f.relation.as_ref())
        .expect("back-relation should be installed");
    assert_eq!(orders_relation.target.as_str(), "orders");
}

#[test]
fn read_only_source_generates_no_mutations() {
    let mut source = fixtures::data_source("shop", SourceKind::Postgres);
    source.read_only = true;
    let mut assembler = Assembler::new();
    assembler.add_source(
        source,
        vec![fixtures::catalog("shop", "shop/schema.graphql", fixtures::SHOP_SDL)],
    );
    let snapshot = assembler.assemble(1).expect("schema should assemble");
    assert!(snapshot.metadata().root_field("Mutation", "insert_orders").is_none());
    assert!(!snapshot.schema().types.contains_key("insert_orders_input"));
}

#[test]
fn module_directive_nests_roots() {
    let sdl = r#"
    type invoices @table(name: "invoices") @module(name: "billing.ar") {
      id: Int! @pk
      amount: Float
    }
    "#;
    let mut assembler = Assembler::new();
    assembler.add_source(
        fixtures::data_source("erp", SourceKind::Postgres),
        vec![fixtures::catalog("erp", "erp/schema.graphql", sdl)],
    );
    let snapshot = assembler.assemble(1).expect("schema should assemble");
    let schema = snapshot.schema();
    assert!(schema.types.contains_key("_module_billing_query"));
    assert!(schema.types.contains_key("_module_billing_ar_query"));
    assert!(schema.types.contains_key("_module_billing_ar_mutation"));
    let meta = snapshot.metadata();
    assert!(meta.root_field("Query", "billing").is_some());
    assert!(meta.root_field("_module_billing_query", "ar").is_some());
    assert!(
        meta.root_field("_module_billing_ar_query", "invoices")
            .is_some()
    );
}

#[test]
fn prefix_collision_is_rejected() {
    let sdl = r#"type items @table(name: "items") { id: Int! @pk }"#;
    let mut assembler = Assembler::new();
    assembler.add_source(
        fixtures::data_source("a", SourceKind::Postgres),
        vec![fixtures::catalog("a", "a/schema.graphql", sdl)],
    );
    assembler.add_source(
        fixtures::data_source("b", SourceKind::Postgres),
        vec![fixtures::catalog("b", "b/schema.graphql", sdl)],
    );
    let err = assembler.assemble(1).expect_err("collision should fail");
    assert!(
        err.errors()
            .iter()
            .any(|e| matches!(e, SingleHugrError::PrefixCollision { .. })),
        "expected a prefix collision, got: {err}"
    );
}

#[test]
fn prefixes_keep_same_table_names_apart() {
    let sdl = r#"type items @table(name: "items") { id: Int! @pk }"#;
    let mut first = fixtures::data_source("a", SourceKind::Postgres);
    first.prefix = "a_".to_owned();
    let mut second = fixtures::data_source("b", SourceKind::Postgres);
    second.prefix = "b_".to_owned();
    let mut assembler = Assembler::new();
    assembler.add_source(first, vec![fixtures::catalog("a", "a/schema.graphql", sdl)]);
    assembler.add_source(second, vec![fixtures::catalog("b", "b/schema.graphql", sdl)]);
    let snapshot = assembler.assemble(1).expect("schema should assemble");
    assert!(snapshot.metadata().object("a_items").is_some());
    assert!(snapshot.metadata().object("b_items").is_some());
}

#[test]
fn dependency_cycles_are_detected() {
    let sdl = r#"type t_a @table(name: "t_a") { id: Int! @pk }"#;
    let sdl_b = r#"type t_b @table(name: "t_b") { id: Int! @pk }"#;
    let mut a = fixtures::data_source("a", SourceKind::Postgres);
    a.dependencies = vec!["b".to_owned()];
    let mut b = fixtures::data_source("b", SourceKind::Postgres);
    b.dependencies = vec!["a".to_owned()];
    let mut assembler = Assembler::new();
    assembler.add_source(a, vec![fixtures::catalog("a", "a/schema.graphql", sdl)]);
    assembler.add_source(b, vec![fixtures::catalog("b", "b/schema.graphql", sdl_b)]);
    let err = assembler.assemble(1).expect_err("cycle should fail");
    assert!(
        err.errors()
            .iter()
            .any(|e| matches!(e, SingleHugrError::CycleDetected { .. })),
        "expected a cycle error, got: {err}"
    );
}

#[test]
fn unknown_dependency_is_rejected() {
    let sdl = r#"type t_a @table(name: "t_a") { id: Int! @pk }"#;
    let mut a = fixtures::data_source("a", SourceKind::Postgres);
    a.dependencies = vec!["missing".to_owned()];
    let mut assembler = Assembler::new();
    assembler.add_source(a, vec![fixtures::catalog("a", "a/schema.graphql", sdl)]);
    let err = assembler.assemble(1).expect_err("unknown dependency should fail");
    assert!(
        err.errors()
            .iter()
            .any(|e| matches!(e, SingleHugrError::UnknownDependency { .. })),
        "expected an unknown dependency error, got: {err}"
    );
}

#[test]
fn join_extension_installs_cross_source_relation() {
    let users_sdl = r#"
    type users @table(name: "users") {
      id: Int! @pk
      email: String
    }
    "#;
    let sessions_sdl = r#"
    type sessions @table(name: "sessions") {
      id: Int! @pk
      user_email: String
      count: Int
    }

    type users @dependency(name: "identity") {
      sessions: [sessions]
        @join(fields: ["email"], references: ["user_email"])
    }
    "#;
    let mut tracking = fixtures::data_source("tracking", SourceKind::Postgres);
    tracking.dependencies = vec!["identity".to_owned()];
    let mut assembler = Assembler::new();
    assembler.add_source(
        fixtures::data_source("identity", SourceKind::Postgres),
        vec![fixtures::catalog("identity", "identity/schema.graphql", users_sdl)],
    );
    assembler.add_source(
        tracking,
        vec![fixtures::catalog("tracking", "tracking/schema.graphql", sessions_sdl)],
    );
    let snapshot = assembler.assemble(1).expect("schema should assemble");
    let users = snapshot.metadata().object("users").expect("users exists");
    let relation = users
        .field("sessions")
        .and_then(|f| f.relation.as_ref())
        .expect("extension relation installed");
    assert!(relation.cross_source);
    assert_eq!(relation.target.as_str(), "sessions");
}

#[test]
fn unknown_directive_is_reported() {
    let sdl = r#"type t @table(name: "t") @sharded(by: "id") { id: Int! @pk }"#;
    let mut assembler = Assembler::new();
    assembler.add_source(
        fixtures::data_source("a", SourceKind::Postgres),
        vec![fixtures::catalog("a", "a/schema.graphql", sdl)],
    );
    let err = assembler.assemble(1).expect_err("unknown directive should fail");
    assert!(err.to_string().contains("sharded"));
}
