//! Shared fixtures: a small shop schema on one source plus a sessions table
//! on a second source, and permission sets used across the suites.

use hugr_core::catalog::CatalogDocument;
use hugr_core::catalog::LoadedCatalog;
use hugr_core::permissions::Permission;
use hugr_core::permissions::PermissionSet;
use hugr_core::permissions::Role;
use hugr_core::schema::Assembler;
use hugr_core::schema::SchemaSnapshot;
use hugr_core::source::DataSource;
use hugr_core::source::SourceKind;

pub const SHOP_SDL: &str = r#"
type orders @table(name: "orders") {
  id: Int! @pk
  customer_id: Int
    @references(
      name: "customer"
      to: "customers"
      source_fields: ["customer_id"]
      target_fields: ["id"]
      back_name: "orders"
    )
  total: Float
  status: String
  created_at: Timestamp
}

type customers @table(name: "customers") {
  id: Int! @pk
  name: String
  email: String
  tenant_id: Int
}

type articles @table(name: "articles") {
  id: Int! @pk
  title: String!
  author_id: Int
  status: String
}
"#;

pub const AUTH_SDL: &str = r#"
type sessions @table(name: "sessions") {
  id: Int! @pk
  user_email: String
  count: Int
}
"#;

pub fn data_source(name: &str, kind: SourceKind) -> DataSource {
    DataSource {
        name: name.to_owned(),
        kind,
        prefix: String::new(),
        description: String::new(),
        as_module: false,
        disabled: false,
        path: format!("postgres://db/{name}"),
        read_only: false,
        self_defined: false,
        catalogs: vec![name.to_owned()],
        dependencies: Vec::new(),
    }
}

pub fn catalog(source: &str, path: &str, sdl: &str) -> LoadedCatalog {
    let mut catalog = LoadedCatalog::new(source);
    catalog.insert(CatalogDocument::parse(sdl, path).expect("fixture SDL should parse"));
    catalog
}

pub fn shop_snapshot() -> SchemaSnapshot {
    let mut assembler = Assembler::new();
    assembler.add_source(
        data_source("shop", SourceKind::Postgres),
        vec![catalog("shop", "shop/schema.graphql", SHOP_SDL)],
    );
    assembler.assemble(1).expect("fixture schema should assemble")
}

pub fn two_source_snapshot() -> SchemaSnapshot {
    let mut assembler = Assembler::new();
    assembler.add_source(
        data_source("shop", SourceKind::Postgres),
        vec![catalog("shop", "shop/schema.graphql", SHOP_SDL)],
    );
    assembler.add_source(
        data_source("auth", SourceKind::Postgres),
        vec![catalog("auth", "auth/schema.graphql", AUTH_SDL)],
    );
    assembler.assemble(1).expect("fixture schema should assemble")
}

pub fn open_permissions() -> PermissionSet {
    PermissionSet::new(
        1,
        [Role {
            name: "admin".to_owned(),
            description: String::new(),
            disabled: false,
        }],
        [],
    )
}

pub fn tenant_permissions() -> PermissionSet {
    PermissionSet::new(
        2,
        [Role {
            name: "tenant_user".to_owned(),
            description: String::new(),
            disabled: false,
        }],
        [Permission {
            role: "tenant_user".to_owned(),
            type_name: "customers".to_owned(),
            field_name: "*".to_owned(),
            hidden: false,
            disabled: false,
            filter: Some(serde_json_bytes::json!({
                "tenant_id": {"eq": "[$auth.tenant_id]"}
            })),
            data: None,
        }],
    )
}

pub fn author_permissions() -> PermissionSet {
    PermissionSet::new(
        3,
        [Role {
            name: "user".to_owned(),
            description: String::new(),
            disabled: false,
        }],
        [Permission {
            role: "user".to_owned(),
            type_name: "articles".to_owned(),
            field_name: "*".to_owned(),
            hidden: false,
            disabled: false,
            filter: None,
            data: Some(serde_json_bytes::json!({
                "author_id": "[$auth.user_id]",
                "status": "draft"
            })),
        }],
    )
}
