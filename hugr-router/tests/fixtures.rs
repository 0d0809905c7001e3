//! Gateway fixtures: a scripted engine and a file-backed shop catalog.

use std::sync::Arc;

use hugr_core::catalog::CatalogKind;
use hugr_core::catalog::CatalogSource;
use hugr_core::source::DataSource;
use hugr_core::source::SourceKind;
use hugr_router::Configuration;
use hugr_router::Gateway;
use hugr_router::engine::ScriptedEngine;
use serde_json_bytes::ByteString;
use serde_json_bytes::Value;

pub const SHOP_SDL: &str = r#"
type orders @table(name: "orders") {
  id: Int! @pk
  total: Float
  status: String
  created_at: Timestamp
}
"#;

pub fn row(pairs: &[(&str, Value)]) -> hugr_core::shape::Row {
    pairs
        .iter()
        .map(|(k, v)| (ByteString::from(k.to_owned()), v.clone()))
        .collect()
}

pub struct TestGateway {
    pub gateway: Arc<Gateway>,
    pub engine: Arc<ScriptedEngine>,
    // Held so the catalog directory outlives the gateway.
    _catalog_dir: tempfile::TempDir,
}

/// Builds a gateway over a scripted engine with the shop catalog attached.
pub async fn shop_gateway(config: Configuration) -> TestGateway {
    let catalog_dir = tempfile::tempdir().expect("tempdir");
    tokio::fs::write(catalog_dir.path().join("shop.graphql"), SHOP_SDL)
        .await
        .expect("write catalog fixture");

    let engine = ScriptedEngine::respond_with(Vec::new());
    let gateway = Gateway::new(config, engine.clone())
        .await
        .expect("gateway should build");

    gateway
        .registry()
        .register_catalog_source(CatalogSource {
            name: "shop".to_owned(),
            kind: CatalogKind::LocalFs,
            description: String::new(),
            path: catalog_dir.path().display().to_string(),
        })
        .await;
    gateway
        .registry()
        .attach(DataSource {
            name: "shop".to_owned(),
            kind: SourceKind::Postgres,
            prefix: String::new(),
            description: String::new(),
            as_module: false,
            disabled: false,
            path: String::new(),
            read_only: false,
            self_defined: false,
            catalogs: vec!["shop".to_owned()],
            dependencies: Vec::new(),
        })
        .await
        .expect("attach should succeed");

    // Drop statements recorded while wiring up, so assertions start clean.
    engine.executed.lock().expect("engine lock").clear();

    TestGateway {
        gateway,
        engine,
        _catalog_dir: catalog_dir,
    }
}
