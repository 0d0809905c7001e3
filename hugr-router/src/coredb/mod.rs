//! The core database: the single source of truth for data sources, catalogs,
//! roles, permissions, API keys, cluster nodes and registered storages.
//!
//! All access goes through the engine handle. On work nodes the core database
//! opens read-only; every write is gated on that flag.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use hugr_core::catalog::CatalogSource;
use hugr_core::error::HugrError;
use hugr_core::error::SingleHugrError;
use hugr_core::permissions::Permission;
use hugr_core::permissions::PermissionSet;
use hugr_core::permissions::Role;
use hugr_core::shape::Row;
use hugr_core::source::DataSource;
use hugr_core::sql::RenderedSql;
use serde::Deserialize;
use serde::Serialize;
use serde_json_bytes::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::auth::ApiKey;
use crate::engine::Engine;
use crate::engine::collect_rows;

/// A registered external storage (object stores for catalogs and data).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredStorage {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub path: String,
    #[serde(default)]
    pub parameters: Value,
}

/// A cluster node row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub name: String,
    pub url: String,
    pub version: String,
    pub ready: bool,
    /// Unix seconds of the last successful health check.
    pub last_seen: i64,
    #[serde(default)]
    pub error: Option<String>,
}

const SCHEMA_STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS data_sources (name VARCHAR PRIMARY KEY, type VARCHAR, prefix VARCHAR, description VARCHAR, as_module BOOLEAN, disabled BOOLEAN, path VARCHAR, read_only BOOLEAN, self_defined BOOLEAN, catalogs VARCHAR, dependencies VARCHAR)",
    "CREATE TABLE IF NOT EXISTS catalog_sources (name VARCHAR PRIMARY KEY, type VARCHAR, description VARCHAR, path VARCHAR)",
    "CREATE TABLE IF NOT EXISTS roles (name VARCHAR PRIMARY KEY, description VARCHAR, disabled BOOLEAN)",
    "CREATE TABLE IF NOT EXISTS role_permissions (role VARCHAR, type_name VARCHAR, field_name VARCHAR, hidden BOOLEAN, disabled BOOLEAN, filter VARCHAR, data VARCHAR, PRIMARY KEY (role, type_name, field_name))",
    "CREATE TABLE IF NOT EXISTS api_keys (name VARCHAR PRIMARY KEY, key VARCHAR UNIQUE, description VARCHAR, default_role VARCHAR, disabled BOOLEAN, is_temporal BOOLEAN, expires_at BIGINT, headers VARCHAR, claims VARCHAR)",
    "CREATE TABLE IF NOT EXISTS nodes (name VARCHAR PRIMARY KEY, url VARCHAR, version VARCHAR, ready BOOLEAN, last_seen BIGINT, error VARCHAR)",
    "CREATE TABLE IF NOT EXISTS registered_storages (name VARCHAR PRIMARY KEY, type VARCHAR, path VARCHAR, parameters VARCHAR)",
];

pub struct CoreDb {
    engine: Arc<dyn Engine>,
    read_only: bool,
    permissions_tx: watch::Sender<PermissionSet>,
    permission_version: AtomicU64,
}

impl CoreDb {
    pub fn new(engine: Arc<dyn Engine>, read_only: bool) -> Self {
        let (permissions_tx, _) = watch::channel(PermissionSet::default());
        Self {
            engine,
            read_only,
            permissions_tx,
            permission_version: AtomicU64::new(0),
        }
    }

    pub async fn ensure_schema(&self) -> Result<(), HugrError> {
        if self.read_only {
            return Ok(());
        }
        for statement in SCHEMA_STATEMENTS {
            self.execute(statement, Vec::new()).await?;
        }
        Ok(())
    }

    /// The current permission set; requests keep the clone they acquired.
    pub fn permissions(&self) -> PermissionSet {
        self.permissions_tx.borrow().clone()
    }

    pub fn watch_permissions(&self) -> watch::Receiver<PermissionSet> {
        self.permissions_tx.subscribe()
    }

    /// Re-reads roles and permissions and publishes a new versioned set.
    pub async fn reload_permissions(&self) -> Result<(), HugrError> {
        let roles: Vec<Role> = self
            .query("SELECT name, description, disabled FROM roles ORDER BY name")
            .await?;
        let rows = self
            .query_rows(
                "SELECT role, type_name, field_name, hidden, disabled, filter, data \
                 FROM role_permissions ORDER BY role, type_name, field_name",
            )
            .await?;
        let permissions = rows
            .into_iter()
            .map(permission_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        let version = self.permission_version.fetch_add(1, Ordering::SeqCst) + 1;
        self.permissions_tx
            .send_replace(PermissionSet::new(version, roles, permissions));
        Ok(())
    }

    pub async fn load_data_sources(&self) -> Result<Vec<DataSource>, HugrError> {
        let rows = self
            .query_rows(
                "SELECT name, type, prefix, description, as_module, disabled, path, \
                 read_only, self_defined, catalogs, dependencies FROM data_sources ORDER BY name",
            )
            .await?;
        rows.into_iter().map(data_source_from_row).collect()
    }

    pub async fn load_catalog_sources(&self) -> Result<Vec<CatalogSource>, HugrError> {
        self.query("SELECT name, type, description, path FROM catalog_sources ORDER BY name")
            .await
    }

    pub async fn load_api_keys(&self) -> Result<Vec<ApiKey>, HugrError> {
        let rows = self
            .query_rows(
                "SELECT name, key, description, default_role, disabled, is_temporal, \
                 expires_at, headers, claims FROM api_keys ORDER BY name",
            )
            .await?;
        rows.into_iter().map(api_key_from_row).collect()
    }

    pub async fn load_nodes(&self) -> Result<Vec<NodeRecord>, HugrError> {
        self.query(
            "SELECT name, url, version, ready, last_seen, error FROM nodes ORDER BY name",
        )
        .await
    }

    pub async fn load_registered_storages(&self) -> Result<Vec<RegisteredStorage>, HugrError> {
        self.query("SELECT name, type, path, parameters FROM registered_storages ORDER BY name")
            .await
    }

    pub async fn upsert_data_source(&self, source: &DataSource) -> Result<(), HugrError> {
        self.write(
            "INSERT OR REPLACE INTO data_sources \
             (name, type, prefix, description, as_module, disabled, path, read_only, self_defined, catalogs, dependencies) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
            vec![
                Value::from(source.name.clone()),
                Value::from(source.kind.to_string()),
                Value::from(source.prefix.clone()),
                Value::from(source.description.clone()),
                Value::from(source.as_module),
                Value::from(source.disabled),
                Value::from(source.path.clone()),
                Value::from(source.read_only),
                Value::from(source.self_defined),
                json_text(&source.catalogs)?,
                json_text(&source.dependencies)?,
            ],
        )
        .await
    }

    pub async fn upsert_catalog_source(&self, catalog: &CatalogSource) -> Result<(), HugrError> {
        self.write(
            "INSERT OR REPLACE INTO catalog_sources (name, type, description, path) \
             VALUES ($1, $2, $3, $4)",
            vec![
                Value::from(catalog.name.clone()),
                Value::from(catalog.kind.to_string()),
                Value::from(catalog.description.clone()),
                Value::from(catalog.path.clone()),
            ],
        )
        .await
    }

    pub async fn upsert_role(&self, role: &Role) -> Result<(), HugrError> {
        self.write(
            "INSERT OR REPLACE INTO roles (name, description, disabled) VALUES ($1, $2, $3)",
            vec![
                Value::from(role.name.clone()),
                Value::from(role.description.clone()),
                Value::from(role.disabled),
            ],
        )
        .await
    }

    pub async fn upsert_permission(&self, permission: &Permission) -> Result<(), HugrError> {
        self.write(
            "INSERT OR REPLACE INTO role_permissions \
             (role, type_name, field_name, hidden, disabled, filter, data) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
            vec![
                Value::from(permission.role.clone()),
                Value::from(permission.type_name.clone()),
                Value::from(permission.field_name.clone()),
                Value::from(permission.hidden),
                Value::from(permission.disabled),
                optional_json_text(permission.filter.as_ref())?,
                optional_json_text(permission.data.as_ref())?,
            ],
        )
        .await
    }

    pub async fn upsert_node(&self, node: &NodeRecord) -> Result<(), HugrError> {
        self.write(
            "INSERT OR REPLACE INTO nodes (name, url, version, ready, last_seen, error) \
             VALUES ($1, $2, $3, $4, $5, $6)",
            vec![
                Value::from(node.name.clone()),
                Value::from(node.url.clone()),
                Value::from(node.version.clone()),
                Value::from(node.ready),
                Value::from(node.last_seen),
                node.error
                    .as_ref()
                    .map(|e| Value::from(e.clone()))
                    .unwrap_or(Value::Null),
            ],
        )
        .await
    }

    pub async fn upsert_registered_storage(
        &self,
        storage: &RegisteredStorage,
    ) -> Result<(), HugrError> {
        self.write(
            "INSERT OR REPLACE INTO registered_storages (name, type, path, parameters) \
             VALUES ($1, $2, $3, $4)",
            vec![
                Value::from(storage.name.clone()),
                Value::from(storage.kind.clone()),
                Value::from(storage.path.clone()),
                Value::from(storage.parameters.to_string()),
            ],
        )
        .await
    }

    async fn write(&self, sql: &str, params: Vec<Value>) -> Result<(), HugrError> {
        if self.read_only {
            return Err(SingleHugrError::InvalidConfiguration {
                message: "the core database is read-only on this node".to_owned(),
            }
            .into());
        }
        self.execute(sql, params).await.map(|_| ())
    }

    async fn execute(&self, sql: &str, params: Vec<Value>) -> Result<Vec<Row>, HugrError> {
        let rendered = RenderedSql {
            text: sql.to_owned(),
            params,
        };
        let cancel = CancellationToken::new();
        let stream = self.engine.execute(&rendered, &cancel).await?;
        collect_rows(stream, &cancel).await
    }

    async fn query_rows(&self, sql: &str) -> Result<Vec<Row>, HugrError> {
        self.execute(sql, Vec::new()).await
    }

    async fn query<T: for<'de> Deserialize<'de>>(&self, sql: &str) -> Result<Vec<T>, HugrError> {
        let rows = self.query_rows(sql).await?;
        rows.into_iter().map(from_row).collect()
    }
}

fn from_row<T: for<'de> Deserialize<'de>>(row: Row) -> Result<T, HugrError> {
    let value = serde_json::to_value(Value::Object(row)).map_err(row_error)?;
    serde_json::from_value(value).map_err(row_error)
}

fn row_error(err: impl std::fmt::Display) -> HugrError {
    HugrError::execution(format!("core database row decoding failed: {err}"))
}

fn json_text<T: Serialize>(value: &T) -> Result<Value, HugrError> {
    serde_json::to_string(value)
        .map(Value::from)
        .map_err(row_error)
}

fn optional_json_text(value: Option<&Value>) -> Result<Value, HugrError> {
    Ok(match value {
        Some(value) => Value::from(value.to_string()),
        None => Value::Null,
    })
}

fn text_cell(row: &Row, name: &str) -> String {
    row.get(name)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_owned()
}

fn bool_cell(row: &Row, name: &str) -> bool {
    row.get(name).and_then(|v| v.as_bool()).unwrap_or(false)
}

fn json_list_cell(row: &Row, name: &str) -> Vec<String> {
    row.get(name)
        .and_then(|v| v.as_str())
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or_default()
}

fn data_source_from_row(row: Row) -> Result<DataSource, HugrError> {
    let kind = text_cell(&row, "type")
        .parse()
        .map_err(|_| row_error(format!("unknown source type in row for \"{}\"", text_cell(&row, "name"))))?;
    Ok(DataSource {
        name: text_cell(&row, "name"),
        kind,
        prefix: text_cell(&row, "prefix"),
        description: text_cell(&row, "description"),
        as_module: bool_cell(&row, "as_module"),
        disabled: bool_cell(&row, "disabled"),
        path: text_cell(&row, "path"),
        read_only: bool_cell(&row, "read_only"),
        self_defined: bool_cell(&row, "self_defined"),
        catalogs: json_list_cell(&row, "catalogs"),
        dependencies: json_list_cell(&row, "dependencies"),
    })
}

fn permission_from_row(row: Row) -> Result<Permission, HugrError> {
    let parse_json = |name: &str| -> Option<Value> {
        row.get(name)
            .and_then(|v| v.as_str())
            .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
    };
    Ok(Permission {
        role: text_cell(&row, "role"),
        type_name: text_cell(&row, "type_name"),
        field_name: text_cell(&row, "field_name"),
        hidden: bool_cell(&row, "hidden"),
        disabled: bool_cell(&row, "disabled"),
        filter: parse_json("filter"),
        data: parse_json("data"),
    })
}

fn api_key_from_row(row: Row) -> Result<ApiKey, HugrError> {
    let headers = row
        .get("headers")
        .and_then(|v| v.as_str())
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or_default();
    let claims = row
        .get("claims")
        .and_then(|v| v.as_str())
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or_default();
    Ok(ApiKey {
        name: text_cell(&row, "name"),
        key: text_cell(&row, "key"),
        description: text_cell(&row, "description"),
        default_role: text_cell(&row, "default_role"),
        disabled: bool_cell(&row, "disabled"),
        is_temporal: bool_cell(&row, "is_temporal"),
        expires_at: row.get("expires_at").and_then(|v| v.as_i64()),
        headers,
        claims,
    })
}

#[cfg(test)]
mod tests {
    use serde_json_bytes::json;

    use super::*;
    use crate::engine::ScriptedEngine;

    fn row(pairs: &[(&str, Value)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (serde_json_bytes::ByteString::from(k.to_owned()), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn reload_permissions_bumps_the_version() {
        let engine = ScriptedEngine::respond_with(vec![
            // roles
            vec![row(&[
                ("name", json!("admin")),
                ("description", json!("")),
                ("disabled", json!(false)),
            ])],
            // permissions
            vec![row(&[
                ("role", json!("admin")),
                ("type_name", json!("*")),
                ("field_name", json!("*")),
                ("hidden", json!(false)),
                ("disabled", json!(false)),
                ("filter", Value::Null),
                ("data", Value::Null),
            ])],
        ]);
        let coredb = CoreDb::new(engine, false);
        let before = coredb.permissions().version();
        coredb.reload_permissions().await.expect("reload");
        let after = coredb.permissions();
        assert!(after.version() > before);
        assert!(after.role("admin").is_some());
    }

    #[tokio::test]
    async fn writes_are_rejected_on_a_read_only_core() {
        let engine = ScriptedEngine::respond_with(Vec::new());
        let coredb = CoreDb::new(engine, true);
        let role = Role {
            name: "viewer".to_owned(),
            description: String::new(),
            disabled: false,
        };
        assert!(coredb.upsert_role(&role).await.is_err());
    }
}
