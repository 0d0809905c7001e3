//! The request pipeline and HTTP surface: `/graphql`, health, the admin
//! data-source endpoints and the cluster protocol endpoints.
//!
//! A query flows: authenticate → acquire snapshot → compile (permission
//! overlay applied inline) → partition → cache get-or-build → execute →
//! shape → respond.

use std::collections::BTreeSet;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::Query;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::http::StatusCode;
use axum::routing::get;
use axum::routing::post;
use hugr_core::error::ErrorCode;
use hugr_core::error::HugrError;
use hugr_core::error::SingleHugrError;
use hugr_core::pushdown;
use hugr_core::query_plan::Compiler;
use hugr_core::query_plan::CompilerOptions;
use hugr_core::query_plan::OperationKind;
use serde::Deserialize;
use serde::Serialize;
use serde_json_bytes::ByteString;
use serde_json_bytes::Map;
use serde_json_bytes::Value;
use tokio_util::sync::CancellationToken;

use crate::auth::ApiKeyStore;
use crate::auth::Authenticator;
use crate::cache::CachedResponse;
use crate::cache::FingerprintInput;
use crate::cache::L1Cache;
use crate::cache::MemoryKv;
use crate::cache::RedisKv;
use crate::cache::ResponseCache;
use crate::cache::fingerprint;
use crate::cluster::ForwardRequest;
use crate::cluster::HeartbeatRequest;
use crate::cluster::Management;
use crate::cluster::ManagementOperation;
use crate::cluster::NodeResult;
use crate::cluster::NodeStatus;
use crate::cluster::RegisterRequest;
use crate::cluster::SECRET_HEADER;
use crate::cluster::WorkNode;
use crate::configuration::Configuration;
use crate::coredb::CoreDb;
use crate::engine::Engine;
use crate::executor::Executor;
use crate::registry::DataSourceRegistry;

const JSON_CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Deserialize)]
pub struct GraphQlRequest {
    pub query: String,
    #[serde(default)]
    pub variables: Map<ByteString, Value>,
    #[serde(rename = "operationName")]
    pub operation_name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct GraphQlError {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<String>>,
    pub extensions: GraphQlErrorExtensions,
}

#[derive(Debug, Serialize)]
pub struct GraphQlErrorExtensions {
    pub code: String,
}

#[derive(Debug, Serialize)]
pub struct GraphQlResponse {
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<GraphQlError>,
}

impl GraphQlResponse {
    fn data(data: Value) -> Self {
        Self {
            data: Some(data),
            errors: Vec::new(),
        }
    }

    fn error(err: &HugrError) -> Self {
        Self {
            data: None,
            errors: graphql_errors(err),
        }
    }
}

fn graphql_errors(err: &HugrError) -> Vec<GraphQlError> {
    err.errors()
        .iter()
        .map(|single| GraphQlError {
            message: error_message(single),
            path: None,
            extensions: GraphQlErrorExtensions {
                code: single.code().to_string(),
            },
        })
        .collect()
}

/// Permission failures surface without leaking schema structure.
fn error_message(err: &SingleHugrError) -> String {
    match err.code() {
        ErrorCode::PermissionDenied => "permission denied".to_owned(),
        _ => err.to_string(),
    }
}

pub struct Gateway {
    config: Configuration,
    registry: Arc<DataSourceRegistry>,
    executor: Executor,
    cache: Arc<ResponseCache>,
    authenticator: Authenticator,
    coredb: Arc<CoreDb>,
    api_keys: Arc<ApiKeyStore>,
    management: Option<Arc<Management>>,
    work: Option<Arc<WorkNode>>,
}

impl Gateway {
    pub async fn new(config: Configuration, engine: Arc<dyn Engine>) -> Result<Arc<Self>, HugrError> {
        config.validate()?;

        let registry = Arc::new(DataSourceRegistry::new(
            Arc::clone(&engine),
            std::time::Duration::from_secs(5),
        )?);
        let coredb = Arc::new(CoreDb::new(
            Arc::clone(&engine),
            config.core_db_readonly,
        ));
        coredb.ensure_schema().await?;

        let l1 = Arc::new(L1Cache::new(
            config.cache_l1_max_size,
            config.cache_l1_eviction_time,
        ));
        l1.spawn_sweeper(config.cache_l1_clean_time);
        let l2: Option<Arc<dyn crate::cache::KvStore>> = if config.cache_l2_addr.is_empty() {
            Some(Arc::new(MemoryKv::default()))
        } else {
            Some(Arc::new(RedisKv::connect(&config.cache_l2_addr).await?))
        };
        let cache = Arc::new(ResponseCache::new(
            l1,
            l2,
            config.cache_ttl,
            config.cache_l2_ttl,
        ));

        let api_keys = Arc::new(ApiKeyStore::default());
        let authenticator = Authenticator::new(&config, Arc::clone(&api_keys), None);
        let executor = Executor::new(
            Arc::clone(&engine),
            config.max_parallel_queries,
            config.allow_parallel,
        );

        let management = if config.is_work_node() {
            None
        } else if config.cluster_secret.is_empty() {
            None
        } else {
            let management = Management::new(
                config.cluster_secret.clone(),
                config.cluster_check,
                config.cluster_timeout,
            );
            management.spawn_health_loop();
            Some(management)
        };
        let work = if config.is_work_node() {
            Some(WorkNode::new(
                config.cluster_management_url.clone(),
                config.cluster_secret.clone(),
                config.cluster_node_name.clone(),
                config.cluster_node_url.clone(),
                config.cluster_timeout,
            ))
        } else {
            None
        };

        let gateway = Arc::new(Self {
            config,
            registry,
            executor,
            cache,
            authenticator,
            coredb,
            api_keys,
            management,
            work,
        });
        gateway.spawn_invalidation_listener();
        Ok(gateway)
    }

    pub fn registry(&self) -> &Arc<DataSourceRegistry> {
        &self.registry
    }

    pub fn coredb(&self) -> &Arc<CoreDb> {
        &self.coredb
    }

    pub fn response_cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    /// Loads persisted state and attaches every enabled data source.
    pub async fn bootstrap(&self) -> Result<(), HugrError> {
        self.coredb.reload_permissions().await?;
        self.api_keys.replace(self.coredb.load_api_keys().await?);
        for catalog in self.coredb.load_catalog_sources().await? {
            self.registry.register_catalog_source(catalog).await;
        }
        for source in self.coredb.load_data_sources().await? {
            if source.disabled {
                continue;
            }
            if let Err(err) = self.registry.attach(source.clone()).await {
                // A broken source must not keep the node from serving the rest.
                tracing::error!(source = %source.name, error = %err, "failed to attach data source");
            }
        }
        if let Some(work) = &self.work {
            work.register().await?;
            work.spawn_heartbeat_loop(self.config.cluster_check);
        }
        Ok(())
    }

    /// Cache invalidation follows every schema or data-source change; the
    /// schema version inside every fingerprint makes missed broadcasts
    /// recover on the next bump.
    fn spawn_invalidation_listener(self: &Arc<Self>) {
        let gateway = Arc::clone(self);
        let mut events = self.registry.subscribe_invalidations();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                gateway.cache.invalidate(&event.tags).await;
                if let Some(management) = &gateway.management {
                    management
                        .fan_out(&ManagementOperation::InvalidateTags {
                            tags: event.tags.clone(),
                        })
                        .await;
                }
            }
        });
    }

    #[tracing::instrument(skip_all)]
    pub async fn handle(&self, request: GraphQlRequest, headers: &HeaderMap) -> GraphQlResponse {
        let auth = match self.authenticator.authenticate(headers).await {
            Ok(auth) => auth,
            Err(err) => return GraphQlResponse::error(&err),
        };

        // One snapshot and one permission set for the whole request.
        let snapshot = self.registry.snapshot();
        let permissions = self.coredb.permissions();

        let compiler = Compiler::new(
            &snapshot,
            &permissions,
            &auth,
            CompilerOptions {
                max_depth: self.config.max_depth,
            },
        );
        let compiled = match compiler.compile(
            &request.query,
            request.operation_name.as_deref(),
            &request.variables,
        ) {
            Ok(compiled) => compiled,
            Err(err) => return GraphQlResponse::error(&err),
        };

        let capabilities = self.registry.capabilities().await;
        for root in &compiled.roots {
            let partitioned = pushdown::partition(&root.plan, &capabilities);
            tracing::debug!(
                root = %root.response_key,
                placement = ?partitioned.placement,
                fragments = partitioned.fragments.len(),
                "partitioned root plan"
            );
        }

        let cancel = CancellationToken::new();
        let tags = compiled.tags();

        if compiled.kind == OperationKind::Mutation {
            let result = self.executor.run(&compiled, &cancel).await;
            return match result {
                Ok(data) => {
                    // Mutations invalidate everything they touched.
                    self.cache.invalidate(&tags).await;
                    if let Some(management) = &self.management {
                        management
                            .fan_out(&ManagementOperation::InvalidateTags { tags })
                            .await;
                    }
                    GraphQlResponse::data(data)
                }
                Err(err) => GraphQlResponse::error(&err),
            };
        }

        let key = fingerprint(&FingerprintInput {
            operation: &request.query,
            variables: &request.variables,
            role: &auth.role,
            user_id: if auth.is_user_scoped() {
                auth.user_id.as_deref()
            } else {
                None
            },
            permission_version: permissions.version(),
            schema_version: snapshot.version(),
            schema_hash: snapshot.hash(),
            content_type: JSON_CONTENT_TYPE,
        });

        let executor = &self.executor;
        let compiled_ref = &compiled;
        let cancel_ref = &cancel;
        let built = self
            .cache
            .get_or_build(&key, tags, || async move {
                let data = executor.run(compiled_ref, cancel_ref).await?;
                Ok(CachedResponse {
                    body: serde_json::to_string(&data)
                        .map_err(|err| HugrError::execution(err.to_string()))?,
                    content_type: JSON_CONTENT_TYPE.to_owned(),
                })
            })
            .await;
        match built {
            Ok(response) => match serde_json::from_str::<Value>(&response.body) {
                Ok(data) => GraphQlResponse::data(data),
                Err(err) => GraphQlResponse::error(&HugrError::execution(err.to_string())),
            },
            Err(err) => GraphQlResponse::error(&err),
        }
    }

    /// Applies a fanned-out management operation on this node.
    async fn apply_operation(&self, operation: ManagementOperation) -> Result<(), HugrError> {
        match operation {
            ManagementOperation::LoadDataSource { name } => {
                let source = self
                    .coredb
                    .load_data_sources()
                    .await?
                    .into_iter()
                    .find(|s| s.name == name)
                    .ok_or_else(|| SingleHugrError::InvalidConfiguration {
                        message: format!("data source \"{name}\" is not defined"),
                    })?;
                self.registry.attach(source).await
            }
            ManagementOperation::ReloadDataSource { name } => self.registry.reload(&name).await,
            ManagementOperation::UnloadDataSource { name } => self.registry.detach(&name).await,
            ManagementOperation::InvalidateTags { tags } => {
                self.cache.invalidate(&tags).await;
                Ok(())
            }
            ManagementOperation::ReloadPermissions => {
                self.coredb.reload_permissions().await?;
                self.api_keys.replace(self.coredb.load_api_keys().await?);
                Ok(())
            }
            ManagementOperation::RegisterStorage { descriptor } => {
                let storage = serde_json::from_str(&descriptor.to_string()).map_err(|err| {
                    SingleHugrError::InvalidConfiguration {
                        message: format!("invalid storage descriptor: {err}"),
                    }
                })?;
                self.coredb.upsert_registered_storage(&storage).await
            }
            ManagementOperation::UnregisterStorage { .. } => Ok(()),
        }
    }

    pub fn router(self: &Arc<Self>) -> Router {
        let mut router = Router::new()
            .route("/graphql", post(graphql_post).get(graphql_get))
            .route("/health", get(health));
        if self.management.is_some() {
            router = router
                .route("/cluster/register", post(cluster_register))
                .route("/cluster/heartbeat", post(cluster_heartbeat))
                .route("/cluster/forward", post(cluster_forward));
        }
        router = router
            .route("/cluster/data-source/load", post(cluster_apply))
            .route("/cluster/data-source/unload", post(cluster_apply))
            .route("/cluster/data-source/reload", post(cluster_apply))
            .route("/cluster/storage/register", post(cluster_apply))
            .route("/cluster/storage/unregister", post(cluster_apply))
            .route("/cluster/invalidate", post(cluster_apply))
            .route("/cluster/permissions/reload", post(cluster_apply))
            .route("/admin/data-sources", post(admin_upsert_data_source))
            .route("/admin/catalog-sources", post(admin_upsert_catalog_source))
            .route("/admin/roles", post(admin_upsert_role))
            .route("/admin/permissions", post(admin_upsert_permission));
        router
            .layer(tower_http::trace::TraceLayer::new_for_http())
            .with_state(Arc::clone(self))
    }

    fn verify_cluster_secret(&self, headers: &HeaderMap) -> bool {
        let presented = headers
            .get(SECRET_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        match (&self.management, &self.work) {
            (Some(management), _) => management.verify_secret(presented),
            (_, Some(work)) => work.verify_secret(presented),
            (None, None) => false,
        }
    }
}

async fn graphql_post(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    Json(request): Json<GraphQlRequest>,
) -> Json<GraphQlResponse> {
    Json(gateway.handle(request, &headers).await)
}

#[derive(Debug, Deserialize)]
struct GraphQlGetParams {
    query: String,
    variables: Option<String>,
    #[serde(rename = "operationName")]
    operation_name: Option<String>,
}

async fn graphql_get(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    Query(params): Query<GraphQlGetParams>,
) -> Json<GraphQlResponse> {
    let variables = params
        .variables
        .as_deref()
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or_default();
    let request = GraphQlRequest {
        query: params.query,
        variables,
        operation_name: params.operation_name,
    };
    Json(gateway.handle(request, &headers).await)
}

async fn health() -> &'static str {
    "ok"
}

async fn cluster_register(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    Json(request): Json<RegisterRequest>,
) -> Result<StatusCode, StatusCode> {
    let management = require_management(&gateway, &headers)?;
    management.register(request);
    Ok(StatusCode::OK)
}

async fn cluster_heartbeat(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    Json(request): Json<HeartbeatRequest>,
) -> Result<StatusCode, StatusCode> {
    let management = require_management(&gateway, &headers)?;
    if management.heartbeat(&request.name) {
        Ok(StatusCode::OK)
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

async fn cluster_forward(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    Json(request): Json<ForwardRequest>,
) -> Result<Json<Vec<NodeResult>>, StatusCode> {
    let management = require_management(&gateway, &headers)?;
    // The management node applies the operation itself, then fans out.
    let own = gateway.apply_operation(request.operation.clone()).await;
    let mut results = vec![NodeResult {
        node: "management".to_owned(),
        status: if own.is_ok() {
            NodeStatus::Ok
        } else {
            NodeStatus::Error
        },
        error: own.err().map(|err| err.to_string()),
    }];
    results.extend(management.fan_out(&request.operation).await);
    Ok(Json(results))
}

async fn cluster_apply(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    Json(request): Json<ForwardRequest>,
) -> Result<StatusCode, (StatusCode, String)> {
    if !gateway.verify_cluster_secret(&headers) {
        return Err((StatusCode::UNAUTHORIZED, "invalid cluster secret".to_owned()));
    }
    gateway
        .apply_operation(request.operation)
        .await
        .map(|_| StatusCode::OK)
        .map_err(|err| (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))
}

fn require_management<'g>(
    gateway: &'g Arc<Gateway>,
    headers: &HeaderMap,
) -> Result<&'g Arc<Management>, StatusCode> {
    let management = gateway
        .management
        .as_ref()
        .ok_or(StatusCode::NOT_FOUND)?;
    let presented = headers
        .get(SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !management.verify_secret(presented) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(management)
}

const SECRET_KEY_HEADER: &str = "x-hugr-secret-key";

fn require_secret_key(gateway: &Gateway, headers: &HeaderMap) -> Result<(), StatusCode> {
    if gateway.config.secret_key.is_empty() {
        return Ok(());
    }
    let presented = headers
        .get(SECRET_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if crate::cluster::secrets_match(&gateway.config.secret_key, presented) {
        Ok(())
    } else {
        Err(StatusCode::UNAUTHORIZED)
    }
}

async fn admin_upsert_data_source(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    Json(source): Json<hugr_core::source::DataSource>,
) -> Result<StatusCode, (StatusCode, String)> {
    require_secret_key(&gateway, &headers).map_err(|code| (code, "unauthorized".to_owned()))?;
    gateway
        .coredb
        .upsert_data_source(&source)
        .await
        .map_err(|err| (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
    if !source.disabled {
        gateway
            .registry
            .attach(source)
            .await
            .map_err(|err| (StatusCode::BAD_REQUEST, err.to_string()))?;
    }
    Ok(StatusCode::OK)
}

async fn admin_upsert_catalog_source(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    Json(catalog): Json<hugr_core::catalog::CatalogSource>,
) -> Result<StatusCode, (StatusCode, String)> {
    require_secret_key(&gateway, &headers).map_err(|code| (code, "unauthorized".to_owned()))?;
    gateway
        .coredb
        .upsert_catalog_source(&catalog)
        .await
        .map_err(|err| (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
    gateway.registry.register_catalog_source(catalog).await;
    Ok(StatusCode::OK)
}

async fn admin_upsert_role(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    Json(role): Json<hugr_core::permissions::Role>,
) -> Result<StatusCode, (StatusCode, String)> {
    require_secret_key(&gateway, &headers).map_err(|code| (code, "unauthorized".to_owned()))?;
    gateway
        .coredb
        .upsert_role(&role)
        .await
        .map_err(|err| (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
    gateway
        .coredb
        .reload_permissions()
        .await
        .map_err(|err| (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
    Ok(StatusCode::OK)
}

async fn admin_upsert_permission(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    Json(permission): Json<hugr_core::permissions::Permission>,
) -> Result<StatusCode, (StatusCode, String)> {
    require_secret_key(&gateway, &headers).map_err(|code| (code, "unauthorized".to_owned()))?;
    gateway
        .coredb
        .upsert_permission(&permission)
        .await
        .map_err(|err| (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
    // Permission mutations bump the version and invalidate cached responses.
    gateway
        .coredb
        .reload_permissions()
        .await
        .map_err(|err| (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
    let tags: BTreeSet<String> = [permission.type_name].into_iter().collect();
    gateway.cache.invalidate(&tags).await;
    if let Some(management) = &gateway.management {
        management
            .fan_out(&ManagementOperation::ReloadPermissions)
            .await;
        management
            .fan_out(&ManagementOperation::InvalidateTags { tags })
            .await;
    }
    Ok(StatusCode::OK)
}
