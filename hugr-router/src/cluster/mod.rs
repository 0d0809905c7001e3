//! The management ↔ work node protocol: registration, health, configuration
//! pushes, data-source propagation and cache invalidation fan-out.
//!
//! Transport is HTTP/JSON. Every call carries the shared cluster secret and a
//! correlation id; secrets compare in constant time.

use std::collections::BTreeSet;

use serde::Deserialize;
use serde::Serialize;
use serde_json_bytes::Value;

pub mod management;
pub mod work;

pub use management::Management;
pub use work::WorkNode;

pub const SECRET_HEADER: &str = "x-hugr-cluster-secret";
pub const CORRELATION_HEADER: &str = "x-hugr-correlation-id";

/// Work → management: announce this node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    pub url: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub name: String,
}

/// A management operation forwarded by a work node or issued directly on the
/// management node, fanned out to every ready work node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum ManagementOperation {
    LoadDataSource { name: String },
    UnloadDataSource { name: String },
    ReloadDataSource { name: String },
    RegisterStorage { descriptor: Value },
    UnregisterStorage { name: String },
    InvalidateTags { tags: BTreeSet<String> },
    ReloadPermissions,
}

impl ManagementOperation {
    /// The work-node endpoint this operation lands on.
    pub fn path(&self) -> &'static str {
        match self {
            Self::LoadDataSource { .. } => "/cluster/data-source/load",
            Self::UnloadDataSource { .. } => "/cluster/data-source/unload",
            Self::ReloadDataSource { .. } => "/cluster/data-source/reload",
            Self::RegisterStorage { .. } => "/cluster/storage/register",
            Self::UnregisterStorage { .. } => "/cluster/storage/unregister",
            Self::InvalidateTags { .. } => "/cluster/invalidate",
            Self::ReloadPermissions => "/cluster/permissions/reload",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardRequest {
    pub operation: ManagementOperation,
}

/// Per-node outcome of a fanned-out operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeResult {
    pub node: String,
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Ok,
    Error,
}

/// Management → work: authentication settings and the schema version the
/// management node has published.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushConfigRequest {
    pub allowed_anonymous: bool,
    pub anonymous_role: String,
    pub allowed_managed_api_keys: bool,
    pub schema_version: u64,
}

/// Constant-time secret comparison.
pub fn secrets_match(expected: &str, presented: &str) -> bool {
    let expected = expected.as_bytes();
    let presented = presented.as_bytes();
    if expected.len() != presented.len() {
        return false;
    }
    let mut diff = 0u8;
    for (a, b) in expected.iter().zip(presented) {
        diff |= a ^ b;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn operations_round_trip_through_json() {
        let operation = ManagementOperation::ReloadDataSource {
            name: "shop".to_owned(),
        };
        let raw = serde_json::to_string(&operation).expect("serialize");
        assert_eq!(raw, r#"{"operation":"reload_data_source","name":"shop"}"#);
        let parsed: ManagementOperation = serde_json::from_str(&raw).expect("deserialize");
        assert_eq!(parsed, operation);
    }

    #[test]
    fn node_results_serialize_with_status() {
        let result = NodeResult {
            node: "work-1".to_owned(),
            status: NodeStatus::Error,
            error: Some("timed out".to_owned()),
        };
        let raw = serde_json::to_string(&result).expect("serialize");
        assert_eq!(raw, r#"{"node":"work-1","status":"error","error":"timed out"}"#);
    }

    #[test]
    fn secret_comparison_rejects_differences() {
        assert!(secrets_match("s3cret", "s3cret"));
        assert!(!secrets_match("s3cret", "s3cret "));
        assert!(!secrets_match("s3cret", "s3creT"));
        assert!(!secrets_match("", "x"));
    }
}
