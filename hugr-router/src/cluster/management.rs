//! The management role: owns the node registry, runs periodic health checks
//! and fans management operations out to every ready work node.

use std::sync::Arc;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use dashmap::DashMap;
use hugr_core::error::HugrError;
use uuid::Uuid;

use super::CORRELATION_HEADER;
use super::ForwardRequest;
use super::ManagementOperation;
use super::NodeResult;
use super::NodeStatus;
use super::RegisterRequest;
use super::SECRET_HEADER;

#[derive(Debug, Clone)]
pub struct NodeState {
    pub url: String,
    pub version: String,
    pub ready: bool,
    pub last_seen: i64,
    pub error: Option<String>,
}

pub struct Management {
    secret: String,
    timeout: Duration,
    check: Duration,
    nodes: DashMap<String, NodeState>,
    client: reqwest::Client,
}

impl Management {
    pub fn new(secret: String, check: Duration, timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            secret,
            timeout,
            check,
            nodes: DashMap::new(),
            client: reqwest::Client::new(),
        })
    }

    pub fn verify_secret(&self, presented: &str) -> bool {
        super::secrets_match(&self.secret, presented)
    }

    /// Work nodes appear through registration; re-registration after a failed
    /// health check makes a node ready again.
    pub fn register(&self, request: RegisterRequest) {
        tracing::info!(node = %request.name, url = %request.url, "work node registered");
        self.nodes.insert(
            request.name,
            NodeState {
                url: request.url,
                version: request.version,
                ready: true,
                last_seen: now_unix(),
                error: None,
            },
        );
    }

    pub fn heartbeat(&self, name: &str) -> bool {
        match self.nodes.get_mut(name) {
            Some(mut node) => {
                node.last_seen = now_unix();
                node.ready = true;
                node.error = None;
                true
            }
            None => false,
        }
    }

    pub fn nodes(&self) -> Vec<(String, NodeState)> {
        let mut nodes: Vec<(String, NodeState)> = self
            .nodes
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        nodes.sort_by(|a, b| a.0.cmp(&b.0));
        nodes
    }

    /// Sends one operation to every ready node, sequentially, and reports a
    /// per-node result. Reload commands for a given source are therefore
    /// serialized per node.
    #[tracing::instrument(skip(self, operation), fields(operation = ?operation))]
    pub async fn fan_out(&self, operation: &ManagementOperation) -> Vec<NodeResult> {
        let correlation_id = Uuid::new_v4().to_string();
        let mut results = Vec::new();
        for (name, node) in self.nodes() {
            if !node.ready {
                continue;
            }
            let result = self
                .call_node(&node.url, operation, &correlation_id)
                .await;
            match result {
                Ok(()) => results.push(NodeResult {
                    node: name,
                    status: NodeStatus::Ok,
                    error: None,
                }),
                Err(err) => {
                    // A failing node is excluded from further fan-out until it
                    // re-registers or passes a health check.
                    if let Some(mut state) = self.nodes.get_mut(&name) {
                        state.ready = false;
                        state.error = Some(err.to_string());
                    }
                    results.push(NodeResult {
                        node: name,
                        status: NodeStatus::Error,
                        error: Some(err.to_string()),
                    });
                }
            }
        }
        results
    }

    async fn call_node(
        &self,
        url: &str,
        operation: &ManagementOperation,
        correlation_id: &str,
    ) -> Result<(), HugrError> {
        self.client
            .post(format!("{url}{}", operation.path()))
            .header(SECRET_HEADER, &self.secret)
            .header(CORRELATION_HEADER, correlation_id)
            .timeout(self.timeout)
            .json(&ForwardRequest {
                operation: operation.clone(),
            })
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|err| hugr_core::error::SingleHugrError::ClusterPeer {
                node: url.to_owned(),
                message: err.to_string(),
            })?;
        Ok(())
    }

    /// Periodic health checks: a node timing out becomes `ready = false` but
    /// keeps serving its last-known snapshot; it rejoins on re-registration
    /// or a later successful check.
    pub fn spawn_health_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let management = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(management.check);
            loop {
                ticker.tick().await;
                for (name, node) in management.nodes() {
                    let healthy = management
                        .client
                        .get(format!("{}/health", node.url))
                        .header(SECRET_HEADER, &management.secret)
                        .timeout(management.timeout)
                        .send()
                        .await
                        .map(|response| response.status().is_success())
                        .unwrap_or(false);
                    if let Some(mut state) = management.nodes.get_mut(&name) {
                        if healthy {
                            state.ready = true;
                            state.last_seen = now_unix();
                            state.error = None;
                        } else if state.ready {
                            tracing::warn!(node = %name, "work node failed health check");
                            state.ready = false;
                            state.error = Some("health check failed".to_owned());
                        }
                    }
                }
            }
        })
    }
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_and_heartbeat_track_readiness() {
        let management = Management::new(
            "secret".to_owned(),
            Duration::from_secs(15),
            Duration::from_secs(5),
        );
        management.register(RegisterRequest {
            name: "work-1".to_owned(),
            url: "http://work-1:15000".to_owned(),
            version: "0.1.0".to_owned(),
        });
        assert!(management.heartbeat("work-1"));
        assert!(!management.heartbeat("work-2"));
        let nodes = management.nodes();
        assert_eq!(nodes.len(), 1);
        assert!(nodes[0].1.ready);
    }

    #[tokio::test]
    async fn fan_out_reports_unreachable_nodes() {
        let management = Management::new(
            "secret".to_owned(),
            Duration::from_secs(15),
            Duration::from_millis(50),
        );
        management.register(RegisterRequest {
            name: "work-1".to_owned(),
            // Unroutable: the call fails fast and is reported per node.
            url: "http://127.0.0.1:1".to_owned(),
            version: "0.1.0".to_owned(),
        });
        let results = management
            .fan_out(&ManagementOperation::ReloadPermissions)
            .await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, NodeStatus::Error);
        // The failing node is excluded from the next fan-out.
        let results = management
            .fan_out(&ManagementOperation::ReloadPermissions)
            .await;
        assert!(results.is_empty());
    }
}
