//! The work role: registers with the management node on startup, heartbeats,
//! and forwards `core.cluster` management operations for fan-out.

use std::sync::Arc;
use std::time::Duration;

use hugr_core::error::HugrError;
use hugr_core::error::SingleHugrError;
use uuid::Uuid;

use super::CORRELATION_HEADER;
use super::ForwardRequest;
use super::HeartbeatRequest;
use super::ManagementOperation;
use super::NodeResult;
use super::RegisterRequest;
use super::SECRET_HEADER;

pub struct WorkNode {
    management_url: String,
    secret: String,
    name: String,
    url: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl WorkNode {
    pub fn new(
        management_url: String,
        secret: String,
        name: String,
        url: String,
        timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            management_url,
            secret,
            name,
            url,
            timeout,
            client: reqwest::Client::new(),
        })
    }

    pub fn verify_secret(&self, presented: &str) -> bool {
        super::secrets_match(&self.secret, presented)
    }

    /// Registers on startup, retrying with a flat backoff until the
    /// management node accepts.
    pub async fn register(&self) -> Result<(), HugrError> {
        let request = RegisterRequest {
            name: self.name.clone(),
            url: self.url.clone(),
            version: env!("CARGO_PKG_VERSION").to_owned(),
        };
        let mut attempts = 0u32;
        loop {
            let result = self
                .call("/cluster/register", &request)
                .await;
            match result {
                Ok(()) => return Ok(()),
                Err(err) if attempts < 5 => {
                    attempts += 1;
                    tracing::warn!(error = %err, attempt = attempts, "registration failed, retrying");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    pub fn spawn_heartbeat_loop(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let work = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let request = HeartbeatRequest {
                    name: work.name.clone(),
                };
                if let Err(err) = work.call("/cluster/heartbeat", &request).await {
                    tracing::warn!(error = %err, "heartbeat failed");
                }
            }
        })
    }

    /// Forwards a management operation and returns the aggregated per-node
    /// results from the management node.
    pub async fn forward(
        &self,
        operation: ManagementOperation,
    ) -> Result<Vec<NodeResult>, HugrError> {
        let response = self
            .client
            .post(format!("{}/cluster/forward", self.management_url))
            .header(SECRET_HEADER, &self.secret)
            .header(CORRELATION_HEADER, Uuid::new_v4().to_string())
            .timeout(self.timeout)
            .json(&ForwardRequest { operation })
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|err| self.peer_error(err))?;
        response
            .json::<Vec<NodeResult>>()
            .await
            .map_err(|err| self.peer_error(err))
    }

    async fn call<T: serde::Serialize>(&self, path: &str, body: &T) -> Result<(), HugrError> {
        self.client
            .post(format!("{}{path}", self.management_url))
            .header(SECRET_HEADER, &self.secret)
            .header(CORRELATION_HEADER, Uuid::new_v4().to_string())
            .timeout(self.timeout)
            .json(body)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|err| self.peer_error(err))?;
        Ok(())
    }

    fn peer_error(&self, err: impl std::fmt::Display) -> HugrError {
        SingleHugrError::ClusterPeer {
            node: self.management_url.clone(),
            message: err.to_string(),
        }
        .into()
    }
}
