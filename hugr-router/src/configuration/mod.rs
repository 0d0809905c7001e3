//! Environment-driven configuration. Every knob has a default that works for
//! a single node; missing or malformed values fail startup with a
//! configuration error naming the variable.

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use hugr_core::error::HugrError;
use hugr_core::error::SingleHugrError;
use serde::Deserialize;
use serde::Serialize;

fn parse_duration(value: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(value)
}

/// Runtime configuration, read from the environment (flags are provided for
/// local development).
#[derive(Debug, Clone, Parser, Serialize, Deserialize)]
#[command(name = "hugr-router", about = "Hugr GraphQL data-mesh gateway")]
pub struct Configuration {
    /// Listen address of the GraphQL endpoint.
    #[arg(long, env = "BIND", default_value = "0.0.0.0:15000")]
    pub bind: SocketAddr,

    /// URL of the analytical engine handle.
    #[arg(long, env = "ENGINE_URL", default_value = "http://127.0.0.1:15432")]
    pub engine_url: String,

    /// Maximum GraphQL selection depth.
    #[arg(long, env = "MAX_DEPTH", default_value_t = 10)]
    pub max_depth: usize,

    /// Maximum concurrently executing compiled statements; excess queues FIFO.
    #[arg(long, env = "MAX_PARALLEL_QUERIES", default_value_t = 64)]
    pub max_parallel_queries: usize,

    /// Execute a query's root fields in parallel.
    #[arg(long, env = "ALLOW_PARALLEL", default_value_t = true, action = clap::ArgAction::Set)]
    pub allow_parallel: bool,

    /// Path of the core database inside the engine.
    #[arg(long, env = "CORE_DB_PATH", default_value = "hugr.db")]
    pub core_db_path: String,

    /// Open the core database read-only (work nodes in a cluster).
    #[arg(long, env = "CORE_DB_READONLY", default_value_t = false, action = clap::ArgAction::Set)]
    pub core_db_readonly: bool,

    /// Default response cache TTL.
    #[arg(long, env = "CACHE_TTL", default_value = "0s", value_parser = parse_duration)]
    #[serde(with = "humantime_serde")]
    pub cache_ttl: Duration,

    /// L1 cache bound, in megabytes.
    #[arg(long, env = "CACHE_L1_MAX_SIZE", default_value_t = 128)]
    pub cache_l1_max_size: usize,

    /// L1 per-entry eviction time.
    #[arg(long, env = "CACHE_L1_EVICTION_TIME", default_value = "60s", value_parser = parse_duration)]
    #[serde(with = "humantime_serde")]
    pub cache_l1_eviction_time: Duration,

    /// L1 sweeper interval.
    #[arg(long, env = "CACHE_L1_CLEAN_TIME", default_value = "10s", value_parser = parse_duration)]
    #[serde(with = "humantime_serde")]
    pub cache_l1_clean_time: Duration,

    /// L2 cache address (`redis://...`); empty disables the shared tier.
    #[arg(long, env = "CACHE_L2_ADDR", default_value = "")]
    pub cache_l2_addr: String,

    /// L2 entry TTL.
    #[arg(long, env = "CACHE_L2_TTL", default_value = "300s", value_parser = parse_duration)]
    #[serde(with = "humantime_serde")]
    pub cache_l2_ttl: Duration,

    /// Shared secret carried by every intra-cluster call.
    #[arg(long, env = "CLUSTER_SECRET", default_value = "")]
    pub cluster_secret: String,

    /// Management node URL; empty means this node runs standalone or is
    /// itself the management node.
    #[arg(long, env = "CLUSTER_MANAGEMENT_URL", default_value = "")]
    pub cluster_management_url: String,

    /// This node's name in the cluster.
    #[arg(long, env = "CLUSTER_NODE_NAME", default_value = "")]
    pub cluster_node_name: String,

    /// This node's externally reachable URL.
    #[arg(long, env = "CLUSTER_NODE_URL", default_value = "")]
    pub cluster_node_url: String,

    /// Health check interval on the management node.
    #[arg(long, env = "CLUSTER_CHECK", default_value = "15s", value_parser = parse_duration)]
    #[serde(with = "humantime_serde")]
    pub cluster_check: Duration,

    /// Per-call timeout for management and work node calls.
    #[arg(long, env = "CLUSTER_TIMEOUT", default_value = "30s", value_parser = parse_duration)]
    #[serde(with = "humantime_serde")]
    pub cluster_timeout: Duration,

    /// Allow unauthenticated requests.
    #[arg(long, env = "ALLOWED_ANONYMOUS", default_value_t = true, action = clap::ArgAction::Set)]
    pub allowed_anonymous: bool,

    /// Role assigned to anonymous requests.
    #[arg(long, env = "ANONYMOUS_ROLE", default_value = "anonymous")]
    pub anonymous_role: String,

    /// Resolve roles through managed API keys.
    #[arg(long, env = "ALLOWED_MANAGED_API_KEYS", default_value_t = true, action = clap::ArgAction::Set)]
    pub allowed_managed_api_keys: bool,

    /// Secret used to authenticate management operations.
    #[arg(long, env = "SECRET_KEY", default_value = "")]
    pub secret_key: String,
}

impl Configuration {
    pub fn from_env() -> Result<Self, HugrError> {
        Self::try_parse_from(std::iter::empty::<std::ffi::OsString>()).map_err(|err| {
            SingleHugrError::InvalidConfiguration {
                message: err.to_string(),
            }
            .into()
        })
    }

    /// Whether this node forwards management operations to a management node.
    pub fn is_work_node(&self) -> bool {
        !self.cluster_management_url.is_empty()
    }

    pub fn validate(&self) -> Result<(), HugrError> {
        if self.is_work_node() && self.cluster_secret.is_empty() {
            return Err(SingleHugrError::InvalidConfiguration {
                message: "CLUSTER_SECRET is required when CLUSTER_MANAGEMENT_URL is set".to_owned(),
            }
            .into());
        }
        if self.is_work_node() && self.cluster_node_name.is_empty() {
            return Err(SingleHugrError::InvalidConfiguration {
                message: "CLUSTER_NODE_NAME is required when CLUSTER_MANAGEMENT_URL is set"
                    .to_owned(),
            }
            .into());
        }
        if self.max_parallel_queries == 0 {
            return Err(SingleHugrError::InvalidConfiguration {
                message: "MAX_PARALLEL_QUERIES must be at least 1".to_owned(),
            }
            .into());
        }
        Ok(())
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self::try_parse_from(std::iter::empty::<std::ffi::OsString>())
            .expect("defaults are valid")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Configuration::default();
        config.validate().expect("defaults should validate");
        assert_eq!(config.max_depth, 10);
        assert_eq!(config.cache_l1_max_size, 128);
        assert!(!config.is_work_node());
    }

    #[test]
    fn work_node_requires_secret_and_name() {
        let config = Configuration {
            cluster_management_url: "http://mgmt:15000".to_owned(),
            ..Configuration::default()
        };
        assert!(config.validate().is_err());
    }
}
