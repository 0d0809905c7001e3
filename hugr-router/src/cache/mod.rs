//! Two-tier response cache with request fingerprinting and single-flight
//! build coalescing.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use hugr_core::error::HugrError;
use serde::Deserialize;
use serde::Serialize;
use serde_json_bytes::ByteString;
use serde_json_bytes::Map;
use serde_json_bytes::Value;
use sha2::Digest;
use sha2::Sha256;

pub mod l1;
pub mod l2;
pub mod single_flight;

pub use l1::L1Cache;
pub use l2::KvStore;
pub use l2::MemoryKv;
pub use l2::RedisKv;
pub use single_flight::SingleFlight;

/// A cached response body with its content type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub body: String,
    pub content_type: String,
}

/// Everything that distinguishes one cacheable response from another.
#[derive(Debug, Clone)]
pub struct FingerprintInput<'a> {
    pub operation: &'a str,
    pub variables: &'a Map<ByteString, Value>,
    pub role: &'a str,
    /// Set when permission placeholders make the response user-specific.
    pub user_id: Option<&'a str>,
    pub permission_version: u64,
    pub schema_version: u64,
    pub schema_hash: &'a str,
    pub content_type: &'a str,
}

/// SHA-256 over the normalized operation text, sorted variable bindings,
/// role (and user when user-scoped), permission version and schema version.
/// Any schema or permission bump therefore changes every fingerprint, which
/// is what lets nodes that missed an invalidation broadcast converge.
pub fn fingerprint(input: &FingerprintInput<'_>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_operation(input.operation));
    hasher.update([0x1f]);
    let sorted: BTreeMap<&str, &Value> = input
        .variables
        .iter()
        .map(|(k, v)| (k.as_str(), v))
        .collect();
    for (name, value) in sorted {
        hasher.update(name);
        hasher.update([0x1e]);
        hasher.update(value.to_string());
        hasher.update([0x1e]);
    }
    hasher.update([0x1f]);
    hasher.update(input.role);
    if let Some(user_id) = input.user_id {
        hasher.update([0x1f]);
        hasher.update(user_id);
    }
    hasher.update([0x1f]);
    hasher.update(input.permission_version.to_be_bytes());
    hasher.update(input.schema_version.to_be_bytes());
    hasher.update(input.schema_hash);
    hasher.update([0x1f]);
    hasher.update(input.content_type);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Collapses runs of whitespace so formatting differences do not split the
/// cache.
fn normalize_operation(operation: &str) -> String {
    let mut out = String::with_capacity(operation.len());
    let mut last_was_space = false;
    for c in operation.trim().chars() {
        if c.is_whitespace() {
            if !last_was_space {
                out.push(' ');
            }
            last_was_space = true;
        } else {
            out.push(c);
            last_was_space = false;
        }
    }
    out
}

pub struct ResponseCache {
    l1: Arc<L1Cache>,
    l2: Option<Arc<dyn KvStore>>,
    flights: Arc<SingleFlight>,
    ttl: Duration,
    l2_ttl: Duration,
}

impl ResponseCache {
    pub fn new(
        l1: Arc<L1Cache>,
        l2: Option<Arc<dyn KvStore>>,
        ttl: Duration,
        l2_ttl: Duration,
    ) -> Self {
        Self {
            l1,
            l2,
            flights: SingleFlight::new(),
            ttl,
            l2_ttl,
        }
    }

    pub fn enabled(&self) -> bool {
        !self.ttl.is_zero()
    }

    /// Serves from L1, then L2 (read-through with fallback to the source on
    /// L2 failure), then coalesces a build.
    pub async fn get_or_build<F, Fut>(
        &self,
        key: &str,
        tags: BTreeSet<String>,
        build: F,
    ) -> Result<CachedResponse, HugrError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<CachedResponse, HugrError>>,
    {
        if !self.enabled() {
            return self.flights.run(key, build).await;
        }
        if let Some(hit) = self.l1.get(key) {
            return Ok(hit);
        }
        if let Some(l2) = &self.l2 {
            match l2.get(key).await {
                Ok(Some(hit)) => {
                    self.l1.insert(key.to_owned(), hit.clone(), self.ttl, tags);
                    return Ok(hit);
                }
                Ok(None) => {}
                Err(err) => {
                    // Read-through: an unavailable shared tier degrades to a
                    // local build instead of failing the request.
                    tracing::warn!(error = %err, "L2 cache read failed");
                }
            }
        }

        let built = self
            .flights
            .run(key, || async {
                // Another follower may have populated L1 while we queued.
                if let Some(hit) = self.l1.get(key) {
                    return Ok(hit);
                }
                build().await
            })
            .await?;
        if let Some(l2) = &self.l2 {
            if let Err(err) = l2.set(key, &built, self.l2_ttl, &tags).await {
                tracing::warn!(error = %err, "L2 cache write failed");
            }
        }
        self.l1.insert(key.to_owned(), built.clone(), self.ttl, tags);
        Ok(built)
    }

    pub async fn invalidate(&self, tags: &BTreeSet<String>) {
        self.l1.invalidate_tags(tags);
        if let Some(l2) = &self.l2 {
            if let Err(err) = l2.invalidate(tags).await {
                tracing::warn!(error = %err, "L2 cache invalidation failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json_bytes::json;

    use super::*;

    fn input<'a>(
        operation: &'a str,
        variables: &'a Map<ByteString, Value>,
        role: &'a str,
        permission_version: u64,
        schema_version: u64,
    ) -> FingerprintInput<'a> {
        FingerprintInput {
            operation,
            variables,
            role,
            user_id: None,
            permission_version,
            schema_version,
            schema_hash: "abc",
            content_type: "application/json",
        }
    }

    #[test]
    fn whitespace_does_not_split_the_fingerprint() {
        let variables = Map::new();
        let a = fingerprint(&input("{ orders { id } }", &variables, "admin", 1, 1));
        let b = fingerprint(&input("{\n  orders {\n    id\n  }\n}", &variables, "admin", 1, 1));
        assert_eq!(a, b);
    }

    #[test]
    fn role_and_versions_split_the_fingerprint() {
        let variables = Map::new();
        let base = fingerprint(&input("{ orders { id } }", &variables, "admin", 1, 1));
        assert_ne!(
            base,
            fingerprint(&input("{ orders { id } }", &variables, "tenant", 1, 1))
        );
        assert_ne!(
            base,
            fingerprint(&input("{ orders { id } }", &variables, "admin", 2, 1))
        );
        assert_ne!(
            base,
            fingerprint(&input("{ orders { id } }", &variables, "admin", 1, 2))
        );
    }

    #[test]
    fn variable_order_does_not_split_the_fingerprint() {
        let mut first = Map::new();
        first.insert(ByteString::from("a".to_owned()), json!(1));
        first.insert(ByteString::from("b".to_owned()), json!(2));
        let mut second = Map::new();
        second.insert(ByteString::from("b".to_owned()), json!(2));
        second.insert(ByteString::from("a".to_owned()), json!(1));
        assert_eq!(
            fingerprint(&input("{ orders { id } }", &first, "admin", 1, 1)),
            fingerprint(&input("{ orders { id } }", &second, "admin", 1, 1)),
        );
    }
}
