//! The shared cache tier: a small KV interface with a Redis implementation.
//! Tag sets are kept alongside the values so invalidation can fan out by tag.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use fred::prelude::*;
use hugr_core::error::HugrError;
use hugr_core::error::SingleHugrError;

use super::CachedResponse;

#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<CachedResponse>, HugrError>;
    async fn set(
        &self,
        key: &str,
        value: &CachedResponse,
        ttl: Duration,
        tags: &BTreeSet<String>,
    ) -> Result<(), HugrError>;
    async fn delete(&self, key: &str) -> Result<(), HugrError>;
    async fn invalidate(&self, tags: &BTreeSet<String>) -> Result<(), HugrError>;
}

fn cache_error(err: impl std::fmt::Display) -> HugrError {
    SingleHugrError::Cache {
        message: err.to_string(),
    }
    .into()
}

const KEY_PREFIX: &str = "hugr:response:";
const TAG_PREFIX: &str = "hugr:tag:";

/// Redis-backed store. Memcached or other stores implement [`KvStore`]
/// instead; the facade is agnostic.
pub struct RedisKv {
    client: Client,
}

impl RedisKv {
    pub async fn connect(addr: &str) -> Result<Self, HugrError> {
        let config = Config::from_url(addr).map_err(cache_error)?;
        let client = Builder::from_config(config).build().map_err(cache_error)?;
        client.init().await.map_err(cache_error)?;
        Ok(Self { client })
    }
}

#[async_trait]
impl KvStore for RedisKv {
    async fn get(&self, key: &str) -> Result<Option<CachedResponse>, HugrError> {
        let raw: Option<String> = self
            .client
            .get(format!("{KEY_PREFIX}{key}"))
            .await
            .map_err(cache_error)?;
        match raw {
            Some(raw) => serde_json::from_str(&raw).map(Some).map_err(cache_error),
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        key: &str,
        value: &CachedResponse,
        ttl: Duration,
        tags: &BTreeSet<String>,
    ) -> Result<(), HugrError> {
        let raw = serde_json::to_string(value).map_err(cache_error)?;
        let full_key = format!("{KEY_PREFIX}{key}");
        let _: () = self
            .client
            .set(
                &full_key,
                raw,
                Some(Expiration::EX(ttl.as_secs().max(1) as i64)),
                None,
                false,
            )
            .await
            .map_err(cache_error)?;
        for tag in tags {
            let tag_key = format!("{TAG_PREFIX}{tag}");
            let _: () = self
                .client
                .sadd(&tag_key, full_key.as_str())
                .await
                .map_err(cache_error)?;
            let _: () = self
                .client
                .expire(&tag_key, ttl.as_secs().max(1) as i64, None)
                .await
                .map_err(cache_error)?;
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), HugrError> {
        let _: () = self
            .client
            .del(format!("{KEY_PREFIX}{key}"))
            .await
            .map_err(cache_error)?;
        Ok(())
    }

    async fn invalidate(&self, tags: &BTreeSet<String>) -> Result<(), HugrError> {
        for tag in tags {
            let tag_key = format!("{TAG_PREFIX}{tag}");
            let members: Vec<String> = self
                .client
                .smembers(&tag_key)
                .await
                .map_err(cache_error)?;
            if !members.is_empty() {
                let _: () = self.client.del(members).await.map_err(cache_error)?;
            }
            let _: () = self.client.del(&tag_key).await.map_err(cache_error)?;
        }
        Ok(())
    }
}

/// An in-memory KV used by tests and single-node setups without Redis.
#[derive(Default)]
pub struct MemoryKv {
    entries: dashmap::DashMap<String, (CachedResponse, std::time::Instant, BTreeSet<String>)>,
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<CachedResponse>, HugrError> {
        match self.entries.get(key) {
            Some(entry) if entry.1 > std::time::Instant::now() => Ok(Some(entry.0.clone())),
            Some(_) => {
                drop(self.entries.remove(key));
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        key: &str,
        value: &CachedResponse,
        ttl: Duration,
        tags: &BTreeSet<String>,
    ) -> Result<(), HugrError> {
        self.entries.insert(
            key.to_owned(),
            (value.clone(), std::time::Instant::now() + ttl, tags.clone()),
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), HugrError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn invalidate(&self, tags: &BTreeSet<String>) -> Result<(), HugrError> {
        self.entries
            .retain(|_, (_, _, entry_tags)| !entry_tags.iter().any(|tag| tags.contains(tag)));
        Ok(())
    }
}
