//! In-process response cache: LRU bounded by total payload bytes with
//! time-based eviction and a periodic sweeper.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use lru::LruCache;

use super::CachedResponse;

struct Entry {
    value: CachedResponse,
    expires_at: Instant,
    tags: BTreeSet<String>,
}

struct Inner {
    entries: LruCache<String, Entry>,
    bytes: usize,
}

pub struct L1Cache {
    inner: Mutex<Inner>,
    max_bytes: usize,
    eviction_time: Duration,
}

impl L1Cache {
    pub fn new(max_megabytes: usize, eviction_time: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::unbounded(),
                bytes: 0,
            }),
            max_bytes: max_megabytes * 1024 * 1024,
            eviction_time,
        }
    }

    pub fn get(&self, key: &str) -> Option<CachedResponse> {
        let mut inner = self.inner.lock().expect("l1 cache lock");
        match inner.entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                if let Some(expired) = inner.entries.pop(key) {
                    inner.bytes = inner.bytes.saturating_sub(expired.value.body.len());
                }
                None
            }
            None => None,
        }
    }

    /// Inserts with the entry's TTL capped by the eviction time, so an L1
    /// entry never outlives its L2 counterpart.
    pub fn insert(&self, key: String, value: CachedResponse, ttl: Duration, tags: BTreeSet<String>) {
        let ttl = ttl.min(self.eviction_time);
        if ttl.is_zero() {
            return;
        }
        let size = value.body.len();
        let mut inner = self.inner.lock().expect("l1 cache lock");
        if let Some(previous) = inner.entries.pop(&key) {
            inner.bytes = inner.bytes.saturating_sub(previous.value.body.len());
        }
        inner.entries.put(
            key,
            Entry {
                value,
                expires_at: Instant::now() + ttl,
                tags,
            },
        );
        inner.bytes += size;
        while inner.bytes > self.max_bytes {
            match inner.entries.pop_lru() {
                Some((_, evicted)) => {
                    inner.bytes = inner.bytes.saturating_sub(evicted.value.body.len());
                }
                None => break,
            }
        }
    }

    /// Drops every entry carrying any of the tags.
    pub fn invalidate_tags(&self, tags: &BTreeSet<String>) {
        let mut inner = self.inner.lock().expect("l1 cache lock");
        let keys: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.tags.iter().any(|tag| tags.contains(tag)))
            .map(|(key, _)| key.clone())
            .collect();
        for key in keys {
            if let Some(entry) = inner.entries.pop(&key) {
                inner.bytes = inner.bytes.saturating_sub(entry.value.body.len());
            }
        }
    }

    /// Removes expired entries; driven by the sweeper task.
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("l1 cache lock");
        let keys: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in keys {
            if let Some(entry) = inner.entries.pop(&key) {
                inner.bytes = inner.bytes.saturating_sub(entry.value.body.len());
            }
        }
    }

    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(100)));
            loop {
                ticker.tick().await;
                cache.sweep();
            }
        })
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().expect("l1 cache lock").entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(body: &str) -> CachedResponse {
        CachedResponse {
            body: body.to_owned(),
            content_type: "application/json".to_owned(),
        }
    }

    #[test]
    fn size_bound_evicts_least_recently_used() {
        // 1 MB budget, three ~600 KB entries: only the freshest two fit.
        let cache = L1Cache::new(1, Duration::from_secs(60));
        let big = "x".repeat(600 * 1024);
        cache.insert("a".to_owned(), response(&big), Duration::from_secs(60), BTreeSet::new());
        cache.insert("b".to_owned(), response(&big), Duration::from_secs(60), BTreeSet::new());
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
    }

    #[test]
    fn tag_invalidation_drops_matching_entries() {
        let cache = L1Cache::new(16, Duration::from_secs(60));
        cache.insert(
            "orders-query".to_owned(),
            response("{}"),
            Duration::from_secs(60),
            BTreeSet::from(["shop".to_owned(), "orders".to_owned()]),
        );
        cache.insert(
            "users-query".to_owned(),
            response("{}"),
            Duration::from_secs(60),
            BTreeSet::from(["identity".to_owned()]),
        );
        cache.invalidate_tags(&BTreeSet::from(["shop".to_owned()]));
        assert!(cache.get("orders-query").is_none());
        assert!(cache.get("users-query").is_some());
    }

    #[test]
    fn sweep_removes_expired_entries() {
        let cache = L1Cache::new(16, Duration::from_millis(1));
        cache.insert(
            "k".to_owned(),
            response("{}"),
            Duration::from_millis(1),
            BTreeSet::new(),
        );
        std::thread::sleep(Duration::from_millis(5));
        cache.sweep();
        assert_eq!(cache.len(), 0);
    }
}
