// crates/engram-server/src/cache/mod.rs
// Look-aside byte cache: hot conversation metadata and memory epochs
//
// The cache is best-effort everywhere: correctness never depends on it,
// failures never propagate, and losing it entirely only costs store reads.

use async_trait::async_trait;
use moka::future::Cache;
use std::time::{Duration, Instant};

/// Opaque (key → bytes) cache with per-entry TTL.
#[async_trait]
pub trait ByteCache: Send + Sync {
    fn id(&self) -> &'static str;
    async fn get(&self, key: &str) -> Option<Vec<u8>>;
    async fn put(&self, key: String, value: Vec<u8>, ttl: Duration);
    async fn remove(&self, key: &str);
}

/// Cache key for a conversation DTO.
pub fn conversation_key(id: &str) -> String {
    format!("convo:{id}")
}

/// Cache key for the latest MEMORY epoch of a (conversation, client).
pub fn epoch_key(conversation_id: &str, client_id: &str) -> String {
    format!("epoch:{conversation_id}:{client_id}")
}

/// In-process moka-backed cache. Entries carry their own deadline; the
/// outer time_to_live bounds residency regardless.
pub struct MokaCache {
    inner: Cache<String, (Instant, Vec<u8>)>,
}

impl MokaCache {
    pub fn new(max_capacity: u64) -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(max_capacity)
                .time_to_live(Duration::from_secs(10 * 60))
                .build(),
        }
    }
}

#[async_trait]
impl ByteCache for MokaCache {
    fn id(&self) -> &'static str {
        "moka"
    }

    async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let (deadline, bytes) = self.inner.get(key).await?;
        if Instant::now() >= deadline {
            self.inner.invalidate(key).await;
            return None;
        }
        Some(bytes)
    }

    async fn put(&self, key: String, value: Vec<u8>, ttl: Duration) {
        self.inner.insert(key, (Instant::now() + ttl, value)).await;
    }

    async fn remove(&self, key: &str) {
        self.inner.invalidate(key).await;
    }
}

/// The `none` cache: every lookup misses.
pub struct NoCache;

#[async_trait]
impl ByteCache for NoCache {
    fn id(&self) -> &'static str {
        "none"
    }

    async fn get(&self, _key: &str) -> Option<Vec<u8>> {
        None
    }

    async fn put(&self, _key: String, _value: Vec<u8>, _ttl: Duration) {}

    async fn remove(&self, _key: &str) {}
}
