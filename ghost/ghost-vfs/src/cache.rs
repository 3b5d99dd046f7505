//! Process-wide object cache with explicit invalidation.
//!
//! Scoped services cache raw file buffers under `buffer::<path>` and decoded
//! JSON under `object::<path>`. The cache also carries an event channel:
//! invalidations are announced to local subscribers, and `sync` broadcasts a
//! serialized [`SyncRequest`](crate::types::SyncRequest) asking peers to pull
//! a folder from the database to disk.

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::{debug, trace};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Key type prefixes stripped before prefix invalidation.
const KEY_KINDS: &[&str] = &["buffer::", "object::", "string::"];

pub fn buffer_key(path: &str) -> String {
    format!("buffer::{}", path)
}

pub fn object_key(path: &str) -> String {
    format!("object::{}", path)
}

/// A cached value.
#[derive(Debug, Clone, PartialEq)]
pub enum CachedValue {
    Buffer(Arc<Vec<u8>>),
    Object(Arc<Value>),
}

impl CachedValue {
    pub fn buffer(bytes: Vec<u8>) -> Self {
        Self::Buffer(Arc::new(bytes))
    }

    pub fn object(value: Value) -> Self {
        Self::Object(Arc::new(value))
    }

    /// Approximate memory footprint in bytes.
    pub fn size(&self) -> usize {
        match self {
            Self::Buffer(bytes) => bytes.len(),
            Self::Object(value) => estimate_value_size(value),
        }
    }

    pub fn as_buffer(&self) -> Option<Arc<Vec<u8>>> {
        match self {
            Self::Buffer(bytes) => Some(Arc::clone(bytes)),
            Self::Object(_) => None,
        }
    }

    pub fn as_object(&self) -> Option<Arc<Value>> {
        match self {
            Self::Object(value) => Some(Arc::clone(value)),
            Self::Buffer(_) => None,
        }
    }
}

fn estimate_value_size(value: &Value) -> usize {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 4,
        Value::Number(_) => 8,
        Value::String(s) => s.len() * 2,
        Value::Array(items) => items.iter().map(estimate_value_size).sum(),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| k.len() * 2 + estimate_value_size(v))
            .sum(),
    }
}

/// Events published on the cache channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    /// A key was dropped or overwritten
    Invalidated(String),
    /// A peer asked for a database to disk pull; carries a JSON `SyncRequest`
    SyncRequested(String),
}

/// Keyed store with an event emitter.
#[async_trait]
pub trait ObjectCache: Send + Sync {
    async fn get(&self, key: &str) -> Option<CachedValue>;

    async fn set(&self, key: &str, value: CachedValue);

    async fn has(&self, key: &str) -> bool;

    /// Remove one key. Emits an invalidation only if something was removed.
    async fn invalidate(&self, key: &str);

    /// Remove every key whose path part starts with `prefix`.
    async fn invalidate_starting_with(&self, prefix: &str);

    /// Broadcast a sync request message.
    async fn sync(&self, message: &str);

    fn subscribe(&self) -> broadcast::Receiver<CacheEvent>;
}

// ============================================================================
// In-memory implementation
// ============================================================================

struct Inner {
    entries: LruCache<String, CachedValue>,
    size_bytes: usize,
}

/// LRU cache bounded by a byte budget.
pub struct MemoryObjectCache {
    inner: Mutex<Inner>,
    max_size: usize,
    events: broadcast::Sender<CacheEvent>,
    stats: CacheStats,
}

impl MemoryObjectCache {
    pub fn new(max_size: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::unbounded(),
                size_bytes: 0,
            }),
            max_size,
            events,
            stats: CacheStats::default(),
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    pub fn size_bytes(&self) -> usize {
        self.inner.lock().size_bytes
    }

    pub fn stats(&self) -> CacheStatistics {
        self.stats.snapshot()
    }

    fn emit(&self, event: CacheEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }

    fn remove_locked(inner: &mut Inner, key: &str) -> bool {
        match inner.entries.pop(key) {
            Some(old) => {
                inner.size_bytes = inner.size_bytes.saturating_sub(old.size());
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl ObjectCache for MemoryObjectCache {
    async fn get(&self, key: &str) -> Option<CachedValue> {
        let value = self.inner.lock().entries.get(key).cloned();
        match value {
            Some(_) => self.stats.hits.fetch_add(1, Ordering::Relaxed),
            None => self.stats.misses.fetch_add(1, Ordering::Relaxed),
        };
        value
    }

    async fn set(&self, key: &str, value: CachedValue) {
        let size = value.size();
        let mut evicted = 0u64;

        let replaced = {
            let mut inner = self.inner.lock();

            if size > self.max_size {
                // Too large to ever fit; drop any stale value without announcing it.
                Self::remove_locked(&mut inner, key);
                trace!("Not caching {} ({} bytes over budget)", key, size);
                return;
            }

            let replaced = Self::remove_locked(&mut inner, key);

            while inner.size_bytes + size > self.max_size {
                match inner.entries.pop_lru() {
                    Some((_, old)) => {
                        inner.size_bytes = inner.size_bytes.saturating_sub(old.size());
                        evicted += 1;
                    }
                    None => break,
                }
            }

            inner.entries.put(key.to_string(), value);
            inner.size_bytes += size;
            replaced
        };

        self.stats.puts.fetch_add(1, Ordering::Relaxed);
        self.stats.evictions.fetch_add(evicted, Ordering::Relaxed);

        if replaced {
            self.emit(CacheEvent::Invalidated(key.to_string()));
        }
    }

    async fn has(&self, key: &str) -> bool {
        self.inner.lock().entries.contains(key)
    }

    async fn invalidate(&self, key: &str) {
        let removed = Self::remove_locked(&mut self.inner.lock(), key);
        if removed {
            trace!("Invalidated {}", key);
            self.emit(CacheEvent::Invalidated(key.to_string()));
        }
    }

    async fn invalidate_starting_with(&self, prefix: &str) {
        let removed: Vec<String> = {
            let mut inner = self.inner.lock();
            let matching: Vec<String> = inner
                .entries
                .iter()
                .map(|(k, _)| k)
                .filter(|k| key_path(k).starts_with(prefix) || k.starts_with(prefix))
                .cloned()
                .collect();

            for key in &matching {
                Self::remove_locked(&mut inner, key);
            }
            matching
        };

        if !removed.is_empty() {
            debug!("Invalidated {} cache entries under {}", removed.len(), prefix);
        }
        for key in removed {
            self.emit(CacheEvent::Invalidated(key));
        }
    }

    async fn sync(&self, message: &str) {
        debug!("Broadcasting sync request: {}", message);
        self.emit(CacheEvent::SyncRequested(message.to_string()));
    }

    fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }
}

fn key_path(key: &str) -> &str {
    KEY_KINDS
        .iter()
        .find_map(|kind| key.strip_prefix(kind))
        .unwrap_or(key)
}

#[derive(Default)]
struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    puts: AtomicU64,
    evictions: AtomicU64,
}

impl CacheStats {
    fn snapshot(&self) -> CacheStatistics {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStatistics {
            hits,
            misses,
            puts: self.puts.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
        }
    }
}

/// Snapshot of cache statistics.
#[derive(Debug, Clone, Copy)]
pub struct CacheStatistics {
    pub hits: u64,
    pub misses: u64,
    pub puts: u64,
    pub evictions: u64,
    pub hit_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::broadcast::error::TryRecvError;

    const A_KEY: &str = "key";
    const ANOTHER_KEY: &str = "another key";
    const MAX_CACHE_SIZE: usize = 24;

    fn small() -> CachedValue {
        CachedValue::buffer(b"a value".to_vec())
    }

    fn huge() -> CachedValue {
        CachedValue::buffer(vec![7u8; MAX_CACHE_SIZE + 1])
    }

    #[tokio::test]
    async fn test_set_get_has() {
        let cache = MemoryObjectCache::new(MAX_CACHE_SIZE);
        assert!(cache.get(A_KEY).await.is_none());
        assert!(!cache.has(A_KEY).await);

        cache.set(A_KEY, small()).await;
        assert!(cache.has(A_KEY).await);
        assert!(!cache.has("invalid key").await);
        assert_eq!(cache.get(A_KEY).await, Some(small()));

        cache.set(A_KEY, CachedValue::object(json!({"key": "value"}))).await;
        let obj = cache.get(A_KEY).await.unwrap().as_object().unwrap();
        assert_eq!(obj["key"], "value");
    }

    #[tokio::test]
    async fn test_oversized_value_is_not_cached_and_drops_previous_silently() {
        let cache = MemoryObjectCache::new(MAX_CACHE_SIZE);
        let mut rx = cache.subscribe();

        cache.set(A_KEY, small()).await;
        cache.set(A_KEY, huge()).await;

        assert!(!cache.has(A_KEY).await);
        assert_eq!(cache.size_bytes(), 0);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_overwrite_emits_invalidation() {
        let cache = MemoryObjectCache::new(MAX_CACHE_SIZE);
        let mut rx = cache.subscribe();

        cache.set(A_KEY, small()).await;
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        cache.set(A_KEY, small()).await;
        assert_eq!(
            rx.try_recv().unwrap(),
            CacheEvent::Invalidated(A_KEY.to_string())
        );
    }

    #[tokio::test]
    async fn test_invalidate_emits_only_when_removed() {
        let cache = MemoryObjectCache::new(MAX_CACHE_SIZE);
        let mut rx = cache.subscribe();

        cache.invalidate(A_KEY).await;
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        cache.set(A_KEY, small()).await;
        cache.set(ANOTHER_KEY, CachedValue::buffer(b"x".to_vec())).await;
        cache.invalidate(A_KEY).await;

        assert!(!cache.has(A_KEY).await);
        assert!(cache.has(ANOTHER_KEY).await);
        assert_eq!(
            rx.try_recv().unwrap(),
            CacheEvent::Invalidated(A_KEY.to_string())
        );
    }

    #[tokio::test]
    async fn test_invalidate_starting_with() {
        let cache = MemoryObjectCache::new(1024);
        let keys = [
            format!("buffer::{}", A_KEY),
            format!("object::{}", A_KEY),
            format!("string::{}", A_KEY),
        ];
        for key in &keys {
            cache.set(key, small()).await;
        }
        cache.set(ANOTHER_KEY, small()).await;

        cache.invalidate_starting_with(A_KEY).await;

        for key in &keys {
            assert!(!cache.has(key).await);
        }
        assert!(cache.has(ANOTHER_KEY).await);
    }

    #[tokio::test]
    async fn test_lru_eviction_respects_budget() {
        let cache = MemoryObjectCache::new(20);
        cache.set("a", CachedValue::buffer(vec![0; 8])).await;
        cache.set("b", CachedValue::buffer(vec![0; 8])).await;
        // Touch "a" so "b" becomes least recently used.
        cache.get("a").await;
        cache.set("c", CachedValue::buffer(vec![0; 8])).await;

        assert!(cache.has("a").await);
        assert!(!cache.has("b").await);
        assert!(cache.has("c").await);
        assert!(cache.size_bytes() <= 20);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test]
    async fn test_sync_emits_message() {
        let cache = MemoryObjectCache::new(MAX_CACHE_SIZE);
        let mut rx = cache.subscribe();

        cache.sync("a message").await;
        assert_eq!(
            rx.try_recv().unwrap(),
            CacheEvent::SyncRequested("a message".to_string())
        );
    }
}
