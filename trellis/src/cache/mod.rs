//! Read-through caches for hot gateway state.
//!
//! Agent records, bootstrap bundles, skills summaries, and cron tables are
//! read on every run; these caches sit in front of the stores and are
//! dropped by the matching `cache:*` invalidation events on the bus.

mod error;

pub use error::CacheError;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::bus::{BusEvent, CacheDomain, MessageBus};

/// Key-value cache with optional TTL.
#[async_trait]
pub trait Cache<K, V>: Send + Sync
where
    K: Send + Sync,
    V: Clone + Send + Sync,
{
    async fn get(&self, key: &K) -> Option<V>;
    async fn set(&self, key: K, value: V, ttl: Option<Duration>) -> Result<(), CacheError>;
    async fn delete(&self, key: &K) -> Result<(), CacheError>;
    async fn clear(&self) -> Result<(), CacheError>;
}

struct Entry<V> {
    value: V,
    expires_at: Option<Instant>,
}

/// Process-local cache.
pub struct InMemoryCache<K, V> {
    entries: Mutex<HashMap<K, Entry<V>>>,
}

impl<K, V> InMemoryCache<K, V>
where
    K: std::hash::Hash + Eq + Send + Sync,
    V: Clone + Send + Sync,
{
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> Default for InMemoryCache<K, V>
where
    K: std::hash::Hash + Eq + Send + Sync,
    V: Clone + Send + Sync,
{
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<K, V> Cache<K, V> for InMemoryCache<K, V>
where
    K: std::hash::Hash + Eq + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    async fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) => {
                if entry
                    .expires_at
                    .map(|t| Instant::now() >= t)
                    .unwrap_or(false)
                {
                    entries.remove(key);
                    None
                } else {
                    Some(entry.value.clone())
                }
            }
            None => None,
        }
    }

    async fn set(&self, key: K, value: V, ttl: Option<Duration>) -> Result<(), CacheError> {
        self.entries.lock().await.insert(
            key,
            Entry {
                value,
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &K) -> Result<(), CacheError> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.entries.lock().await.clear();
        Ok(())
    }
}

/// Subscribes to the bus and clears `cache` whenever its domain is
/// invalidated. Returns the listener task handle; dropping it stops the
/// listener with the session.
pub fn listen_for_invalidation<K, V>(
    bus: &MessageBus,
    domain: CacheDomain,
    cache: Arc<dyn Cache<K, V>>,
) -> tokio::task::JoinHandle<()>
where
    K: Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    let mut events = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(BusEvent::CacheInvalidated(d)) if d == domain => {
                    if let Err(e) = cache.clear().await {
                        tracing::warn!(error = %e, "cache clear failed");
                    }
                }
                Ok(BusEvent::Shutdown) => break,
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    // Missed events may include an invalidation; clearing is
                    // the safe recovery.
                    tracing::warn!(missed = n, "cache listener lagged; clearing");
                    let _ = cache.clear().await;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
