//! Typed TTL/LRU key-value store.
//!
//! Production deployments point the `CacheStore` trait at a networked
//! backend; the bundled `MemoryCache` keeps the same async surface
//! (get/set/delete with per-namespace TTLs) over an in-process LRU so the
//! core and the test suite run without external services.
//!
//! Namespaces are typed so each call site states which policy applies:
//! activation and device-status operations fail closed when the cache is
//! down, intent/location lookups fail open and recompute.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lru::LruCache;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),
    #[error("cache value decode failed: {0}")]
    Decode(String),
}

/// Cache namespaces with their default TTLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKind {
    /// Activation payloads keyed by MAC. 24 hour TTL. Fails closed.
    Activation,
    /// Reverse activation index, code -> MAC. 24 hour TTL. Fails closed.
    ActivationCode,
    /// Device connectivity status. 5 minute TTL. Fails closed.
    Device,
    /// Resolved client location info. 1 hour TTL. Fails open.
    IpInfo,
    /// Intent recognition results. 10 minute TTL. Fails open.
    Intent,
    /// General configuration snapshots. 5 minute TTL. Fails open.
    Config,
}

impl CacheKind {
    pub fn ttl(self) -> Duration {
        match self {
            CacheKind::Activation | CacheKind::ActivationCode => Duration::from_secs(86_400),
            CacheKind::Device | CacheKind::Config => Duration::from_secs(300),
            CacheKind::IpInfo => Duration::from_secs(3_600),
            CacheKind::Intent => Duration::from_secs(600),
        }
    }

    /// Whether callers must treat backend failure as a hard error.
    pub fn fails_closed(self) -> bool {
        matches!(
            self,
            CacheKind::Activation | CacheKind::ActivationCode | CacheKind::Device
        )
    }

    fn prefix(self) -> &'static str {
        match self {
            CacheKind::Activation => "activation",
            CacheKind::ActivationCode => "activation_code",
            CacheKind::Device => "device",
            CacheKind::IpInfo => "ip_info",
            CacheKind::Intent => "intent",
            CacheKind::Config => "config",
        }
    }
}

fn full_key(kind: CacheKind, key: &str) -> String {
    format!("{}:{}", kind.prefix(), key)
}

/// Async key-value store with JSON values and per-entry TTLs.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, kind: CacheKind, key: &str) -> Result<Option<Value>, CacheError>;
    async fn set(&self, kind: CacheKind, key: &str, value: Value) -> Result<(), CacheError>;
    async fn set_with_ttl(
        &self,
        kind: CacheKind,
        key: &str,
        value: Value,
        ttl: Duration,
    ) -> Result<(), CacheError>;
    async fn delete(&self, kind: CacheKind, key: &str) -> Result<bool, CacheError>;
}

/// Typed convenience wrappers shared by every `CacheStore`.
pub async fn get_typed<T: DeserializeOwned>(
    store: &dyn CacheStore,
    kind: CacheKind,
    key: &str,
) -> Result<Option<T>, CacheError> {
    match store.get(kind, key).await? {
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(|e| CacheError::Decode(e.to_string())),
        None => Ok(None),
    }
}

pub async fn set_typed<T: Serialize>(
    store: &dyn CacheStore,
    kind: CacheKind,
    key: &str,
    value: &T,
) -> Result<(), CacheError> {
    let value =
        serde_json::to_value(value).map_err(|e| CacheError::Decode(e.to_string()))?;
    store.set(kind, key, value).await
}

struct Entry {
    value: Value,
    expires_at: Instant,
}

/// In-process LRU cache with per-entry TTLs.
pub struct MemoryCache {
    entries: Mutex<LruCache<String, Entry>>,
}

const DEFAULT_CAPACITY: usize = 4096;

impl MemoryCache {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, kind: CacheKind, key: &str) -> Result<Option<Value>, CacheError> {
        let key = full_key(kind, key);
        let mut entries = self.entries.lock().unwrap();
        let hit = entries
            .get(&key)
            .map(|entry| (entry.expires_at > Instant::now(), entry.value.clone()));
        match hit {
            Some((true, value)) => Ok(Some(value)),
            Some((false, _)) => {
                entries.pop(&key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, kind: CacheKind, key: &str, value: Value) -> Result<(), CacheError> {
        self.set_with_ttl(kind, key, value, kind.ttl()).await
    }

    async fn set_with_ttl(
        &self,
        kind: CacheKind,
        key: &str,
        value: Value,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let mut entries = self.entries.lock().unwrap();
        entries.put(
            full_key(kind, key),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, kind: CacheKind, key: &str) -> Result<bool, CacheError> {
        let mut entries = self.entries.lock().unwrap();
        Ok(entries.pop(&full_key(kind, key)).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn set_get_delete() {
        let cache = MemoryCache::new();
        cache
            .set(CacheKind::Device, "AA:BB", json!("connected"))
            .await
            .unwrap();
        assert_eq!(
            cache.get(CacheKind::Device, "AA:BB").await.unwrap(),
            Some(json!("connected"))
        );
        assert!(cache.delete(CacheKind::Device, "AA:BB").await.unwrap());
        assert_eq!(cache.get(CacheKind::Device, "AA:BB").await.unwrap(), None);
    }

    #[tokio::test]
    async fn namespaces_do_not_collide() {
        let cache = MemoryCache::new();
        cache
            .set(CacheKind::Activation, "123456", json!("mac-a"))
            .await
            .unwrap();
        assert_eq!(
            cache.get(CacheKind::ActivationCode, "123456").await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn ttl_expiry() {
        let cache = MemoryCache::new();
        cache
            .set_with_ttl(
                CacheKind::Intent,
                "q",
                json!(1),
                Duration::from_millis(20),
            )
            .await
            .unwrap();
        assert!(cache.get(CacheKind::Intent, "q").await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cache.get(CacheKind::Intent, "q").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lru_evicts_oldest() {
        let cache = MemoryCache::with_capacity(2);
        cache.set(CacheKind::Config, "a", json!(1)).await.unwrap();
        cache.set(CacheKind::Config, "b", json!(2)).await.unwrap();
        cache.set(CacheKind::Config, "c", json!(3)).await.unwrap();
        assert!(cache.get(CacheKind::Config, "a").await.unwrap().is_none());
        assert!(cache.get(CacheKind::Config, "c").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn typed_wrappers() {
        #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
        struct City {
            city: String,
        }
        let cache = MemoryCache::new();
        set_typed(
            &cache,
            CacheKind::IpInfo,
            "1.2.3.4",
            &City {
                city: "Hanoi".to_string(),
            },
        )
        .await
        .unwrap();
        let got: Option<City> = get_typed(&cache, CacheKind::IpInfo, "1.2.3.4").await.unwrap();
        assert_eq!(
            got,
            Some(City {
                city: "Hanoi".to_string()
            })
        );
    }

    #[test]
    fn policy_table() {
        assert!(CacheKind::Activation.fails_closed());
        assert!(CacheKind::Device.fails_closed());
        assert!(!CacheKind::IpInfo.fails_closed());
        assert_eq!(CacheKind::Activation.ttl(), Duration::from_secs(86_400));
    }
}
