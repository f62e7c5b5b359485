use crate::config::CacheConfig;
use crate::error::GatewayError;
use bytes::Bytes;
use dashmap::DashMap;
use http::{HeaderMap, Method, StatusCode};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const GC_INTERVAL_SECS: u64 = 30;
const DEFAULT_MAX_ENTRIES: usize = 50_000;

/// A route's compiled cache rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePolicy {
    pub ttl: Duration,
    pub region: String,
    pub hash_body: bool,
}

impl CachePolicy {
    pub fn from_config(cfg: &CacheConfig, methods: &[Method], upstream_template: &str) -> Self {
        let region = match cfg.region.as_deref().map(str::trim) {
            Some(r) if !r.is_empty() => r.to_string(),
            _ => derive_region(methods, upstream_template),
        };
        Self {
            ttl: Duration::from_secs(cfg.ttl_seconds),
            region,
            hash_body: cfg.hash_body,
        }
    }

    /// Only safe, idempotent reads are served from or written to the cache.
    pub fn is_cacheable(method: &Method) -> bool {
        *method == Method::GET || *method == Method::HEAD
    }
}

/// `GET` + `/api/products/{id}` gives `GETapiproductsid`.
fn derive_region(methods: &[Method], upstream_template: &str) -> String {
    methods
        .iter()
        .map(Method::as_str)
        .chain(std::iter::once(upstream_template))
        .flat_map(str::chars)
        .filter(char::is_ascii_alphanumeric)
        .collect()
}

/// Cache key for one downstream call. Requests that resolve to the same
/// downstream path on the same route share a key whatever their upstream path.
pub fn cache_key(
    method: &Method,
    route_key: &str,
    downstream_path_and_query: &str,
    body: Option<&[u8]>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(method.as_str().as_bytes());
    hasher.update(b"\n");
    hasher.update(route_key.as_bytes());
    hasher.update(b"\n");
    hasher.update(downstream_path_and_query.as_bytes());
    if let Some(body) = body {
        hasher.update(b"\n");
        hasher.update(Sha256::digest(body));
    }
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, PartialEq)]
pub struct CachedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

struct CacheEntry {
    response: Arc<CachedResponse>,
    region: String,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// In-memory TTL cache of downstream responses, partitioned by region.
pub struct OutputCache {
    entries: DashMap<String, CacheEntry>,
    max_entries: usize,
}

impl Default for OutputCache {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_MAX_ENTRIES)
    }
}

impl OutputCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries,
        }
    }

    /// Expired entries read as absent.
    pub fn get(&self, key: &str, region: &str) -> Option<Arc<CachedResponse>> {
        let entry = self.entries.get(key)?;
        if entry.region != region || entry.is_expired(Instant::now()) {
            return None;
        }
        Some(entry.response.clone())
    }

    /// Store `value` under `key`, replacing whatever was there.
    ///
    /// Fails with `CacheUnavailable` when the cache is at capacity even after
    /// dropping expired entries.
    pub fn add(
        &self,
        key: &str,
        value: CachedResponse,
        ttl: Duration,
        region: &str,
    ) -> Result<(), GatewayError> {
        if self.entries.len() >= self.max_entries && !self.entries.contains_key(key) {
            self.evict_expired();
            if self.entries.len() >= self.max_entries {
                return Err(GatewayError::CacheUnavailable(format!(
                    "cache full ({} entries)",
                    self.max_entries
                )));
            }
        }
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                response: Arc::new(value),
                region: region.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    /// Remove every entry tagged with `region`. Returns how many were removed.
    pub fn clear_region(&self, region: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.region != region);
        let removed = before.saturating_sub(self.entries.len());
        tracing::info!("cache: cleared region, region={}, removed={}", region, removed);
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn evict_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|_, e| !e.is_expired(now));
    }

    /// Spawn a background task that periodically drops expired entries.
    pub fn start_gc(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(GC_INTERVAL_SECS));
            loop {
                interval.tick().await;
                cache.evict_expired();
            }
        })
    }
}
