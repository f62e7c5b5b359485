use crate::config::{RateLimitConfig, RateLimitGlobalConfig};
use crate::error::GatewayError;
use dashmap::DashMap;
use http::{HeaderMap, HeaderName, HeaderValue};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Counters whose window closed are evicted on this interval.
const GC_INTERVAL_SECS: u64 = 60;
/// Hard cap on live counters. Past it, the counters closest to their window
/// end are force-evicted.
const MAX_ENTRIES: usize = 100_000;

const DEFAULT_QUOTA_MESSAGE: &str = "API calls quota exceeded! maximum admitted {0} per {1}.";
/// Client identifier used when the request carries no client id header.
pub const ANONYMOUS_CLIENT: &str = "anonymous";

static X_RATE_LIMIT_LIMIT: HeaderName = HeaderName::from_static("x-rate-limit-limit");
static X_RATE_LIMIT_REMAINING: HeaderName = HeaderName::from_static("x-rate-limit-remaining");
static X_RATE_LIMIT_RESET: HeaderName = HeaderName::from_static("x-rate-limit-reset");

/// Parse a window length such as `1s`, `5m`, `1h` or `1d`.
pub fn parse_period(period: &str) -> Result<Duration, GatewayError> {
    let d = humantime::parse_duration(period.trim())
        .map_err(|e| GatewayError::Config(format!("invalid period '{}': {}", period, e)))?;
    if d.is_zero() {
        return Err(GatewayError::Config(format!("period '{}' must be positive", period)));
    }
    Ok(d)
}

/// A route's compiled rate-limit rule merged with the global options.
#[derive(Debug, Clone)]
pub struct RateLimitPolicy {
    pub client_id_header: HeaderName,
    pub client_whitelist: HashSet<String>,
    pub period: Duration,
    /// The period as written in config, echoed in `X-Rate-Limit-Limit`.
    pub period_label: String,
    pub limit: u64,
    pub disable_headers: bool,
    pub quota_exceeded_message: String,
    pub http_status_code: u16,
    pub counter_prefix: String,
}

impl RateLimitPolicy {
    /// `Ok(None)` when the route disables rate limiting.
    pub fn from_config(
        cfg: &RateLimitConfig,
        global: &RateLimitGlobalConfig,
    ) -> Result<Option<Self>, GatewayError> {
        if !cfg.enable_rate_limiting {
            return Ok(None);
        }
        if cfg.limit == 0 {
            return Err(GatewayError::Config(
                "rate limit must be greater than 0".to_string(),
            ));
        }
        let client_id_header = HeaderName::from_bytes(global.client_id_header.as_bytes())
            .map_err(|e| {
                GatewayError::Config(format!(
                    "invalid client id header '{}': {}",
                    global.client_id_header, e
                ))
            })?;

        Ok(Some(Self {
            client_id_header,
            client_whitelist: cfg.client_whitelist.iter().cloned().collect(),
            period: parse_period(&cfg.period)?,
            period_label: cfg.period.trim().to_string(),
            limit: cfg.limit,
            disable_headers: global.disable_rate_limit_headers,
            quota_exceeded_message: global
                .quota_exceeded_message
                .clone()
                .unwrap_or_else(|| DEFAULT_QUOTA_MESSAGE.to_string()),
            http_status_code: global.http_status_code,
            counter_prefix: global.counter_prefix.clone(),
        }))
    }

    pub fn client_id(&self, headers: &HeaderMap) -> String {
        headers
            .get(&self.client_id_header)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .unwrap_or(ANONYMOUS_CLIENT)
            .to_string()
    }

    pub fn is_whitelisted(&self, client_id: &str) -> bool {
        self.client_whitelist.contains(client_id)
    }

    /// Quota message with `{0}` as the limit and `{1}` as the period.
    pub fn quota_message(&self) -> String {
        self.quota_exceeded_message
            .replace("{0}", itoa::Buffer::new().format(self.limit))
            .replace("{1}", &self.period_label)
    }

    pub fn rejection(&self) -> GatewayError {
        GatewayError::RateLimited {
            message: self.quota_message(),
            status: self.http_status_code,
        }
    }
}

/// Outcome of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u64,
    /// Time until the current window closes.
    pub reset_after: Duration,
}

impl RateLimitDecision {
    /// Advisory headers for this decision. Empty when the policy disables them.
    pub fn headers(&self, policy: &RateLimitPolicy) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if policy.disable_headers {
            return headers;
        }
        if self.allowed {
            if let Ok(v) = HeaderValue::from_str(&policy.period_label) {
                headers.insert(X_RATE_LIMIT_LIMIT.clone(), v);
            }
            let mut buf = itoa::Buffer::new();
            if let Ok(v) = HeaderValue::from_str(buf.format(self.remaining)) {
                headers.insert(X_RATE_LIMIT_REMAINING.clone(), v);
            }
            let reset_at = SystemTime::now() + self.reset_after;
            let reset = humantime::format_rfc3339_seconds(reset_at).to_string();
            if let Ok(v) = HeaderValue::from_str(&reset) {
                headers.insert(X_RATE_LIMIT_RESET.clone(), v);
            }
        } else {
            // Whole seconds, rounded up so clients never retry early.
            let secs = self.reset_after.as_secs() + u64::from(self.reset_after.subsec_nanos() > 0);
            let mut buf = itoa::Buffer::new();
            if let Ok(v) = HeaderValue::from_str(buf.format(secs.max(1))) {
                headers.insert(http::header::RETRY_AFTER, v);
            }
        }
        headers
    }
}

/// Fixed-window counter for one (route, client) pair.
struct Counter {
    inner: Mutex<CounterInner>,
    /// Window end in microseconds since the limiter's epoch. Read by GC
    /// without taking the lock.
    window_end_us: AtomicU64,
}

impl Counter {
    fn is_busy(&self) -> bool {
        self.inner.try_lock().is_err()
    }
}

struct CounterInner {
    window_start: Instant,
    count: u64,
}

/// Per-client fixed-window rate limiter shared by every route.
pub struct RateLimiter {
    counters: DashMap<String, Arc<Counter>>,
    epoch: Instant,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self {
            counters: DashMap::new(),
            epoch: Instant::now(),
        }
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    fn now_us(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.epoch).as_micros() as u64
    }

    /// Count one attempt by `client_id` on `route_key`.
    ///
    /// The window opens on the first attempt and resets once `period` has
    /// elapsed. Denied attempts do not consume quota.
    pub async fn check(
        &self,
        route_key: &str,
        client_id: &str,
        policy: &RateLimitPolicy,
    ) -> RateLimitDecision {
        let key = format!("{}:{}:{}", policy.counter_prefix, route_key, client_id);

        loop {
            // Fast path: key already exists.
            let counter = if let Some(entry) = self.counters.get(&key) {
                entry.value().clone()
            } else {
                self.counters
                    .entry(key.clone())
                    .or_insert_with(|| {
                        let now = Instant::now();
                        Arc::new(Counter {
                            inner: Mutex::new(CounterInner {
                                window_start: now,
                                count: 0,
                            }),
                            window_end_us: AtomicU64::new(self.now_us(now + policy.period)),
                        })
                    })
                    .clone()
            };

            let mut c = counter.inner.lock().await;
            // GC may have evicted the counter while we waited for its lock.
            // Counting against an orphan would split the window in two.
            let live = self
                .counters
                .get(&key)
                .is_some_and(|e| Arc::ptr_eq(e.value(), &counter));
            if live {
                return self.admit(&counter, &mut c, route_key, client_id, policy);
            }
        }
    }

    fn admit(
        &self,
        counter: &Counter,
        c: &mut CounterInner,
        route_key: &str,
        client_id: &str,
        policy: &RateLimitPolicy,
    ) -> RateLimitDecision {
        let now = Instant::now();
        if now.saturating_duration_since(c.window_start) >= policy.period {
            c.window_start = now;
            c.count = 0;
            counter
                .window_end_us
                .store(self.now_us(now + policy.period), Ordering::Relaxed);
        }
        let reset_after = (c.window_start + policy.period).saturating_duration_since(now);

        if c.count >= policy.limit {
            tracing::debug!(
                "ratelimit: rejected, route={}, client={}, limit={}, period={}",
                route_key,
                client_id,
                policy.limit,
                policy.period_label
            );
            metrics::counter!(
                "gateway_rate_limit_rejected_total",
                "route" => route_key.to_string(),
            )
            .increment(1);
            return RateLimitDecision {
                allowed: false,
                remaining: 0,
                reset_after,
            };
        }

        c.count += 1;
        RateLimitDecision {
            allowed: true,
            remaining: policy.limit - c.count,
            reset_after,
        }
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Spawn a background task that periodically evicts closed windows.
    pub fn start_gc(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(GC_INTERVAL_SECS));
            loop {
                interval.tick().await;
                limiter.evict_stale();
            }
        })
    }

    /// Drop counters whose window already closed. Such a counter would reset
    /// on its next use anyway. Counters locked by an in-progress check stay.
    pub fn evict_stale(&self) {
        let now = self.now_us(Instant::now());
        self.counters
            .retain(|_, c| c.window_end_us.load(Ordering::Relaxed) > now || c.is_busy());

        let overflow = self.counters.len().saturating_sub(MAX_ENTRIES);
        if overflow > 0 {
            let mut entries: Vec<(String, u64)> = self
                .counters
                .iter()
                .map(|r| (r.key().clone(), r.value().window_end_us.load(Ordering::Relaxed)))
                .collect();
            entries.sort_unstable_by_key(|e| e.1);
            for (key, _) in entries.into_iter().take(overflow) {
                self.counters.remove_if(&key, |_, c| !c.is_busy());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(limit: u64, period: &str) -> RateLimitPolicy {
        RateLimitPolicy::from_config(
            &RateLimitConfig {
                enable_rate_limiting: true,
                client_whitelist: vec!["trusted".into()],
                period: period.into(),
                limit,
            },
            &RateLimitGlobalConfig::default(),
        )
        .unwrap()
        .unwrap()
    }

    #[test]
    fn test_parse_period() {
        assert_eq!(parse_period("1s").unwrap(), Duration::from_secs(1));
        assert_eq!(parse_period("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_period("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_period("1d").unwrap(), Duration::from_secs(86_400));
        assert!(parse_period("0s").is_err());
        assert!(parse_period("soon").is_err());
    }

    #[test]
    fn test_disabled_policy_compiles_to_none() {
        let cfg = RateLimitConfig {
            enable_rate_limiting: false,
            client_whitelist: vec![],
            period: "nonsense".into(),
            limit: 0,
        };
        assert!(RateLimitPolicy::from_config(&cfg, &RateLimitGlobalConfig::default())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_client_id_and_whitelist() {
        let p = policy(1, "1s");
        let mut headers = HeaderMap::new();
        assert_eq!(p.client_id(&headers), ANONYMOUS_CLIENT);
        headers.insert("clientid", HeaderValue::from_static("trusted"));
        assert_eq!(p.client_id(&headers), "trusted");
        assert!(p.is_whitelisted("trusted"));
        assert!(!p.is_whitelisted(ANONYMOUS_CLIENT));
    }

    #[test]
    fn test_quota_message_formatting() {
        let p = policy(5, "1m");
        assert_eq!(
            p.quota_message(),
            "API calls quota exceeded! maximum admitted 5 per 1m."
        );
        match p.rejection() {
            GatewayError::RateLimited { status, .. } => assert_eq!(status, 429),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_limit_then_deny_then_reset() {
        let limiter = RateLimiter::new();
        let p = policy(3, "1s");

        for expected_remaining in [2, 1, 0] {
            let d = limiter.check("r", "c", &p).await;
            assert!(d.allowed);
            assert_eq!(d.remaining, expected_remaining);
        }
        let denied = limiter.check("r", "c", &p).await;
        assert!(!denied.allowed);
        // Denials do not push the window.
        assert!(!limiter.check("r", "c", &p).await.allowed);

        tokio::time::advance(Duration::from_secs(1)).await;
        let d = limiter.check("r", "c", &p).await;
        assert!(d.allowed);
        assert_eq!(d.remaining, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_counters_are_per_client_and_route() {
        let limiter = RateLimiter::new();
        let p = policy(1, "1m");
        assert!(limiter.check("r1", "a", &p).await.allowed);
        assert!(!limiter.check("r1", "a", &p).await.allowed);
        assert!(limiter.check("r1", "b", &p).await.allowed);
        assert!(limiter.check("r2", "a", &p).await.allowed);
        assert_eq!(limiter.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_headers_on_admission_and_denial() {
        let limiter = RateLimiter::new();
        let p = policy(1, "30s");

        let ok = limiter.check("r", "c", &p).await.headers(&p);
        assert_eq!(ok["x-rate-limit-limit"], "30s");
        assert_eq!(ok["x-rate-limit-remaining"], "0");
        assert!(ok.contains_key("x-rate-limit-reset"));

        tokio::time::advance(Duration::from_millis(10_500)).await;
        let denied = limiter.check("r", "c", &p).await.headers(&p);
        assert_eq!(denied[http::header::RETRY_AFTER], "20");
        assert!(!denied.contains_key("x-rate-limit-remaining"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_headers() {
        let limiter = RateLimiter::new();
        let mut p = policy(1, "1s");
        p.disable_headers = true;
        assert!(limiter.check("r", "c", &p).await.headers(&p).is_empty());
        assert!(limiter.check("r", "c", &p).await.headers(&p).is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_admissions_never_exceed_limit() {
        let limiter = Arc::new(RateLimiter::new());
        let p = Arc::new(policy(25, "1h"));
        let handles: Vec<_> = (0..100)
            .map(|_| {
                let limiter = limiter.clone();
                let p = p.clone();
                tokio::spawn(async move { limiter.check("r", "c", &p).await.allowed })
            })
            .collect();
        let mut admitted = 0;
        for h in handles {
            if h.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 25);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gc_evicts_closed_windows() {
        let limiter = RateLimiter::new();
        let short = policy(1, "1s");
        let long = policy(1, "1h");
        limiter.check("r", "short", &short).await;
        limiter.check("r", "long", &long).await;

        tokio::time::advance(Duration::from_secs(2)).await;
        limiter.evict_stale();
        assert_eq!(limiter.len(), 1);
        // The surviving counter still holds its quota.
        assert!(!limiter.check("r", "long", &long).await.allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gc_keeps_counter_with_waiting_check() {
        let limiter = Arc::new(RateLimiter::new());
        let p = Arc::new(policy(1, "1s"));
        assert!(limiter.check("r", "c", &p).await.allowed);
        tokio::time::advance(Duration::from_secs(2)).await;

        let counter = limiter.counters.iter().next().unwrap().value().clone();
        let held = counter.inner.lock().await;
        let waiting = tokio::spawn({
            let limiter = limiter.clone();
            let p = p.clone();
            async move { limiter.check("r", "c", &p).await.allowed }
        });
        tokio::task::yield_now().await;

        limiter.evict_stale();
        assert_eq!(limiter.len(), 1);
        drop(held);

        assert!(waiting.await.unwrap());
        assert!(!limiter.check("r", "c", &p).await.allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_retries_when_counter_evicted_while_waiting() {
        let limiter = Arc::new(RateLimiter::new());
        let p = Arc::new(policy(1, "1s"));
        assert!(limiter.check("r", "c", &p).await.allowed);
        tokio::time::advance(Duration::from_secs(2)).await;

        let key = limiter.counters.iter().next().unwrap().key().clone();
        let counter = limiter.counters.get(&key).unwrap().value().clone();
        let held = counter.inner.lock().await;
        let waiting = tokio::spawn({
            let limiter = limiter.clone();
            let p = p.clone();
            async move { limiter.check("r", "c", &p).await.allowed }
        });
        tokio::task::yield_now().await;

        limiter.counters.remove(&key);
        drop(held);

        // The waiting check moved to the live counter, so the window's
        // single admission is spent.
        assert!(waiting.await.unwrap());
        assert!(!limiter.check("r", "c", &p).await.allowed);
        assert_eq!(limiter.len(), 1);
    }
}
