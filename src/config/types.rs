use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

/// Deserialize a `T` that implements `Default`, treating JSON `null` the same
/// as a missing field. Use with:
///   `#[serde(default, deserialize_with = "deserialize_null_default")]`
fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub global: GlobalConfig,

    /// Route rules, matched in declaration order.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub routes: Vec<RouteConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Header carrying the request id. When unset no request id is forwarded.
    #[serde(default)]
    pub request_id_key: Option<String>,

    /// Requests with a larger body are rejected with 413 before routing.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: u64,

    #[serde(default)]
    pub service_discovery: Option<ServiceDiscoveryConfig>,

    #[serde(default)]
    pub rate_limit: RateLimitGlobalConfig,

    #[serde(default)]
    pub downstream: DownstreamClientConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            request_id_key: None,
            max_body_bytes: default_max_body_bytes(),
            service_discovery: None,
            rate_limit: RateLimitGlobalConfig::default(),
            downstream: DownstreamClientConfig::default(),
        }
    }
}

fn default_max_body_bytes() -> u64 {
    10 * 1024 * 1024
}

/// Dynamic backend registry. Only `consul` is supported.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDiscoveryConfig {
    #[serde(rename = "type", default = "default_discovery_type")]
    pub provider: String,

    #[serde(default = "default_consul_addr")]
    pub address: String,

    #[serde(default)]
    pub datacenter: Option<String>,

    #[serde(default)]
    pub token: Option<String>,

    /// How long a fetched service list is reused before consul is asked again (seconds).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

impl Default for ServiceDiscoveryConfig {
    fn default() -> Self {
        Self {
            provider: default_discovery_type(),
            address: default_consul_addr(),
            datacenter: None,
            token: None,
            poll_interval_secs: default_poll_interval(),
        }
    }
}

fn default_discovery_type() -> String {
    "consul".to_string()
}

fn default_consul_addr() -> String {
    "http://127.0.0.1:8500".to_string()
}

fn default_poll_interval() -> u64 {
    1
}

/// Settings shared by every route that enables rate limiting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitGlobalConfig {
    #[serde(default = "default_client_id_header")]
    pub client_id_header: String,

    /// `{0}` is replaced by the limit and `{1}` by the period.
    #[serde(default)]
    pub quota_exceeded_message: Option<String>,

    #[serde(default = "default_counter_prefix")]
    pub counter_prefix: String,

    #[serde(default)]
    pub disable_rate_limit_headers: bool,

    #[serde(default = "default_rejected_code")]
    pub http_status_code: u16,
}

impl Default for RateLimitGlobalConfig {
    fn default() -> Self {
        Self {
            client_id_header: default_client_id_header(),
            quota_exceeded_message: None,
            counter_prefix: default_counter_prefix(),
            disable_rate_limit_headers: false,
            http_status_code: default_rejected_code(),
        }
    }
}

fn default_client_id_header() -> String {
    "ClientId".to_string()
}

fn default_counter_prefix() -> String {
    "sluice".to_string()
}

fn default_rejected_code() -> u16 {
    429
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownstreamClientConfig {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    #[serde(default = "default_pool_size")]
    pub pool_max_idle_per_host: usize,

    /// Skip certificate validation on `https` backends.
    #[serde(default)]
    pub danger_accept_invalid_certs: bool,
}

impl Default for DownstreamClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            pool_idle_timeout_secs: default_idle_timeout(),
            pool_max_idle_per_host: default_pool_size(),
            danger_accept_invalid_certs: false,
        }
    }
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_idle_timeout() -> u64 {
    60
}

fn default_pool_size() -> usize {
    64
}

/// One route rule: an upstream template mapped onto a downstream template
/// plus the policies applied to traffic on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Path template with `{placeholder}` tokens, e.g. `/api/products/{id}`.
    pub upstream_path_template: String,

    /// Allowed methods. Empty means all methods.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub upstream_http_method: Vec<String>,

    pub downstream_path_template: String,

    #[serde(default = "default_scheme")]
    pub downstream_scheme: String,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub downstream_host_and_ports: Vec<HostAndPort>,

    /// Resolve backends through service discovery instead of a static list.
    #[serde(default)]
    pub service_name: Option<String>,

    /// "RoundRobin", "LeastConnection" or "NoLoadBalancer".
    #[serde(default = "default_load_balancer")]
    pub load_balancer: String,

    /// Forces the downstream method regardless of the inbound one.
    #[serde(default)]
    pub downstream_http_method: Option<String>,

    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,

    #[serde(default)]
    pub cache: Option<CacheConfig>,

    #[serde(default)]
    pub qos: Option<QosConfig>,

    #[serde(default)]
    pub authentication: Option<AuthenticationConfig>,

    /// Claim type → required value.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub route_claims_requirement: HashMap<String, String>,

    /// Header name → `Claims[<type>] > value[<index>] > <delimiter>`.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub add_headers_to_request: HashMap<String, String>,

    /// Query parameter → `Claims[<type>] > value[<index>] > <delimiter>`.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub add_queries_to_request: HashMap<String, String>,

    /// Overrides the global request id header for this route.
    #[serde(default)]
    pub request_id_key: Option<String>,
}

fn default_scheme() -> String {
    "http".to_string()
}

fn default_load_balancer() -> String {
    "RoundRobin".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostAndPort {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enable_rate_limiting: bool,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub client_whitelist: Vec<String>,

    /// Window length: `1s`, `5m`, `1h`, `1d`.
    pub period: String,

    pub limit: u64,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub ttl_seconds: u64,

    /// Defaults to a region derived from the upstream methods and template.
    #[serde(default)]
    pub region: Option<String>,

    /// Fold a hash of the request body into the cache key.
    #[serde(default)]
    pub hash_body: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QosConfig {
    pub exceptions_allowed_before_breaking: u32,

    #[serde(default = "default_break_duration")]
    pub duration_of_break_ms: u64,

    pub timeout_value_ms: u64,

    #[serde(default = "default_half_open_trials")]
    pub half_open_trials: u32,

    /// Failures older than this no longer count towards opening the breaker.
    #[serde(default = "default_failure_window")]
    pub failure_window_ms: u64,

    /// "route" (one breaker per route) or "host" (one per route and backend).
    #[serde(default = "default_breaker_scope")]
    pub scope: String,
}

fn default_break_duration() -> u64 {
    5_000
}

fn default_half_open_trials() -> u32 {
    1
}

fn default_failure_window() -> u64 {
    60_000
}

fn default_breaker_scope() -> String {
    "route".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticationConfig {
    pub authentication_provider_key: String,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub allowed_scopes: Vec<String>,
}
