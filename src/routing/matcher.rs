use super::replacer::replace_template_variables;
use super::template::{UrlMatch, UrlTemplate};
use crate::auth::{AuthenticationPolicy, ClaimsToThing};
use crate::cache::CachePolicy;
use crate::config::{GatewayConfig, GlobalConfig, RouteConfig};
use crate::discovery::Service;
use crate::error::GatewayError;
use crate::ratelimit::RateLimitPolicy;
use crate::upstream::qos::QosPolicy;
use crate::upstream::LoadBalancerKind;
use http::{HeaderName, Method};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// A route rule compiled from [`RouteConfig`]. Immutable; a reload builds a
/// fresh [`RouteTable`] instead of touching existing routes.
#[derive(Debug)]
pub struct CompiledRoute {
    /// Methods plus upstream template, e.g. `GET,POST|/api/products/{id}`.
    pub key: String,
    /// Table build this route belongs to. Later reloads get larger values.
    pub generation: u64,
    pub upstream: UrlTemplate,
    /// Empty means every method.
    pub methods: Vec<Method>,
    pub downstream_path_template: String,
    pub downstream_scheme: String,
    pub downstream_hosts: Vec<Service>,
    pub service_name: Option<String>,
    pub load_balancer: LoadBalancerKind,
    pub downstream_method: Option<Method>,
    pub rate_limit: Option<RateLimitPolicy>,
    pub cache: Option<CachePolicy>,
    pub qos: Option<QosPolicy>,
    pub authentication: Option<AuthenticationPolicy>,
    pub claims_requirement: Vec<(String, String)>,
    pub headers_from_claims: Vec<ClaimsToThing>,
    pub queries_from_claims: Vec<ClaimsToThing>,
    pub request_id_key: Option<HeaderName>,
}

fn parse_method(m: &str) -> Result<Method, GatewayError> {
    Method::from_bytes(m.trim().to_ascii_uppercase().as_bytes())
        .map_err(|_| GatewayError::Config(format!("invalid http method '{}'", m)))
}

fn parse_header_name(name: &str) -> Result<HeaderName, GatewayError> {
    HeaderName::from_bytes(name.as_bytes())
        .map_err(|_| GatewayError::Config(format!("invalid header name '{}'", name)))
}

pub fn route_key(methods: &[Method], upstream_template: &str) -> String {
    if methods.is_empty() {
        return format!("*|{}", upstream_template);
    }
    let mut joined: Vec<&str> = methods.iter().map(|m| m.as_str()).collect();
    joined.sort_unstable();
    format!("{}|{}", joined.join(","), upstream_template)
}

impl CompiledRoute {
    pub fn compile(cfg: &RouteConfig, global: &GlobalConfig) -> Result<Self, GatewayError> {
        let upstream = UrlTemplate::compile(&cfg.upstream_path_template)?;
        let downstream = UrlTemplate::compile(&cfg.downstream_path_template)?;
        if downstream.placeholders().len() > upstream.placeholders().len() {
            return Err(GatewayError::Config(format!(
                "downstream template '{}' uses {} placeholders but upstream '{}' only captures {}",
                cfg.downstream_path_template,
                downstream.placeholders().len(),
                cfg.upstream_path_template,
                upstream.placeholders().len()
            )));
        }

        let mut methods = Vec::with_capacity(cfg.upstream_http_method.len());
        for m in &cfg.upstream_http_method {
            let method = parse_method(m)?;
            if !methods.contains(&method) {
                methods.push(method);
            }
        }
        let key = route_key(&methods, &cfg.upstream_path_template);

        let load_balancer = cfg
            .load_balancer
            .parse::<LoadBalancerKind>()
            .map_err(GatewayError::Config)?;

        let downstream_method = cfg
            .downstream_http_method
            .as_deref()
            .map(parse_method)
            .transpose()?;

        let rate_limit = match cfg.rate_limit {
            Some(ref rl) => RateLimitPolicy::from_config(rl, &global.rate_limit)?,
            None => None,
        };

        let cache = cfg
            .cache
            .as_ref()
            .map(|c| CachePolicy::from_config(c, &methods, &cfg.upstream_path_template));

        let mut claims_requirement: Vec<(String, String)> = cfg
            .route_claims_requirement
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        claims_requirement.sort();

        let mut headers_from_claims = Vec::with_capacity(cfg.add_headers_to_request.len());
        for (name, expr) in &cfg.add_headers_to_request {
            parse_header_name(name)?;
            headers_from_claims.push(ClaimsToThing::parse(name, expr)?);
        }
        headers_from_claims.sort_by(|a, b| a.key.cmp(&b.key));

        let mut queries_from_claims = Vec::with_capacity(cfg.add_queries_to_request.len());
        for (name, expr) in &cfg.add_queries_to_request {
            queries_from_claims.push(ClaimsToThing::parse(name, expr)?);
        }
        queries_from_claims.sort_by(|a, b| a.key.cmp(&b.key));

        let request_id_key = cfg
            .request_id_key
            .as_deref()
            .or(global.request_id_key.as_deref())
            .map(parse_header_name)
            .transpose()?;

        Ok(Self {
            key,
            generation: 0,
            upstream,
            methods,
            downstream_path_template: cfg.downstream_path_template.clone(),
            downstream_scheme: cfg.downstream_scheme.clone(),
            downstream_hosts: cfg.downstream_host_and_ports.iter().map(Service::from).collect(),
            service_name: cfg.service_name.clone(),
            load_balancer,
            downstream_method,
            rate_limit,
            cache,
            qos: cfg.qos.as_ref().map(QosPolicy::from_config),
            authentication: cfg.authentication.as_ref().map(AuthenticationPolicy::from),
            claims_requirement,
            headers_from_claims,
            queries_from_claims,
            request_id_key,
        })
    }

    pub fn allows(&self, method: &Method) -> bool {
        self.methods.is_empty()
            || self
                .methods
                .iter()
                .any(|m| m.as_str().eq_ignore_ascii_case(method.as_str()))
    }
}

/// A route rule paired with the bindings captured for one request.
#[derive(Debug, Clone)]
pub struct DownstreamRoute {
    pub route: Arc<CompiledRoute>,
    pub url_match: UrlMatch,
    pub downstream_path: String,
}

/// Ordered collection of compiled routes. Shared behind `ArcSwap` and
/// replaced wholesale on reload.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: Vec<Arc<CompiledRoute>>,
}

impl RouteTable {
    pub fn new(config: &GatewayConfig) -> Result<Self, GatewayError> {
        let mut routes = Vec::with_capacity(config.routes.len());
        let mut seen = HashSet::new();
        let generation = NEXT_GENERATION.fetch_add(1, Ordering::Relaxed);

        for cfg in &config.routes {
            let mut route = CompiledRoute::compile(cfg, &config.global)?;
            route.generation = generation;
            if !seen.insert(route.key.clone()) {
                return Err(GatewayError::Config(format!(
                    "duplicate route '{}'",
                    route.key
                )));
            }
            routes.push(Arc::new(route));
        }

        Ok(Self { routes })
    }

    pub fn routes(&self) -> &[Arc<CompiledRoute>] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// First route whose template matches `path` and whose method set
    /// contains `method` wins. When templates matched but none accepted the
    /// method the result is `MethodNotAllowed`, otherwise `RouteNotFound`.
    pub fn resolve(&self, method: &Method, path: &str) -> Result<DownstreamRoute, GatewayError> {
        let mut allowed: Vec<String> = Vec::new();

        for route in &self.routes {
            let Some(url_match) = route.upstream.match_path(path) else {
                continue;
            };
            if route.allows(method) {
                let downstream_path =
                    replace_template_variables(&route.downstream_path_template, &url_match)?;
                return Ok(DownstreamRoute {
                    route: route.clone(),
                    url_match,
                    downstream_path,
                });
            }
            for m in &route.methods {
                if !allowed.iter().any(|a| a == m.as_str()) {
                    allowed.push(m.as_str().to_string());
                }
            }
        }

        if allowed.is_empty() {
            Err(GatewayError::RouteNotFound)
        } else {
            Err(GatewayError::MethodNotAllowed { allowed })
        }
    }
}
