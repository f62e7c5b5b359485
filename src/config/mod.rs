pub mod types;


pub use types::*;

use crate::auth::ClaimsToThing;
use crate::ratelimit::parse_period;
use crate::routing::UrlTemplate;
use crate::upstream::LoadBalancerKind;
use anyhow::Result;
use std::path::Path;

impl GatewayConfig {
    /// Load configuration from a file (if it exists) and apply environment
    /// variable overrides for global settings. When the file does not exist
    /// the gateway starts with no routes.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: GatewayConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Self::parse(&content, path)?
        } else {
            tracing::info!("config: file not found at {}, using defaults", path.display());
            GatewayConfig::default()
        };

        config.apply_env_overrides();

        config.validate()?;
        tracing::info!(routes = config.routes.len(), "loaded gateway configuration");
        Ok(config)
    }

    fn parse(content: &str, path: &Path) -> Result<Self> {
        Ok(match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(content)?,
            Some("json") => serde_json::from_str(content)?,
            Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
            None => anyhow::bail!("config file has no extension, use .toml or .json"),
        })
    }

    /// Environment overrides only touch infrastructure settings; routes come
    /// from the file.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("SLUICE_REQUEST_ID_KEY") {
            self.global.request_id_key = Some(v);
        }
        if let Ok(v) = std::env::var("SLUICE_MAX_BODY_BYTES") {
            if let Ok(n) = v.parse::<u64>() {
                self.global.max_body_bytes = n;
            }
        }

        if let Ok(v) = std::env::var("SLUICE_CONSUL_ADDRESS") {
            self.global
                .service_discovery
                .get_or_insert_with(ServiceDiscoveryConfig::default)
                .address = v;
        }
        if let Some(sd) = self.global.service_discovery.as_mut() {
            if let Ok(v) = std::env::var("SLUICE_CONSUL_TOKEN") {
                sd.token = Some(v);
            }
            if let Ok(v) = std::env::var("SLUICE_CONSUL_DATACENTER") {
                sd.datacenter = Some(v);
            }
        }

        if let Ok(v) = std::env::var("SLUICE_RATE_LIMIT_CLIENT_ID_HEADER") {
            self.global.rate_limit.client_id_header = v;
        }
        if let Ok(v) = std::env::var("SLUICE_RATE_LIMIT_DISABLE_HEADERS") {
            self.global.rate_limit.disable_rate_limit_headers = v == "true" || v == "1";
        }
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(ref sd) = self.global.service_discovery {
            if sd.provider != "consul" {
                anyhow::bail!("unsupported service discovery provider '{}'", sd.provider);
            }
        }
        if http::StatusCode::from_u16(self.global.rate_limit.http_status_code).is_err() {
            anyhow::bail!(
                "rate_limit http_status_code {} is not a valid status",
                self.global.rate_limit.http_status_code
            );
        }
        if let Some(ref key) = self.global.request_id_key {
            if http::HeaderName::from_bytes(key.as_bytes()).is_err() {
                anyhow::bail!("request_id_key '{}' is not a valid header name", key);
            }
        }

        for route in &self.routes {
            self.validate_route(route)?;
        }
        Ok(())
    }

    fn validate_route(&self, route: &RouteConfig) -> Result<()> {
        let name = route.upstream_path_template.as_str();

        if !route.upstream_path_template.starts_with('/') {
            anyhow::bail!("route '{}': upstream_path_template must start with '/'", name);
        }
        if !route.downstream_path_template.starts_with('/') {
            anyhow::bail!(
                "route '{}': downstream_path_template '{}' must start with '/'",
                name,
                route.downstream_path_template
            );
        }
        if route.downstream_path_template.contains("http://")
            || route.downstream_path_template.contains("https://")
        {
            anyhow::bail!(
                "route '{}': downstream_path_template must not contain a scheme",
                name
            );
        }
        UrlTemplate::compile(&route.upstream_path_template)
            .map_err(|e| anyhow::anyhow!("route '{}': {}", name, e))?;
        UrlTemplate::compile(&route.downstream_path_template)
            .map_err(|e| anyhow::anyhow!("route '{}': downstream: {}", name, e))?;

        for m in &route.upstream_http_method {
            if http::Method::from_bytes(m.to_ascii_uppercase().as_bytes()).is_err() {
                anyhow::bail!("route '{}': invalid http method '{}'", name, m);
            }
        }
        if let Some(ref m) = route.downstream_http_method {
            if http::Method::from_bytes(m.to_ascii_uppercase().as_bytes()).is_err() {
                anyhow::bail!("route '{}': invalid downstream http method '{}'", name, m);
            }
        }
        if route.downstream_scheme != "http" && route.downstream_scheme != "https" {
            anyhow::bail!(
                "route '{}': downstream_scheme must be http or https, got '{}'",
                name,
                route.downstream_scheme
            );
        }

        match route.service_name {
            Some(ref service) => {
                if self.global.service_discovery.is_none() {
                    anyhow::bail!(
                        "route '{}': service_name '{}' requires global.service_discovery",
                        name,
                        service
                    );
                }
            }
            None => {
                if route.downstream_host_and_ports.is_empty() {
                    anyhow::bail!(
                        "route '{}': needs downstream_host_and_ports or service_name",
                        name
                    );
                }
            }
        }
        if route.load_balancer.parse::<LoadBalancerKind>().is_err() {
            anyhow::bail!(
                "route '{}': unknown load_balancer '{}'",
                name,
                route.load_balancer
            );
        }

        if let Some(ref rl) = route.rate_limit {
            if rl.enable_rate_limiting {
                parse_period(&rl.period)
                    .map_err(|e| anyhow::anyhow!("route '{}': rate_limit: {}", name, e))?;
                if rl.limit == 0 {
                    anyhow::bail!("route '{}': rate_limit limit must be greater than 0", name);
                }
            }
        }
        if let Some(ref qos) = route.qos {
            if qos.exceptions_allowed_before_breaking == 0 || qos.timeout_value_ms == 0 {
                anyhow::bail!(
                    "route '{}': qos needs exceptions_allowed_before_breaking and timeout_value_ms greater than 0",
                    name
                );
            }
            if qos.scope != "route" && qos.scope != "host" {
                anyhow::bail!("route '{}': qos scope must be route or host", name);
            }
        }
        if let Some(ref cache) = route.cache {
            if cache.ttl_seconds == 0 {
                anyhow::bail!("route '{}': cache ttl_seconds must be greater than 0", name);
            }
        }
        if let Some(ref auth) = route.authentication {
            if auth.authentication_provider_key.trim().is_empty() {
                anyhow::bail!("route '{}': authentication_provider_key is empty", name);
            }
        }

        for (key, expr) in route
            .add_headers_to_request
            .iter()
            .chain(route.add_queries_to_request.iter())
        {
            ClaimsToThing::parse(key, expr)
                .map_err(|e| anyhow::anyhow!("route '{}': {}", name, e))?;
        }
        if let Some(ref key) = route.request_id_key {
            if http::HeaderName::from_bytes(key.as_bytes()).is_err() {
                anyhow::bail!("route '{}': request_id_key '{}' is invalid", name, key);
            }
        }
        Ok(())
    }
}
