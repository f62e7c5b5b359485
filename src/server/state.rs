use crate::auth::Authenticator;
use crate::cache::OutputCache;
use crate::config::GatewayConfig;
use crate::discovery::ServiceDiscoveryFactory;
use crate::metrics::Metrics;
use crate::proxy::{Pipeline, PipelineDeps};
use crate::ratelimit::RateLimiter;
use crate::routing::RouteTable;
use crate::upstream::{DownstreamClient, LoadBalancerHouse, QosWrapper};
use anyhow::Result;
use arc_swap::ArcSwap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Shared gateway state, cheaply cloneable.
///
/// The route table and config are swapped wholesale on reload; readers go
/// through `ArcSwap::load` and never block. Reloads are serialized through
/// `reload_mu`.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<ArcSwap<GatewayConfig>>,
    pub metrics: Option<Metrics>,
    pub route_table: Arc<ArcSwap<RouteTable>>,
    pub house: Arc<LoadBalancerHouse>,
    pub rate_limiter: Arc<RateLimiter>,
    pub cache: Arc<OutputCache>,
    pub qos: Arc<QosWrapper>,
    pub pipeline: Arc<Pipeline>,
    reload_mu: Arc<Mutex<()>>,
}

impl GatewayState {
    /// Compile the initial route table and wire the standard pipeline.
    pub fn new(
        config: GatewayConfig,
        authenticator: Arc<dyn Authenticator>,
        client: Arc<dyn DownstreamClient>,
    ) -> Result<Self> {
        let table = RouteTable::new(&config)?;
        let discovery = ServiceDiscoveryFactory::new(config.global.service_discovery.as_ref())?;
        metrics::gauge!("gateway_config_routes_total").set(table.len() as f64);

        let route_table = Arc::new(ArcSwap::from_pointee(table));
        let house = Arc::new(LoadBalancerHouse::new(Arc::new(discovery)));
        let rate_limiter = Arc::new(RateLimiter::new());
        let cache = Arc::new(OutputCache::new());
        let qos = Arc::new(QosWrapper::new());

        let pipeline = Pipeline::standard(PipelineDeps {
            route_table: route_table.clone(),
            rate_limiter: rate_limiter.clone(),
            authenticator,
            cache: cache.clone(),
            house: house.clone(),
            client,
            qos: qos.clone(),
        });

        Ok(Self {
            config: Arc::new(ArcSwap::from_pointee(config)),
            metrics: None,
            route_table,
            house,
            rate_limiter,
            cache,
            qos,
            pipeline: Arc::new(pipeline),
            reload_mu: Arc::new(Mutex::new(())),
        })
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Validate and compile `config`, then install it.
    ///
    /// Nothing is swapped unless the whole table compiles. Balancers and
    /// breakers built for the old table are dropped after the swap. The
    /// downstream client keeps its startup settings.
    pub async fn reload(&self, config: GatewayConfig) -> Result<()> {
        config.validate()?;
        let table = RouteTable::new(&config)?;
        let discovery = ServiceDiscoveryFactory::new(config.global.service_discovery.as_ref())?;
        let routes = table.len();

        let _guard = self.reload_mu.lock().await;
        self.route_table.store(Arc::new(table));
        self.config.store(Arc::new(config));
        self.house.reset(Arc::new(discovery));
        self.qos.breakers().clear();

        metrics::gauge!("gateway_config_routes_total").set(routes as f64);
        metrics::counter!("gateway_config_reloads_total").increment(1);
        info!("config: route table reloaded, routes={}", routes);
        Ok(())
    }

    pub fn route_count(&self) -> usize {
        self.route_table.load().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::NoAuthenticationProvider;
    use crate::config::{GlobalConfig, HostAndPort, RouteConfig};
    use crate::error::GatewayError;
    use async_trait::async_trait;
    use bytes::Bytes;
    use http::{Request, Response};
    use std::collections::HashMap;

    struct Ok200;

    #[async_trait]
    impl DownstreamClient for Ok200 {
        async fn send(&self, _request: Request<Bytes>) -> Result<Response<Bytes>, GatewayError> {
            Ok(Response::new(Bytes::from_static(b"ok")))
        }
    }

    fn route(upstream: &str) -> RouteConfig {
        RouteConfig {
            upstream_path_template: upstream.into(),
            upstream_http_method: vec!["GET".into()],
            downstream_path_template: "/".into(),
            downstream_scheme: "http".into(),
            downstream_host_and_ports: vec![HostAndPort {
                host: "backend".into(),
                port: 80,
            }],
            service_name: None,
            load_balancer: "RoundRobin".into(),
            downstream_http_method: None,
            rate_limit: None,
            cache: None,
            qos: None,
            authentication: None,
            route_claims_requirement: HashMap::new(),
            add_headers_to_request: HashMap::new(),
            add_queries_to_request: HashMap::new(),
            request_id_key: None,
        }
    }

    fn config(routes: Vec<RouteConfig>) -> GatewayConfig {
        GatewayConfig {
            global: GlobalConfig::default(),
            routes,
        }
    }

    fn state(cfg: GatewayConfig) -> GatewayState {
        GatewayState::new(cfg, Arc::new(NoAuthenticationProvider), Arc::new(Ok200)).unwrap()
    }

    fn get(path: &str) -> Request<Bytes> {
        Request::builder().uri(path).body(Bytes::new()).unwrap()
    }

    #[tokio::test]
    async fn test_reload_swaps_route_table() {
        let state = state(config(vec![route("/old")]));
        let peer = "127.0.0.1:1".parse().unwrap();

        assert_eq!(state.pipeline.execute(get("/old"), peer).await.status(), 200);
        state.reload(config(vec![route("/new")])).await.unwrap();

        assert_eq!(state.pipeline.execute(get("/old"), peer).await.status(), 404);
        assert_eq!(state.pipeline.execute(get("/new"), peer).await.status(), 200);
        assert_eq!(state.route_count(), 1);
    }

    #[tokio::test]
    async fn test_reload_clears_balancers() {
        let state = state(config(vec![route("/a")]));
        state
            .pipeline
            .execute(get("/a"), "127.0.0.1:1".parse().unwrap())
            .await;
        assert_eq!(state.house.len(), 1);

        state.reload(config(vec![route("/a")])).await.unwrap();
        assert!(state.house.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_reload_keeps_current_table() {
        let state = state(config(vec![route("/a")]));
        let mut bad = route("/b");
        bad.load_balancer = "Weighted".into();

        assert!(state.reload(config(vec![bad])).await.is_err());
        assert_eq!(
            state
                .pipeline
                .execute(get("/a"), "127.0.0.1:1".parse().unwrap())
                .await
                .status(),
            200
        );
    }
}
