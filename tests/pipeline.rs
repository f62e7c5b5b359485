//! End-to-end pipeline behaviour with in-process downstream and auth mocks.

use arc_swap::ArcSwap;
use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method, Request, Response, StatusCode};
use sluice_gateway::auth::{AuthenticationPolicy, Authenticator, Claims};
use sluice_gateway::cache::OutputCache;
use sluice_gateway::config::GatewayConfig;
use sluice_gateway::discovery::ServiceDiscoveryFactory;
use sluice_gateway::error::GatewayError;
use sluice_gateway::proxy::{Pipeline, PipelineDeps};
use sluice_gateway::ratelimit::RateLimiter;
use sluice_gateway::routing::RouteTable;
use sluice_gateway::upstream::{DownstreamClient, LoadBalancer, LoadBalancerHouse, QosWrapper};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Records every downstream request and answers 200 with the request URI,
/// a transport error while `fail` is set, or never while `hang` is set.
#[derive(Default)]
struct MockDownstream {
    calls: AtomicUsize,
    fail: AtomicBool,
    hang: AtomicBool,
    last: Mutex<Option<Request<Bytes>>>,
}

impl MockDownstream {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn last_header(&self, name: &str) -> Option<String> {
        self.last
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|r| r.headers().get(name))
            .map(|v| v.to_str().unwrap().to_string())
    }
}

#[async_trait]
impl DownstreamClient for MockDownstream {
    async fn send(&self, request: Request<Bytes>) -> Result<Response<Bytes>, GatewayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let uri = request.uri().to_string();
        *self.last.lock().unwrap() = Some(request);
        if self.fail.load(Ordering::SeqCst) {
            return Err(GatewayError::DownstreamTransport("connection reset".into()));
        }
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(Response::new(Bytes::from(uri)))
    }
}

/// `Authorization: Bearer <sub>:<role>` yields `sub` and `role` claims.
struct MockAuthenticator;

#[async_trait]
impl Authenticator for MockAuthenticator {
    async fn authenticate(
        &self,
        _policy: &AuthenticationPolicy,
        headers: &HeaderMap,
    ) -> Result<Claims, GatewayError> {
        let token = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or_else(|| GatewayError::AuthenticationFailed("missing bearer token".into()))?;
        let (sub, role) = token
            .split_once(':')
            .ok_or_else(|| GatewayError::AuthenticationFailed("malformed token".into()))?;
        Ok([("sub", sub), ("role", role)].into_iter().collect())
    }
}

struct Gateway {
    pipeline: Pipeline,
    table: Arc<ArcSwap<RouteTable>>,
    house: Arc<LoadBalancerHouse>,
    downstream: Arc<MockDownstream>,
}

impl Gateway {
    fn new(toml_config: &str) -> Self {
        let config: GatewayConfig = toml::from_str(toml_config).unwrap();
        config.validate().unwrap();

        let table = Arc::new(ArcSwap::from_pointee(RouteTable::new(&config).unwrap()));
        let house = Arc::new(LoadBalancerHouse::new(Arc::new(
            ServiceDiscoveryFactory::new(None).unwrap(),
        )));
        let downstream = Arc::new(MockDownstream::default());
        let pipeline = Pipeline::standard(PipelineDeps {
            route_table: table.clone(),
            rate_limiter: Arc::new(RateLimiter::new()),
            authenticator: Arc::new(MockAuthenticator),
            cache: Arc::new(OutputCache::new()),
            house: house.clone(),
            client: downstream.clone(),
            qos: Arc::new(QosWrapper::new()),
        });
        Self {
            pipeline,
            table,
            house,
            downstream,
        }
    }

    async fn send(&self, request: Request<Bytes>) -> Response<Bytes> {
        let peer: SocketAddr = "192.0.2.10:50000".parse().unwrap();
        self.pipeline.execute(request, peer).await
    }

    async fn get(&self, uri: &str) -> Response<Bytes> {
        self.send(request(Method::GET, uri)).await
    }

    /// Outstanding leases on `endpoint` for the first route's balancer.
    fn in_flight(&self, endpoint: &str) -> usize {
        let table = self.table.load();
        match self.house.get(&table.routes()[0]).unwrap().as_ref() {
            LoadBalancer::LeastConnection(lb) => lb.in_flight(endpoint),
            _ => panic!("route is not least-connection balanced"),
        }
    }
}

fn request(method: Method, uri: &str) -> Request<Bytes> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Bytes::new())
        .unwrap()
}

fn error_message(response: &Response<Bytes>) -> String {
    let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
    body["error"].as_str().unwrap().to_string()
}

const PRODUCTS: &str = r#"
[[routes]]
upstream_path_template = "/api/products/{id}"
upstream_http_method = ["GET"]
downstream_path_template = "/products/{id}"
load_balancer = "RoundRobin"

[[routes.downstream_host_and_ports]]
host = "products"
port = 8080
"#;

#[tokio::test]
async fn test_forwards_to_downstream() {
    let gw = Gateway::new(PRODUCTS);

    let response = gw.get("/api/products/42?expand=true").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.body().as_ref(),
        b"http://products:8080/products/42?expand=true"
    );
    assert_eq!(gw.downstream.last_header("host").as_deref(), Some("products:8080"));
    assert_eq!(
        gw.downstream.last_header("x-forwarded-for").as_deref(),
        Some("192.0.2.10")
    );
}

#[tokio::test]
async fn test_unknown_path_is_404() {
    let gw = Gateway::new(PRODUCTS);

    let response = gw.get("/api/orders/1").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(response.headers()["content-type"], "application/json");
    assert_eq!(error_message(&response), "no route found");
    assert_eq!(gw.downstream.calls(), 0);
}

#[tokio::test]
async fn test_wrong_method_is_405_with_allow() {
    let gw = Gateway::new(PRODUCTS);

    let response = gw.send(request(Method::DELETE, "/api/products/42")).await;
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(response.headers()["allow"], "GET");
    assert_eq!(gw.downstream.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_is_429_until_window_resets() {
    let gw = Gateway::new(&format!(
        "{}{}",
        PRODUCTS,
        r#"
[routes.rate_limit]
enable_rate_limiting = true
period = "1m"
limit = 2
"#
    ));

    for remaining in ["1", "0"] {
        let response = gw.get("/api/products/1").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-rate-limit-remaining"], remaining);
    }

    let denied = gw.get("/api/products/1").await;
    assert_eq!(denied.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(denied.headers()["retry-after"], "60");
    let message = std::str::from_utf8(denied.body()).unwrap();
    assert!(message.contains("quota exceeded"), "{}", message);
    assert_eq!(gw.downstream.calls(), 2);

    tokio::time::advance(std::time::Duration::from_secs(61)).await;
    assert_eq!(gw.get("/api/products/1").await.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_whitelisted_client_bypasses_rate_limit() {
    let gw = Gateway::new(&format!(
        "{}{}",
        PRODUCTS,
        r#"
[routes.rate_limit]
enable_rate_limiting = true
client_whitelist = ["batch"]
period = "1h"
limit = 1
"#
    ));

    for _ in 0..3 {
        let mut req = request(Method::GET, "/api/products/1");
        req.headers_mut().insert("clientid", "batch".parse().unwrap());
        assert_eq!(gw.send(req).await.status(), StatusCode::OK);
    }
    assert_eq!(gw.downstream.calls(), 3);
}

const SECURED: &str = r#"
[[routes]]
upstream_path_template = "/admin/{rest}"
downstream_path_template = "/{rest}"
load_balancer = "NoLoadBalancer"

[[routes.downstream_host_and_ports]]
host = "admin"
port = 9000

[routes.authentication]
authentication_provider_key = "Bearer"

[routes.route_claims_requirement]
role = "admin"

[routes.add_headers_to_request]
X-User = "Claims[sub] > value"
"#;

#[tokio::test]
async fn test_missing_credentials_is_401() {
    let gw = Gateway::new(SECURED);

    let response = gw.get("/admin/users").await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(error_message(&response).contains("missing bearer token"));
    assert_eq!(gw.downstream.calls(), 0);
}

#[tokio::test]
async fn test_missing_claim_value_is_403() {
    let gw = Gateway::new(SECURED);

    let mut req = request(Method::GET, "/admin/users");
    req.headers_mut()
        .insert("authorization", "Bearer alice:reader".parse().unwrap());
    assert_eq!(gw.send(req).await.status(), StatusCode::FORBIDDEN);
    assert_eq!(gw.downstream.calls(), 0);
}

#[tokio::test]
async fn test_authorised_request_carries_claim_header() {
    let gw = Gateway::new(SECURED);

    let mut req = request(Method::GET, "/admin/users");
    req.headers_mut()
        .insert("authorization", "Bearer alice:admin".parse().unwrap());
    assert_eq!(gw.send(req).await.status(), StatusCode::OK);
    assert_eq!(gw.downstream.last_header("x-user").as_deref(), Some("alice"));
}

#[tokio::test]
async fn test_cache_hit_skips_downstream() {
    let gw = Gateway::new(&format!(
        "{}{}",
        PRODUCTS,
        r#"
[routes.cache]
ttl_seconds = 30
"#
    ));

    let first = gw.get("/api/products/7").await;
    let second = gw.get("/api/products/7").await;
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(first.body(), second.body());
    assert_eq!(gw.downstream.calls(), 1);

    gw.get("/api/products/8").await;
    assert_eq!(gw.downstream.calls(), 2);
}

#[tokio::test]
async fn test_failed_responses_are_not_cached() {
    let gw = Gateway::new(&format!(
        "{}{}",
        PRODUCTS,
        r#"
[routes.cache]
ttl_seconds = 30
"#
    ));

    gw.downstream.fail.store(true, Ordering::SeqCst);
    assert_eq!(gw.get("/api/products/7").await.status(), StatusCode::BAD_GATEWAY);
    gw.downstream.fail.store(false, Ordering::SeqCst);
    assert_eq!(gw.get("/api/products/7").await.status(), StatusCode::OK);
    assert_eq!(gw.downstream.calls(), 2);
}

#[tokio::test]
async fn test_open_breaker_fails_fast_with_503() {
    let gw = Gateway::new(&format!(
        "{}{}",
        PRODUCTS,
        r#"
[routes.qos]
exceptions_allowed_before_breaking = 2
duration_of_break_ms = 60000
timeout_value_ms = 1000
"#
    ));
    gw.downstream.fail.store(true, Ordering::SeqCst);

    for _ in 0..2 {
        assert_eq!(gw.get("/api/products/1").await.status(), StatusCode::BAD_GATEWAY);
    }
    let rejected = gw.get("/api/products/1").await;
    assert_eq!(rejected.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(error_message(&rejected).starts_with("circuit open"));
    assert_eq!(gw.downstream.calls(), 2);
}

const BALANCED: &str = r#"
[[routes]]
upstream_path_template = "/svc/{x}"
downstream_path_template = "/{x}"
load_balancer = "LeastConnection"

[[routes.downstream_host_and_ports]]
host = "a"
port = 1

[[routes.downstream_host_and_ports]]
host = "b"
port = 2
"#;

#[tokio::test]
async fn test_leases_released_on_success_and_failure() {
    let gw = Gateway::new(BALANCED);

    assert_eq!(gw.get("/svc/1").await.status(), StatusCode::OK);
    assert_eq!(gw.get("/svc/2").await.status(), StatusCode::OK);
    gw.downstream.fail.store(true, Ordering::SeqCst);
    assert_eq!(gw.get("/svc/3").await.status(), StatusCode::BAD_GATEWAY);

    assert_eq!(gw.in_flight("a:1"), 0);
    assert_eq!(gw.in_flight("b:2"), 0);
}

#[tokio::test]
async fn test_lease_released_when_request_is_cancelled() {
    let gw = Gateway::new(BALANCED);
    gw.downstream.hang.store(true, Ordering::SeqCst);

    let mut pending = Box::pin(gw.get("/svc/1"));
    let wait = std::time::Duration::from_millis(50);
    assert!(tokio::time::timeout(wait, &mut pending).await.is_err());
    assert_eq!(gw.downstream.calls(), 1);
    assert_eq!(gw.in_flight("a:1") + gw.in_flight("b:2"), 1);

    // The client went away mid-call.
    drop(pending);
    assert_eq!(gw.in_flight("a:1"), 0);
    assert_eq!(gw.in_flight("b:2"), 0);
}

#[tokio::test]
async fn test_lease_released_when_breaker_rejects() {
    let gw = Gateway::new(&format!(
        "{}{}",
        BALANCED,
        r#"
[routes.qos]
exceptions_allowed_before_breaking = 1
duration_of_break_ms = 60000
timeout_value_ms = 1000
"#
    ));
    gw.downstream.fail.store(true, Ordering::SeqCst);
    assert_eq!(gw.get("/svc/1").await.status(), StatusCode::BAD_GATEWAY);

    // Leased an endpoint, then refused by the open breaker.
    assert_eq!(gw.get("/svc/2").await.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(gw.downstream.calls(), 1);
    assert_eq!(gw.in_flight("a:1"), 0);
    assert_eq!(gw.in_flight("b:2"), 0);
}

#[tokio::test]
async fn test_request_id_is_forwarded_and_echoed() {
    let gw = Gateway::new(&format!("[global]\nrequest_id_key = \"X-Request-Id\"\n{}", PRODUCTS));

    let mut req = request(Method::GET, "/api/products/1");
    req.headers_mut()
        .insert("x-request-id", "abc-123".parse().unwrap());
    let response = gw.send(req).await;
    assert_eq!(response.headers()["x-request-id"], "abc-123");
    assert_eq!(gw.downstream.last_header("x-request-id").as_deref(), Some("abc-123"));

    // Without an inbound id the gateway mints one and uses it both ways.
    let response = gw.get("/api/products/1").await;
    let minted = response.headers()["x-request-id"].to_str().unwrap().to_string();
    assert_eq!(minted.len(), 32);
    assert_eq!(gw.downstream.last_header("x-request-id"), Some(minted));
}
