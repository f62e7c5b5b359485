use super::context::{error_response, PipelineContext};
use super::stage::{Stage, StageOutcome};
use crate::auth::Authenticator;
use crate::cache::OutputCache;
use crate::error::GatewayError;
use crate::ratelimit::RateLimiter;
use crate::routing::RouteTable;
use crate::upstream::{DownstreamClient, LoadBalancerHouse, QosWrapper};
use arc_swap::ArcSwap;
use bytes::Bytes;
use http::{HeaderValue, Request, Response};
use std::net::SocketAddr;
use std::sync::Arc;

/// Shared state the standard stages are built from.
#[derive(Clone)]
pub struct PipelineDeps {
    pub route_table: Arc<ArcSwap<RouteTable>>,
    pub rate_limiter: Arc<RateLimiter>,
    pub authenticator: Arc<dyn Authenticator>,
    pub cache: Arc<OutputCache>,
    pub house: Arc<LoadBalancerHouse>,
    pub client: Arc<dyn DownstreamClient>,
    pub qos: Arc<QosWrapper>,
}

/// Fixed, ordered list of stages run once per inbound request.
#[derive(Debug)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    pub fn new(stages: Vec<Stage>) -> Self {
        Self { stages }
    }

    /// Route resolution, rate limit, authentication, authorisation, cache
    /// lookup, request construction, lease, downstream call, response
    /// mapping, cache store, release.
    pub fn standard(deps: PipelineDeps) -> Self {
        Self::new(vec![
            Stage::RouteResolution(deps.route_table),
            Stage::RateLimit(deps.rate_limiter),
            Stage::Authentication(deps.authenticator),
            Stage::Authorisation,
            Stage::CacheLookup(deps.cache.clone()),
            Stage::RequestConstruction,
            Stage::LoadBalancerLease(deps.house),
            Stage::Downstream {
                client: deps.client,
                qos: deps.qos,
            },
            Stage::ResponseMapping,
            Stage::CacheStore(deps.cache),
            Stage::LoadBalancerRelease,
        ])
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Run every stage in order and produce the response.
    ///
    /// The first stage that records an error or produces a response ends
    /// the run. Any lease still held is released before the response is
    /// built, on every path.
    pub async fn execute(&self, request: Request<Bytes>, peer_addr: SocketAddr) -> Response<Bytes> {
        let mut ctx = PipelineContext::new(request, peer_addr);

        for stage in &self.stages {
            match stage.process(&mut ctx).await {
                StageOutcome::Continue => {}
                StageOutcome::Respond => break,
                StageOutcome::Halt => {
                    tracing::debug!(
                        "proxy: stage halted, stage={}, route={}, error={}",
                        stage.name(),
                        ctx.route_key(),
                        ctx.errors().first().map(|e| e.kind()).unwrap_or("")
                    );
                    break;
                }
            }
        }
        ctx.release_lease();

        let mut response = if ctx.is_error() {
            error_response(ctx.errors())
        } else {
            match ctx.response.take() {
                Some(r) => r,
                None => {
                    tracing::error!(
                        "proxy: pipeline ended without a response, route={}",
                        ctx.route_key()
                    );
                    error_response(&[GatewayError::Internal(
                        "pipeline produced no response".to_string(),
                    )])
                }
            }
        };

        decorate_response(&ctx, &mut response);
        finalize(&ctx, &response);
        response
    }
}

/// Per-request headers added to every response, cached or not.
fn decorate_response(ctx: &PipelineContext, response: &mut Response<Bytes>) {
    for (name, value) in &ctx.rate_limit_headers {
        response.headers_mut().insert(name.clone(), value.clone());
    }
    if let Some(key) = ctx
        .downstream_route
        .as_ref()
        .and_then(|r| r.route.request_id_key.as_ref())
    {
        if let Ok(v) = HeaderValue::from_str(&ctx.request_id) {
            response.headers_mut().insert(key.clone(), v);
        }
    }
}

fn finalize(ctx: &PipelineContext, response: &Response<Bytes>) {
    let status = response.status().as_u16();
    let mut buf = itoa::Buffer::new();
    let status_str = buf.format(status);
    let route = ctx.route_key().to_string();

    metrics::counter!(
        "gateway_http_requests_total",
        "route" => route.clone(),
        "method" => ctx.method.as_str().to_string(),
        "status_code" => status_str.to_owned(),
    )
    .increment(1);
    metrics::histogram!(
        "gateway_http_request_duration_seconds",
        "route" => route,
    )
    .record(ctx.start.elapsed().as_secs_f64());

    // Structured access log, one line per request.
    tracing::info!(
        request_id = %ctx.request_id,
        client_ip = %ctx.client_ip,
        method = %ctx.method,
        path = %ctx.path(),
        status = status,
        route = %ctx.route_key(),
        cache_hit = ctx.served_from_cache,
        error = ctx.errors().first().map(|e| e.kind()).unwrap_or(""),
        latency_ms = %ctx.start.elapsed().as_millis(),
        "access"
    );
}
