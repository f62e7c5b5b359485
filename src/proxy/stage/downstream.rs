use super::request::remove_hop_headers;
use super::StageOutcome;
use crate::error::GatewayError;
use crate::proxy::context::PipelineContext;
use crate::upstream::{DownstreamClient, LoadBalancerHouse, QosWrapper};
use http::header::HOST;
use http::{HeaderValue, Uri};

pub(super) async fn lease(
    house: &LoadBalancerHouse,
    ctx: &mut PipelineContext,
) -> Result<StageOutcome, GatewayError> {
    let route = ctx.route()?.route.clone();
    let balancer = house.get(&route)?;
    let lease = balancer.lease().await.map_err(|e| {
        tracing::warn!("lb: lease failed, route={}, error={}", route.key, e);
        e
    })?;
    metrics::counter!(
        "gateway_lb_leases_total",
        "route" => route.key.clone(),
        "endpoint" => lease.endpoint().to_string(),
    )
    .increment(1);

    let request = ctx
        .downstream_request
        .as_mut()
        .ok_or_else(|| GatewayError::Internal("no downstream request to address".to_string()))?;
    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let mut uri = String::with_capacity(
        route.downstream_scheme.len() + 3 + lease.endpoint().len() + path_and_query.len(),
    );
    uri.push_str(&route.downstream_scheme);
    uri.push_str("://");
    uri.push_str(lease.endpoint());
    uri.push_str(path_and_query);
    let uri: Uri = uri
        .parse()
        .map_err(|e| GatewayError::Internal(format!("downstream uri: {}", e)))?;
    *request.uri_mut() = uri;
    if let Ok(host) = HeaderValue::from_str(lease.endpoint()) {
        request.headers_mut().insert(HOST, host);
    }

    ctx.lease = Some(lease);
    Ok(StageOutcome::Continue)
}

pub(super) async fn call(
    client: &dyn DownstreamClient,
    qos: &QosWrapper,
    ctx: &mut PipelineContext,
) -> Result<StageOutcome, GatewayError> {
    let route = ctx.route()?.route.clone();
    let endpoint = ctx
        .lease
        .as_ref()
        .map(|l| l.endpoint().to_string())
        .ok_or_else(|| GatewayError::Internal("downstream call without a lease".to_string()))?;
    let request = ctx
        .downstream_request
        .take()
        .ok_or_else(|| GatewayError::Internal("no downstream request".to_string()))?;

    let scope = route
        .qos
        .as_ref()
        .map(|q| q.scope_key(&route.key, &endpoint))
        .unwrap_or_default();

    tracing::debug!(
        "proxy: calling downstream, route={}, method={}, uri={}",
        route.key,
        request.method(),
        request.uri()
    );
    let response = qos
        .execute(route.qos.as_ref(), &route.key, &scope, client.send(request))
        .await
        .map_err(|e| {
            tracing::warn!(
                "proxy: downstream failed, route={}, endpoint={}, error={}",
                route.key,
                endpoint,
                e
            );
            e
        })?;
    ctx.downstream_response = Some(response);
    Ok(StageOutcome::Continue)
}

/// The backend's response becomes the gateway's, status and body untouched.
pub(super) fn map_response(ctx: &mut PipelineContext) -> Result<StageOutcome, GatewayError> {
    let mut response = ctx
        .downstream_response
        .take()
        .ok_or_else(|| GatewayError::Internal("no downstream response".to_string()))?;
    remove_hop_headers(response.headers_mut());
    ctx.response = Some(response);
    Ok(StageOutcome::Continue)
}

pub(super) fn release(ctx: &mut PipelineContext) -> Result<StageOutcome, GatewayError> {
    ctx.release_lease();
    Ok(StageOutcome::Continue)
}
