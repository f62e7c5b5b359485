use super::request::downstream_path_and_query;
use super::StageOutcome;
use crate::cache::{cache_key, CachePolicy, CachedResponse, OutputCache};
use crate::error::GatewayError;
use crate::proxy::context::PipelineContext;
use http::Response;

pub(super) fn lookup(
    cache: &OutputCache,
    ctx: &mut PipelineContext,
) -> Result<StageOutcome, GatewayError> {
    let route = ctx.route()?.route.clone();
    let Some(ref policy) = route.cache else {
        return Ok(StageOutcome::Continue);
    };
    if !CachePolicy::is_cacheable(&ctx.method) {
        return Ok(StageOutcome::Continue);
    }

    let path_and_query = downstream_path_and_query(ctx)?;
    let body = policy.hash_body.then_some(ctx.body.as_ref());
    let key = cache_key(&ctx.method, &route.key, &path_and_query, body);

    if let Some(hit) = cache.get(&key, &policy.region) {
        tracing::debug!("cache: hit, route={}, region={}", route.key, policy.region);
        metrics::counter!("gateway_cache_hits_total", "route" => route.key.clone()).increment(1);
        let mut response = Response::new(hit.body.clone());
        *response.status_mut() = hit.status;
        *response.headers_mut() = hit.headers.clone();
        ctx.response = Some(response);
        ctx.served_from_cache = true;
        return Ok(StageOutcome::Respond);
    }

    metrics::counter!("gateway_cache_misses_total", "route" => route.key.clone()).increment(1);
    ctx.cache_key = Some(key);
    Ok(StageOutcome::Continue)
}

/// Store successful responses. A full cache is logged and skipped.
pub(super) fn store(
    cache: &OutputCache,
    ctx: &mut PipelineContext,
) -> Result<StageOutcome, GatewayError> {
    let route = ctx.route()?.route.clone();
    let (Some(policy), Some(key), Some(response)) =
        (route.cache.as_ref(), ctx.cache_key.as_deref(), ctx.response.as_ref())
    else {
        return Ok(StageOutcome::Continue);
    };
    if !response.status().is_success() {
        return Ok(StageOutcome::Continue);
    }

    let value = CachedResponse {
        status: response.status(),
        headers: response.headers().clone(),
        body: response.body().clone(),
    };
    if let Err(e) = cache.add(key, value, policy.ttl, &policy.region) {
        tracing::warn!("cache: store skipped, route={}, error={}", route.key, e);
    }
    Ok(StageOutcome::Continue)
}
