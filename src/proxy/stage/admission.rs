use super::StageOutcome;
use crate::auth::{authorise, Authenticator};
use crate::error::GatewayError;
use crate::proxy::context::PipelineContext;
use crate::ratelimit::RateLimiter;
use crate::routing::RouteTable;
use arc_swap::ArcSwap;

pub(super) fn resolve_route(
    table: &ArcSwap<RouteTable>,
    ctx: &mut PipelineContext,
) -> Result<StageOutcome, GatewayError> {
    let resolved = table.load().resolve(&ctx.method, ctx.path());
    let downstream_route = match resolved {
        Ok(r) => r,
        Err(e) => {
            tracing::debug!(
                "proxy: no route, method={}, path={}, error={}",
                ctx.method,
                ctx.path(),
                e
            );
            return Err(e);
        }
    };

    if let Some(ref key) = downstream_route.route.request_id_key {
        if let Some(id) = ctx.headers.get(key).and_then(|v| v.to_str().ok()) {
            ctx.request_id = id.to_string();
        }
    }
    ctx.downstream_route = Some(downstream_route);
    Ok(StageOutcome::Continue)
}

pub(super) async fn check_rate_limit(
    limiter: &RateLimiter,
    ctx: &mut PipelineContext,
) -> Result<StageOutcome, GatewayError> {
    let route = ctx.route()?.route.clone();
    let Some(ref policy) = route.rate_limit else {
        return Ok(StageOutcome::Continue);
    };

    let client_id = policy.client_id(&ctx.headers);
    if policy.is_whitelisted(&client_id) {
        return Ok(StageOutcome::Continue);
    }

    let decision = limiter.check(&route.key, &client_id, policy).await;
    ctx.rate_limit_headers = decision.headers(policy);
    if decision.allowed {
        Ok(StageOutcome::Continue)
    } else {
        Err(policy.rejection())
    }
}

pub(super) async fn authenticate(
    authenticator: &dyn Authenticator,
    ctx: &mut PipelineContext,
) -> Result<StageOutcome, GatewayError> {
    let route = ctx.route()?.route.clone();
    let Some(ref policy) = route.authentication else {
        return Ok(StageOutcome::Continue);
    };

    match authenticator.authenticate(policy, &ctx.headers).await {
        Ok(claims) => {
            ctx.claims = Some(claims);
            Ok(StageOutcome::Continue)
        }
        Err(e) => {
            tracing::debug!(
                "auth: rejected, route={}, provider={}, error={}",
                route.key,
                policy.provider_key,
                e
            );
            Err(e)
        }
    }
}

/// Claim requirements and allowed scopes. Routes without authentication
/// are not authorised against anything.
pub(super) fn authorise_claims(ctx: &mut PipelineContext) -> Result<StageOutcome, GatewayError> {
    let route = &ctx.route()?.route;
    let Some(ref policy) = route.authentication else {
        return Ok(StageOutcome::Continue);
    };
    let Some(ref claims) = ctx.claims else {
        return Err(GatewayError::Unauthorised("no claims".to_string()));
    };
    authorise(claims, &route.claims_requirement, &policy.allowed_scopes)?;
    Ok(StageOutcome::Continue)
}
