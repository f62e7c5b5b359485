mod admission;
mod cache;
mod downstream;
pub(crate) mod request;

use crate::auth::Authenticator;
use crate::cache::OutputCache;
use crate::proxy::context::PipelineContext;
use crate::ratelimit::RateLimiter;
use crate::routing::RouteTable;
use crate::upstream::{DownstreamClient, LoadBalancerHouse, QosWrapper};
use arc_swap::ArcSwap;
use std::sync::Arc;

/// What the pipeline does after a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    /// Run the next stage.
    Continue,
    /// A response is ready (cache hit); skip the remaining stages.
    Respond,
    /// The stage recorded an error; skip the remaining stages.
    Halt,
}

/// One pipeline step. Enum dispatch; each variant holds the shared state it
/// needs and is built once at startup.
pub enum Stage {
    RouteResolution(Arc<ArcSwap<RouteTable>>),
    RateLimit(Arc<RateLimiter>),
    Authentication(Arc<dyn Authenticator>),
    Authorisation,
    CacheLookup(Arc<OutputCache>),
    RequestConstruction,
    LoadBalancerLease(Arc<LoadBalancerHouse>),
    Downstream {
        client: Arc<dyn DownstreamClient>,
        qos: Arc<QosWrapper>,
    },
    ResponseMapping,
    CacheStore(Arc<OutputCache>),
    LoadBalancerRelease,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::RouteResolution(_) => "route_resolution",
            Stage::RateLimit(_) => "rate_limit",
            Stage::Authentication(_) => "authentication",
            Stage::Authorisation => "authorisation",
            Stage::CacheLookup(_) => "cache_lookup",
            Stage::RequestConstruction => "request_construction",
            Stage::LoadBalancerLease(_) => "load_balancer_lease",
            Stage::Downstream { .. } => "downstream",
            Stage::ResponseMapping => "response_mapping",
            Stage::CacheStore(_) => "cache_store",
            Stage::LoadBalancerRelease => "load_balancer_release",
        }
    }

    /// Run the stage. A failure is recorded on `ctx` and reported as
    /// [`StageOutcome::Halt`].
    pub async fn process(&self, ctx: &mut PipelineContext) -> StageOutcome {
        let result = match self {
            Stage::RouteResolution(table) => admission::resolve_route(table, ctx),
            Stage::RateLimit(limiter) => admission::check_rate_limit(limiter, ctx).await,
            Stage::Authentication(authenticator) => {
                admission::authenticate(authenticator.as_ref(), ctx).await
            }
            Stage::Authorisation => admission::authorise_claims(ctx),
            Stage::CacheLookup(output) => cache::lookup(output, ctx),
            Stage::RequestConstruction => request::build_downstream_request(ctx).map(|req| {
                ctx.downstream_request = Some(req);
                StageOutcome::Continue
            }),
            Stage::LoadBalancerLease(house) => downstream::lease(house, ctx).await,
            Stage::Downstream { client, qos } => {
                downstream::call(client.as_ref(), qos, ctx).await
            }
            Stage::ResponseMapping => downstream::map_response(ctx),
            Stage::CacheStore(output) => cache::store(output, ctx),
            Stage::LoadBalancerRelease => downstream::release(ctx),
        };

        match result {
            Ok(outcome) => outcome,
            Err(e) => {
                ctx.add_error(e);
                StageOutcome::Halt
            }
        }
    }
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
