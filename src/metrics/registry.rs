use anyhow::Result;
use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

/// Histogram bucket boundaries for latency metrics (seconds).
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Thin handle around the global metrics recorder.
///
/// After `Metrics::install()` the `metrics` macros can be used anywhere in
/// the crate. The handle is retained for rendering the admin `/metrics`
/// endpoint.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder and register metric
    /// descriptions. Call once at startup.
    pub fn install() -> Result<Self> {
        let handle = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("_duration_seconds".to_string()),
                LATENCY_BUCKETS,
            )?
            .install_recorder()?;

        describe();
        Ok(Self { handle })
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

fn describe() {
    // request path
    describe_counter!(
        "gateway_http_requests_total",
        Unit::Count,
        "Total HTTP requests processed by the pipeline"
    );
    describe_histogram!(
        "gateway_http_request_duration_seconds",
        Unit::Seconds,
        "Total request duration from client perspective"
    );
    describe_gauge!(
        "gateway_connections_active",
        Unit::Count,
        "Number of active inbound connections"
    );
    describe_counter!(
        "gateway_connections_total",
        Unit::Count,
        "Total connections accepted"
    );

    // admission
    describe_counter!(
        "gateway_rate_limit_rejected_total",
        Unit::Count,
        "Total requests rejected by the rate limiter"
    );

    // output cache
    describe_counter!(
        "gateway_cache_hits_total",
        Unit::Count,
        "Responses served from the output cache"
    );
    describe_counter!(
        "gateway_cache_misses_total",
        Unit::Count,
        "Cacheable requests not found in the output cache"
    );

    // downstream
    describe_counter!(
        "gateway_lb_leases_total",
        Unit::Count,
        "Backend leases handed out by load balancers"
    );
    describe_counter!(
        "gateway_downstream_timeouts_total",
        Unit::Count,
        "Downstream calls that exceeded the route timeout"
    );
    describe_counter!(
        "gateway_circuit_breaker_rejected_total",
        Unit::Count,
        "Total requests rejected by an open circuit breaker"
    );
    describe_counter!(
        "gateway_circuit_breaker_opened_total",
        Unit::Count,
        "Circuit breaker transitions to open"
    );
    describe_gauge!(
        "gateway_discovered_nodes",
        Unit::Count,
        "Number of nodes discovered per service"
    );

    // config
    describe_gauge!(
        "gateway_config_routes_total",
        Unit::Count,
        "Number of routes currently loaded"
    );
    describe_counter!(
        "gateway_config_reloads_total",
        Unit::Count,
        "Route table reload events"
    );
}
