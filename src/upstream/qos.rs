use super::circuit_breaker::{BreakerCheck, BreakerSettings, CircuitBreaker, CircuitBreakerRegistry};
use crate::config::QosConfig;
use crate::error::GatewayError;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerScope {
    /// One breaker shared by every backend of the route.
    Route,
    /// One breaker per route and backend endpoint.
    Host,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QosPolicy {
    pub timeout: Duration,
    pub breaker: BreakerSettings,
    pub scope: BreakerScope,
}

impl QosPolicy {
    pub fn from_config(cfg: &QosConfig) -> Self {
        Self {
            timeout: Duration::from_millis(cfg.timeout_value_ms),
            breaker: BreakerSettings {
                failure_threshold: cfg.exceptions_allowed_before_breaking.max(1),
                break_duration: Duration::from_millis(cfg.duration_of_break_ms),
                half_open_trials: cfg.half_open_trials.max(1),
                failure_window: Duration::from_millis(cfg.failure_window_ms),
            },
            scope: if cfg.scope == "host" {
                BreakerScope::Host
            } else {
                BreakerScope::Route
            },
        }
    }

    pub fn scope_key(&self, route_key: &str, endpoint: &str) -> String {
        match self.scope {
            BreakerScope::Route => route_key.to_string(),
            BreakerScope::Host => format!("{}@{}", route_key, endpoint),
        }
    }
}

/// Settles one admitted call on its breaker. A call dropped before it
/// settles (the caller went away mid-flight) counts as a failure.
struct Admission {
    breaker: Arc<CircuitBreaker>,
    probe: bool,
    settled: bool,
}

impl Admission {
    fn succeed(mut self) {
        self.settled = true;
        self.breaker.record_success(self.probe);
    }

    fn fail(mut self) -> bool {
        self.settled = true;
        self.breaker.record_failure(self.probe)
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.record_failure(self.probe);
        }
    }
}

/// Timeout plus circuit breaker around downstream calls.
#[derive(Default)]
pub struct QosWrapper {
    breakers: CircuitBreakerRegistry,
}

impl QosWrapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    /// Run `call` for `route` under `policy`, with the breaker chosen by
    /// `scope`. Without a policy the call runs as is.
    ///
    /// An open breaker rejects before `call` is polled. Errors and timeouts
    /// count as failures; any response the backend produced, whatever its
    /// status, counts as a success.
    pub async fn execute<T, F>(
        &self,
        policy: Option<&QosPolicy>,
        route: &str,
        scope: &str,
        call: F,
    ) -> Result<T, GatewayError>
    where
        F: Future<Output = Result<T, GatewayError>>,
    {
        let Some(policy) = policy else {
            return call.await;
        };

        let breaker = self.breakers.get_or_create(scope, &policy.breaker);
        let probe = match breaker.check() {
            BreakerCheck::Allowed => false,
            BreakerCheck::Probe => true,
            BreakerCheck::Rejected => {
                tracing::debug!("qos: circuit open, rejecting, scope={}", scope);
                metrics::counter!(
                    "gateway_circuit_breaker_rejected_total",
                    "scope" => scope.to_string(),
                )
                .increment(1);
                return Err(GatewayError::CircuitOpen(scope.to_string()));
            }
        };
        let admission = Admission {
            breaker,
            probe,
            settled: false,
        };

        let result = match tokio::time::timeout(policy.timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    "qos: downstream timed out, route={}, scope={}, timeout_ms={}",
                    route,
                    scope,
                    policy.timeout.as_millis()
                );
                metrics::counter!(
                    "gateway_downstream_timeouts_total",
                    "route" => route.to_string(),
                )
                .increment(1);
                Err(GatewayError::DownstreamTimeout)
            }
        };

        match result {
            Ok(value) => {
                admission.succeed();
                Ok(value)
            }
            Err(e) => {
                if admission.fail() {
                    metrics::counter!(
                        "gateway_circuit_breaker_opened_total",
                        "scope" => scope.to_string(),
                    )
                    .increment(1);
                }
                Err(e)
            }
        }
    }
}
