pub mod least_connection;
pub mod round_robin;

use crate::discovery::{Service, ServiceDiscovery};
use crate::error::GatewayError;
use least_connection::LeastConnectionBalancer;
use round_robin::RoundRobinBalancer;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadBalancerKind {
    RoundRobin,
    LeastConnection,
    NoLoadBalancer,
}

impl FromStr for LoadBalancerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "roundrobin" | "round_robin" => Ok(Self::RoundRobin),
            "leastconnection" | "least_connection" => Ok(Self::LeastConnection),
            "noloadbalancer" | "no_load_balancer" | "" => Ok(Self::NoLoadBalancer),
            other => Err(format!("unknown load balancer '{}'", other)),
        }
    }
}

impl fmt::Display for LoadBalancerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RoundRobin => write!(f, "RoundRobin"),
            Self::LeastConnection => write!(f, "LeastConnection"),
            Self::NoLoadBalancer => write!(f, "NoLoadBalancer"),
        }
    }
}

/// Always hands out the first backend discovery reports.
pub struct NoLoadBalancer {
    discovery: Arc<dyn ServiceDiscovery>,
}

impl NoLoadBalancer {
    pub fn new(discovery: Arc<dyn ServiceDiscovery>) -> Self {
        Self { discovery }
    }

    pub async fn lease(&self) -> Result<Service, GatewayError> {
        self.discovery
            .get_services()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| GatewayError::NoServiceAvailable("no services configured".to_string()))
    }
}

/// Enum-dispatched balancer, one instance per route key.
pub enum LoadBalancer {
    RoundRobin(RoundRobinBalancer),
    LeastConnection(LeastConnectionBalancer),
    NoLoadBalancer(NoLoadBalancer),
}

impl LoadBalancer {
    pub fn new(kind: LoadBalancerKind, discovery: Arc<dyn ServiceDiscovery>) -> Arc<Self> {
        Arc::new(match kind {
            LoadBalancerKind::RoundRobin => Self::RoundRobin(RoundRobinBalancer::new(discovery)),
            LoadBalancerKind::LeastConnection => {
                Self::LeastConnection(LeastConnectionBalancer::new(discovery))
            }
            LoadBalancerKind::NoLoadBalancer => Self::NoLoadBalancer(NoLoadBalancer::new(discovery)),
        })
    }

    pub fn kind(&self) -> LoadBalancerKind {
        match self {
            Self::RoundRobin(_) => LoadBalancerKind::RoundRobin,
            Self::LeastConnection(_) => LoadBalancerKind::LeastConnection,
            Self::NoLoadBalancer(_) => LoadBalancerKind::NoLoadBalancer,
        }
    }

    /// Take the next backend. The returned [`Lease`] gives it back exactly
    /// once, either through [`Lease::release`] or when dropped.
    pub async fn lease(self: &Arc<Self>) -> Result<Lease, GatewayError> {
        let service = match self.as_ref() {
            Self::RoundRobin(lb) => lb.lease().await?,
            Self::LeastConnection(lb) => lb.lease().await?,
            Self::NoLoadBalancer(lb) => lb.lease().await?,
        };
        Ok(Lease {
            service,
            balancer: self.clone(),
            released: false,
        })
    }

    fn release(&self, service: &Service) {
        match self {
            Self::LeastConnection(lb) => lb.release(service),
            Self::RoundRobin(_) | Self::NoLoadBalancer(_) => {}
        }
    }
}

/// A leased backend endpoint.
pub struct Lease {
    service: Service,
    balancer: Arc<LoadBalancer>,
    released: bool,
}

impl Lease {
    pub fn service(&self) -> &Service {
        &self.service
    }

    pub fn endpoint(&self) -> &str {
        self.service.endpoint()
    }

    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if !self.released {
            self.released = true;
            self.balancer.release(&self.service);
        }
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("endpoint", &self.service.endpoint())
            .field("balancer", &self.balancer.kind())
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.release_once();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::ConfigurationServiceProvider;

    fn provider(n: usize) -> Arc<dyn ServiceDiscovery> {
        let services = (0..n)
            .map(|i| Service::new(format!("s{}", i), format!("10.0.0.{}", i + 1), 8080))
            .collect();
        Arc::new(ConfigurationServiceProvider::new(services))
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("RoundRobin".parse::<LoadBalancerKind>(), Ok(LoadBalancerKind::RoundRobin));
        assert_eq!(
            "leastconnection".parse::<LoadBalancerKind>(),
            Ok(LoadBalancerKind::LeastConnection)
        );
        assert_eq!(
            "NoLoadBalancer".parse::<LoadBalancerKind>(),
            Ok(LoadBalancerKind::NoLoadBalancer)
        );
        assert!("Random".parse::<LoadBalancerKind>().is_err());
    }

    #[tokio::test]
    async fn test_no_load_balancer_always_first() {
        let lb = LoadBalancer::new(LoadBalancerKind::NoLoadBalancer, provider(3));
        for _ in 0..3 {
            assert_eq!(lb.lease().await.unwrap().endpoint(), "10.0.0.1:8080");
        }
    }

    #[tokio::test]
    async fn test_lease_release_is_idempotent_for_least_connection() {
        let lb = LoadBalancer::new(LoadBalancerKind::LeastConnection, provider(1));
        let lease = lb.lease().await.unwrap();
        let LoadBalancer::LeastConnection(ref inner) = *lb else {
            panic!("wrong balancer");
        };
        assert_eq!(inner.in_flight("10.0.0.1:8080"), 1);
        lease.release();
        assert_eq!(inner.in_flight("10.0.0.1:8080"), 0);
    }

    #[tokio::test]
    async fn test_dropped_lease_is_released() {
        let lb = LoadBalancer::new(LoadBalancerKind::LeastConnection, provider(1));
        {
            let _lease = lb.lease().await.unwrap();
        }
        let LoadBalancer::LeastConnection(ref inner) = *lb else {
            panic!("wrong balancer");
        };
        assert_eq!(inner.in_flight("10.0.0.1:8080"), 0);
    }

    #[tokio::test]
    async fn test_empty_backends_error_for_every_kind() {
        for kind in [
            LoadBalancerKind::RoundRobin,
            LoadBalancerKind::LeastConnection,
            LoadBalancerKind::NoLoadBalancer,
        ] {
            let lb = LoadBalancer::new(kind, provider(0));
            assert!(
                matches!(lb.lease().await, Err(GatewayError::NoServiceAvailable(_))),
                "{} should fail on an empty list",
                kind
            );
        }
    }
}
