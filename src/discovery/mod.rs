pub mod client;

pub use client::{ConsulClient, ConsulServiceNode};

use crate::config::{HostAndPort, ServiceDiscoveryConfig};
use crate::error::GatewayError;
use crate::routing::CompiledRoute;
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// A backend endpoint. Cheap to clone; the `host:port` string is shared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub metadata: HashMap<String, String>,
    endpoint: Arc<str>,
}

impl Service {
    pub fn new(id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        let endpoint: Arc<str> = format!("{}:{}", host, port).into();
        Self {
            id: id.into(),
            host,
            port,
            metadata: HashMap::new(),
            endpoint,
        }
    }

    #[inline]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl From<&HostAndPort> for Service {
    fn from(hp: &HostAndPort) -> Self {
        Service::new(format!("{}:{}", hp.host, hp.port), hp.host.as_str(), hp.port)
    }
}

impl From<ConsulServiceNode> for Service {
    fn from(node: ConsulServiceNode) -> Self {
        let mut svc = Service::new(node.service_id, node.service_address, node.service_port);
        svc.metadata = node.service_meta;
        svc
    }
}

/// Source of the current backend list for one route.
#[async_trait]
pub trait ServiceDiscovery: Send + Sync {
    async fn get_services(&self) -> Result<Vec<Service>, GatewayError>;
}

/// Backends listed directly in the route configuration.
pub struct ConfigurationServiceProvider {
    services: Vec<Service>,
}

impl ConfigurationServiceProvider {
    pub fn new(services: Vec<Service>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl ServiceDiscovery for ConfigurationServiceProvider {
    async fn get_services(&self) -> Result<Vec<Service>, GatewayError> {
        Ok(self.services.clone())
    }
}

struct CachedServices {
    fetched_at: Instant,
    services: Vec<Service>,
}

/// Backends registered in consul under a service name.
///
/// A fetched list is reused for `refresh`. If consul fails and a previous
/// list exists, that list keeps serving.
pub struct ConsulServiceProvider {
    client: ConsulClient,
    service_name: String,
    refresh: Duration,
    cached: ArcSwapOption<CachedServices>,
}

impl ConsulServiceProvider {
    pub fn new(client: ConsulClient, service_name: impl Into<String>, refresh: Duration) -> Self {
        Self {
            client,
            service_name: service_name.into(),
            refresh,
            cached: ArcSwapOption::empty(),
        }
    }
}

#[async_trait]
impl ServiceDiscovery for ConsulServiceProvider {
    async fn get_services(&self) -> Result<Vec<Service>, GatewayError> {
        let previous = self.cached.load_full();
        if let Some(ref cached) = previous {
            if cached.fetched_at.elapsed() < self.refresh {
                return Ok(cached.services.clone());
            }
        }

        match self.client.query_healthy_services(&self.service_name).await {
            Ok(nodes) => {
                let services: Vec<Service> = nodes.into_iter().map(Service::from).collect();
                metrics::gauge!(
                    "gateway_discovered_nodes",
                    "service" => self.service_name.clone(),
                )
                .set(services.len() as f64);
                self.cached.store(Some(Arc::new(CachedServices {
                    fetched_at: Instant::now(),
                    services: services.clone(),
                })));
                Ok(services)
            }
            Err(e) => match previous {
                Some(cached) => {
                    tracing::warn!(
                        "discovery: consul: query failed, serving stale list, service={}, error={}",
                        self.service_name,
                        e
                    );
                    Ok(cached.services.clone())
                }
                None => Err(GatewayError::Discovery(format!(
                    "service={}: {}",
                    self.service_name, e
                ))),
            },
        }
    }
}

/// Picks the discovery provider for a route.
pub struct ServiceDiscoveryFactory {
    consul: Option<(ConsulClient, Duration)>,
}

impl ServiceDiscoveryFactory {
    pub fn new(config: Option<&ServiceDiscoveryConfig>) -> Result<Self, GatewayError> {
        let consul = match config {
            Some(sd) => {
                let client =
                    ConsulClient::new(&sd.address, sd.token.clone(), sd.datacenter.clone())?;
                Some((client, Duration::from_secs(sd.poll_interval_secs)))
            }
            None => None,
        };
        Ok(Self { consul })
    }

    pub fn get(&self, route: &CompiledRoute) -> Result<Arc<dyn ServiceDiscovery>, GatewayError> {
        match route.service_name {
            Some(ref name) => {
                let (client, refresh) = self.consul.as_ref().ok_or_else(|| {
                    GatewayError::Config(format!(
                        "route '{}' uses service_name '{}' but no service discovery is configured",
                        route.key, name
                    ))
                })?;
                Ok(Arc::new(ConsulServiceProvider::new(
                    client.clone(),
                    name.as_str(),
                    *refresh,
                )))
            }
            None => Ok(Arc::new(ConfigurationServiceProvider::new(
                route.downstream_hosts.clone(),
            ))),
        }
    }
}
