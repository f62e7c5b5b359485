use super::loadbalance::LoadBalancer;
use crate::discovery::ServiceDiscoveryFactory;
use crate::error::GatewayError;
use crate::routing::CompiledRoute;
use arc_swap::ArcSwap;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

/// Registry of live load balancers, one per route key.
///
/// Balancers are built on first use and shared by every request on that
/// route. Construction happens under the map's shard lock, so concurrent
/// first requests still produce a single instance.
///
/// Each balancer remembers the route table generation it was built from. A
/// route from a newer table replaces it; a request still holding a route
/// from an older table gets a detached balancer that is never registered.
pub struct LoadBalancerHouse {
    balancers: DashMap<String, Registered>,
    discovery: ArcSwap<ServiceDiscoveryFactory>,
}

struct Registered {
    generation: u64,
    balancer: Arc<LoadBalancer>,
}

impl LoadBalancerHouse {
    pub fn new(discovery: Arc<ServiceDiscoveryFactory>) -> Self {
        Self {
            balancers: DashMap::new(),
            discovery: ArcSwap::new(discovery),
        }
    }

    fn build(&self, route: &CompiledRoute) -> Result<Arc<LoadBalancer>, GatewayError> {
        let provider = self.discovery.load().get(route)?;
        tracing::debug!(
            "lb: created balancer, route={}, generation={}, type={}",
            route.key,
            route.generation,
            route.load_balancer
        );
        Ok(LoadBalancer::new(route.load_balancer, provider))
    }

    pub fn get(&self, route: &CompiledRoute) -> Result<Arc<LoadBalancer>, GatewayError> {
        // Fast path: no allocation when the balancer exists.
        if let Some(entry) = self.balancers.get(&route.key) {
            if entry.generation == route.generation {
                return Ok(entry.balancer.clone());
            }
        }

        match self.balancers.entry(route.key.clone()) {
            Entry::Occupied(mut entry) => {
                let current = entry.get().generation;
                if current == route.generation {
                    Ok(entry.get().balancer.clone())
                } else if current > route.generation {
                    tracing::debug!(
                        "lb: route from a replaced table, route={}, generation={}, current={}",
                        route.key,
                        route.generation,
                        current
                    );
                    drop(entry);
                    self.build(route)
                } else {
                    let balancer = self.build(route)?;
                    entry.insert(Registered {
                        generation: route.generation,
                        balancer: balancer.clone(),
                    });
                    Ok(balancer)
                }
            }
            Entry::Vacant(entry) => {
                let balancer = self.build(route)?;
                entry.insert(Registered {
                    generation: route.generation,
                    balancer: balancer.clone(),
                });
                Ok(balancer)
            }
        }
    }

    /// Drop every balancer. Called after a route table reload.
    pub fn clear(&self) {
        self.balancers.clear();
    }

    /// Swap the discovery provider factory and drop every balancer built
    /// from the old one.
    pub fn reset(&self, discovery: Arc<ServiceDiscoveryFactory>) {
        self.discovery.store(discovery);
        self.clear();
    }

    pub fn len(&self) -> usize {
        self.balancers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.balancers.is_empty()
    }
}
