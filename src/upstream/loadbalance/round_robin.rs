use crate::discovery::{Service, ServiceDiscovery};
use crate::error::GatewayError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Round-robin over a backend list that is re-read on every lease.
///
/// The cursor only ever advances; it is reduced modulo the list length at
/// lease time, so backends added or removed between leases never push it
/// out of range.
pub struct RoundRobinBalancer {
    discovery: Arc<dyn ServiceDiscovery>,
    cursor: AtomicUsize,
}

impl RoundRobinBalancer {
    pub fn new(discovery: Arc<dyn ServiceDiscovery>) -> Self {
        Self {
            discovery,
            cursor: AtomicUsize::new(0),
        }
    }

    pub async fn lease(&self) -> Result<Service, GatewayError> {
        let services = self.discovery.get_services().await?;
        if services.is_empty() {
            return Err(GatewayError::NoServiceAvailable(
                "round robin found no services".to_string(),
            ));
        }
        let n = self.cursor.fetch_add(1, Ordering::Relaxed);
        Ok(services[n % services.len()].clone())
    }
}
