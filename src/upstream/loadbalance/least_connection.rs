use crate::discovery::{Service, ServiceDiscovery};
use crate::error::GatewayError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Picks the backend with the fewest leases outstanding. Ties go to the
/// earliest backend in discovery order.
pub struct LeastConnectionBalancer {
    discovery: Arc<dyn ServiceDiscovery>,
    /// endpoint -> leases not yet released.
    in_flight: Mutex<HashMap<String, usize>>,
}

impl LeastConnectionBalancer {
    pub fn new(discovery: Arc<dyn ServiceDiscovery>) -> Self {
        Self {
            discovery,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub async fn lease(&self) -> Result<Service, GatewayError> {
        let services = self.discovery.get_services().await?;
        if services.is_empty() {
            return Err(GatewayError::NoServiceAvailable(
                "least connection found no services".to_string(),
            ));
        }

        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        // Forget idle backends that discovery no longer reports.
        in_flight.retain(|endpoint, n| *n > 0 || services.iter().any(|s| s.endpoint() == endpoint));

        let chosen = services
            .iter()
            .min_by_key(|s| in_flight.get(s.endpoint()).copied().unwrap_or(0))
            .cloned()
            .ok_or_else(|| GatewayError::NoServiceAvailable("no candidates".to_string()))?;
        *in_flight.entry(chosen.endpoint().to_string()).or_insert(0) += 1;
        Ok(chosen)
    }

    pub fn release(&self, service: &Service) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(n) = in_flight.get_mut(service.endpoint()) {
            *n = n.saturating_sub(1);
        }
    }

    pub fn in_flight(&self, endpoint: &str) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(endpoint)
            .copied()
            .unwrap_or(0)
    }
}
