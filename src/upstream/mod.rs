pub mod circuit_breaker;
pub mod client;
pub mod house;
pub mod loadbalance;
pub mod qos;

pub use circuit_breaker::{BreakerCheck, BreakerSettings, BreakerState, CircuitBreakerRegistry};
pub use client::{DownstreamClient, HttpDownstreamClient};
pub use house::LoadBalancerHouse;
pub use loadbalance::{Lease, LoadBalancer, LoadBalancerKind};
pub use qos::{BreakerScope, QosPolicy, QosWrapper};
