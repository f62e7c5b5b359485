pub mod auth;
pub mod cache;
pub mod config;
pub mod discovery;
pub mod error;
pub mod metrics;
pub mod proxy;
pub mod ratelimit;
pub mod routing;
pub mod server;
pub mod upstream;
