pub mod auth;
mod breaker;
mod client;
mod error;
mod limiter;
pub mod types;

pub use breaker::CircuitBreaker;
pub use client::{ApiMetrics, VpsieApi, VpsieClient, VpsieClientConfig};
pub use error::VpsieError;
pub use limiter::ApiRateLimiter;

#[cfg(test)]
pub mod fake;
