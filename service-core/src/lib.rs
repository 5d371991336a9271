//! Shared HTTP infrastructure for the entitlement service: errors, config
//! helpers, tracing setup, request middleware and request signing.
pub mod config;
pub mod error;
pub mod middleware;
pub mod observability;
pub mod retry;
pub mod utils;

pub use error::AppError;
