//! Logging setup for the cache-tags binary and embedding services
//!
//! Provides:
//! - Environment-driven logging configuration
//! - Structured logging with tracing

pub mod config;
pub mod tracing_config;

pub use config::{LogFormat, MonitoringConfig};
pub use tracing_config::init_tracing;
