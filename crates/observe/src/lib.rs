//! Code required to provide or improve the observability of the relay. That
//! includes initialization logic for metrics and logging.
mod config;
pub mod metrics;
pub mod tracing;

pub use config::Config;
