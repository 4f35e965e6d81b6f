//! Shared infrastructure: configuration, errors, canonical JSON, utilities

pub mod canonical;
pub mod config;
pub mod error;
pub mod utils;

pub use config::{ApiKeyConfig, Config, CoordinatorConfig, GatewayConfig, HostConfig};
pub use error::{Error, Result};
