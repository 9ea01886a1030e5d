pub mod models;
pub mod remote;
pub mod cache;
pub mod service;
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod resilience;

#[cfg(test)]
pub mod test_helpers;

pub use config::PermissionCacheConfig;
pub use error::{Error, Result};
pub use service::PermissionCacheService;
