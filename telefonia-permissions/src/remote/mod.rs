//! Source of truth for the permission matrix
//!
//! The cache only talks to the backend through [`RemoteSource`], so tests and
//! alternative transports can stand in for the HTTP client.

pub mod http;
pub mod wire;

use async_trait::async_trait;

use crate::models::{Matrix, Role, RolePermissions, Version};
use crate::Result;

pub use http::HttpRemoteSource;

/// Remote key-value store holding the authoritative matrix
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Full role -> permission -> granted table
    async fn fetch_matrix(&self) -> Result<Matrix>;

    /// Grants of a single role; an unknown role yields an empty set
    async fn fetch_role(&self, role: &Role) -> Result<RolePermissions>;

    /// Current freshness token
    async fn fetch_version(&self) -> Result<Version>;

    /// Replace the whole matrix, returning what the server accepted
    async fn replace_matrix(&self, matrix: &Matrix) -> Result<Matrix>;

    /// Restore the built-in defaults, returning the resulting matrix
    async fn reset_defaults(&self) -> Result<Matrix>;
}
