pub mod defaults;
pub mod matrix;

pub use defaults::{default_matrix, page_permissions, PermissionInfo, BASELINE_PERMISSION, PERMISSION_CATALOG};
pub use matrix::{CacheEntry, Lookup, Matrix, PermissionId, Role, RolePermissions, Version};
