//! Built-in permission catalogue and default matrix
//!
//! The cache layer never branches on these values; they are data consulted
//! when a role has to be resolved without remote input.

use std::sync::LazyLock;

use super::{Matrix, RolePermissions};

/// Landing view every logged-in user must be able to reach
pub const BASELINE_PERMISSION: &str = "dashboard.view";

/// Description of a known permission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PermissionInfo {
    pub id: &'static str,
    pub name: &'static str,
    pub category: &'static str,
}

const fn info(id: &'static str, name: &'static str, category: &'static str) -> PermissionInfo {
    PermissionInfo { id, name, category }
}

/// Every permission the administrative UI knows about
pub const PERMISSION_CATALOG: &[PermissionInfo] = &[
    info("dashboard.view", "View dashboard", "Dashboard"),
    info("companies.view", "View contracts", "Contracts"),
    info("companies.create", "Create contracts", "Contracts"),
    info("companies.edit", "Edit contracts", "Contracts"),
    info("companies.delete", "Delete contracts", "Contracts"),
    info("invoices.view", "View invoices", "Invoices"),
    info("invoices.upload", "Upload invoices", "Invoices"),
    info("invoices.edit", "Edit invoices", "Invoices"),
    info("invoices.delete", "Delete invoices", "Invoices"),
    info("reports.view", "View reports", "Reports"),
    info("reports.export", "Export reports", "Reports"),
    info("admin.view", "Administration panel", "Administration"),
    info("users.view", "View users", "Administration"),
    info("users.create", "Create users", "Administration"),
    info("users.edit", "Edit users", "Administration"),
    info("users.delete", "Delete users", "Administration"),
    info("permissions.manage", "Manage permissions", "Administration"),
    info("consultant.dashboard", "Consultant dashboard", "Consultant"),
    info("consultant.proposals", "Manage proposals", "Consultant"),
];

/// Granted permissions per built-in role; everything else in the catalogue
/// is explicitly denied.
const DEFAULT_GRANTS: &[(&str, &[&str])] = &[
    (
        "admin",
        &[
            "dashboard.view",
            "companies.view",
            "companies.create",
            "companies.edit",
            "companies.delete",
            "invoices.view",
            "invoices.upload",
            "invoices.edit",
            "invoices.delete",
            "reports.view",
            "reports.export",
            "admin.view",
            "users.view",
            "users.create",
            "users.edit",
            "users.delete",
            "permissions.manage",
        ],
    ),
    (
        "supervisor",
        &[
            "dashboard.view",
            "companies.view",
            "companies.create",
            "companies.edit",
            "invoices.view",
            "invoices.upload",
            "invoices.edit",
            "reports.view",
            "reports.export",
            "users.view",
        ],
    ),
    (
        "consultant",
        &[
            "dashboard.view",
            "companies.view",
            "companies.create",
            "companies.edit",
            "invoices.view",
            "invoices.upload",
            "consultant.dashboard",
            "consultant.proposals",
        ],
    ),
    ("client", &["dashboard.view", "companies.view", "invoices.view"]),
];

static DEFAULT_MATRIX: LazyLock<Matrix> = LazyLock::new(|| {
    DEFAULT_GRANTS
        .iter()
        .map(|(role, granted)| {
            let permissions: RolePermissions = PERMISSION_CATALOG
                .iter()
                .map(|perm| (perm.id, granted.contains(&perm.id)))
                .collect();
            (*role, permissions)
        })
        .collect()
});

/// The built-in default matrix
#[must_use]
pub fn default_matrix() -> &'static Matrix {
    &DEFAULT_MATRIX
}

/// Permissions that open a route; any one of them is sufficient.
#[must_use]
pub fn page_permissions(page: &str) -> &'static [&'static str] {
    match page {
        "/dashboard" => &["dashboard.view"],
        "/companies" => &["companies.view"],
        "/invoices" => &["invoices.view"],
        "/reports" => &["reports.view"],
        "/admin" => &["admin.view"],
        "/consultant-dashboard" => &["consultant.dashboard"],
        _ => &[],
    }
}

#[must_use]
pub fn permission_info(id: &str) -> Option<&'static PermissionInfo> {
    PERMISSION_CATALOG.iter().find(|perm| perm.id == id)
}
