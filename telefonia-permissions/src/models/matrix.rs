//! Role x permission access matrix
//!
//! Roles and permission ids are opaque strings. A key that is not present in
//! a role's map is treated as not granted.

use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id!(
    /// Role identifier (`admin`, `client`, ...)
    Role
);

string_id!(
    /// Permission identifier, `resource.action` by convention
    PermissionId
);

/// Wire representation of a grant flag.
///
/// The permission backend stores grants as tinyint columns, so both `true`
/// and `1` mean granted.
#[derive(Deserialize)]
#[serde(untagged)]
enum GrantedValue {
    Bool(bool),
    Number(i64),
}

impl From<GrantedValue> for bool {
    fn from(value: GrantedValue) -> Self {
        match value {
            GrantedValue::Bool(granted) => granted,
            GrantedValue::Number(n) => n == 1,
        }
    }
}

/// Deserialize a grant flag that may be encoded as a boolean or an integer.
pub(crate) fn deserialize_granted<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    GrantedValue::deserialize(deserializer).map(Into::into)
}

/// Permission grants for a single role
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct RolePermissions(BTreeMap<PermissionId, bool>);

impl RolePermissions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw lookup; `None` means the key is absent.
    #[must_use]
    pub fn get(&self, permission: &str) -> Option<bool> {
        self.0.get(permission).copied()
    }

    /// Default-deny lookup
    #[must_use]
    pub fn is_granted(&self, permission: &str) -> bool {
        self.get(permission).unwrap_or(false)
    }

    pub fn set(&mut self, permission: impl Into<PermissionId>, granted: bool) {
        self.0.insert(permission.into(), granted);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PermissionId, bool)> {
        self.0.iter().map(|(id, granted)| (id, *granted))
    }

    /// Ids of every granted permission
    pub fn granted(&self) -> impl Iterator<Item = &PermissionId> {
        self.0.iter().filter(|(_, granted)| **granted).map(|(id, _)| id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Values from `self` layered over `base`.
    #[must_use]
    pub fn overlay_on(&self, base: &Self) -> Self {
        let mut merged = base.0.clone();
        merged.extend(self.0.iter().map(|(id, granted)| (id.clone(), *granted)));
        Self(merged)
    }
}

impl<'de> Deserialize<'de> for RolePermissions {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = BTreeMap::<PermissionId, GrantedValue>::deserialize(deserializer)?;
        Ok(Self(
            raw.into_iter()
                .map(|(id, granted)| (id, granted.into()))
                .collect(),
        ))
    }
}

impl<K: Into<PermissionId>> FromIterator<(K, bool)> for RolePermissions {
    fn from_iter<I: IntoIterator<Item = (K, bool)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(id, granted)| (id.into(), granted)).collect())
    }
}

/// Result of looking a permission up in a matrix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// Role and key are present
    Found(bool),
    /// Role is present but the key is not
    MissingKey,
    /// Role is absent
    MissingRole,
}

/// Full role -> permission -> granted table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Matrix(BTreeMap<Role, RolePermissions>);

impl Matrix {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn role(&self, role: &str) -> Option<&RolePermissions> {
        self.0.get(role)
    }

    #[must_use]
    pub fn contains_role(&self, role: &str) -> bool {
        self.0.contains_key(role)
    }

    pub fn insert_role(&mut self, role: impl Into<Role>, permissions: RolePermissions) {
        self.0.insert(role.into(), permissions);
    }

    pub fn roles(&self) -> impl Iterator<Item = &Role> {
        self.0.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Role, &RolePermissions)> {
        self.0.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn lookup(&self, role: &str, permission: &str) -> Lookup {
        match self.role(role) {
            None => Lookup::MissingRole,
            Some(permissions) => permissions
                .get(permission)
                .map_or(Lookup::MissingKey, Lookup::Found),
        }
    }

    /// Every role of `base` with this matrix's values layered on top, plus
    /// roles that only exist here.
    #[must_use]
    pub fn overlay_on(&self, base: &Self) -> Self {
        let mut merged = base.clone();
        for (role, permissions) in &self.0 {
            let layered = match base.role(role.as_str()) {
                Some(defaults) => permissions.overlay_on(defaults),
                None => permissions.clone(),
            };
            merged.0.insert(role.clone(), layered);
        }
        merged
    }
}

impl<R: Into<Role>> FromIterator<(R, RolePermissions)> for Matrix {
    fn from_iter<I: IntoIterator<Item = (R, RolePermissions)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(role, perms)| (role.into(), perms)).collect())
    }
}

/// Freshness token of the remote matrix
///
/// Only compared for staleness, never used to order concurrent writers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(pub i64);

impl Version {
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Immutable unit held by the matrix store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub matrix: Arc<Matrix>,
    pub version: Version,
    /// When the entry was last confirmed by the remote source or an accepted
    /// write. `None` until the first successful synchronization.
    pub fetched_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
    /// Entry held before anything has been loaded
    #[must_use]
    pub fn empty() -> Self {
        Self {
            matrix: Arc::new(Matrix::new()),
            version: Version::ZERO,
            fetched_at: None,
        }
    }

    /// Entry built from a successful remote fetch
    #[must_use]
    pub fn fetched(matrix: Matrix, version: Version) -> Self {
        Self {
            matrix: Arc::new(matrix),
            version,
            fetched_at: Some(Utc::now()),
        }
    }

    /// Entry restored from local persistence: served, but never synchronized
    #[must_use]
    pub fn restored(matrix: Matrix) -> Self {
        Self {
            matrix: Arc::new(matrix),
            version: Version::ZERO,
            fetched_at: None,
        }
    }

    /// Same version, new content, e.g. after the server accepted a write
    #[must_use]
    pub fn with_matrix(&self, matrix: Matrix) -> Self {
        Self {
            matrix: Arc::new(matrix),
            version: self.version,
            fetched_at: Some(Utc::now()),
        }
    }

    #[must_use]
    pub const fn is_synchronized(&self) -> bool {
        self.fetched_at.is_some()
    }
}

impl Default for CacheEntry {
    fn default() -> Self {
        Self::empty()
    }
}
