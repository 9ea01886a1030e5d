//! Snapshot holder for the current permission matrix

use std::sync::Arc;

use parking_lot::RwLock;

use crate::models::CacheEntry;

/// In-memory holder of the current [`CacheEntry`]
///
/// Entries are swapped whole; a reader gets an `Arc` to an immutable entry
/// and never observes a partially written matrix. The lock is only held for
/// the pointer copy, never across an await point.
#[derive(Debug)]
pub struct MatrixStore {
    current: RwLock<Arc<CacheEntry>>,
}

impl MatrixStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_entry(CacheEntry::empty())
    }

    #[must_use]
    pub fn with_entry(entry: CacheEntry) -> Self {
        Self {
            current: RwLock::new(Arc::new(entry)),
        }
    }

    /// Last known snapshot
    #[must_use]
    pub fn get(&self) -> Arc<CacheEntry> {
        self.current.read().clone()
    }

    /// Atomically replace the snapshot, returning the previous one.
    pub fn set(&self, entry: CacheEntry) -> Arc<CacheEntry> {
        self.swap(Arc::new(entry))
    }

    pub fn swap(&self, entry: Arc<CacheEntry>) -> Arc<CacheEntry> {
        std::mem::replace(&mut *self.current.write(), entry)
    }
}

impl Default for MatrixStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Matrix, RolePermissions, Version};

    fn matrix_with(role: &str, permission: &str) -> Matrix {
        [(role, [(permission, true)].into_iter().collect::<RolePermissions>())]
            .into_iter()
            .collect()
    }

    #[test]
    fn test_starts_empty() {
        let store = MatrixStore::new();
        let entry = store.get();
        assert!(entry.matrix.is_empty());
        assert!(!entry.is_synchronized());
    }

    #[test]
    fn test_set_replaces_and_returns_previous() {
        let store = MatrixStore::new();
        let previous = store.set(CacheEntry::fetched(matrix_with("admin", "users.view"), Version(3)));
        assert!(previous.matrix.is_empty());

        let current = store.get();
        assert_eq!(current.version, Version(3));
        assert!(current.matrix.contains_role("admin"));
    }

    #[test]
    fn test_snapshots_are_isolated_from_later_writes() {
        let store = MatrixStore::new();
        store.set(CacheEntry::fetched(matrix_with("admin", "users.view"), Version(1)));
        let held = store.get();

        store.set(CacheEntry::fetched(matrix_with("client", "dashboard.view"), Version(2)));

        assert!(held.matrix.contains_role("admin"));
        assert!(!held.matrix.contains_role("client"));
        assert_eq!(held.version, Version(1));
    }

    #[test]
    fn test_concurrent_readers_see_whole_entries() {
        let store = Arc::new(MatrixStore::new());
        let writer = {
            let store = store.clone();
            std::thread::spawn(move || {
                for v in 1..=200 {
                    let role = if v % 2 == 0 { "even" } else { "odd" };
                    store.set(CacheEntry::fetched(matrix_with(role, "x"), Version(v)));
                }
            })
        };

        for _ in 0..200 {
            let entry = store.get();
            if entry.version.is_zero() {
                continue;
            }
            let expected = if entry.version.0 % 2 == 0 { "even" } else { "odd" };
            assert!(entry.matrix.contains_role(expected));
            assert_eq!(entry.matrix.len(), 1);
        }
        writer.join().unwrap();
    }
}
