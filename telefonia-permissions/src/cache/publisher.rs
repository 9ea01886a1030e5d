//! Ordered replacement of the cached snapshot
//!
//! Every write to the [`MatrixStore`] goes through [`SnapshotPublisher`], which
//! holds a commit lock across the swap and the notification so subscribers see
//! changes in exactly the order the store applied them.
//!
//! The lock also guards a local-write epoch. A fetch records the epoch before
//! it asks the server for anything; if an update, reset or role merge commits
//! while the fetch is in flight, the fetched matrix may predate that write and
//! is dropped.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use super::events::{ChangeSource, EventBus};
use super::store::MatrixStore;
use crate::models::{CacheEntry, Matrix, Role, RolePermissions, Version};

#[derive(Debug)]
pub struct SnapshotPublisher {
    store: Arc<MatrixStore>,
    events: EventBus,
    /// Local-write epoch, bumped by every commit that did not come from a fetch.
    commit: Mutex<u64>,
}

impl SnapshotPublisher {
    #[must_use]
    pub fn new(store: Arc<MatrixStore>, events: EventBus) -> Self {
        Self {
            store,
            events,
            commit: Mutex::new(0),
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<MatrixStore> {
        &self.store
    }

    #[must_use]
    pub const fn events(&self) -> &EventBus {
        &self.events
    }

    /// Current local-write epoch, to be passed back to [`Self::publish_fetched`].
    #[must_use]
    pub fn local_epoch(&self) -> u64 {
        *self.commit.lock()
    }

    /// Install the result of a remote fetch.
    ///
    /// `observed_epoch` is the [`Self::local_epoch`] read before the fetch
    /// started. A result that raced a local write, or one older than the held
    /// version, is discarded and the held entry is returned; an equal version
    /// replaces it.
    pub fn publish_fetched(&self, matrix: Matrix, version: Version, observed_epoch: u64) -> Arc<CacheEntry> {
        let epoch = self.commit.lock();
        let current = self.store.get();
        if *epoch != observed_epoch {
            debug!(
                incoming = %version,
                observed_epoch,
                current_epoch = *epoch,
                "Discarding permission fetch that raced a local write"
            );
            return current;
        }
        if version < current.version {
            debug!(
                incoming = %version,
                held = %current.version,
                "Discarding out-of-order permission fetch"
            );
            return current;
        }

        let entry = Arc::new(CacheEntry::fetched(matrix, version));
        self.store.swap(entry.clone());
        self.events.publish(ChangeSource::Refresh, entry.clone());
        info!(
            version = %version,
            roles = entry.matrix.len(),
            "Permission matrix refreshed"
        );
        entry
    }

    /// Install a matrix accepted by the server outside a fetch (update, reset).
    ///
    /// The held version is kept, so the next poll still reconciles with the
    /// server's own freshness token.
    pub fn publish_local(&self, source: ChangeSource, matrix: Matrix) -> Arc<CacheEntry> {
        let mut epoch = self.commit.lock();
        *epoch += 1;
        let entry = Arc::new(self.store.get().with_matrix(matrix));
        self.store.swap(entry.clone());
        self.events.publish(source, entry.clone());
        info!(?source, roles = entry.matrix.len(), "Permission matrix replaced");
        entry
    }

    /// Add one role to the snapshot unless it appeared in the meantime.
    pub fn merge_role(&self, role: Role, permissions: RolePermissions) -> Arc<CacheEntry> {
        let mut epoch = self.commit.lock();
        let current = self.store.get();
        if current.matrix.contains_role(role.as_str()) {
            return current;
        }
        *epoch += 1;

        let mut matrix = (*current.matrix).clone();
        debug!(role = %role, permissions = permissions.len(), "Merging role into permission cache");
        matrix.insert_role(role, permissions);
        let entry = Arc::new(CacheEntry {
            matrix: Arc::new(matrix),
            version: current.version,
            fetched_at: current.fetched_at,
        });
        self.store.swap(entry.clone());
        self.events.publish(ChangeSource::RoleLoaded, entry.clone());
        entry
    }
}
