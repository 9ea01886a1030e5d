//! Permission cache facade
//!
//! Lookups are synchronous and served from the in-memory snapshot. A role
//! that is not cached yet answers with the fallback policy and schedules a
//! background refresh. Administrative writes go to the remote source first and
//! land in the cache only once accepted.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use super::scheduler::{SchedulerState, SyncScheduler, TickOutcome};
use crate::cache::persist::{self, FileSnapshotStore, SnapshotPersistence, SnapshotWriter};
use crate::cache::{
    ChangeListener, ChangeSource, EventBus, MatrixChanged, MatrixStore, RefreshCoordinator,
    RefreshHandle, RefreshTrigger, SnapshotPublisher, Subscription,
};
use crate::config::{FallbackConfig, MissPolicy, PermissionCacheConfig};
use crate::metrics;
use crate::models::{
    default_matrix, page_permissions, CacheEntry, Lookup, Matrix, Role, RolePermissions,
};
use crate::remote::RemoteSource;
use crate::resilience::timeout::with_timeout;
use crate::{Error, Result};

/// Answers given while a role has no cached data
#[derive(Debug, Clone)]
struct FallbackPolicy {
    baseline: Vec<String>,
    miss_policy: MissPolicy,
}

impl FallbackPolicy {
    fn from_config(config: &FallbackConfig) -> Self {
        Self {
            baseline: config.baseline_permissions.clone(),
            miss_policy: config.miss_policy,
        }
    }

    /// Baseline views stay reachable so a fresh login is never locked out.
    fn answer(&self, permission: &str) -> bool {
        self.baseline
            .iter()
            .any(|baseline| permission.contains(baseline.as_str()))
    }
}

/// Process-wide permission cache
///
/// Owned by the application's composition root and shared by handle.
pub struct PermissionCacheService {
    remote: Arc<dyn RemoteSource>,
    store: Arc<MatrixStore>,
    publisher: Arc<SnapshotPublisher>,
    coordinator: Arc<RefreshCoordinator>,
    scheduler: SyncScheduler,
    fallback: FallbackPolicy,
    request_timeout: std::time::Duration,
    sync_enabled: bool,
    writer: Mutex<Option<SnapshotWriter>>,
}

impl PermissionCacheService {
    /// In-memory cache; must be called within a Tokio runtime.
    ///
    /// Fails with [`Error::Config`] when `config` does not validate.
    pub fn new(remote: Arc<dyn RemoteSource>, config: &PermissionCacheConfig) -> Result<Self> {
        Self::build(remote, config, CacheEntry::empty())
    }

    /// Cache backed by `persistence`: the saved matrix is served until the
    /// first successful sync, and every change is written back.
    pub async fn with_persistence(
        remote: Arc<dyn RemoteSource>,
        config: &PermissionCacheConfig,
        persistence: Arc<dyn SnapshotPersistence>,
    ) -> Result<Self> {
        let initial = persist::restore(persistence.as_ref())
            .await
            .map_or_else(CacheEntry::empty, CacheEntry::restored);
        let service = Self::build(remote, config, initial)?;
        *service.writer.lock() = Some(persist::spawn_writer(
            service.publisher.events(),
            persistence,
        ));
        Ok(service)
    }

    /// Attach file persistence when a snapshot path is set.
    pub async fn from_config(
        remote: Arc<dyn RemoteSource>,
        config: &PermissionCacheConfig,
    ) -> Result<Self> {
        match &config.persistence.snapshot_path {
            Some(path) => {
                let persistence = Arc::new(FileSnapshotStore::new(path));
                Self::with_persistence(remote, config, persistence).await
            }
            None => Self::new(remote, config),
        }
    }

    fn build(
        remote: Arc<dyn RemoteSource>,
        config: &PermissionCacheConfig,
        initial: CacheEntry,
    ) -> Result<Self> {
        config.validate()?;
        let runtime = Handle::try_current()
            .map_err(|e| Error::Internal(format!("permission cache needs a Tokio runtime: {e}")))?;
        let request_timeout = config.remote.request_timeout();

        let store = Arc::new(MatrixStore::with_entry(initial));
        let publisher = Arc::new(SnapshotPublisher::new(store.clone(), EventBus::new()));
        let coordinator = Arc::new(RefreshCoordinator::new(
            remote.clone(),
            publisher.clone(),
            runtime.clone(),
            &config.refresh,
            request_timeout,
        ));
        let scheduler = SyncScheduler::new(
            remote.clone(),
            store.clone(),
            coordinator.clone(),
            runtime,
            config.sync.interval(),
            request_timeout,
        );

        Ok(Self {
            remote,
            store,
            publisher,
            coordinator,
            scheduler,
            fallback: FallbackPolicy::from_config(&config.fallback),
            request_timeout,
            sync_enabled: config.sync.enabled,
            writer: Mutex::new(None),
        })
    }

    /// Whether `role` holds `permission`. Never blocks, never fails.
    ///
    /// Absent key in a cached role: `false`. Absent role: the fallback answer,
    /// with a background refresh scheduled.
    pub fn check(&self, role: &str, permission: &str) -> bool {
        let entry = self.store.get();
        match entry.matrix.lookup(role, permission) {
            Lookup::Found(granted) => {
                metrics::record_check("hit");
                granted
            }
            Lookup::MissingKey => {
                metrics::record_check("key_miss");
                if self.fallback.miss_policy == MissPolicy::AnyKey {
                    debug!(role, permission, "Permission key missing, refreshing");
                    self.refresh_in_background();
                }
                false
            }
            Lookup::MissingRole => {
                metrics::record_check("role_miss");
                debug!(role, permission, "Role not cached, answering with fallback");
                self.refresh_in_background();
                self.fallback.answer(permission)
            }
        }
    }

    /// Whether `role` may open `page`: pages without requirements are open,
    /// otherwise any one required permission suffices.
    pub fn can_access_page(&self, role: &str, page: &str) -> bool {
        let required = page_permissions(page);
        required.is_empty() || required.iter().any(|permission| self.check(role, permission))
    }

    /// Current snapshot of the full matrix
    #[must_use]
    pub fn get_matrix(&self) -> Arc<Matrix> {
        self.store.get().matrix.clone()
    }

    /// Current snapshot including version and fetch time
    #[must_use]
    pub fn entry(&self) -> Arc<CacheEntry> {
        self.store.get()
    }

    /// Cached grants of `role`, else its built-in defaults, else none
    #[must_use]
    pub fn role_permissions(&self, role: &str) -> RolePermissions {
        let entry = self.store.get();
        entry
            .matrix
            .role(role)
            .or_else(|| default_matrix().role(role))
            .cloned()
            .unwrap_or_default()
    }

    /// Built-in defaults with every cached value layered on top
    #[must_use]
    pub fn effective_matrix(&self) -> Matrix {
        self.store.get().matrix.overlay_on(default_matrix())
    }

    /// Replace the remote matrix and install the accepted result locally.
    ///
    /// Remote errors are returned unchanged and leave the cache untouched.
    pub async fn update(&self, matrix: Matrix) -> Result<()> {
        let accepted = with_timeout(self.request_timeout, self.remote.replace_matrix(&matrix))
            .await
            .inspect_err(|e| warn!(error = %e, "Permission matrix update rejected"))?;
        self.publisher.publish_local(ChangeSource::Update, accepted);
        Ok(())
    }

    /// Restore the remote defaults and install the result locally.
    pub async fn reset_to_defaults(&self) -> Result<()> {
        let restored = with_timeout(self.request_timeout, self.remote.reset_defaults())
            .await
            .inspect_err(|e| warn!(error = %e, "Permission reset failed"))?;
        info!(roles = restored.len(), "Permission matrix reset to defaults");
        self.publisher.publish_local(ChangeSource::Reset, restored);
        Ok(())
    }

    /// Load a single role that is missing from the snapshot.
    pub async fn ensure_role_loaded(&self, role: &str) -> Result<()> {
        if self.store.get().matrix.contains_role(role) {
            return Ok(());
        }
        let role = Role::from(role);
        let permissions = with_timeout(self.request_timeout, self.remote.fetch_role(&role)).await?;
        self.publisher.merge_role(role, permissions);
        Ok(())
    }

    /// Fetch the matrix now, ignoring the miss cooldown.
    pub async fn refresh(&self) -> Result<Arc<Matrix>> {
        let entry = self.coordinator.refresh_now(RefreshTrigger::Manual).await?;
        Ok(entry.matrix.clone())
    }

    /// Miss-driven refresh; joins a running fetch and honours the cooldown.
    pub fn request_refresh(&self) -> RefreshHandle {
        self.coordinator.request_refresh()
    }

    fn refresh_in_background(&self) {
        // The fetch runs on its own task; the handle is not needed here.
        drop(self.coordinator.request_refresh());
    }

    /// Listener receiving every later matrix replacement
    #[must_use]
    pub fn subscribe(&self) -> ChangeListener {
        self.publisher.events().subscribe()
    }

    /// Run `handler` once per later matrix replacement, on its own task.
    pub fn on_change<F>(&self, handler: F) -> Subscription
    where
        F: FnMut(MatrixChanged) + Send + 'static,
    {
        self.publisher.events().on_change(handler)
    }

    /// Begin periodic synchronization (e.g. at login); `false` if already
    /// running or disabled by `sync.enabled`.
    pub fn start(&self) -> bool {
        if !self.sync_enabled {
            info!("Periodic permission sync disabled by configuration");
            return false;
        }
        self.scheduler.start()
    }

    /// Stop periodic synchronization (e.g. at logout).
    pub fn stop(&self) -> bool {
        self.scheduler.stop()
    }

    #[must_use]
    pub fn sync_state(&self) -> SchedulerState {
        self.scheduler.state()
    }

    /// One synchronization tick, outside the timer
    pub async fn sync_once(&self) -> TickOutcome {
        self.scheduler.sync_once().await
    }

    /// Stop synchronization, then let the snapshot writer save any queued
    /// change before it exits.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            writer.close().await;
        }
        info!("Permission cache shut down");
    }
}

impl std::fmt::Debug for PermissionCacheService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entry = self.store.get();
        f.debug_struct("PermissionCacheService")
            .field("version", &entry.version)
            .field("roles", &entry.matrix.len())
            .field("sync", &self.scheduler.state())
            .finish_non_exhaustive()
    }
}

impl Drop for PermissionCacheService {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.get_mut().take() {
            writer.abort();
        }
    }
}
