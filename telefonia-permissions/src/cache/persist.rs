//! Durable copy of the last known matrix
//!
//! Read once at startup, written after every accepted change. The persisted
//! matrix is never treated as fresher than a remote fetch.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::events::EventBus;
use crate::models::Matrix;
use crate::{Error, Result};

/// Storage for one serialized [`Matrix`] blob
#[async_trait]
pub trait SnapshotPersistence: Send + Sync {
    /// `Ok(None)` when nothing has been saved yet
    async fn load(&self) -> Result<Option<Matrix>>;

    async fn save(&self, matrix: &Matrix) -> Result<()>;
}

/// JSON file on local disk
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    path: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn staging_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl SnapshotPersistence for FileSnapshotStore {
    async fn load(&self) -> Result<Option<Matrix>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let matrix = serde_json::from_slice(&bytes).map_err(|e| {
            Error::Persistence(format!("corrupt snapshot {}: {e}", self.path.display()))
        })?;
        Ok(Some(matrix))
    }

    async fn save(&self, matrix: &Matrix) -> Result<()> {
        let json = serde_json::to_vec(matrix)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let staging = self.staging_path();
        tokio::fs::write(&staging, &json).await?;
        tokio::fs::rename(&staging, &self.path).await?;
        Ok(())
    }
}

/// Read the persisted matrix, treating any failure as "nothing saved".
pub async fn restore(persistence: &dyn SnapshotPersistence) -> Option<Matrix> {
    match persistence.load().await {
        Ok(Some(matrix)) => {
            info!(roles = matrix.len(), "Restored persisted permission matrix");
            Some(matrix)
        }
        Ok(None) => None,
        Err(e) => {
            warn!(error = %e, "Ignoring unreadable permission snapshot");
            None
        }
    }
}

/// Background task saving every published matrix
#[derive(Debug)]
pub struct SnapshotWriter {
    events: EventBus,
    subscriber_id: u64,
    task: JoinHandle<()>,
}

impl SnapshotWriter {
    /// Stop listening, save whatever change is still queued, then wait for the task.
    pub async fn close(self) {
        self.events.unsubscribe(self.subscriber_id);
        if let Err(e) = self.task.await {
            warn!(error = %e, "Permission snapshot writer ended abnormally");
        }
    }

    /// Stop immediately, dropping any unsaved change.
    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Save every published matrix until the bus subscription ends.
///
/// Must be called from within a Tokio runtime. Only the newest queued change
/// is written when several arrive while a save is running.
pub fn spawn_writer(events: &EventBus, persistence: Arc<dyn SnapshotPersistence>) -> SnapshotWriter {
    let mut listener = events.subscribe();
    let subscriber_id = listener.id();
    let task = tokio::spawn(async move {
        while let Some(mut event) = listener.recv().await {
            while let Some(newer) = listener.try_recv() {
                event = newer;
            }
            match persistence.save(&event.entry.matrix).await {
                Ok(()) => debug!(sequence = event.sequence, "Permission snapshot saved"),
                Err(e) => warn!(error = %e, "Failed to persist permission snapshot"),
            }
        }
    });

    SnapshotWriter {
        events: events.clone(),
        subscriber_id,
        task,
    }
}
