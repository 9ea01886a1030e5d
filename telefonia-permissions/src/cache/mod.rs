//! Local copy of the permission matrix and the machinery that keeps it fresh

pub mod events;
pub mod persist;
pub mod publisher;
pub mod refresh;
pub mod store;

pub use events::{ChangeListener, ChangeSource, EventBus, MatrixChanged, Subscription};
pub use persist::{FileSnapshotStore, SnapshotPersistence, SnapshotWriter};
pub use publisher::SnapshotPublisher;
pub use refresh::{RefreshCoordinator, RefreshHandle, RefreshOrigin, RefreshTrigger};
pub use store::MatrixStore;
