pub mod permission;
pub mod scheduler;

pub use permission::PermissionCacheService;
pub use scheduler::{SchedulerState, SyncScheduler, TickOutcome};
