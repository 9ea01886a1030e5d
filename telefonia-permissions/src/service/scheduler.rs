//! Periodic version polling
//!
//! Each tick compares the remote freshness token with the cached one and asks
//! the refresh coordinator for a new matrix when the cache is behind. The first
//! tick fires as soon as the scheduler starts.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::cache::{MatrixStore, RefreshCoordinator, RefreshTrigger};
use crate::metrics;
use crate::models::Version;
use crate::remote::RemoteSource;
use crate::resilience::timeout::with_timeout;
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Stopped,
    Running,
}

/// Result of one polling tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Cached version is current
    Fresh,
    /// Cache was behind and has been refreshed to this version
    Refreshed(Version),
    /// No credential; nothing was fetched
    LoggedOut,
    /// Polling or refreshing failed; the cache is unchanged
    Failed(Error),
}

struct SyncTask {
    remote: Arc<dyn RemoteSource>,
    store: Arc<MatrixStore>,
    coordinator: Arc<RefreshCoordinator>,
    request_timeout: Duration,
}

impl SyncTask {
    async fn tick(&self) -> TickOutcome {
        let held = self.store.get();
        let remote_version = match with_timeout(self.request_timeout, self.remote.fetch_version()).await {
            Ok(version) => version,
            Err(Error::Unauthorized(reason)) => {
                debug!(%reason, "Skipping permission sync while logged out");
                metrics::record_sync_tick("skipped");
                return TickOutcome::LoggedOut;
            }
            Err(e) => {
                warn!(error = %e, "Permission version poll failed");
                metrics::record_sync_tick("error");
                return TickOutcome::Failed(e);
            }
        };

        if held.is_synchronized() && remote_version <= held.version {
            trace!(version = %held.version, "Permission matrix up to date");
            metrics::record_sync_tick("fresh");
            return TickOutcome::Fresh;
        }

        info!(
            held = %held.version,
            remote = %remote_version,
            synchronized = held.is_synchronized(),
            "Permission matrix stale, refreshing"
        );
        metrics::record_sync_tick("stale");
        match self.coordinator.refresh_now(RefreshTrigger::Scheduled).await {
            Ok(entry) => TickOutcome::Refreshed(entry.version),
            Err(e) => TickOutcome::Failed(e),
        }
    }
}

/// Owns the background polling task
///
/// `Stopped -> Running` on [`start`](Self::start), back on
/// [`stop`](Self::stop). A failed tick leaves it running.
pub struct SyncScheduler {
    task: Arc<SyncTask>,
    runtime: Handle,
    period: Duration,
    running: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl SyncScheduler {
    pub fn new(
        remote: Arc<dyn RemoteSource>,
        store: Arc<MatrixStore>,
        coordinator: Arc<RefreshCoordinator>,
        runtime: Handle,
        period: Duration,
        request_timeout: Duration,
    ) -> Self {
        Self {
            task: Arc::new(SyncTask {
                remote,
                store,
                coordinator,
                request_timeout,
            }),
            runtime,
            period,
            running: Mutex::new(None),
        }
    }

    /// Start polling; `false` if already running or the period is zero.
    pub fn start(&self) -> bool {
        if self.period.is_zero() {
            warn!("Permission sync period is zero, not starting");
            return false;
        }
        let mut running = self.running.lock();
        if matches!(&*running, Some((_, handle)) if !handle.is_finished()) {
            return false;
        }

        let token = CancellationToken::new();
        let cancel = token.clone();
        let task = self.task.clone();
        let period = self.period;

        let handle = self.runtime.spawn(async move {
            let mut timer = interval(period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    _ = timer.tick() => {
                        tokio::select! {
                            biased;
                            () = cancel.cancelled() => break,
                            _ = task.tick() => {}
                        }
                    }
                }
            }
            info!("Permission sync scheduler stopped");
        });

        info!(interval_secs = period.as_secs(), "Permission sync scheduler started");
        *running = Some((token, handle));
        true
    }

    /// Stop polling; `false` if it was not running. A refresh already in
    /// flight is left to finish.
    pub fn stop(&self) -> bool {
        match self.running.lock().take() {
            Some((token, _)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Stop polling and wait for the loop to exit.
    pub async fn shutdown(&self) {
        let running = self.running.lock().take();
        if let Some((token, handle)) = running {
            token.cancel();
            if let Err(e) = handle.await {
                warn!(error = %e, "Permission sync task ended abnormally");
            }
        }
    }

    #[must_use]
    pub fn state(&self) -> SchedulerState {
        match &*self.running.lock() {
            Some((_, handle)) if !handle.is_finished() => SchedulerState::Running,
            _ => SchedulerState::Stopped,
        }
    }

    /// Run a single tick now, independent of the timer.
    pub async fn sync_once(&self) -> TickOutcome {
        self.task.tick().await
    }
}

impl Drop for SyncScheduler {
    fn drop(&mut self) {
        if let Some((token, _)) = self.running.get_mut().take() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{EventBus, SnapshotPublisher};
    use crate::config::RefreshConfig;
    use crate::test_helpers::{sample_matrix, FakeRemote};

    const PERIOD: Duration = Duration::from_secs(30);

    fn scheduler(remote: Arc<FakeRemote>) -> (SyncScheduler, Arc<MatrixStore>) {
        scheduler_with_period(remote, PERIOD)
    }

    fn scheduler_with_period(remote: Arc<FakeRemote>, period: Duration) -> (SyncScheduler, Arc<MatrixStore>) {
        let store = Arc::new(MatrixStore::new());
        let publisher = Arc::new(SnapshotPublisher::new(store.clone(), EventBus::new()));
        let coordinator = Arc::new(RefreshCoordinator::new(
            remote.clone(),
            publisher,
            Handle::current(),
            &RefreshConfig::default(),
            Duration::from_secs(5),
        ));
        let scheduler = SyncScheduler::new(
            remote,
            store.clone(),
            coordinator,
            Handle::current(),
            period,
            Duration::from_secs(5),
        );
        (scheduler, store)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    async fn next_period() {
        tokio::time::sleep(PERIOD).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_tick_runs_immediately() {
        let remote = Arc::new(FakeRemote::new(sample_matrix(), 1));
        let (scheduler, store) = scheduler(remote.clone());

        assert!(scheduler.start());
        settle().await;

        assert_eq!(remote.matrix_calls(), 1);
        assert_eq!(store.get().version, Version(1));
        assert_eq!(scheduler.state(), SchedulerState::Running);
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_refresh_per_version_change() {
        let remote = Arc::new(FakeRemote::new(sample_matrix(), 1));
        let (scheduler, store) = scheduler(remote.clone());
        scheduler.start();
        settle().await;
        assert_eq!(remote.matrix_calls(), 1);

        next_period().await;
        next_period().await;
        assert_eq!(remote.matrix_calls(), 1);

        remote.set_version(2);
        next_period().await;
        assert_eq!(remote.matrix_calls(), 2);
        assert_eq!(store.get().version, Version(2));

        next_period().await;
        assert_eq!(remote.matrix_calls(), 2);

        remote.set_version(5);
        next_period().await;
        assert_eq!(remote.matrix_calls(), 3);
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_calls_after_stop() {
        let remote = Arc::new(FakeRemote::new(sample_matrix(), 1));
        let (scheduler, _) = scheduler(remote.clone());
        scheduler.start();
        settle().await;

        assert!(scheduler.stop());
        let calls = remote.total_calls();
        remote.set_version(10);
        for _ in 0..5 {
            next_period().await;
        }

        assert_eq!(remote.total_calls(), calls);
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
        assert!(!scheduler.stop());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_and_restart() {
        let remote = Arc::new(FakeRemote::new(sample_matrix(), 1));
        let (scheduler, _) = scheduler(remote.clone());

        assert!(scheduler.start());
        assert!(!scheduler.start());
        scheduler.shutdown().await;
        assert_eq!(scheduler.state(), SchedulerState::Stopped);

        assert!(scheduler.start());
        settle().await;
        assert_eq!(scheduler.state(), SchedulerState::Running);
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_logged_out_skips_tick() {
        let remote = Arc::new(FakeRemote::new(sample_matrix(), 1));
        remote.fail_with(Some(Error::Unauthorized("no bearer token configured".to_string())));
        let (scheduler, store) = scheduler(remote.clone());

        assert_eq!(scheduler.sync_once().await, TickOutcome::LoggedOut);
        assert_eq!(remote.matrix_calls(), 0);
        assert!(!store.get().is_synchronized());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_retries_next_tick() {
        let remote = Arc::new(FakeRemote::new(sample_matrix(), 3));
        remote.fail_with(Some(Error::Transport("connection reset".to_string())));
        let (scheduler, store) = scheduler(remote.clone());
        scheduler.start();
        settle().await;
        assert_eq!(scheduler.state(), SchedulerState::Running);
        assert!(!store.get().is_synchronized());

        remote.fail_with(None);
        next_period().await;
        assert_eq!(store.get().version, Version(3));
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_once_reports_outcome() {
        let remote = Arc::new(FakeRemote::new(sample_matrix(), 4));
        let (scheduler, _) = scheduler(remote.clone());

        assert_eq!(scheduler.sync_once().await, TickOutcome::Refreshed(Version(4)));
        assert_eq!(scheduler.sync_once().await, TickOutcome::Fresh);
        assert_eq!(remote.matrix_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_period_is_refused() {
        let remote = Arc::new(FakeRemote::new(sample_matrix(), 1));
        let (scheduler, _) = scheduler_with_period(remote.clone(), Duration::ZERO);

        assert!(!scheduler.start());
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
        settle().await;
        assert_eq!(remote.total_calls(), 0);
    }
}
