//! Single-flight refresh of the permission matrix
//!
//! At most one fetch runs at a time. Requests arriving while it runs share its
//! outcome through a cloned [`Shared`] future. The fetch itself is a spawned
//! task, so it completes and populates the cache even if every requester
//! drops its handle.
//!
//! Miss-driven requests wait a short debounce before fetching and are
//! throttled by a cooldown measured from the last successful refresh.
//! Scheduler and manual refreshes skip both but still join an in-flight fetch.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::publisher::SnapshotPublisher;
use crate::config::RefreshConfig;
use crate::metrics;
use crate::models::CacheEntry;
use crate::remote::RemoteSource;
use crate::resilience::timeout::with_timeout;
use crate::{Error, Result};

type SharedFetch = Shared<BoxFuture<'static, Result<Arc<CacheEntry>>>>;

/// Who asked for a refresh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshTrigger {
    /// A lookup found no data for a role
    CacheMiss,
    /// The sync scheduler saw a newer remote version
    Scheduled,
    /// An explicit caller request
    Manual,
}

impl RefreshTrigger {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CacheMiss => "cache_miss",
            Self::Scheduled => "scheduled",
            Self::Manual => "manual",
        }
    }
}

/// How a [`RefreshHandle`] was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOrigin {
    /// This request started a new fetch
    Started,
    /// A fetch was already running; the handle shares its outcome
    Joined,
    /// Within the cooldown; the handle resolves to the current snapshot
    Cooldown,
}

/// Outcome of a refresh request, awaitable by any number of holders
///
/// Dropping the handle does not cancel the fetch.
#[derive(Clone)]
#[must_use = "await the handle to observe the refresh outcome"]
pub struct RefreshHandle {
    origin: RefreshOrigin,
    inner: SharedFetch,
}

impl RefreshHandle {
    fn ready(entry: Arc<CacheEntry>) -> Self {
        Self {
            origin: RefreshOrigin::Cooldown,
            inner: futures::future::ready(Ok(entry)).boxed().shared(),
        }
    }

    #[must_use]
    pub const fn origin(&self) -> RefreshOrigin {
        self.origin
    }
}

impl Future for RefreshHandle {
    type Output = Result<Arc<CacheEntry>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.inner).poll(cx)
    }
}

impl std::fmt::Debug for RefreshHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshHandle")
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct FlightState {
    in_flight: Option<SharedFetch>,
    /// Id of the fetch `in_flight` belongs to
    flight_id: u64,
    last_success: Option<Instant>,
}

impl FlightState {
    fn finish(&mut self, flight_id: u64) {
        if self.flight_id == flight_id {
            self.in_flight = None;
        }
    }
}

/// Releases the in-flight slot however a running fetch task ends, panics
/// and cancellation included.
struct FlightGuard {
    state: Arc<Mutex<FlightState>>,
    flight_id: u64,
}

impl FlightGuard {
    fn complete(&self, succeeded: bool) {
        let mut state = self.state.lock();
        state.finish(self.flight_id);
        if succeeded {
            state.last_success = Some(Instant::now());
        }
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.state.lock().finish(self.flight_id);
    }
}

/// Deduplicates refresh requests into one fetch against the [`RemoteSource`]
pub struct RefreshCoordinator {
    remote: Arc<dyn RemoteSource>,
    publisher: Arc<SnapshotPublisher>,
    runtime: Handle,
    debounce: Duration,
    cooldown: Duration,
    request_timeout: Duration,
    state: Arc<Mutex<FlightState>>,
}

impl RefreshCoordinator {
    pub fn new(
        remote: Arc<dyn RemoteSource>,
        publisher: Arc<SnapshotPublisher>,
        runtime: Handle,
        config: &RefreshConfig,
        request_timeout: Duration,
    ) -> Self {
        Self {
            remote,
            publisher,
            runtime,
            debounce: config.debounce(),
            cooldown: config.cooldown(),
            request_timeout,
            state: Arc::new(Mutex::new(FlightState::default())),
        }
    }

    /// Miss-driven refresh: debounced, throttled by the cooldown.
    pub fn request_refresh(&self) -> RefreshHandle {
        let mut state = self.state.lock();
        if let Some(in_flight) = &state.in_flight {
            return RefreshHandle {
                origin: RefreshOrigin::Joined,
                inner: in_flight.clone(),
            };
        }

        if let Some(at) = state.last_success {
            if at.elapsed() < self.cooldown {
                debug!(
                    remaining_ms = self.cooldown.saturating_sub(at.elapsed()).as_millis() as u64,
                    "Permission refresh suppressed by cooldown"
                );
                metrics::record_refresh(RefreshTrigger::CacheMiss.as_str(), "cooldown");
                return RefreshHandle::ready(self.publisher.store().get());
            }
        }

        self.start(&mut state, RefreshTrigger::CacheMiss, self.debounce)
    }

    /// Immediate refresh that ignores the cooldown.
    pub fn refresh_now(&self, trigger: RefreshTrigger) -> RefreshHandle {
        let mut state = self.state.lock();
        if let Some(in_flight) = &state.in_flight {
            return RefreshHandle {
                origin: RefreshOrigin::Joined,
                inner: in_flight.clone(),
            };
        }
        self.start(&mut state, trigger, Duration::ZERO)
    }

    /// Whether a fetch is currently running or waiting out its debounce
    #[must_use]
    pub fn is_refreshing(&self) -> bool {
        self.state.lock().in_flight.is_some()
    }

    fn start(&self, state: &mut FlightState, trigger: RefreshTrigger, delay: Duration) -> RefreshHandle {
        state.flight_id += 1;
        let task = self.runtime.spawn(run_fetch(
            self.remote.clone(),
            self.publisher.clone(),
            self.state.clone(),
            state.flight_id,
            trigger,
            delay,
            self.request_timeout,
        ));

        let shared = async move {
            task.await
                .unwrap_or_else(|e| Err(Error::Internal(format!("refresh task failed: {e}"))))
        }
        .boxed()
        .shared();

        state.in_flight = Some(shared.clone());
        debug!(trigger = trigger.as_str(), delay_ms = delay.as_millis() as u64, "Permission refresh started");

        RefreshHandle {
            origin: RefreshOrigin::Started,
            inner: shared,
        }
    }
}

async fn run_fetch(
    remote: Arc<dyn RemoteSource>,
    publisher: Arc<SnapshotPublisher>,
    state: Arc<Mutex<FlightState>>,
    flight_id: u64,
    trigger: RefreshTrigger,
    delay: Duration,
    request_timeout: Duration,
) -> Result<Arc<CacheEntry>> {
    // Built on first poll: the spawner still holds the state lock.
    let guard = FlightGuard { state, flight_id };
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    let started = Instant::now();
    let epoch = publisher.local_epoch();
    let result: Result<Arc<CacheEntry>> = async {
        let version = with_timeout(request_timeout, remote.fetch_version()).await?;
        let matrix = with_timeout(request_timeout, remote.fetch_matrix()).await?;
        Ok(publisher.publish_fetched(matrix, version, epoch))
    }
    .await;

    let label = if result.is_ok() { "success" } else { "error" };
    metrics::record_refresh(trigger.as_str(), label);
    metrics::record_refresh_duration(label, started.elapsed().as_secs_f64());

    guard.complete(result.is_ok());

    if let Err(e) = &result {
        warn!(
            trigger = trigger.as_str(),
            error = %e,
            "Permission refresh failed, keeping cached matrix"
        );
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{EventBus, MatrixStore};
    use crate::models::Version;
    use crate::test_helpers::{sample_matrix, FakeRemote};

    fn setup(remote: Arc<FakeRemote>) -> (RefreshCoordinator, Arc<SnapshotPublisher>) {
        let publisher = Arc::new(SnapshotPublisher::new(
            Arc::new(MatrixStore::new()),
            EventBus::new(),
        ));
        let coordinator = RefreshCoordinator::new(
            remote,
            publisher.clone(),
            Handle::current(),
            &RefreshConfig::default(),
            Duration::from_secs(5),
        );
        (coordinator, publisher)
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_requests_share_one_fetch() {
        let remote = Arc::new(FakeRemote::new(sample_matrix(), 3));
        remote.set_delay(Duration::from_millis(200));
        let (coordinator, publisher) = setup(remote.clone());

        let handles: Vec<_> = (0..16).map(|_| coordinator.request_refresh()).collect();
        assert_eq!(handles[0].origin(), RefreshOrigin::Started);
        assert!(handles[1..].iter().all(|h| h.origin() == RefreshOrigin::Joined));

        for result in futures::future::join_all(handles).await {
            assert_eq!(result.unwrap().version, Version(3));
        }
        assert_eq!(remote.matrix_calls(), 1);
        assert_eq!(publisher.store().get().version, Version(3));
        assert!(!coordinator.is_refreshing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_miss_refresh_waits_for_debounce() {
        let remote = Arc::new(FakeRemote::new(sample_matrix(), 1));
        let (coordinator, _) = setup(remote.clone());

        let handle = coordinator.request_refresh();
        tokio::time::advance(Duration::from_millis(500)).await;
        tokio::task::yield_now().await;
        assert_eq!(remote.matrix_calls(), 0);

        // Arrives inside the debounce window and joins.
        assert_eq!(coordinator.request_refresh().origin(), RefreshOrigin::Joined);

        handle.await.unwrap();
        assert_eq!(remote.matrix_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_suppresses_repeat_miss_refreshes() {
        let remote = Arc::new(FakeRemote::new(sample_matrix(), 1));
        let (coordinator, _) = setup(remote.clone());

        coordinator.request_refresh().await.unwrap();
        assert_eq!(remote.matrix_calls(), 1);

        let suppressed = coordinator.request_refresh();
        assert_eq!(suppressed.origin(), RefreshOrigin::Cooldown);
        let entry = suppressed.await.unwrap();
        assert_eq!(entry.version, Version(1));
        assert_eq!(remote.matrix_calls(), 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        let handle = coordinator.request_refresh();
        assert_eq!(handle.origin(), RefreshOrigin::Started);
        handle.await.unwrap();
        assert_eq!(remote.matrix_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_now_ignores_cooldown() {
        let remote = Arc::new(FakeRemote::new(sample_matrix(), 1));
        let (coordinator, publisher) = setup(remote.clone());

        coordinator.refresh_now(RefreshTrigger::Manual).await.unwrap();
        remote.set_version(2);
        let handle = coordinator.refresh_now(RefreshTrigger::Scheduled);
        assert_eq!(handle.origin(), RefreshOrigin::Started);
        handle.await.unwrap();

        assert_eq!(remote.matrix_calls(), 2);
        assert_eq!(publisher.store().get().version, Version(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_keeps_cached_matrix_and_does_not_retry() {
        let remote = Arc::new(FakeRemote::new(sample_matrix(), 4));
        let (coordinator, publisher) = setup(remote.clone());
        coordinator.refresh_now(RefreshTrigger::Manual).await.unwrap();

        remote.fail_with(Some(Error::Transport("connection refused".to_string())));
        let err = coordinator
            .refresh_now(RefreshTrigger::Manual)
            .await
            .unwrap_err();
        assert!(err.is_transient());

        let held = publisher.store().get();
        assert_eq!(held.version, Version(4));
        assert!(held.matrix.contains_role("admin"));

        let calls = remote.total_calls();
        tokio::time::advance(Duration::from_secs(600)).await;
        tokio::task::yield_now().await;
        assert_eq!(remote.total_calls(), calls);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_source_times_out() {
        let remote = Arc::new(FakeRemote::new(sample_matrix(), 1));
        remote.set_delay(Duration::from_secs(60));
        let (coordinator, publisher) = setup(remote);

        let err = coordinator
            .refresh_now(RefreshTrigger::Manual)
            .await
            .unwrap_err();
        assert_eq!(err, Error::Timeout(Duration::from_secs(5)));
        assert!(!publisher.store().get().is_synchronized());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_handle_still_populates_cache() {
        let remote = Arc::new(FakeRemote::new(sample_matrix(), 9));
        let (coordinator, publisher) = setup(remote.clone());
        let mut listener = publisher.events().subscribe();

        drop(coordinator.request_refresh());

        let event = listener.recv().await.unwrap();
        assert_eq!(event.entry.version, Version(9));
        assert_eq!(remote.matrix_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_fetch_releases_in_flight_slot() {
        let remote = Arc::new(FakeRemote::new(sample_matrix(), 6));
        let (coordinator, publisher) = setup(remote.clone());

        remote.panic_once();
        let err = coordinator
            .refresh_now(RefreshTrigger::Manual)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
        assert!(!coordinator.is_refreshing());

        let handle = coordinator.refresh_now(RefreshTrigger::Manual);
        assert_eq!(handle.origin(), RefreshOrigin::Started);
        assert_eq!(handle.await.unwrap().version, Version(6));
        assert_eq!(publisher.store().get().version, Version(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unawaited_panicking_fetch_does_not_wedge_misses() {
        let remote = Arc::new(FakeRemote::new(sample_matrix(), 2));
        let (coordinator, _) = setup(remote.clone());

        remote.panic_once();
        drop(coordinator.request_refresh());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!coordinator.is_refreshing());

        let handle = coordinator.request_refresh();
        assert_eq!(handle.origin(), RefreshOrigin::Started);
        handle.await.unwrap();
        assert_eq!(remote.matrix_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_racing_local_write_does_not_revert_it() {
        let remote = Arc::new(FakeRemote::new(sample_matrix(), 5));
        remote.set_delay(Duration::from_millis(200));
        let (coordinator, publisher) = setup(remote.clone());

        let handle = coordinator.refresh_now(RefreshTrigger::Manual);
        // The matrix request has been answered from the old state by now.
        tokio::time::sleep(Duration::from_millis(300)).await;

        let updated: crate::models::Matrix = [(
            "client",
            [("invoices.view", true)].into_iter().collect::<crate::models::RolePermissions>(),
        )]
        .into_iter()
        .collect();
        publisher.publish_local(crate::cache::ChangeSource::Update, updated.clone());

        let entry = handle.await.unwrap();
        assert_eq!(*entry.matrix, updated);
        assert_eq!(*publisher.store().get().matrix, updated);
        assert_eq!(remote.matrix_calls(), 1);
    }
}
