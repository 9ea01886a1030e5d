//! In-memory permission source for unit tests

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::models::{default_matrix, Matrix, Role, RolePermissions, Version};
use crate::remote::RemoteSource;
use crate::{Error, Result};

/// Counting fake with settable contents, latency and failures
#[derive(Debug, Default)]
pub struct FakeRemote {
    matrix: Mutex<Matrix>,
    version: Mutex<Version>,
    delay: Mutex<Duration>,
    failure: Mutex<Option<Error>>,
    panic_next: AtomicBool,
    matrix_calls: AtomicUsize,
    version_calls: AtomicUsize,
    role_calls: AtomicUsize,
    replace_calls: AtomicUsize,
    reset_calls: AtomicUsize,
}

impl FakeRemote {
    pub fn new(matrix: Matrix, version: i64) -> Self {
        let fake = Self::default();
        fake.set_matrix(matrix);
        fake.set_version(version);
        fake
    }

    pub fn set_matrix(&self, matrix: Matrix) {
        *self.matrix.lock() = matrix;
    }

    pub fn set_version(&self, version: i64) {
        *self.version.lock() = Version(version);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn fail_with(&self, error: Option<Error>) {
        *self.failure.lock() = error;
    }

    /// Make the next call panic instead of answering
    pub fn panic_once(&self) {
        self.panic_next.store(true, Ordering::SeqCst);
    }

    pub fn matrix_calls(&self) -> usize {
        self.matrix_calls.load(Ordering::SeqCst)
    }

    pub fn version_calls(&self) -> usize {
        self.version_calls.load(Ordering::SeqCst)
    }

    pub fn role_calls(&self) -> usize {
        self.role_calls.load(Ordering::SeqCst)
    }

    pub fn total_calls(&self) -> usize {
        self.matrix_calls()
            + self.version_calls()
            + self.role_calls()
            + self.replace_calls.load(Ordering::SeqCst)
            + self.reset_calls.load(Ordering::SeqCst)
    }

    /// The answer reflects the state when the call arrived, delivered after the delay.
    async fn respond<T: Send>(&self, counter: &AtomicUsize, value: impl FnOnce() -> T) -> Result<T> {
        counter.fetch_add(1, Ordering::SeqCst);
        if self.panic_next.swap(false, Ordering::SeqCst) {
            panic!("permission source crashed");
        }
        let value = value();
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.failure.lock().clone() {
            return Err(err);
        }
        Ok(value)
    }
}

#[async_trait]
impl RemoteSource for FakeRemote {
    async fn fetch_matrix(&self) -> Result<Matrix> {
        self.respond(&self.matrix_calls, || self.matrix.lock().clone())
            .await
    }

    async fn fetch_role(&self, role: &Role) -> Result<RolePermissions> {
        self.respond(&self.role_calls, || {
            self.matrix
                .lock()
                .role(role.as_str())
                .cloned()
                .unwrap_or_default()
        })
        .await
    }

    async fn fetch_version(&self) -> Result<Version> {
        self.respond(&self.version_calls, || *self.version.lock())
            .await
    }

    async fn replace_matrix(&self, matrix: &Matrix) -> Result<Matrix> {
        let accepted = self
            .respond(&self.replace_calls, || matrix.clone())
            .await?;
        self.set_matrix(accepted.clone());
        Ok(accepted)
    }

    async fn reset_defaults(&self) -> Result<Matrix> {
        let restored = self
            .respond(&self.reset_calls, || default_matrix().clone())
            .await?;
        self.set_matrix(restored.clone());
        Ok(restored)
    }
}

/// Small matrix used across tests
pub fn sample_matrix() -> Matrix {
    [
        (
            "admin",
            [("users.delete", true), ("users.view", true)]
                .into_iter()
                .collect::<RolePermissions>(),
        ),
        (
            "client",
            [("dashboard.view", true), ("invoices.edit", false)]
                .into_iter()
                .collect::<RolePermissions>(),
        ),
    ]
    .into_iter()
    .collect()
}
