//! Bounded waiting for calls to the permission source

pub mod timeout {
    //! Timeout configuration for remote permission calls

    use std::future::Future;
    use std::time::Duration;

    use crate::{Error, Result};

    /// Default bound for a single remote call
    pub const REMOTE_CALL_TIMEOUT: Duration = Duration::from_secs(5);

    /// Default TCP connect bound
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

    /// Run `fut`, failing with [`Error::Timeout`] once `limit` elapses.
    pub async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::time::timeout(limit, fut)
            .await
            .unwrap_or(Err(Error::Timeout(limit)))
    }

}
