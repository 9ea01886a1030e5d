//! HTTP client for the permissions API
//!
//! Bearer-authenticated JSON calls against `{base_url}/permissions/...`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use url::Url;

use super::wire::{
    rows_to_permissions, ErrorBody, LastUpdated, MatrixEnvelope, ReplaceMatrixRequest,
    RolePermissionRow,
};
use super::RemoteSource;
use crate::config::RemoteConfig;
use crate::models::{Matrix, Role, RolePermissions, Version};
use crate::{Error, Result};

/// Permissions API client
///
/// Cheap to clone; clones share the connection pool and the bearer token.
#[derive(Clone)]
pub struct HttpRemoteSource {
    base_url: Url,
    token: Arc<RwLock<Option<String>>>,
    request_timeout: Duration,
    client: Client,
}

impl HttpRemoteSource {
    pub fn new(config: &RemoteConfig) -> Result<Self> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| Error::Config(format!("invalid remote.base_url: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(Error::Config(format!(
                "remote.base_url cannot be a base: {base_url}"
            )));
        }

        let client = Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .pool_max_idle_per_host(4)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url,
            token: Arc::new(RwLock::new(config.bearer_token.clone())),
            request_timeout: config.request_timeout(),
            client,
        })
    }

    /// Install or clear the bearer credential (login / logout)
    pub fn set_bearer_token(&self, token: Option<String>) {
        *self.token.write() = token;
    }

    #[must_use]
    pub fn has_token(&self) -> bool {
        self.token.read().is_some()
    }

    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn request(&self, method: Method, segments: &[&str]) -> Result<RequestBuilder> {
        let token = self
            .token
            .read()
            .clone()
            .ok_or_else(|| Error::Unauthorized("no bearer token configured".to_string()))?;

        Ok(self
            .client
            .request(method, self.endpoint(segments))
            .bearer_auth(token))
    }

    async fn send_raw(&self, builder: RequestBuilder) -> Result<Response> {
        builder.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::Timeout(self.request_timeout)
            } else {
                Error::Transport(e.to_string())
            }
        })
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response> {
        check_response(self.send_raw(builder).await?).await
    }

    async fn json<T: DeserializeOwned>(response: Response) -> Result<T> {
        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Map non-success statuses onto the error taxonomy.
async fn check_response(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let url = response.url().to_string();
    let detail = response
        .json::<ErrorBody>()
        .await
        .ok()
        .and_then(|body| body.describe())
        .unwrap_or_else(|| format!("HTTP {status} for {url}"));

    Err(match status {
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => Error::Validation(detail),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Error::Unauthorized(detail),
        _ => Error::Transport(format!("HTTP {status} for {url}: {detail}")),
    })
}

#[async_trait]
impl RemoteSource for HttpRemoteSource {
    async fn fetch_matrix(&self) -> Result<Matrix> {
        let response = self
            .send(self.request(Method::GET, &["permissions", "matrix"])?)
            .await?;
        Self::json(response).await
    }

    async fn fetch_role(&self, role: &Role) -> Result<RolePermissions> {
        let builder = self.request(Method::GET, &["permissions", "role", role.as_str()])?;
        let response = self.send_raw(builder).await?;
        if response.status() == StatusCode::NOT_FOUND {
            tracing::debug!(role = %role, "Role unknown to permission source");
            return Ok(RolePermissions::new());
        }
        let response = check_response(response).await?;
        let rows: Vec<RolePermissionRow> = Self::json(response).await?;
        Ok(rows_to_permissions(rows))
    }

    async fn fetch_version(&self) -> Result<Version> {
        let response = self
            .send(self.request(Method::GET, &["permissions", "last-updated"])?)
            .await?;
        let body: LastUpdated = Self::json(response).await?;
        Ok(body.into())
    }

    async fn replace_matrix(&self, matrix: &Matrix) -> Result<Matrix> {
        let builder = self
            .request(Method::PUT, &["permissions", "matrix"])?
            .json(&ReplaceMatrixRequest { matrix });
        let response = self.send(builder).await?;
        let envelope: MatrixEnvelope = Self::json(response).await?;
        Ok(envelope.into_matrix())
    }

    async fn reset_defaults(&self) -> Result<Matrix> {
        let builder = self
            .request(Method::POST, &["permissions", "reset-default"])?
            .json(&serde_json::json!({}));
        let response = self.send(builder).await?;
        let envelope: MatrixEnvelope = Self::json(response).await?;
        Ok(envelope.into_matrix())
    }
}

impl std::fmt::Debug for HttpRemoteSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRemoteSource")
            .field("base_url", &self.base_url.as_str())
            .field("has_token", &self.has_token())
            .finish_non_exhaustive()
    }
}
