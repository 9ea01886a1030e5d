//! JSON bodies exchanged with the permissions API

use serde::{Deserialize, Serialize};

use crate::models::matrix::deserialize_granted;
use crate::models::{Matrix, PermissionId, RolePermissions, Version};

/// One row of `GET /permissions/role/{role}`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RolePermissionRow {
    pub permission_id: PermissionId,
    #[serde(deserialize_with = "deserialize_granted")]
    pub granted: bool,
}

/// Collapse role rows into a lookup map; later rows win on duplicates.
pub fn rows_to_permissions(rows: Vec<RolePermissionRow>) -> RolePermissions {
    rows.into_iter()
        .map(|row| (row.permission_id, row.granted))
        .collect()
}

/// Body of `GET /permissions/last-updated`
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct LastUpdated {
    pub timestamp: i64,
}

impl From<LastUpdated> for Version {
    fn from(body: LastUpdated) -> Self {
        Self(body.timestamp)
    }
}

/// Body of `PUT /permissions/matrix`
#[derive(Debug, Serialize)]
pub struct ReplaceMatrixRequest<'a> {
    pub matrix: &'a Matrix,
}

/// Matrix responses arrive either bare or wrapped with a status message.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum MatrixEnvelope {
    Wrapped {
        matrix: Matrix,
        #[serde(default)]
        message: Option<String>,
    },
    Bare(Matrix),
}

impl MatrixEnvelope {
    pub fn into_matrix(self) -> Matrix {
        match self {
            Self::Wrapped { matrix, .. } | Self::Bare(matrix) => matrix,
        }
    }
}

/// Error body produced by the backend framework
///
/// `message` is either a string or a list of validation messages.
#[derive(Debug, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub message: serde_json::Value,
}

impl ErrorBody {
    pub fn describe(&self) -> Option<String> {
        match &self.message {
            serde_json::Value::String(msg) => Some(msg.clone()),
            serde_json::Value::Array(items) => Some(
                items
                    .iter()
                    .map(|item| item.as_str().map_or_else(|| item.to_string(), str::to_string))
                    .collect::<Vec<_>>()
                    .join("; "),
            ),
            _ => None,
        }
    }
}
