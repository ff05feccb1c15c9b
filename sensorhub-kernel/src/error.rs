use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

/// Failures of the persisted registry file.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("registry file is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("registry io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of a rejected registry operation.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("invalid input: {0}")]
    Invalid(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("storage fault: {0}")]
    Storage(#[from] StoreError),
}

impl RegistryError {
    pub fn status(&self) -> StatusCode {
        match self {
            RegistryError::Invalid(_) => StatusCode::BAD_REQUEST,
            RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
            RegistryError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (self.status(), body).into_response()
    }
}

/// Telemetry rejected by the fan-out hub.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("malformed telemetry: {0}")]
    Malformed(String),
}
