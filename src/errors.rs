use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use tracing::{error, warn};

#[derive(Error, Debug)]
pub enum HeliosError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("API key required")]
    Unauthenticated,

    #[error("API key not permitted for tenant")]
    Forbidden,

    #[error("tenant not found: {0}")]
    TenantNotFound(String),

    #[error("tenant already exists: {0}")]
    TenantExists(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("shared store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("coordination store unavailable: {0}")]
    RegistryUnavailable(String),

    #[error("request cancelled before completion")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<redis::RedisError> for HeliosError {
    fn from(err: redis::RedisError) -> Self {
        HeliosError::StoreUnavailable(err.to_string())
    }
}

impl From<etcd_client::Error> for HeliosError {
    fn from(err: etcd_client::Error) -> Self {
        HeliosError::RegistryUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for HeliosError {
    fn from(err: serde_json::Error) -> Self {
        HeliosError::Internal(format!("JSON serialization: {err}"))
    }
}

impl HeliosError {
    /// HTTP status the error surfaces as. Degraded collaborators map to 503
    /// so load balancers retry another node.
    pub fn status_code(&self) -> StatusCode {
        match self {
            HeliosError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            HeliosError::Unauthenticated => StatusCode::UNAUTHORIZED,
            HeliosError::Forbidden => StatusCode::FORBIDDEN,
            HeliosError::TenantNotFound(_) => StatusCode::NOT_FOUND,
            HeliosError::TenantExists(_) => StatusCode::CONFLICT,
            HeliosError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            HeliosError::StoreUnavailable(_) | HeliosError::RegistryUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            HeliosError::Cancelled => StatusCode::REQUEST_TIMEOUT,
            HeliosError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message exposed to clients. Backend causes stay in the logs.
    fn client_message(&self) -> String {
        match self {
            HeliosError::StoreUnavailable(_) | HeliosError::RegistryUnavailable(_) => {
                "service temporarily degraded".to_string()
            }
            HeliosError::Internal(_) | HeliosError::Configuration(_) => {
                "internal server error".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl IntoResponse for HeliosError {
    fn into_response(self) -> Response {
        match &self {
            HeliosError::StoreUnavailable(cause) | HeliosError::RegistryUnavailable(cause) => {
                warn!(error = %cause, "serving degraded response");
            }
            HeliosError::Internal(cause) => {
                error!(error = %cause, "internal error");
            }
            _ => {}
        }

        let status = self.status_code();
        let body = Json(json!({ "error": self.client_message() }));
        (status, body).into_response()
    }
}

/// Result type alias for Helios operations
pub type Result<T> = std::result::Result<T, HeliosError>;
