use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use lostlink_shared::ProtocolError;
use lostlink_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Missing authenticated identity")]
    Unauthenticated,

    #[error("Message blocked by user")]
    Blocked,

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Analysis queue is full")]
    QueueFull,

    #[error("Match analysis is disabled on this instance")]
    AnalysisDisabled,

    #[error("No embedding available for the analysed item")]
    NoEmbedding,

    #[error("Store error: {0}")]
    Store(StoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for ServerError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => ServerError::NotFound("record".into()),
            other => ServerError::Store(other),
        }
    }
}

impl From<ProtocolError> for ServerError {
    fn from(e: ProtocolError) -> Self {
        ServerError::BadRequest(e.to_string())
    }
}

impl From<tokio::task::JoinError> for ServerError {
    fn from(e: tokio::task::JoinError) -> Self {
        ServerError::Internal(format!("blocking task failed: {e}"))
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServerError::Unauthenticated => (StatusCode::UNAUTHORIZED, self.to_string()),
            ServerError::Blocked => (StatusCode::FORBIDDEN, self.to_string()),
            ServerError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ServerError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            ServerError::QueueFull => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
            ServerError::AnalysisDisabled => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
            ServerError::NoEmbedding => (StatusCode::BAD_GATEWAY, self.to_string()),
            ServerError::Store(e) => {
                tracing::error!(error = %e, "store failure");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
            ServerError::Internal(e) => {
                tracing::error!(error = %e, "internal failure");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}
