use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use tracing::error;
use uuid::Uuid;

/// The proxy's domain-error taxonomy, per the error handling design.
///
/// Each variant maps to exactly one HTTP status code via [`ProxyError::status_code`].
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("unsupported content type")]
    UnsupportedContentType,

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("forbidden")]
    Forbidden,

    #[error("unknown queue")]
    UnknownQueue,

    #[error("queue empty")]
    Empty,

    #[error("broker rejected message: {0}")]
    BrokerRejected(String),

    #[error("shutting down")]
    ShuttingDown,

    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl ProxyError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::UnsupportedContentType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ProxyError::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            ProxyError::Forbidden => StatusCode::FORBIDDEN,
            ProxyError::UnknownQueue => StatusCode::NOT_FOUND,
            ProxyError::Empty => StatusCode::LOCKED,
            ProxyError::BrokerRejected(_) => StatusCode::BAD_GATEWAY,
            ProxyError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ProxyError::UnsupportedContentType => "UNSUPPORTED_CONTENT_TYPE",
            ProxyError::InvalidPayload(_) => "INVALID_PAYLOAD",
            ProxyError::Forbidden => "FORBIDDEN",
            ProxyError::UnknownQueue => "UNKNOWN_QUEUE",
            ProxyError::Empty => "EMPTY",
            ProxyError::BrokerRejected(_) => "BROKER_REJECTED",
            ProxyError::ShuttingDown => "SHUTTING_DOWN",
            ProxyError::Internal(_) => "INTERNAL",
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        if let ProxyError::Internal(ref source) = self {
            let correlation_id = Uuid::new_v4();
            error!(%correlation_id, error = %source, "internal error");
            return (status, Json(json!({ "error": self.kind(), "message": self.to_string(), "correlationId": correlation_id.to_string() })))
                .into_response();
        }

        (status, Json(json!({ "error": self.kind(), "message": self.to_string() }))).into_response()
    }
}
