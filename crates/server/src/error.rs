use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use townhall_engine::BrokerError;
use townhall_protocol::ErrorBody;

/// Relay body for sends and WebSocket clients arriving before the broker is
/// up. Browser clients match on this exact text.
pub const NOT_INITIALIZED: &str = "Fluvio not initialized";

/// JSON error returned by every handler.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorBody,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody::new(message).with_code(code),
        }
    }

    /// Body carries only `error`, which is what relay callers match on.
    pub fn plain(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody::new(message),
        }
    }

    pub fn not_initialized() -> Self {
        Self::plain(StatusCode::SERVICE_UNAVAILABLE, NOT_INITIALIZED)
    }

    /// Relay mapping: an unreachable broker is a 503, anything else a 500.
    pub fn from_send_error(err: &BrokerError) -> Self {
        if matches!(err, BrokerError::NotInitialized) {
            return Self::not_initialized();
        }
        let status = if err.is_unavailable() {
            StatusCode::SERVICE_UNAVAILABLE
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        Self::plain(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (self.status, Json(self.body)).into_response()
    }
}

/// Broker node mapping: each failure keeps its own status so remote clients
/// can rebuild the same [`BrokerError`].
impl From<BrokerError> for ApiError {
    fn from(err: BrokerError) -> Self {
        let message = err.to_string();
        match err {
            BrokerError::NotInitialized
            | BrokerError::Connection { .. }
            | BrokerError::ConnectTimeout { .. } => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, "unavailable", message)
            }
            BrokerError::TopicAlreadyExists(_) => {
                Self::new(StatusCode::CONFLICT, "topic_exists", message)
            }
            BrokerError::TopicNotFound(_) => {
                Self::new(StatusCode::NOT_FOUND, "topic_not_found", message)
            }
            BrokerError::PartitionNotFound { .. } => {
                Self::new(StatusCode::NOT_FOUND, "partition_not_found", message)
            }
            BrokerError::InvalidTopicName(_) => {
                Self::new(StatusCode::BAD_REQUEST, "invalid_topic_name", message)
            }
            BrokerError::InvalidConfig(_) => {
                Self::new(StatusCode::BAD_REQUEST, "invalid_config", message)
            }
            BrokerError::Send(_)
            | BrokerError::Stream(_)
            | BrokerError::Storage(_)
            | BrokerError::Codec(_) => {
                tracing::error!(error = %message, "broker request failed");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
            }
        }
    }
}
