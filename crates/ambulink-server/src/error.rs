use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use ambulink_net::NetError;
use ambulink_shared::ParseError;
use ambulink_store::StoreError;

/// Why an inbound message or session change was rejected.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Malformed topic; the sender cannot be identified reliably.
    #[error("{0}")]
    Parse(#[from] ParseError),

    #[error("unknown {0}")]
    UnknownResource(String),

    #[error("not authorized: {0}")]
    Authorization(String),

    #[error("invalid payload: {0}")]
    Validation(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("{0}")]
    Store(StoreError),

    #[error("could not encode payload: {0}")]
    Encode(#[from] serde_json::Error),
}

impl BridgeError {
    pub fn unknown(what: impl Into<String>) -> Self {
        Self::UnknownResource(what.into())
    }

    pub fn unauthorized(why: impl Into<String>) -> Self {
        Self::Authorization(why.into())
    }

    pub fn invalid(why: impl Into<String>) -> Self {
        Self::Validation(why.into())
    }

    /// Whether the sender gets an error reply. Parse errors are only logged.
    pub fn is_reportable(&self) -> bool {
        !matches!(self, Self::Parse(_))
    }
}

impl From<StoreError> for BridgeError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => Self::UnknownResource("record".into()),
            other => Self::Store(other),
        }
    }
}

impl From<NetError> for BridgeError {
    fn from(err: NetError) -> Self {
        match err {
            NetError::Protocol(msg) => Self::Protocol(msg),
            other => Self::BrokerUnavailable(other.to_string()),
        }
    }
}

/// Errors returned by the HTTP surface.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<BridgeError> for ServerError {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::Parse(_) | BridgeError::Validation(_) => Self::BadRequest(err.to_string()),
            BridgeError::UnknownResource(_) => Self::NotFound(err.to_string()),
            BridgeError::Authorization(_) => Self::Forbidden(err.to_string()),
            BridgeError::Store(StoreError::Conflict(msg)) => Self::Conflict(msg),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<StoreError> for ServerError {
    fn from(err: StoreError) -> Self {
        BridgeError::from(err).into()
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServerError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ServerError::Forbidden(_) => (StatusCode::FORBIDDEN, self.to_string()),
            ServerError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            ServerError::Conflict(_) => (StatusCode::CONFLICT, self.to_string()),
            ServerError::Internal(e) => {
                tracing::error!(error = %e, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_net_errors_map_to_bridge_taxonomy() {
        let err = BridgeError::from(NetError::Protocol("SUBACK for unknown packet id 9".into()));
        assert!(matches!(err, BridgeError::Protocol(_)));

        let err = BridgeError::from(NetError::Rejected("connection refused".into()));
        assert!(matches!(err, BridgeError::BrokerUnavailable(_)));
        assert!(matches!(ServerError::from(err), ServerError::Internal(_)));
    }

    #[test]
    fn test_missing_row_is_unknown_resource() {
        let err = BridgeError::from(StoreError::NotFound);
        assert!(matches!(err, BridgeError::UnknownResource(_)));
        assert!(matches!(ServerError::from(err), ServerError::NotFound(_)));
    }
}
