//! HTTP error mapping for the router.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
}

/// Redirect failures are the operator's to read: everything except a
/// missing conversation is a 400 carrying the underlying message.
impl From<dataminer_core::Error> for ApiError {
    fn from(err: dataminer_core::Error) -> Self {
        match err {
            dataminer_core::Error::NotFound(msg) => ApiError::NotFound(msg),
            other => ApiError::BadRequest(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
        };

        let body = Json(serde_json::json!({
            "error": message,
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dataminer_core::Error;

    #[test]
    fn test_port_exhaustion_is_bad_request() {
        let err: ApiError = Error::PortExhausted {
            start: 9000,
            end: 8999,
        }
        .into();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_not_found_maps_to_404() {
        let err: ApiError = Error::NotFound("conversation C1".into()).into();
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_transient_init_failure_is_bad_request() {
        let err: ApiError = Error::Transient("broker unavailable".into()).into();
        assert!(matches!(err, ApiError::BadRequest(ref m) if m.contains("broker unavailable")));
    }
}
