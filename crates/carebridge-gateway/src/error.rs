//! HTTP rendering of the shared error taxonomy.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use uuid::Uuid;

use carebridge_core::Error;

/// Wraps [`carebridge_core::Error`] for use as an axum rejection.
///
/// Every gateway surfaces failures with the same body shape:
/// `{"error": "<kind>", "detail": "<message>", "requestId": "<uuid>"}`.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = json!({
            "error": self.0.kind().as_str(),
            "detail": self.0.to_string(),
            "requestId": Uuid::new_v4().to_string(),
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_status_follows_taxonomy() {
        let response = ApiError(Error::not_found("Patient", "1")).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = ApiError(Error::request_timeout("pool")).into_response();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);

        let response = ApiError(Error::authentication_failed("token")).into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
