//! HTTP error mapping

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use storyforge_metering::MeteringError;

/// Wrapper turning engine errors into HTTP responses
#[derive(Debug)]
pub struct ApiError(pub MeteringError);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            MeteringError::NotFound(_) => StatusCode::NOT_FOUND,
            MeteringError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            MeteringError::LimitExceeded(_) => StatusCode::FORBIDDEN,
            MeteringError::Expired(_) => StatusCode::GONE,
            MeteringError::Conflict(_) => StatusCode::CONFLICT,
            MeteringError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            MeteringError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<MeteringError> for ApiError {
    fn from(err: MeteringError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        // Internal detail stays in the logs, not the response body
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self.0, "Internal error");
            "internal server error".to_string()
        } else {
            self.0.to_string()
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_errors_map_to_expected_statuses() {
        let cases = [
            (MeteringError::NotFound("org".into()), StatusCode::NOT_FOUND),
            (
                MeteringError::InvalidArgument("amount".into()),
                StatusCode::BAD_REQUEST,
            ),
            (
                MeteringError::LimitExceeded("over".into()),
                StatusCode::FORBIDDEN,
            ),
            (MeteringError::Expired("hold".into()), StatusCode::GONE),
            (
                MeteringError::Conflict("terminal".into()),
                StatusCode::CONFLICT,
            ),
            (
                MeteringError::Unavailable("pool".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(ApiError(err).status(), expected);
        }
    }
}
