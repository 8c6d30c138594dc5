use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

use crate::shared::error::LabError;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Lab(LabError),
    Internal(anyhow::Error),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Lab(e) => match e {
                LabError::Validation(_) | LabError::UnsupportedAction(_) => {
                    StatusCode::BAD_REQUEST
                }
                LabError::PathTraversal(_) => StatusCode::FORBIDDEN,
                LabError::SessionNotFound(_) | LabError::FileNotFound(_) => StatusCode::NOT_FOUND,
                LabError::SessionNotReady { .. } | LabError::InvalidTransition { .. } => {
                    StatusCode::CONFLICT
                }
                LabError::PortExhaustion { .. } => StatusCode::SERVICE_UNAVAILABLE,
                LabError::ContainerStartTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                LabError::ContainerRuntime(_) | LabError::Cleanup { .. } | LabError::Io(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "bad_request",
            ApiError::Internal(_) => "internal_error",
            ApiError::Lab(e) => e.kind(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status();
        let error = self.kind();
        let message = match self {
            ApiError::BadRequest(msg) => msg,
            ApiError::Lab(e) => e.to_string(),
            ApiError::Internal(e) => format!("Internal error: {}", e),
        };
        if status.is_server_error() {
            tracing::error!(error, "{}", message);
        }
        (status, Json(ErrorResponse { error, message })).into_response()
    }
}

impl From<LabError> for ApiError {
    fn from(e: LabError) -> Self {
        ApiError::Lab(e)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Internal(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::models::LabStatus;
    use std::time::Duration;

    #[test]
    fn lab_errors_map_to_status_codes() {
        let cases = [
            (LabError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (LabError::PathTraversal("../x".into()), StatusCode::FORBIDDEN),
            (LabError::SessionNotFound("l".into()), StatusCode::NOT_FOUND),
            (
                LabError::SessionNotReady {
                    id: "l".into(),
                    status: LabStatus::Paused,
                },
                StatusCode::CONFLICT,
            ),
            (
                LabError::PortExhaustion {
                    requested: 3,
                    available: 1,
                },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                LabError::ContainerStartTimeout {
                    container: "c".into(),
                    timeout: Duration::from_secs(1),
                },
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (
                LabError::ContainerRuntime("boom".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
    }

    #[tokio::test]
    async fn body_carries_the_error_kind() {
        let response = ApiError::from(LabError::UnsupportedAction("rm_rf".into())).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error"], "unsupported_action");
        assert!(value["message"].as_str().unwrap().contains("rm_rf"));
    }
}
