use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::error;
use crate::backend::schemas::ErrorResponse;
use crate::error::GenerationError;

/// Handler failure, rendered as a JSON body with a matching status
#[derive(Debug)]
pub struct BackendError {
    status: StatusCode,
    message: String,
}

impl BackendError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<GenerationError> for BackendError {
    fn from(err: GenerationError) -> Self {
        let status = match err {
            GenerationError::Configuration(_) => StatusCode::BAD_REQUEST,
            GenerationError::Busy => StatusCode::CONFLICT,
            GenerationError::WorkerUnavailable => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<anyhow::Error> for BackendError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<GenerationError>() {
            Ok(err) => err.into(),
            Err(err) => Self::internal(format!("{:#}", err)),
        }
    }
}

impl IntoResponse for BackendError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(status = %self.status, "Request failed: {}", self.message);
        }
        (self.status, Json(ErrorResponse { error: self.message })).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            BackendError::from(GenerationError::Configuration("x".into())).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(BackendError::from(GenerationError::Busy).status(), StatusCode::CONFLICT);
        assert_eq!(
            BackendError::from(GenerationError::WorkerUnavailable).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_anyhow_keeps_generation_errors() {
        let err: anyhow::Error = GenerationError::Busy.into();
        assert_eq!(BackendError::from(err).status(), StatusCode::CONFLICT);

        let wrapped = Err::<(), _>(GenerationError::Configuration("bad".into()))
            .context("submitting")
            .unwrap_err();
        assert_eq!(BackendError::from(wrapped).status(), StatusCode::BAD_REQUEST);

        let other = anyhow::anyhow!("disk full");
        assert_eq!(BackendError::from(other).status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
