use axum::extract::multipart::{MultipartError, MultipartRejection};
use axum::extract::rejection::QueryRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use facegate_core::{ParamError, PipelineError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub type ServiceResult<T> = Result<T, ServiceError>;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("{0}")]
    BadRequest(String),

    #[error("gallery is closed")]
    GalleryClosed,

    #[error("engine did not answer within {0:?}")]
    EngineTimeout(Duration),

    #[error("engine failure: {0}")]
    EngineFatal(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// JSON body of every non-200 response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
}

impl ServiceError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServiceError::GalleryClosed => StatusCode::CONFLICT,
            ServiceError::EngineTimeout(_) => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::EngineFatal(_) | ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn missing_field(name: &str) -> Self {
        ServiceError::BadRequest(format!("missing form field '{name}'"))
    }
}

impl From<PipelineError> for ServiceError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::BadRequest(msg) => ServiceError::BadRequest(msg),
            PipelineError::GalleryClosed => ServiceError::GalleryClosed,
            PipelineError::EngineTimeout(limit) => ServiceError::EngineTimeout(limit),
            PipelineError::EngineFatal(msg) => ServiceError::EngineFatal(msg),
        }
    }
}

impl From<ParamError> for ServiceError {
    fn from(err: ParamError) -> Self {
        ServiceError::BadRequest(err.to_string())
    }
}

impl From<MultipartError> for ServiceError {
    fn from(err: MultipartError) -> Self {
        ServiceError::BadRequest(format!("malformed multipart body: {}", err.body_text()))
    }
}

impl From<MultipartRejection> for ServiceError {
    fn from(err: MultipartRejection) -> Self {
        ServiceError::BadRequest(err.body_text())
    }
}

impl From<QueryRejection> for ServiceError {
    fn from(err: QueryRejection) -> Self {
        ServiceError::BadRequest(err.body_text())
    }
}

impl From<std::io::Error> for ServiceError {
    fn from(err: std::io::Error) -> Self {
        ServiceError::Internal(err.to_string())
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = self.to_string();
        if status.is_server_error() {
            tracing::error!(%status, %message, "request failed");
        } else {
            tracing::info!(%status, %message, "request rejected");
        }
        (status, Json(ErrorBody { message })).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (PipelineError::BadRequest("x".into()), StatusCode::BAD_REQUEST),
            (PipelineError::GalleryClosed, StatusCode::CONFLICT),
            (PipelineError::EngineTimeout(Duration::from_secs(30)), StatusCode::SERVICE_UNAVAILABLE),
            (PipelineError::EngineFatal("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ServiceError::from(err).status_code(), status);
        }
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        assert_eq!(ServiceError::from(io).status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_missing_field_names_the_field() {
        let err = ServiceError::missing_field("image2");
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert!(err.to_string().contains("image2"));
    }
}
