use axum::{
    Json,
    extract::rejection::QueryRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

/// Failures raised by a generative backend.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BackendError {
    /// Expired or invalid credentials. Recoverable by rebuilding the client.
    #[error("backend credentials expired: {0}")]
    TransientAuth(String),

    #[error("{0}")]
    Fatal(String),
}

impl BackendError {
    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    pub fn is_transient_auth(&self) -> bool {
        matches!(self, Self::TransientAuth(_))
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        Self::Fatal(format!("request failed: {}", err))
    }
}

/// Inbound frame that could not be accepted. The Display form is what the
/// client sees in the `error` frame.
#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    #[error("invalid_json")]
    InvalidJson,

    #[error("unknown_type")]
    UnknownType(Option<String>),

    #[error("invalid_frame: {0}")]
    InvalidFrame(String),
}

/// Error type for the HTTP endpoints.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        tracing::error!(error = %format!("{:#}", err), "Request failed");
        Self::Internal(format!("{:#}", err))
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorBody {
            error: self.error_code(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
