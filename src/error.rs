use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

/// Client-facing failure classes. The HTTP status and the stable wire code
/// are fixed per kind; only the message varies per call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    BadRequest,
    NotFound,
    Conflict,
    FailedDependency,
    GatewayTimeout,
    Internal,
}

impl ErrorKind {
    fn status(self) -> StatusCode {
        match self {
            ErrorKind::BadRequest => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::FailedDependency => StatusCode::FAILED_DEPENDENCY,
            ErrorKind::GatewayTimeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(self) -> &'static str {
        match self {
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::FailedDependency => "failed_dependency",
            ErrorKind::GatewayTimeout => "gateway_timeout",
            ErrorKind::Internal => "internal_error",
        }
    }
}

#[derive(Debug)]
pub struct ApiError {
    kind: ErrorKind,
    message: String,
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

impl ApiError {
    fn of(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::of(ErrorKind::BadRequest, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::of(ErrorKind::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::of(ErrorKind::Conflict, message)
    }

    pub fn failed_dependency(message: impl Into<String>) -> Self {
        Self::of(ErrorKind::FailedDependency, message)
    }

    pub fn gateway_timeout(message: impl Into<String>) -> Self {
        Self::of(ErrorKind::GatewayTimeout, message)
    }

    pub fn internal(err: impl std::fmt::Display) -> Self {
        Self::of(ErrorKind::Internal, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            code: self.kind.code(),
            message: self.message,
        };
        (self.kind.status(), Json(body)).into_response()
    }
}

/// Failure surface of the generation pipeline. Each variant maps to one
/// published `error` event; the distinction matters for logs and metrics,
/// not for the client.
#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("generation stream failed: {0}")]
    Streamer(String),
    #[error("result sink failed: {0}")]
    Sink(String),
}
