//! API error types.

use axum::Json;
use axum::http::StatusCode;
use axum::http::header::WWW_AUTHENTICATE;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// API error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error code for programmatic handling.
    pub code: String,
    /// Human-readable error message.
    pub message: String,
}

/// API error type.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Private-fork read without (valid) credentials. Carries the realm for
    /// the `WWW-Authenticate` challenge.
    #[error("authentication required for fork {realm}")]
    BasicAuthRequired { realm: String },

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unprocessable: {0}")]
    UnprocessableEntity(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("store error: {0}")]
    Db(#[from] depot_db::DbError),

    #[error("core error: {0}")]
    Core(#[from] depot_core::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

impl ApiError {
    /// Get the error code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Unauthorized(_) | Self::BasicAuthRequired { .. } => "unauthorized",
            Self::BadRequest(_) => "bad_request",
            Self::Conflict(_) => "conflict",
            Self::UnprocessableEntity(_) => "unprocessable_entity",
            Self::Internal(_) => "internal_error",
            Self::Db(_) => "store_error",
            Self::Core(_) => "bad_request",
            Self::Io(_) => "io_error",
            Self::Sqlx(_) => "store_error",
        }
    }

    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unauthorized(_) | Self::BasicAuthRequired { .. } => StatusCode::UNAUTHORIZED,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::UnprocessableEntity(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Db(e) => match e {
                depot_db::DbError::NotFound(_) => StatusCode::NOT_FOUND,
                depot_db::DbError::AlreadyExists(_) => StatusCode::CONFLICT,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Core(_) => StatusCode::BAD_REQUEST,
            Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Sqlx(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            code: self.code().to_string(),
            message: self.to_string(),
        };

        match &self {
            Self::BasicAuthRequired { realm } => (
                status,
                [(WWW_AUTHENTICATE, format!("Basic realm={realm}"))],
                Json(body),
            )
                .into_response(),
            _ => (status, Json(body)).into_response(),
        }
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_auth_challenge_sets_header() {
        let err = ApiError::BasicAuthRequired {
            realm: "fork_priv".to_string(),
        };
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get(WWW_AUTHENTICATE).unwrap(),
            "Basic realm=fork_priv"
        );
    }

    #[test]
    fn db_conflicts_map_to_409() {
        let err = ApiError::Db(depot_db::DbError::AlreadyExists("version 1.0".into()));
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
        let err = ApiError::Db(depot_db::DbError::NotFound("fork".into()));
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }
}
