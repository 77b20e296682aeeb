//! Typed HTTP-facing error boundary.
//!
//! Internal plumbing returns `anyhow::Result`; handlers convert to `AppError`
//! at the edge, the same way the teacher's HTTP layer turns failures into a
//! status code, just with a named type instead of an ad-hoc `simple(status, msg)`.

use axum::{
    response::{IntoResponse, Response},
    Json,
};
use http::StatusCode;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("not found")]
    NotFound,
    #[error("gone")]
    Gone(serde_json::Value),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("upstream error: {0}")]
    Upstream(String),
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, Json(ErrorBody { error: msg })).into_response()
            }
            AppError::Unauthorized(msg) => {
                (StatusCode::UNAUTHORIZED, Json(ErrorBody { error: msg })).into_response()
            }
            AppError::Forbidden(msg) => {
                (StatusCode::FORBIDDEN, Json(ErrorBody { error: msg })).into_response()
            }
            AppError::NotFound => (
                StatusCode::NOT_FOUND,
                Json(ErrorBody {
                    error: "not found".into(),
                }),
            )
                .into_response(),
            AppError::Gone(tombstone) => (
                StatusCode::GONE,
                [("Content-Type", crate::context::ACTIVITY_JSON)],
                Json(tombstone),
            )
                .into_response(),
            AppError::Conflict(msg) => {
                (StatusCode::CONFLICT, Json(ErrorBody { error: msg })).into_response()
            }
            AppError::Upstream(msg) => {
                tracing::warn!("upstream error: {msg}");
                (StatusCode::BAD_GATEWAY, Json(ErrorBody { error: msg })).into_response()
            }
            AppError::Internal(err) => {
                tracing::error!("internal error: {err:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorBody {
                        error: "internal error".into(),
                    }),
                )
                    .into_response()
            }
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;
