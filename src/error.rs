use std::path::PathBuf;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::models::trip::TripStatus;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Pdf(#[from] lopdf::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("invalid trip transition: {from} -> {to}")]
    InvalidTransition { from: TripStatus, to: TripStatus },
    #[error("trip is locked: {0}")]
    Locked(String),
    #[error("compliance violation: {0}")]
    ComplianceViolation(String),
    #[error("{0}")]
    Conflict(String),
    #[error("report template not found at {}", .0.display())]
    TemplateNotFound(PathBuf),
    #[error("report rendering timed out; retry the request")]
    RenderTimeout,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self {
            AppError::Config(_)
            | AppError::Io(_)
            | AppError::Database(_)
            | AppError::Pdf(_)
            | AppError::Other(_)
            | AppError::TemplateNotFound(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::InvalidTransition { .. } | AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Locked(_) => StatusCode::LOCKED,
            AppError::ComplianceViolation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::RenderTimeout => StatusCode::SERVICE_UNAVAILABLE,
        };

        (status, self.to_string()).into_response()
    }
}
