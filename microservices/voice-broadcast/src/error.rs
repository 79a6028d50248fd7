//! Error taxonomy for the voice broadcast service.
//!
//! Mirrors `brivas_core::BrivasError`'s shape (one variant per failure
//! class, a `status_code()` accessor) but adds an `IntoResponse` impl since
//! this service serves its own Axum router rather than going through a
//! shared gateway.

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BroadcastError>;

#[derive(Error, Debug)]
pub enum BroadcastError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("TTS service unavailable: {0}")]
    TtsUnavailable(String),

    #[error("CDN unavailable: {0}")]
    CdnUnavailable(String),

    #[error("Provider rejected call: {code} {message}")]
    ProviderRejection { code: String, message: String },

    #[error("Provider unreachable: {0}")]
    ProviderUnreachable(String),

    #[error("Invalid webhook signature")]
    SignatureInvalid,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BroadcastError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            BroadcastError::Validation(_) => StatusCode::BAD_REQUEST,
            BroadcastError::NotFound(_) => StatusCode::NOT_FOUND,
            BroadcastError::Conflict(_) => StatusCode::CONFLICT,
            BroadcastError::SignatureInvalid => StatusCode::FORBIDDEN,
            BroadcastError::TtsUnavailable(_)
            | BroadcastError::CdnUnavailable(_)
            | BroadcastError::ProviderUnreachable(_) => StatusCode::SERVICE_UNAVAILABLE,
            BroadcastError::ProviderRejection { .. } => StatusCode::BAD_GATEWAY,
            BroadcastError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
    message: String,
}

impl IntoResponse for BroadcastError {
    fn into_response(self) -> axum::response::Response {
        // Signature failures respond with no diagnostic body (spec.md §7).
        if matches!(self, BroadcastError::SignatureInvalid) {
            return (StatusCode::FORBIDDEN, ()).into_response();
        }

        let status = self.status_code();
        let body = ErrorBody {
            success: false,
            error: error_code(&self),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

fn error_code(err: &BroadcastError) -> String {
    match err {
        BroadcastError::Validation(_) => "VALIDATION_ERROR",
        BroadcastError::NotFound(_) => "NOT_FOUND",
        BroadcastError::Conflict(_) => "CONFLICT",
        BroadcastError::TtsUnavailable(_) => "TTS_UNAVAILABLE",
        BroadcastError::CdnUnavailable(_) => "CDN_UNAVAILABLE",
        BroadcastError::ProviderRejection { .. } => "PROVIDER_REJECTION",
        BroadcastError::ProviderUnreachable(_) => "PROVIDER_UNREACHABLE",
        BroadcastError::SignatureInvalid => "SIGNATURE_INVALID",
        BroadcastError::Internal(_) => "INTERNAL_ERROR",
    }
    .to_string()
}
