//! HTTP error responses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use octofhir_cql_translator::TranslatorError;
use serde_json::json;
use thiserror::Error;

/// Errors that end a request without a translation result.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Translation(#[from] TranslatorError),

    /// Request content type the translate route does not accept (415)
    #[error("Unsupported content type: {0}")]
    UnsupportedContentType(String),

    /// Accept header admits no ELM representation (406)
    #[error("Not acceptable: {0}")]
    NotAcceptable(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Translation(TranslatorError::Internal(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Translation(_) => StatusCode::BAD_REQUEST,
            Self::UnsupportedContentType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Self::NotAcceptable(_) => StatusCode::NOT_ACCEPTABLE,
        }
    }

    /// OperationOutcome issue type code.
    fn issue_code(&self) -> &'static str {
        match self {
            Self::Translation(TranslatorError::Internal(_)) => "exception",
            Self::Translation(_) => "invalid",
            Self::UnsupportedContentType(_) | Self::NotAcceptable(_) => "not-supported",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, status = status.as_u16(), "Request failed");
        } else {
            tracing::warn!(error = %self, status = status.as_u16(), "Request rejected");
        }

        let operation_outcome = json!({
            "resourceType": "OperationOutcome",
            "issue": [{
                "severity": "error",
                "code": self.issue_code(),
                "diagnostics": self.to_string()
            }]
        });

        (status, Json(operation_outcome)).into_response()
    }
}
