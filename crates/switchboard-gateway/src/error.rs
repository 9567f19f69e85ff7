//! Core error → HTTP response mapping.
//!
//! Detail discipline: internal failures are logged server-side in full
//! and reach the caller as a generic message only. Abuse rejections show
//! the public half of the error; the matched detail stays in the audit
//! trail.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::{error, warn};

use switchboard_core::GatewayError;

pub struct ApiError(pub GatewayError);

impl From<GatewayError> for ApiError {
    fn from(e: GatewayError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self.0 {
            GatewayError::Auth { reason } => {
                warn!(event = "auth_reject", reason = %reason);
                (StatusCode::UNAUTHORIZED, "authentication failed".to_string())
            }
            GatewayError::Forbidden { server } => {
                warn!(event = "authz_reject", server = %server);
                (StatusCode::FORBIDDEN, "access denied".to_string())
            }
            GatewayError::Abuse { public, detail, stage } => {
                warn!(event = "abuse_reject", stage = stage, detail = %detail);
                (StatusCode::BAD_REQUEST, public.clone())
            }
            GatewayError::ConfirmationExpired => (
                StatusCode::NOT_FOUND,
                "confirmation not found or expired".to_string(),
            ),
            GatewayError::ConfirmationForbidden => {
                (StatusCode::FORBIDDEN, "access denied".to_string())
            }
            GatewayError::ServiceDegraded { server, message } => {
                warn!(event = "service_degraded", server = %server, message = %message);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "service temporarily unavailable".to_string(),
                )
            }
            GatewayError::Store(detail) => {
                error!(event = "store_error", detail = %detail);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
            GatewayError::Unexpected(source) => {
                error!(event = "unexpected_error", detail = ?source);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, Json(json!({ "error": body }))).into_response()
    }
}
