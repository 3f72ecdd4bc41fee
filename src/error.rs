use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::error;

use crate::responses::RequestMeta;

pub const E_UNKNOWN_LINK: &str = "UNKNOWN_LINK";
pub const E_UNKNOWN_CLICK: &str = "UNKNOWN_CLICK";
pub const E_BAD_CLICK_ID: &str = "BAD_CLICK_ID";
pub const E_BAD_EVENT_TYPE: &str = "BAD_EVENT_TYPE";
pub const E_BAD_AMOUNT: &str = "BAD_AMOUNT";
pub const E_DB_FAILURE: &str = "DB_FAILURE";
pub const E_INGEST_FAILURE: &str = "INGEST_FAILURE";
pub const E_ENFORCE_FAILURE: &str = "ENFORCE_FAILURE";
pub const E_BILLING_FAILURE: &str = "BILLING_FAILURE";
pub const E_NOT_SUSPENDED: &str = "NOT_SUSPENDED";

#[derive(Debug)]
pub enum ApiError {
    /// Terminal: the caller should not retry.
    NotFound(String),
    /// Terminal: the payload is malformed.
    BadRequest(String),
    /// Retryable: store or compute failure.
    Internal(anyhow::Error),
}

#[derive(Debug)]
pub struct ApiErrorWithMeta {
    error: ApiError,
    meta: RequestMeta,
    code: Option<String>,
}

impl ApiError {
    pub fn with_meta(self, meta: RequestMeta) -> ApiErrorWithMeta {
        ApiErrorWithMeta {
            error: self,
            meta,
            code: None,
        }
    }
}

impl ApiErrorWithMeta {
    pub fn with_code(mut self, code: &str) -> Self {
        self.code = Some(code.to_string());
        self
    }
}

impl IntoResponse for ApiErrorWithMeta {
    fn into_response(self) -> Response {
        let (status, error_message) = match self.error {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(e) => {
                error!("internal error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
        };

        let mut body = json!({
            "request_id": self.meta.request_id,
            "error": error_message,
        });
        if let Some(code) = self.code {
            body["code"] = json!(code);
        }

        (status, Json(body)).into_response()
    }
}
