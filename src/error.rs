//! Error handling and JSON error responses for the gateway

use crate::throttle::ThrottleDenial;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Error codes for gateway errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayErrorCode {
    /// Shared key header missing or wrong
    SharedKeyMismatch,
    /// A host was created too recently
    CreationTooSoon,
    /// No more hosts may be created by this process
    CreationLimitReached,
    /// Unknown host reached the downstream stage
    UnknownHost,
    /// Internal gateway error
    InternalError,
}

impl GatewayErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayErrorCode::SharedKeyMismatch => StatusCode::SERVICE_UNAVAILABLE,
            GatewayErrorCode::CreationTooSoon => StatusCode::SERVICE_UNAVAILABLE,
            GatewayErrorCode::CreationLimitReached => StatusCode::SERVICE_UNAVAILABLE,
            GatewayErrorCode::UnknownHost => StatusCode::NOT_FOUND,
            GatewayErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Provision-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            GatewayErrorCode::SharedKeyMismatch => "SHARED_KEY_MISMATCH",
            GatewayErrorCode::CreationTooSoon => "CREATION_TOO_SOON",
            GatewayErrorCode::CreationLimitReached => "CREATION_LIMIT_REACHED",
            GatewayErrorCode::UnknownHost => "UNKNOWN_HOST",
            GatewayErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl From<&ThrottleDenial> for GatewayErrorCode {
    fn from(denial: &ThrottleDenial) -> Self {
        match denial {
            ThrottleDenial::TooSoon { .. } => GatewayErrorCode::CreationTooSoon,
            ThrottleDenial::LimitReached { .. } => GatewayErrorCode::CreationLimitReached,
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: GatewayErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    /// Create a new error response
    pub fn new(code: GatewayErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Provision-Error header
pub fn json_error_response(
    code: GatewayErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Provision-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
