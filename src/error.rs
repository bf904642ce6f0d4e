//! Transport error taxonomy and its HTTP/JSON-RPC rendering.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};

use crate::jsonrpc::{Envelope, ErrorObject, MalformedEnvelope, RequestId};

/// JSON-RPC error codes used by the transport itself.
pub mod codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const INTERNAL_ERROR: i64 = -32603;
    pub const SERVER_ERROR: i64 = -32000;
    pub const AUTH_PROVIDER_ERROR: i64 = -32001;
    pub const AUTH_FAILED: i64 = -32002;
    pub const SESSION_NOT_FOUND: i64 = -32004;
    pub const BATCH_TIMEOUT: i64 = -32006;
}

pub const ALLOWED_METHODS: &str = "GET, POST, DELETE, OPTIONS";

/// Every way an HTTP exchange can be rejected or fail.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Bad Request: {0}")]
    MalformedEnvelope(#[from] MalformedEnvelope),
    #[error("Bad Request: missing required session header {header}")]
    MissingSession { header: String },
    #[error("Not Found: invalid or expired session ID")]
    UnknownSession,
    #[error("Not Found")]
    UnknownEndpoint,
    #[error("Bad Request: cannot send session ID with initialize request")]
    DuplicateSessionOnInit,
    #[error("Unsupported Media Type: Content-Type must be application/json")]
    UnsupportedMediaType,
    #[error("Not Acceptable: {0}")]
    NotAcceptable(&'static str),
    #[error("Method Not Allowed: {0}")]
    MethodNotAllowed(&'static str),
    #[error("Payload Too Large: message exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },
    #[error("{message}")]
    AuthenticationFailed { status: StatusCode, message: String },
    #[error("Authentication provider error: {0}")]
    AuthProvider(String),
    #[error("Request batch timed out. Missing responses for {} requests.", .missing.len())]
    BatchTimeout { missing: Vec<RequestId> },
    #[error("Bad Request: duplicate request id {0} in one message")]
    DuplicateRequestId(RequestId),
    #[error("Bad Request: request id {0} is already in flight")]
    RequestIdInFlight(RequestId),
    #[error("Internal Server Error: {0}")]
    Internal(String),
}

impl TransportError {
    pub fn status(&self) -> StatusCode {
        match self {
            TransportError::MalformedEnvelope(_)
            | TransportError::MissingSession { .. }
            | TransportError::DuplicateSessionOnInit
            | TransportError::DuplicateRequestId(_)
            | TransportError::RequestIdInFlight(_) => StatusCode::BAD_REQUEST,
            TransportError::UnknownSession | TransportError::UnknownEndpoint => {
                StatusCode::NOT_FOUND
            }
            TransportError::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            TransportError::NotAcceptable(_) => StatusCode::NOT_ACCEPTABLE,
            TransportError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            TransportError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            TransportError::AuthenticationFailed { status, .. } => *status,
            TransportError::AuthProvider(_) | TransportError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            TransportError::BatchTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    pub fn code(&self) -> i64 {
        match self {
            TransportError::MalformedEnvelope(e) if e.is_parse_error() => codes::PARSE_ERROR,
            TransportError::MalformedEnvelope(_)
            | TransportError::MissingSession { .. }
            | TransportError::DuplicateSessionOnInit
            | TransportError::DuplicateRequestId(_)
            | TransportError::RequestIdInFlight(_) => codes::INVALID_REQUEST,
            TransportError::UnknownSession => codes::SESSION_NOT_FOUND,
            TransportError::AuthenticationFailed { .. } => codes::AUTH_FAILED,
            TransportError::AuthProvider(_) => codes::AUTH_PROVIDER_ERROR,
            TransportError::BatchTimeout { .. } => codes::BATCH_TIMEOUT,
            TransportError::Internal(_) => codes::INTERNAL_ERROR,
            TransportError::UnknownEndpoint
            | TransportError::UnsupportedMediaType
            | TransportError::NotAcceptable(_)
            | TransportError::MethodNotAllowed(_)
            | TransportError::PayloadTooLarge { .. } => codes::SERVER_ERROR,
        }
    }

    fn data(&self) -> Option<Value> {
        match self {
            TransportError::BatchTimeout { missing } => Some(json!({ "missingIds": missing })),
            _ => None,
        }
    }

    /// Attach the id of the request that triggered the error.
    pub fn with_request_id(self, id: Option<RequestId>) -> RejectedRequest {
        RejectedRequest { error: self, id }
    }

    pub fn to_envelope(&self, id: Option<RequestId>) -> Envelope {
        Envelope::error(id, ErrorObject::new(self.code(), self.to_string(), self.data()))
    }
}

/// A [`TransportError`] bound to the request id it answers.
#[derive(Debug)]
pub struct RejectedRequest {
    pub error: TransportError,
    pub id: Option<RequestId>,
}

impl From<TransportError> for RejectedRequest {
    fn from(error: TransportError) -> Self {
        RejectedRequest { error, id: None }
    }
}

impl IntoResponse for RejectedRequest {
    fn into_response(self) -> Response {
        let status = self.error.status();
        let body = self.error.to_envelope(self.id);
        let mut response = (status, Json(body)).into_response();
        if matches!(self.error, TransportError::MethodNotAllowed(_)) {
            response
                .headers_mut()
                .insert(header::ALLOW, HeaderValue::from_static(ALLOWED_METHODS));
        }
        response
    }
}

impl IntoResponse for TransportError {
    fn into_response(self) -> Response {
        RejectedRequest::from(self).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(TransportError::UnknownSession.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            TransportError::DuplicateSessionOnInit.status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            TransportError::UnsupportedMediaType.status(),
            StatusCode::UNSUPPORTED_MEDIA_TYPE
        );
        assert_eq!(
            TransportError::BatchTimeout { missing: vec![] }.status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            TransportError::AuthenticationFailed {
                status: StatusCode::FORBIDDEN,
                message: "nope".into()
            }
            .status(),
            StatusCode::FORBIDDEN
        );
    }

    #[test]
    fn test_parse_error_code() {
        let err = TransportError::from(MalformedEnvelope::Json("eof".into()));
        assert_eq!(err.code(), codes::PARSE_ERROR);
        let err = TransportError::from(MalformedEnvelope::Shape);
        assert_eq!(err.code(), codes::INVALID_REQUEST);
    }

    #[test]
    fn test_batch_timeout_envelope_lists_missing_ids() {
        let err = TransportError::BatchTimeout {
            missing: vec![RequestId::from(3_i64)],
        };
        let value = serde_json::to_value(err.to_envelope(None)).unwrap();
        assert_eq!(value["id"], Value::Null);
        assert_eq!(value["error"]["code"], codes::BATCH_TIMEOUT);
        assert_eq!(value["error"]["data"]["missingIds"], json!([3]));
    }

    #[tokio::test]
    async fn test_method_not_allowed_sets_allow_header() {
        let response = TransportError::MethodNotAllowed("PUT").into_response();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers()[header::ALLOW], ALLOWED_METHODS);
    }
}
