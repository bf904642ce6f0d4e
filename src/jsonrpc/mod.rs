//! JSON-RPC 2.0 envelope model.
//!
//! Every message crossing the transport is an [`Envelope`]: a request, a
//! notification, or a response (success or error). Inbound JSON is turned into
//! envelopes by [`classify`], which enforces the shape rules; outbound
//! envelopes serialize back to canonical JSON-RPC.

mod classify;

pub use classify::{classify, parse_body, MalformedEnvelope};

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// Method name that opens a new session.
pub const INITIALIZE_METHOD: &str = "initialize";

/// The `"jsonrpc": "2.0"` protocol marker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JsonRpcVersion2_0;

impl JsonRpcVersion2_0 {
    pub const VALUE: &'static str = "2.0";
}

impl Serialize for JsonRpcVersion2_0 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(Self::VALUE)
    }
}

impl<'de> Deserialize<'de> for JsonRpcVersion2_0 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let version = String::deserialize(deserializer)?;
        if version == Self::VALUE {
            Ok(JsonRpcVersion2_0)
        } else {
            Err(serde::de::Error::custom(format!(
                "unsupported jsonrpc version {version:?}"
            )))
        }
    }
}

/// Request identifier. Fractional numbers are not accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        RequestId::Number(value)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        RequestId::String(value.to_string())
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        RequestId::String(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: JsonRpcVersion2_0,
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: JsonRpcVersion2_0,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// JSON-RPC error object carried by an error response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    pub fn new(code: i64, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            code,
            message: message.into(),
            data,
        }
    }
}

/// Either side of a response; success and error are mutually exclusive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponsePayload {
    Result(Value),
    Error(ErrorObject),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: JsonRpcVersion2_0,
    /// `None` serializes as `null`, used when the failing request had no usable id.
    pub id: Option<RequestId>,
    #[serde(flatten)]
    pub payload: ResponsePayload,
}

impl JsonRpcResponse {
    pub fn is_error(&self) -> bool {
        matches!(self.payload, ResponsePayload::Error(_))
    }
}

/// One JSON-RPC 2.0 message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Envelope {
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
    Response(JsonRpcResponse),
}

/// Dispatch-relevant category of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeKind {
    Request,
    Notification,
    SuccessResponse,
    ErrorResponse,
}

impl Envelope {
    pub fn request(
        id: impl Into<RequestId>,
        method: impl Into<String>,
        params: Option<Value>,
    ) -> Self {
        Envelope::Request(JsonRpcRequest {
            jsonrpc: JsonRpcVersion2_0,
            id: id.into(),
            method: method.into(),
            params,
        })
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Envelope::Notification(JsonRpcNotification {
            jsonrpc: JsonRpcVersion2_0,
            method: method.into(),
            params,
        })
    }

    pub fn success(id: impl Into<RequestId>, result: Value) -> Self {
        Envelope::Response(JsonRpcResponse {
            jsonrpc: JsonRpcVersion2_0,
            id: Some(id.into()),
            payload: ResponsePayload::Result(result),
        })
    }

    pub fn error(id: Option<RequestId>, error: ErrorObject) -> Self {
        Envelope::Response(JsonRpcResponse {
            jsonrpc: JsonRpcVersion2_0,
            id,
            payload: ResponsePayload::Error(error),
        })
    }

    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Envelope::Request(_) => EnvelopeKind::Request,
            Envelope::Notification(_) => EnvelopeKind::Notification,
            Envelope::Response(r) if r.is_error() => EnvelopeKind::ErrorResponse,
            Envelope::Response(_) => EnvelopeKind::SuccessResponse,
        }
    }

    /// The id of a request, or the (non-null) id of a response.
    pub fn id(&self) -> Option<&RequestId> {
        match self {
            Envelope::Request(r) => Some(&r.id),
            Envelope::Response(r) => r.id.as_ref(),
            Envelope::Notification(_) => None,
        }
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            Envelope::Request(r) => Some(&r.method),
            Envelope::Notification(n) => Some(&n.method),
            Envelope::Response(_) => None,
        }
    }

    pub fn is_response(&self) -> bool {
        matches!(self, Envelope::Response(_))
    }

    pub fn is_initialize(&self) -> bool {
        matches!(self, Envelope::Request(r) if r.method == INITIALIZE_METHOD)
    }
}

impl<'de> Deserialize<'de> for Envelope {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        classify(value).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_success_response_serializes_result() {
        let value = serde_json::to_value(Envelope::success(7_i64, json!({"ok": true}))).unwrap();
        assert_eq!(value, json!({"jsonrpc": "2.0", "id": 7, "result": {"ok": true}}));
    }

    #[test]
    fn test_error_response_with_null_id() {
        let envelope = Envelope::error(None, ErrorObject::new(-32600, "Invalid Request", None));
        let value = serde_json::to_value(envelope).unwrap();
        assert_eq!(
            value,
            json!({
                "jsonrpc": "2.0",
                "id": null,
                "error": {"code": -32600, "message": "Invalid Request"}
            })
        );
    }

    #[test]
    fn test_notification_omits_params() {
        let envelope = Envelope::notification("notifications/initialized", None);
        let value = serde_json::to_value(envelope).unwrap();
        assert_eq!(value, json!({"jsonrpc": "2.0", "method": "notifications/initialized"}));
    }

    #[test]
    fn test_deserialize_goes_through_classifier() {
        let envelope: Envelope =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":"a","method":"tools/list"}"#).unwrap();
        assert_eq!(envelope.kind(), EnvelopeKind::Request);
        assert_eq!(envelope.id(), Some(&RequestId::from("a")));

        let err = serde_json::from_str::<Envelope>(r#"{"jsonrpc":"1.0","method":"x"}"#);
        assert!(err.is_err());
    }

    #[test]
    fn test_is_initialize() {
        assert!(Envelope::request(1_i64, INITIALIZE_METHOD, None).is_initialize());
        assert!(!Envelope::notification(INITIALIZE_METHOD, None).is_initialize());
    }
}
