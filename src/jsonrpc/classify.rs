//! Shape rules for turning raw JSON into envelopes.

use serde_json::{Map, Value};

use super::{
    Envelope, ErrorObject, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    JsonRpcVersion2_0, RequestId, ResponsePayload,
};

/// Why a message could not be classified as any of the four envelope shapes.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MalformedEnvelope {
    #[error("invalid JSON: {0}")]
    Json(String),
    #[error("empty batch")]
    EmptyBatch,
    #[error("message is not a JSON object")]
    NotAnObject,
    #[error("missing or unsupported jsonrpc version marker")]
    Version,
    #[error("id must be a string or an integer")]
    InvalidId,
    #[error("method must be a string")]
    InvalidMethod,
    #[error("error must be an object with an integer code and a string message")]
    InvalidErrorObject,
    #[error("message does not match request, notification or response shape")]
    Shape,
    #[error("invalid message at index {index}: {source}")]
    AtIndex {
        index: usize,
        #[source]
        source: Box<MalformedEnvelope>,
    },
}

impl MalformedEnvelope {
    /// True when the body was not valid JSON at all, as opposed to valid JSON
    /// of the wrong shape.
    pub fn is_parse_error(&self) -> bool {
        match self {
            MalformedEnvelope::Json(_) => true,
            MalformedEnvelope::AtIndex { source, .. } => source.is_parse_error(),
            _ => false,
        }
    }
}

/// Classify one JSON value as a request, notification, or response.
///
/// Exactly one of `method`, `result`, `error` must be present. Requests need a
/// non-null id, notifications must not carry an `id` key, responses carry an id
/// that may be `null`.
pub fn classify(value: Value) -> Result<Envelope, MalformedEnvelope> {
    let Value::Object(mut obj) = value else {
        return Err(MalformedEnvelope::NotAnObject);
    };

    match obj.get("jsonrpc") {
        Some(Value::String(v)) if v == JsonRpcVersion2_0::VALUE => {}
        _ => return Err(MalformedEnvelope::Version),
    }

    let has_method = obj.contains_key("method");
    let has_result = obj.contains_key("result");
    let has_error = obj.contains_key("error");
    let has_id = obj.contains_key("id");

    match (has_method, has_result, has_error) {
        (true, false, false) => {
            let method = match obj.remove("method") {
                Some(Value::String(m)) => m,
                _ => return Err(MalformedEnvelope::InvalidMethod),
            };
            let params = obj.remove("params");
            if has_id {
                let id = request_id(obj.remove("id"))?.ok_or(MalformedEnvelope::InvalidId)?;
                Ok(Envelope::Request(JsonRpcRequest {
                    jsonrpc: JsonRpcVersion2_0,
                    id,
                    method,
                    params,
                }))
            } else {
                Ok(Envelope::Notification(JsonRpcNotification {
                    jsonrpc: JsonRpcVersion2_0,
                    method,
                    params,
                }))
            }
        }
        (false, true, false) if has_id => {
            let id = request_id(obj.remove("id"))?;
            let result = obj.remove("result").unwrap_or(Value::Null);
            Ok(response(id, ResponsePayload::Result(result)))
        }
        (false, false, true) if has_id => {
            let id = request_id(obj.remove("id"))?;
            let error = error_object(&mut obj)?;
            Ok(response(id, ResponsePayload::Error(error)))
        }
        _ => Err(MalformedEnvelope::Shape),
    }
}

/// Parse a POST body holding one envelope or a non-empty array of envelopes.
pub fn parse_body(body: &[u8]) -> Result<Vec<Envelope>, MalformedEnvelope> {
    let value: Value =
        serde_json::from_slice(body).map_err(|e| MalformedEnvelope::Json(e.to_string()))?;

    match value {
        Value::Array(items) => {
            if items.is_empty() {
                return Err(MalformedEnvelope::EmptyBatch);
            }
            items
                .into_iter()
                .enumerate()
                .map(|(index, item)| {
                    classify(item).map_err(|source| MalformedEnvelope::AtIndex {
                        index,
                        source: Box::new(source),
                    })
                })
                .collect()
        }
        other => classify(other).map(|envelope| vec![envelope]),
    }
}

fn response(id: Option<RequestId>, payload: ResponsePayload) -> Envelope {
    Envelope::Response(JsonRpcResponse {
        jsonrpc: JsonRpcVersion2_0,
        id,
        payload,
    })
}

/// `Ok(None)` means an explicit `null` id.
fn request_id(value: Option<Value>) -> Result<Option<RequestId>, MalformedEnvelope> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(RequestId::String(s))),
        Some(Value::Number(n)) => n
            .as_i64()
            .map(|n| Some(RequestId::Number(n)))
            .ok_or(MalformedEnvelope::InvalidId),
        Some(_) => Err(MalformedEnvelope::InvalidId),
    }
}

fn error_object(obj: &mut Map<String, Value>) -> Result<ErrorObject, MalformedEnvelope> {
    let Some(Value::Object(mut error)) = obj.remove("error") else {
        return Err(MalformedEnvelope::InvalidErrorObject);
    };
    let code = error
        .get("code")
        .and_then(Value::as_i64)
        .ok_or(MalformedEnvelope::InvalidErrorObject)?;
    let message = match error.remove("message") {
        Some(Value::String(m)) => m,
        _ => return Err(MalformedEnvelope::InvalidErrorObject),
    };
    Ok(ErrorObject {
        code,
        message,
        data: error.remove("data"),
    })
}
