//! JSON-RPC 2.0 envelope types. The concrete tool schemas are an external
//! collaborator; this module only carries the protocol-level shape the
//! session and dispatch layers need to route and error on.
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
/// Reused, per spec, for both "server busy" (capacity) and "bad request"
/// (missing initialize) conditions.
pub const SERVER_BUSY_OR_BAD_REQUEST: i64 = -32000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn parse_error() -> Self {
        Self::new(PARSE_ERROR, "Parse error")
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(INVALID_REQUEST, message.into())
    }

    pub fn server_busy(message: impl Into<String>) -> Self {
        Self::new(SERVER_BUSY_OR_BAD_REQUEST, message.into())
    }
}

/// An id is either present (request) or absent (notification); JSON-RPC ids
/// are strings, numbers, or null — never booleans/objects/arrays.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: JsonRpcVersion,
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: JsonRpcVersion,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: JsonRpcVersion,
    pub id: RequestId,
    pub result: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcErrorResponse {
    pub jsonrpc: JsonRpcVersion,
    pub id: Option<RequestId>,
    pub error: JsonRpcError,
}

/// The literal `"2.0"` — a marker type so the field can't silently hold any
/// other string once deserialised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JsonRpcVersion;

impl Serialize for JsonRpcVersion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str("2.0")
    }
}

impl<'de> Deserialize<'de> for JsonRpcVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        if s == "2.0" {
            Ok(JsonRpcVersion)
        } else {
            Err(serde::de::Error::custom(format!("unsupported jsonrpc version {s}")))
        }
    }
}

/// A decoded inbound message. A JSON array at the top level is rejected
/// before reaching this type — batches are not supported.
#[derive(Debug, Clone)]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
    Response(JsonRpcResponse),
    Error(JsonRpcErrorResponse),
}

impl JsonRpcMessage {
    /// Parses a single JSON-RPC object, rejecting arrays (batches) outright.
    pub fn parse(raw: &Value) -> Result<Self, JsonRpcError> {
        if raw.is_array() {
            return Err(JsonRpcError::invalid_request("batch requests are not supported"));
        }
        let obj = raw.as_object().ok_or_else(|| JsonRpcError::invalid_request("request must be a JSON object"))?;
        if obj.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
            return Err(JsonRpcError::invalid_request("missing or invalid jsonrpc version"));
        }
        if obj.contains_key("method") {
            if obj.contains_key("id") {
                let req: JsonRpcRequest = serde_json::from_value(raw.clone())
                    .map_err(|e| JsonRpcError::invalid_request(e.to_string()))?;
                Ok(JsonRpcMessage::Request(req))
            } else {
                let note: JsonRpcNotification = serde_json::from_value(raw.clone())
                    .map_err(|e| JsonRpcError::invalid_request(e.to_string()))?;
                Ok(JsonRpcMessage::Notification(note))
            }
        } else if obj.contains_key("error") {
            let err: JsonRpcErrorResponse = serde_json::from_value(raw.clone())
                .map_err(|e| JsonRpcError::invalid_request(e.to_string()))?;
            Ok(JsonRpcMessage::Error(err))
        } else if obj.contains_key("result") {
            let resp: JsonRpcResponse = serde_json::from_value(raw.clone())
                .map_err(|e| JsonRpcError::invalid_request(e.to_string()))?;
            Ok(JsonRpcMessage::Response(resp))
        } else {
            Err(JsonRpcError::invalid_request("message is neither a request, notification, response, nor error"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn batches_are_rejected() {
        let raw = json!([{"jsonrpc":"2.0","id":1,"method":"initialize"}]);
        assert!(JsonRpcMessage::parse(&raw).is_err());
    }

    #[test]
    fn request_without_id_is_a_notification() {
        let raw = json!({"jsonrpc":"2.0","method":"notifications/initialized"});
        matches!(JsonRpcMessage::parse(&raw).unwrap(), JsonRpcMessage::Notification(_));
    }
}
