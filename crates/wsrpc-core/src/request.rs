//! JSON-RPC 2.0 wire types.
//!
//! Outbound traffic is an [`RpcPayload`] (one request or a batch); inbound
//! traffic is an [`RpcMessage`] built from the loosely-typed
//! [`JsonRpcMessage`] so that responses and server pushes share one shape.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TransportError;

/// JSON-RPC request ID: string, number, or null.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcId {
    Number(u64),
    String(String),
    Null,
}

impl RpcId {
    pub fn number(n: u64) -> Self {
        Self::Number(n)
    }

    /// `Null` ids cannot correlate a response.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl std::fmt::Display for RpcId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
            Self::Null => write!(f, "null"),
        }
    }
}

impl From<u64> for RpcId {
    fn from(n: u64) -> Self {
        Self::Number(n)
    }
}

/// A single JSON-RPC parameter value.
pub type RpcParam = Value;

/// A JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    pub params: Vec<RpcParam>,
    pub id: RpcId,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC 2.0 request.
    pub fn new(id: u64, method: impl Into<String>, params: Vec<RpcParam>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            method: method.into(),
            params,
            id: RpcId::Number(id),
        }
    }
}

/// What a caller hands to the transport: one request or a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcPayload {
    Batch(Vec<JsonRpcRequest>),
    Single(JsonRpcRequest),
}

impl RpcPayload {
    /// The id the response will carry. Batches correlate by their first element.
    pub fn correlation_id(&self) -> Option<&RpcId> {
        let id = match self {
            Self::Single(req) => &req.id,
            Self::Batch(reqs) => &reqs.first()?.id,
        };
        (!id.is_null()).then_some(id)
    }

    /// Method name used in log lines (`"batch"` for batches).
    pub fn method(&self) -> &str {
        match self {
            Self::Single(req) => &req.method,
            Self::Batch(_) => "batch",
        }
    }

    /// Serialise to the text frame written on the socket.
    pub fn to_text(&self) -> Result<String, TransportError> {
        Ok(serde_json::to_string(self)?)
    }
}

impl From<JsonRpcRequest> for RpcPayload {
    fn from(req: JsonRpcRequest) -> Self {
        Self::Single(req)
    }
}

impl From<Vec<JsonRpcRequest>> for RpcPayload {
    fn from(reqs: Vec<JsonRpcRequest>) -> Self {
        Self::Batch(reqs)
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JSON-RPC error {}: {}", self.code, self.message)
    }
}

/// A JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: RpcId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Returns `true` if this is a successful response (has result, no error).
    pub fn is_ok(&self) -> bool {
        self.error.is_none() && self.result.is_some()
    }

    /// Unwrap the result value or return an error.
    pub fn into_result(self) -> Result<Value, JsonRpcError> {
        if let Some(err) = self.error {
            Err(err)
        } else {
            Ok(self.result.unwrap_or(Value::Null))
        }
    }
}

/// Any inbound JSON-RPC object: a response, an error, or a server push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcMessage {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RpcId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

fn default_version() -> String {
    "2.0".into()
}

impl JsonRpcMessage {
    /// Server-initiated messages carry a method instead of a result.
    pub fn is_notification(&self) -> bool {
        self.method.is_some()
    }

    /// The server-issued subscription id of a push notification
    /// (`params.subscription`), if any.
    pub fn subscription_id(&self) -> Option<&str> {
        self.params.as_ref()?.get("subscription")?.as_str()
    }

    /// Convert into a response, treating a missing id as `Null`.
    pub fn into_response(self) -> JsonRpcResponse {
        JsonRpcResponse {
            jsonrpc: self.jsonrpc,
            id: self.id.unwrap_or(RpcId::Null),
            result: self.result,
            error: self.error,
        }
    }
}

/// One frame as delivered to application logic: an object or a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcMessage {
    Batch(Vec<JsonRpcMessage>),
    Single(JsonRpcMessage),
}

impl RpcMessage {
    /// Batches correlate by the id of their first element.
    pub fn correlation_id(&self) -> Option<&RpcId> {
        let id = match self {
            Self::Single(msg) => msg.id.as_ref()?,
            Self::Batch(msgs) => msgs.first()?.id.as_ref()?,
        };
        (!id.is_null()).then_some(id)
    }

    /// Returns `true` if this frame was pushed by the server rather than
    /// answering a request.
    pub fn is_notification(&self) -> bool {
        matches!(self, Self::Single(msg) if msg.is_notification())
    }

    /// Subscription id of a single push notification.
    pub fn subscription_id(&self) -> Option<&str> {
        match self {
            Self::Single(msg) => msg.subscription_id(),
            Self::Batch(_) => None,
        }
    }

    /// Convert a single-object frame into a response.
    pub fn into_response(self) -> Result<JsonRpcResponse, TransportError> {
        match self {
            Self::Single(msg) => Ok(msg.into_response()),
            Self::Batch(_) => Err(TransportError::InvalidRequest(
                "expected a single response, got a batch".into(),
            )),
        }
    }

    /// Convert into a list of responses (a single object yields one).
    pub fn into_responses(self) -> Vec<JsonRpcResponse> {
        match self {
            Self::Single(msg) => vec![msg.into_response()],
            Self::Batch(msgs) => msgs.into_iter().map(JsonRpcMessage::into_response).collect(),
        }
    }
}
