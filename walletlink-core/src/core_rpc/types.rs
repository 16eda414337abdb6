//! JSON-RPC 2.0 payloads

use crate::errors::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

/// Time-ordered id: milliseconds since the epoch with three random digits
///
/// Ids from one party grow with wall-clock time, which the update/extend
/// ordering guard relies on.
pub fn payload_id() -> u64 {
    crate::time::now_millis() * 1000 + rand::random_range(0..1000u64)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub id: u64,
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            id,
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorPayload {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResult {
    pub id: u64,
    pub jsonrpc: String,
    pub result: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub id: u64,
    pub jsonrpc: String,
    pub error: ErrorPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcResponse {
    Error(JsonRpcError),
    Result(JsonRpcResult),
}

impl JsonRpcResponse {
    pub fn result(id: u64, result: Value) -> Self {
        JsonRpcResponse::Result(JsonRpcResult {
            id,
            jsonrpc: JSONRPC_VERSION.to_string(),
            result,
        })
    }

    pub fn error(id: u64, error: ErrorPayload) -> Self {
        JsonRpcResponse::Error(JsonRpcError {
            id,
            jsonrpc: JSONRPC_VERSION.to_string(),
            error,
        })
    }

    pub fn id(&self) -> u64 {
        match self {
            JsonRpcResponse::Error(e) => e.id,
            JsonRpcResponse::Result(r) => r.id,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, JsonRpcResponse::Error(_))
    }

    /// Result value, or the peer's error mapped onto [`EngineError`]
    pub fn outcome(&self) -> EngineResult<Value> {
        match self {
            JsonRpcResponse::Result(r) => Ok(r.result.clone()),
            JsonRpcResponse::Error(e) => Err(EngineError::from_payload(&e.error)),
        }
    }
}

/// Anything that can arrive inside a decrypted envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcPayload {
    Request(JsonRpcRequest),
    Response(JsonRpcResponse),
}
