//! JSON-RPC layer shared by the pairing and session engines
//!
//! - `types`: wire payloads (request, result, error) and payload ids
//! - `methods`: the method table with publish TTL/tag/prompt per direction
//! - `params`: typed params per method, parsed fail-closed
//! - `history`: every request sent or received, keyed by id
//! - `waiters`: callers awaiting a response, each with its own deadline

mod history;
mod methods;
pub mod params;
mod types;
mod waiters;

pub use history::{JsonRpcHistory, JsonRpcRecord, RecordRequest};
pub use methods::{MethodOptions, RpcMethod};
pub use params::RequestParams;
pub use types::{
    payload_id, ErrorPayload, JsonRpcError, JsonRpcPayload, JsonRpcRequest, JsonRpcResponse,
    JsonRpcResult, JSONRPC_VERSION,
};
pub use waiters::ResponseWaiters;
