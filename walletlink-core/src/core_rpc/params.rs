//! Typed params for every session and pairing method
//!
//! Inbound requests are parsed into [`RequestParams`] at the dispatch point.
//! A method name we do not know, or params that do not match the method's
//! shape, fail the parse and the request is answered with an error.

use super::{JsonRpcRequest, RpcMethod};
use crate::core_session::types::{
    AuthArtifact, AuthRequest, Namespaces, Participant, ProposalNamespaces, RelayProtocol,
    SessionProperties,
};
use crate::errors::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionProposeParams {
    pub relays: Vec<RelayProtocol>,
    pub proposer: Participant,
    pub required_namespaces: ProposalNamespaces,
    #[serde(default)]
    pub optional_namespaces: ProposalNamespaces,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_properties: Option<SessionProperties>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry_timestamp: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_authentication: Option<AuthRequest>,
}

/// Result of a successful `session_propose`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionProposeResponse {
    pub relay: RelayProtocol,
    pub responder_public_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSettleParams {
    pub relay: RelayProtocol,
    pub controller: Participant,
    pub namespaces: Namespaces,
    #[serde(default)]
    pub required_namespaces: ProposalNamespaces,
    #[serde(default)]
    pub optional_namespaces: ProposalNamespaces,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_properties: Option<SessionProperties>,
    pub expiry: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pairing_topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication: Option<Vec<AuthArtifact>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionUpdateParams {
    pub namespaces: Namespaces,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionExtendParams {
    pub expiry: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestPayload {
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry_timestamp: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRequestParams {
    pub request: RequestPayload,
    pub chain_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    pub name: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEventParams {
    pub event: EventPayload,
    pub chain_id: String,
}

/// Reason carried by `session_delete` and `pairing_delete`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteParams {
    pub code: i64,
    pub message: String,
}

impl DeleteParams {
    pub fn user_disconnected() -> Self {
        Self {
            code: crate::errors::codes::USER_DISCONNECTED,
            message: "User disconnected.".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PingParams {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum RequestParams {
    SessionPropose(SessionProposeParams),
    SessionSettle(SessionSettleParams),
    SessionUpdate(SessionUpdateParams),
    SessionExtend(SessionExtendParams),
    SessionRequest(SessionRequestParams),
    SessionEvent(SessionEventParams),
    SessionDelete(DeleteParams),
    SessionPing(PingParams),
    PairingDelete(DeleteParams),
    PairingPing(PingParams),
}

impl RequestParams {
    pub fn method(&self) -> RpcMethod {
        match self {
            RequestParams::SessionPropose(_) => RpcMethod::SessionPropose,
            RequestParams::SessionSettle(_) => RpcMethod::SessionSettle,
            RequestParams::SessionUpdate(_) => RpcMethod::SessionUpdate,
            RequestParams::SessionExtend(_) => RpcMethod::SessionExtend,
            RequestParams::SessionRequest(_) => RpcMethod::SessionRequest,
            RequestParams::SessionEvent(_) => RpcMethod::SessionEvent,
            RequestParams::SessionDelete(_) => RpcMethod::SessionDelete,
            RequestParams::SessionPing(_) => RpcMethod::SessionPing,
            RequestParams::PairingDelete(_) => RpcMethod::PairingDelete,
            RequestParams::PairingPing(_) => RpcMethod::PairingPing,
        }
    }

    /// Chain targeted by a request or event, recorded in history
    pub fn chain_id(&self) -> Option<&str> {
        match self {
            RequestParams::SessionRequest(p) => Some(&p.chain_id),
            RequestParams::SessionEvent(p) => Some(&p.chain_id),
            _ => None,
        }
    }

    pub fn into_request(self, id: u64) -> EngineResult<JsonRpcRequest> {
        let mut tagged = serde_json::to_value(self)?;
        let params = tagged
            .get_mut("params")
            .map(Value::take)
            .unwrap_or_else(|| json!({}));
        let method = tagged
            .get("method")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::Internal("tagged params lost method".to_string()))?
            .to_string();
        Ok(JsonRpcRequest::new(id, method, params))
    }

    /// Parse an inbound request; unknown methods yield `MethodNotFound`
    pub fn from_request(request: &JsonRpcRequest) -> EngineResult<Self> {
        request.method.parse::<RpcMethod>()?;
        serde_json::from_value(json!({
            "method": request.method,
            "params": request.params,
        }))
        .map_err(|e| {
            EngineError::MissingOrInvalid(format!("{} params: {}", request.method, e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_roundtrip() {
        let req = RequestParams::SessionPing(PingParams {}).into_request(7).unwrap();
        assert_eq!(req.method, "session_ping");
        assert_eq!(req.params, json!({}));
        assert_eq!(
            RequestParams::from_request(&req).unwrap(),
            RequestParams::SessionPing(PingParams {})
        );
    }

    #[test]
    fn test_request_params_wire_shape() {
        let params = RequestParams::SessionRequest(SessionRequestParams {
            request: RequestPayload {
                method: "eth_sign".into(),
                params: json!(["0xabc", "0xdead"]),
                expiry_timestamp: None,
            },
            chain_id: "eip155:1".into(),
        });
        assert_eq!(params.chain_id(), Some("eip155:1"));

        let req = params.into_request(42).unwrap();
        assert_eq!(
            req.params,
            json!({"request": {"method": "eth_sign", "params": ["0xabc", "0xdead"]}, "chainId": "eip155:1"})
        );
    }

    #[test]
    fn test_fail_closed() {
        let unknown = JsonRpcRequest::new(1, "wc_unknown", json!({}));
        assert!(matches!(
            RequestParams::from_request(&unknown),
            Err(EngineError::MethodNotFound(_))
        ));

        let malformed = JsonRpcRequest::new(2, "session_extend", json!({"expiry": "soon"}));
        assert!(matches!(
            RequestParams::from_request(&malformed),
            Err(EngineError::MissingOrInvalid(_))
        ));

        let missing = JsonRpcRequest::new(3, "session_update", json!({}));
        assert!(RequestParams::from_request(&missing).is_err());
    }

    #[test]
    fn test_delete_reason() {
        let req = RequestParams::SessionDelete(DeleteParams::user_disconnected())
            .into_request(9)
            .unwrap();
        assert_eq!(req.params["code"], 6000);
    }
}
