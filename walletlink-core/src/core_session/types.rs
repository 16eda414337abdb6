//! Session, proposal and participant records

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::config::DEFAULT_RELAY_PROTOCOL;

pub type ProposalNamespaces = BTreeMap<String, ProposalNamespace>;
pub type Namespaces = BTreeMap<String, Namespace>;
pub type SessionProperties = BTreeMap<String, String>;

/// Opaque artifact produced by an external signer (message + signature)
pub type AuthArtifact = Value;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Redirect {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub native: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub universal: Option<String>,
    #[serde(default)]
    pub link_mode: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub name: String,
    pub description: String,
    pub url: String,
    #[serde(default)]
    pub icons: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect: Option<Redirect>,
}

impl Metadata {
    /// Universal link when this party accepts link-mode delivery
    pub fn link_mode_target(&self) -> Option<&str> {
        self.redirect
            .as_ref()
            .filter(|r| r.link_mode)
            .and_then(|r| r.universal.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayProtocol {
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl Default for RelayProtocol {
    fn default() -> Self {
        Self {
            protocol: DEFAULT_RELAY_PROTOCOL.to_string(),
            data: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub public_key: String,
    pub metadata: Metadata,
}

/// Namespace as requested in a proposal
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposalNamespace {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chains: Option<Vec<String>>,
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub events: Vec<String>,
}

/// Namespace as approved by the wallet
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Namespace {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chains: Option<Vec<String>>,
    #[serde(default)]
    pub accounts: Vec<String>,
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub events: Vec<String>,
}

/// What the dapp asks an external signer to authenticate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRequest {
    pub chains: Vec<String>,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionProposal {
    pub id: u64,
    pub pairing_topic: String,
    pub proposer: Participant,
    pub required_namespaces: ProposalNamespaces,
    #[serde(default)]
    pub optional_namespaces: ProposalNamespaces,
    pub relays: Vec<RelayProtocol>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_properties: Option<SessionProperties>,
    pub expiry_timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_authentication: Option<AuthRequest>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub topic: String,
    pub pairing_topic: String,
    pub relay: RelayProtocol,
    pub expiry: u64,
    /// True once both sides agree the session is settled
    pub acknowledged: bool,
    /// Public key of the party allowed to update and extend
    pub controller: String,
    pub self_participant: Participant,
    pub peer: Participant,
    pub namespaces: Namespaces,
    #[serde(default)]
    pub required_namespaces: ProposalNamespaces,
    #[serde(default)]
    pub optional_namespaces: ProposalNamespaces,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_properties: Option<SessionProperties>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication: Option<Vec<AuthArtifact>>,
}

impl Session {
    pub fn is_controller(&self) -> bool {
        self.self_participant.public_key == self.controller
    }

    /// Universal link to reach the peer when both sides opted into link mode
    pub fn link_mode_target(&self) -> Option<&str> {
        self.self_participant.metadata.link_mode_target()?;
        self.peer.metadata.link_mode_target()
    }
}

/// An inbound `session_request` waiting for the wallet's answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingRequest {
    pub id: u64,
    pub topic: String,
    pub chain_id: String,
    pub method: String,
    pub params: Value,
    pub expiry_timestamp: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_namespace_wire_shape() {
        let ns = ProposalNamespace {
            chains: Some(vec!["eip155:1".into()]),
            methods: vec!["eth_sign".into()],
            events: vec![],
        };
        assert_eq!(
            serde_json::to_value(&ns).unwrap(),
            json!({"chains": ["eip155:1"], "methods": ["eth_sign"], "events": []})
        );

        let parsed: Namespace =
            serde_json::from_value(json!({"accounts": ["eip155:1:0xabc"], "methods": []})).unwrap();
        assert_eq!(parsed.chains, None);
        assert!(parsed.events.is_empty());
    }

    #[test]
    fn test_link_mode_requires_both_sides() {
        let linked = Metadata {
            redirect: Some(Redirect {
                native: None,
                universal: Some("https://wallet.example/wc".into()),
                link_mode: true,
            }),
            ..Default::default()
        };
        assert_eq!(linked.link_mode_target(), Some("https://wallet.example/wc"));

        let mut session = Session {
            topic: "t".into(),
            pairing_topic: "p".into(),
            relay: RelayProtocol::default(),
            expiry: 0,
            acknowledged: true,
            controller: "peer".into(),
            self_participant: Participant {
                public_key: "self".into(),
                metadata: Metadata::default(),
            },
            peer: Participant {
                public_key: "peer".into(),
                metadata: linked.clone(),
            },
            namespaces: Namespaces::new(),
            required_namespaces: ProposalNamespaces::new(),
            optional_namespaces: ProposalNamespaces::new(),
            session_properties: None,
            authentication: None,
        };
        assert!(!session.is_controller());
        assert_eq!(session.link_mode_target(), None);

        session.self_participant.metadata = linked;
        assert_eq!(session.link_mode_target(), Some("https://wallet.example/wc"));
    }
}
