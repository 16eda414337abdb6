//! Events surfaced to the host application

use crate::core_pairing::Pairing;
use crate::core_rpc::params::EventPayload;
use crate::core_session::{Namespaces, PendingRequest, Session, SessionProposal};

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// A dapp proposed a session on one of our pairings
    SessionProposal { proposal: Box<SessionProposal> },
    /// The wallet settled a session we proposed
    SessionConnect { session: Box<Session> },
    SessionUpdate { topic: String, id: u64, namespaces: Namespaces },
    SessionExtend { topic: String, id: u64, expiry: u64 },
    SessionPing { topic: String, id: u64 },
    /// The peer deleted the session
    SessionDelete { topic: String, id: u64 },
    SessionExpire { topic: String },
    SessionRequest { request: PendingRequest },
    SessionRequestExpire { id: u64 },
    SessionEvent { topic: String, id: u64, chain_id: String, event: EventPayload },
    ProposalExpire { id: u64 },
    PairingCreated { pairing: Pairing },
    PairingPing { topic: String, id: u64 },
    PairingDelete { topic: String, id: u64 },
    PairingExpire { topic: String },
    RelayConnected,
    RelayDisconnected,
}

impl ClientEvent {
    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::SessionProposal { .. } => "session_proposal",
            ClientEvent::SessionConnect { .. } => "session_connect",
            ClientEvent::SessionUpdate { .. } => "session_update",
            ClientEvent::SessionExtend { .. } => "session_extend",
            ClientEvent::SessionPing { .. } => "session_ping",
            ClientEvent::SessionDelete { .. } => "session_delete",
            ClientEvent::SessionExpire { .. } => "session_expire",
            ClientEvent::SessionRequest { .. } => "session_request",
            ClientEvent::SessionRequestExpire { .. } => "session_request_expire",
            ClientEvent::SessionEvent { .. } => "session_event",
            ClientEvent::ProposalExpire { .. } => "proposal_expire",
            ClientEvent::PairingCreated { .. } => "pairing_created",
            ClientEvent::PairingPing { .. } => "pairing_ping",
            ClientEvent::PairingDelete { .. } => "pairing_delete",
            ClientEvent::PairingExpire { .. } => "pairing_expire",
            ClientEvent::RelayConnected => "relay_connected",
            ClientEvent::RelayDisconnected => "relay_disconnected",
        }
    }
}
