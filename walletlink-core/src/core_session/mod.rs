//! Sessions: the authorized channel between a dapp and a wallet
//!
//! Per proposal: proposed → approved | rejected | expired
//! Per session:  settled → (updated | extended)* → deleted | expired

pub mod caip;
mod engine;
mod external;
mod inbound;
pub mod namespaces;
pub mod types;

#[cfg(test)]
mod tests;

pub use engine::{
    ApproveParams, Approved, ConnectParams, ConnectResponse, OutboundRequest, SessionEngine,
};
pub use external::{AuthSigner, LinkModeDelivery};
pub use types::{
    AuthArtifact, AuthRequest, Metadata, Namespace, Namespaces, Participant, PendingRequest,
    ProposalNamespace, ProposalNamespaces, Redirect, RelayProtocol, Session, SessionProperties,
    SessionProposal,
};
