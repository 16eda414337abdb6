//! Hooks the host application plugs in

use super::types::{AuthArtifact, AuthRequest};
use crate::errors::EngineResult;
use async_trait::async_trait;

/// Produces authentication artifacts for a proposal that asks for them.
/// The engine forwards the artifacts untouched in `session_settle`.
#[async_trait]
pub trait AuthSigner: Send + Sync {
    async fn sign(&self, request: &AuthRequest) -> EngineResult<Vec<AuthArtifact>>;
}

/// Opens a deep link that carries an envelope straight to the peer app
#[async_trait]
pub trait LinkModeDelivery: Send + Sync {
    async fn deliver(&self, url: &str) -> EngineResult<()>;
}
