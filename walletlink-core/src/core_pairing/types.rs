use crate::core_session::{Metadata, RelayProtocol};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pairing {
    pub topic: String,
    pub relay: RelayProtocol,
    pub expiry: u64,
    pub active: bool,
    /// Methods the creator said it will send over this pairing
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_metadata: Option<Metadata>,
}
