//! Error taxonomy for the pairing and session engine
//!
//! Subsystem errors (`CryptoError`, `RelayError`, `StorageError`) wrap into
//! [`EngineError`], which is what every public operation returns. Each engine
//! error maps onto a numeric wire code so it can be sent to the peer as a
//! JSON-RPC error, and known peer codes map back onto typed variants.

use crate::core_rpc::ErrorPayload;
use thiserror::Error;

/// Cryptographic failures from the keychain and envelope codec
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Malformed envelope: {0}")]
    InvalidEnvelope(String),

    #[error("Relay auth token error: {0}")]
    Jwt(String),
}

/// Relay socket and relay JSON-RPC failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error("Relay is not connected")]
    Disconnected,

    #[error("Relay connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Relay request {method} timed out")]
    Timeout { method: String },

    #[error("Publish {id} was not acknowledged before its deadline")]
    PublishTimeout { id: u64 },

    #[error("Relay returned error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Relay transport closed")]
    Closed,

    #[error("Malformed relay frame: {0}")]
    InvalidFrame(String),
}

/// Key-value storage failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Stored value for {key} is corrupt: {reason}")]
    Corrupt { key: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("Not initialized: {0}")]
    NotInitialized(String),

    #[error("No matching key: {0}")]
    NoMatchingKey(String),

    #[error("Expired: {0}")]
    Expired(String),

    #[error("Missing or invalid: {0}")]
    MissingOrInvalid(String),

    #[error("Unsupported chains: {0}")]
    UnsupportedChains(String),

    #[error("Unsupported methods: {0}")]
    UnsupportedMethods(String),

    #[error("Unsupported events: {0}")]
    UnsupportedEvents(String),

    #[error("Unsupported accounts: {0}")]
    UnsupportedAccounts(String),

    #[error("Unsupported namespace key: {0}")]
    UnsupportedNamespaceKey(String),

    #[error("User disconnected: {0}")]
    UserDisconnected(String),

    #[error("User rejected: {0}")]
    UserRejected(String),

    #[error("Restore will override: {0}")]
    RestoreWillOverride(String),

    #[error("Invalid update request: {0}")]
    InvalidUpdateRequest(String),

    #[error("Invalid extend request: {0}")]
    InvalidExtendRequest(String),

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    /// Error returned by the peer that has no typed counterpart
    #[error("Peer error {code}: {message}")]
    Peer { code: i64, message: String },

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

pub mod codes {
    pub const INVALID_METHOD: i64 = 1001;
    pub const INVALID_UPDATE_REQUEST: i64 = 1003;
    pub const INVALID_EXTEND_REQUEST: i64 = 1004;
    pub const NO_MATCHING_KEY: i64 = 1100;
    pub const EXPIRED: i64 = 1101;
    pub const MISSING_OR_INVALID: i64 = 1102;
    pub const USER_REJECTED: i64 = 5000;
    pub const UNSUPPORTED_CHAINS: i64 = 5100;
    pub const UNSUPPORTED_METHODS: i64 = 5101;
    pub const UNSUPPORTED_EVENTS: i64 = 5102;
    pub const UNSUPPORTED_ACCOUNTS: i64 = 5103;
    pub const UNSUPPORTED_NAMESPACE_KEY: i64 = 5104;
    pub const USER_DISCONNECTED: i64 = 6000;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL: i64 = -32603;
}

impl EngineError {
    /// Wire code sent to the peer for this error
    pub fn code(&self) -> i64 {
        match self {
            EngineError::NoMatchingKey(_) => codes::NO_MATCHING_KEY,
            EngineError::Expired(_) => codes::EXPIRED,
            EngineError::MissingOrInvalid(_) | EngineError::Serialization(_) => {
                codes::MISSING_OR_INVALID
            }
            EngineError::UnsupportedChains(_) => codes::UNSUPPORTED_CHAINS,
            EngineError::UnsupportedMethods(_) => codes::UNSUPPORTED_METHODS,
            EngineError::UnsupportedEvents(_) => codes::UNSUPPORTED_EVENTS,
            EngineError::UnsupportedAccounts(_) => codes::UNSUPPORTED_ACCOUNTS,
            EngineError::UnsupportedNamespaceKey(_) => codes::UNSUPPORTED_NAMESPACE_KEY,
            EngineError::UserDisconnected(_) => codes::USER_DISCONNECTED,
            EngineError::UserRejected(_) => codes::USER_REJECTED,
            EngineError::InvalidUpdateRequest(_) => codes::INVALID_UPDATE_REQUEST,
            EngineError::InvalidExtendRequest(_) => codes::INVALID_EXTEND_REQUEST,
            EngineError::MethodNotFound(_) => codes::METHOD_NOT_FOUND,
            EngineError::Peer { code, .. } => *code,
            EngineError::NotInitialized(_)
            | EngineError::RestoreWillOverride(_)
            | EngineError::Crypto(_)
            | EngineError::Relay(_)
            | EngineError::Storage(_)
            | EngineError::Internal(_) => codes::INTERNAL,
        }
    }

    /// JSON-RPC error object for this error
    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload::new(self.code(), self.to_string())
    }

    /// Map an error received from the peer back onto a typed variant
    pub fn from_payload(payload: &ErrorPayload) -> Self {
        let message = payload.message.clone();
        match payload.code {
            codes::USER_REJECTED => EngineError::UserRejected(message),
            codes::USER_DISCONNECTED => EngineError::UserDisconnected(message),
            codes::UNSUPPORTED_CHAINS => EngineError::UnsupportedChains(message),
            codes::UNSUPPORTED_METHODS => EngineError::UnsupportedMethods(message),
            codes::UNSUPPORTED_EVENTS => EngineError::UnsupportedEvents(message),
            codes::UNSUPPORTED_ACCOUNTS => EngineError::UnsupportedAccounts(message),
            codes::UNSUPPORTED_NAMESPACE_KEY => EngineError::UnsupportedNamespaceKey(message),
            codes::INVALID_UPDATE_REQUEST => EngineError::InvalidUpdateRequest(message),
            codes::INVALID_EXTEND_REQUEST => EngineError::InvalidExtendRequest(message),
            codes::NO_MATCHING_KEY => EngineError::NoMatchingKey(message),
            codes::EXPIRED => EngineError::Expired(message),
            codes::MISSING_OR_INVALID => EngineError::MissingOrInvalid(message),
            codes::METHOD_NOT_FOUND => EngineError::MethodNotFound(message),
            code => EngineError::Peer { code, message },
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}
