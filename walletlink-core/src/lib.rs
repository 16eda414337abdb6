//! walletlink: pairing and session engine for wallet connections over an
//! untrusted relay.
//!
//! A dapp and a wallet share a symmetric key out of band (the pairing URI),
//! negotiate a session over it, then exchange JSON-RPC requests and events
//! through end-to-end encrypted envelopes. [`Client`] is the entry point.

pub mod client;
pub mod config;
pub mod context;
pub mod core_crypto;
pub mod core_expirer;
pub mod core_pairing;
pub mod core_relay;
pub mod core_rpc;
pub mod core_session;
pub mod core_store;
pub mod errors;
pub mod events;
pub mod logging;
pub mod shutdown;
pub mod test_utils;
pub mod time;

pub use client::{Client, ClientOptions};
pub use config::Config;
pub use errors::{EngineError, EngineResult};
pub use events::ClientEvent;
pub use logging::{init_logging, LogLevel};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_exports() {
        let _ = LogLevel::Info;
        let _ = Config::default();
        assert!(matches!(
            EngineError::NotInitialized("x".into()),
            EngineError::NotInitialized(_)
        ));
    }
}
