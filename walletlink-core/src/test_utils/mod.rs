//! Test support: an in-process relay plus fixtures and async helpers
//!
//! Public so integration tests and the CLI's loopback demo can run a full
//! dapp/wallet handshake without a network.

pub mod async_helpers;
pub mod fixtures;
pub mod memory_relay;

pub use async_helpers::*;
pub use fixtures::*;
pub use memory_relay::{MemoryConnector, MemoryRelay};
