//! Persistence seam
//!
//! The engine never talks to a database directly. Every stateful component
//! (keychain, subscriptions, expirer, history, pairings, sessions, proposals)
//! writes JSON values through [`KeyValueStorage`]. [`MemoryStorage`] is the
//! bundled implementation; hosts plug in their own.

use crate::errors::StorageError;
use async_trait::async_trait;
use serde_json::Value;

mod memory;
mod store;

pub use memory::MemoryStorage;
pub use store::Store;

/// Async key-value storage consumed by the engine
#[async_trait]
pub trait KeyValueStorage: Send + Sync {
    /// Returns `None` when the key was never written or was removed
    async fn get_item(&self, key: &str) -> Result<Option<Value>, StorageError>;

    async fn set_item(&self, key: &str, value: Value) -> Result<(), StorageError>;

    async fn remove_item(&self, key: &str) -> Result<(), StorageError>;

    async fn get_keys(&self) -> Result<Vec<String>, StorageError>;
}

/// Storage key for a named collection, e.g. `walletlink@2:core//keychain`
pub fn storage_key(prefix: &str, context: &str, name: &str) -> String {
    format!("{}:{}//{}", prefix, context, name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_key_layout() {
        assert_eq!(
            storage_key("walletlink@2", "core", "keychain"),
            "walletlink@2:core//keychain"
        );
    }
}
