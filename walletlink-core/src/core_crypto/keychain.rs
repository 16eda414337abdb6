//! Keychain: every private and symmetric key the engine holds
//!
//! Keys are stored by tag. X25519 private keys are tagged with their public
//! key hex, symmetric keys with their topic. The whole map sits behind one
//! async mutex and is persisted before the lock is released.

use super::{random_key, relay_auth, topic_for_key, KEY_LENGTH};
use crate::core_store::KeyValueStorage;
use crate::errors::{CryptoError, EngineError, EngineResult, StorageError};
use ed25519_dalek::SigningKey;
use hkdf::Hkdf;
use sha2::Sha256;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

const CLIENT_SEED_TAG: &str = "client_ed25519_seed";

type Secret = Zeroizing<[u8; KEY_LENGTH]>;

pub struct KeyStore {
    storage: Arc<dyn KeyValueStorage>,
    storage_key: String,
    keys: Mutex<HashMap<String, Secret>>,
}

impl fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyStore")
            .field("storage_key", &self.storage_key)
            .field("keys", &"[REDACTED]")
            .finish()
    }
}

impl KeyStore {
    pub fn new(storage: Arc<dyn KeyValueStorage>, storage_key: String) -> Self {
        Self {
            storage,
            storage_key,
            keys: Mutex::new(HashMap::new()),
        }
    }

    pub async fn restore(&self) -> EngineResult<()> {
        let mut keys = self.keys.lock().await;
        if !keys.is_empty() {
            return Err(EngineError::RestoreWillOverride(format!(
                "keychain already holds {} keys",
                keys.len()
            )));
        }

        let Some(value) = self.storage.get_item(&self.storage_key).await? else {
            return Ok(());
        };
        let persisted: HashMap<String, String> =
            serde_json::from_value(value).map_err(|e| self.corrupt(e.to_string()))?;

        for (tag, encoded) in persisted {
            let bytes = Zeroizing::new(hex::decode(encoded).map_err(|e| self.corrupt(e.to_string()))?);
            let key: [u8; KEY_LENGTH] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| self.corrupt(format!("key {} has wrong length", tag)))?;
            keys.insert(tag, Zeroizing::new(key));
        }

        debug!(count = keys.len(), "keychain restored");
        Ok(())
    }

    /// New X25519 key pair; returns the public key hex
    pub async fn generate_key_pair(&self) -> EngineResult<String> {
        let secret = StaticSecret::from(random_key());
        let public = hex::encode(PublicKey::from(&secret).as_bytes());

        let mut keys = self.keys.lock().await;
        keys.insert(public.clone(), Zeroizing::new(secret.to_bytes()));
        self.persist(&keys).await?;
        Ok(public)
    }

    /// ECDH with the peer, HKDF to a symmetric key, stored under its topic
    pub async fn generate_shared_key(
        &self,
        self_public_key: &str,
        peer_public_key: &str,
        override_topic: Option<&str>,
    ) -> EngineResult<String> {
        let mut keys = self.keys.lock().await;
        let sym_key = derive(&keys, self_public_key, peer_public_key)?;
        let topic = override_topic
            .map(str::to_string)
            .unwrap_or_else(|| topic_for_key(&sym_key));
        keys.insert(topic.clone(), sym_key);
        self.persist(&keys).await?;
        debug!(topic = %topic, "derived shared key");
        Ok(topic)
    }

    /// Shared key for a one-off exchange without storing it
    pub async fn derive_sym_key(
        &self,
        self_public_key: &str,
        peer_public_key: &str,
    ) -> EngineResult<Zeroizing<[u8; KEY_LENGTH]>> {
        let keys = self.keys.lock().await;
        derive(&keys, self_public_key, peer_public_key)
    }

    pub async fn set_sym_key(
        &self,
        sym_key: [u8; KEY_LENGTH],
        override_topic: Option<&str>,
    ) -> EngineResult<String> {
        let topic = override_topic
            .map(str::to_string)
            .unwrap_or_else(|| topic_for_key(&sym_key));

        let mut keys = self.keys.lock().await;
        keys.insert(topic.clone(), Zeroizing::new(sym_key));
        self.persist(&keys).await?;
        Ok(topic)
    }

    pub async fn get_sym_key(&self, topic: &str) -> EngineResult<Zeroizing<[u8; KEY_LENGTH]>> {
        self.keys
            .lock()
            .await
            .get(topic)
            .cloned()
            .ok_or_else(|| EngineError::NoMatchingKey(format!("sym key for topic {}", topic)))
    }

    pub async fn has_keys(&self, tag: &str) -> bool {
        self.keys.lock().await.contains_key(tag)
    }

    pub async fn delete_key_pair(&self, public_key: &str) -> EngineResult<()> {
        self.delete(public_key).await
    }

    pub async fn delete_sym_key(&self, topic: &str) -> EngineResult<()> {
        self.delete(topic).await
    }

    /// Ed25519 identity used to authenticate against the relay
    pub async fn client_signing_key(&self) -> EngineResult<SigningKey> {
        let mut keys = self.keys.lock().await;
        if let Some(seed) = keys.get(CLIENT_SEED_TAG) {
            return Ok(SigningKey::from_bytes(seed));
        }

        let seed = random_key();
        keys.insert(CLIENT_SEED_TAG.to_string(), Zeroizing::new(seed));
        self.persist(&keys).await?;
        Ok(SigningKey::from_bytes(&seed))
    }

    /// `did:key` of the client identity
    pub async fn client_id(&self) -> EngineResult<String> {
        let signing = self.client_signing_key().await?;
        Ok(relay_auth::encode_did_key(&signing.verifying_key()))
    }

    async fn delete(&self, tag: &str) -> EngineResult<()> {
        let mut keys = self.keys.lock().await;
        if keys.remove(tag).is_some() {
            self.persist(&keys).await?;
        }
        Ok(())
    }

    async fn persist(&self, keys: &HashMap<String, Secret>) -> EngineResult<()> {
        let encoded: HashMap<&String, String> =
            keys.iter().map(|(tag, key)| (tag, hex::encode(key.as_slice()))).collect();
        self.storage
            .set_item(&self.storage_key, serde_json::to_value(encoded)?)
            .await?;
        Ok(())
    }

    fn corrupt(&self, reason: String) -> EngineError {
        StorageError::Corrupt {
            key: self.storage_key.clone(),
            reason,
        }
        .into()
    }
}

fn derive(
    keys: &HashMap<String, Secret>,
    self_public_key: &str,
    peer_public_key: &str,
) -> EngineResult<Secret> {
    let private = keys
        .get(self_public_key)
        .ok_or_else(|| EngineError::NoMatchingKey(format!("private key for {}", self_public_key)))?;
    let peer = decode_public_key(peer_public_key)?;

    let secret = StaticSecret::from(**private);
    let shared = secret.diffie_hellman(&peer);

    let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
    let mut okm = Zeroizing::new([0u8; KEY_LENGTH]);
    hk.expand(&[], &mut okm[..])
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    Ok(okm)
}

pub(crate) fn decode_public_key(public_key: &str) -> Result<PublicKey, CryptoError> {
    let bytes = hex::decode(public_key)
        .map_err(|e| CryptoError::InvalidKey(format!("public key is not hex: {}", e)))?;
    let array: [u8; KEY_LENGTH] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("public key must be 32 bytes".to_string()))?;
    Ok(PublicKey::from(array))
}
