//! Key management and envelope encryption
//!
//! ```text
//!   KeyStore  ── X25519 key pairs, symmetric keys by topic, client identity
//!      │
//!   Codec     ── JSON payload <-> base64 envelope (type 0 | 1 | 2)
//!      │
//!   envelope  ── byte layout + ChaCha20-Poly1305
//! ```
//!
//! A topic is always `hex(sha256(sym_key))` unless the caller supplied an
//! explicit override when storing the key.

use sha2::{Digest, Sha256};

mod codec;
pub mod envelope;
mod keychain;
pub mod relay_auth;

pub use codec::{Codec, DecodeOptions, EncodeOptions, Encoding};
pub use envelope::EnvelopeType;
pub use keychain::KeyStore;

pub const KEY_LENGTH: usize = 32;

/// Topic for a symmetric key
pub fn topic_for_key(sym_key: &[u8; KEY_LENGTH]) -> String {
    hex::encode(Sha256::digest(sym_key))
}

/// 32 random bytes from the thread RNG
pub fn random_key() -> [u8; KEY_LENGTH] {
    rand::random()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_is_deterministic_sha256() {
        let key = [7u8; KEY_LENGTH];
        let topic = topic_for_key(&key);
        assert_eq!(topic, topic_for_key(&key));
        assert_eq!(topic.len(), 64);
        assert_ne!(topic, topic_for_key(&[8u8; KEY_LENGTH]));
    }
}
