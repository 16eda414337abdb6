//! Wire envelope layout
//!
//! ```text
//! type 0: [0x00 | utf8 payload]
//! type 1: [0x01 | sender public key (32) | iv (12) | ciphertext]
//! type 2: [0x02 | iv (12) | ciphertext]
//! ```

use super::KEY_LENGTH;
use crate::errors::CryptoError;
use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    ChaCha20Poly1305, Key, Nonce,
};

pub const IV_LENGTH: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnvelopeType {
    /// Plain JSON, used only for out-of-band control payloads
    Type0,
    /// Encrypted to a receiver key, sender public key embedded
    Type1,
    /// Encrypted under the topic's symmetric key
    #[default]
    Type2,
}

impl EnvelopeType {
    pub fn as_byte(self) -> u8 {
        match self {
            EnvelopeType::Type0 => 0,
            EnvelopeType::Type1 => 1,
            EnvelopeType::Type2 => 2,
        }
    }

    pub fn from_byte(byte: u8) -> Result<Self, CryptoError> {
        match byte {
            0 => Ok(EnvelopeType::Type0),
            1 => Ok(EnvelopeType::Type1),
            2 => Ok(EnvelopeType::Type2),
            other => Err(CryptoError::InvalidEnvelope(format!(
                "unknown envelope type {}",
                other
            ))),
        }
    }
}

/// Parsed envelope; `sealed` is plaintext for type 0 and ciphertext otherwise
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub envelope_type: EnvelopeType,
    pub sender_public_key: Option<[u8; KEY_LENGTH]>,
    pub iv: Option<[u8; IV_LENGTH]>,
    pub sealed: Vec<u8>,
}

impl Envelope {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + KEY_LENGTH + IV_LENGTH + self.sealed.len());
        out.push(self.envelope_type.as_byte());
        if let Some(sender) = &self.sender_public_key {
            out.extend_from_slice(sender);
        }
        if let Some(iv) = &self.iv {
            out.extend_from_slice(iv);
        }
        out.extend_from_slice(&self.sealed);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let (&type_byte, rest) = bytes
            .split_first()
            .ok_or_else(|| CryptoError::InvalidEnvelope("empty envelope".to_string()))?;
        let envelope_type = EnvelopeType::from_byte(type_byte)?;

        match envelope_type {
            EnvelopeType::Type0 => Ok(Self {
                envelope_type,
                sender_public_key: None,
                iv: None,
                sealed: rest.to_vec(),
            }),
            EnvelopeType::Type1 => {
                if rest.len() < KEY_LENGTH + IV_LENGTH {
                    return Err(CryptoError::InvalidEnvelope(
                        "type 1 envelope too short".to_string(),
                    ));
                }
                let (sender, rest) = rest.split_at(KEY_LENGTH);
                let (iv, sealed) = rest.split_at(IV_LENGTH);
                Ok(Self {
                    envelope_type,
                    sender_public_key: Some(to_array(sender)?),
                    iv: Some(to_array(iv)?),
                    sealed: sealed.to_vec(),
                })
            }
            EnvelopeType::Type2 => {
                if rest.len() < IV_LENGTH {
                    return Err(CryptoError::InvalidEnvelope(
                        "type 2 envelope too short".to_string(),
                    ));
                }
                let (iv, sealed) = rest.split_at(IV_LENGTH);
                Ok(Self {
                    envelope_type,
                    sender_public_key: None,
                    iv: Some(to_array(iv)?),
                    sealed: sealed.to_vec(),
                })
            }
        }
    }
}

fn to_array<const N: usize>(slice: &[u8]) -> Result<[u8; N], CryptoError> {
    slice
        .try_into()
        .map_err(|_| CryptoError::InvalidEnvelope(format!("expected {} bytes", N)))
}

/// Encrypt with a fresh random nonce
pub fn seal(key: &[u8; KEY_LENGTH], plaintext: &[u8]) -> Result<([u8; IV_LENGTH], Vec<u8>), CryptoError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;

    let mut iv = [0u8; IV_LENGTH];
    iv.copy_from_slice(nonce.as_slice());
    Ok((iv, ciphertext))
}

/// Decrypt; fails on tag mismatch
pub fn open(key: &[u8; KEY_LENGTH], iv: &[u8; IV_LENGTH], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(iv), ciphertext)
        .map_err(|_| CryptoError::Decryption("authentication tag mismatch".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open() {
        let key = [3u8; KEY_LENGTH];
        let (iv, ct) = seal(&key, b"hello").unwrap();
        assert_eq!(open(&key, &iv, &ct).unwrap(), b"hello");
    }

    #[test]
    fn test_wrong_key_fails_closed() {
        let (iv, ct) = seal(&[1u8; KEY_LENGTH], b"secret").unwrap();
        assert!(matches!(
            open(&[2u8; KEY_LENGTH], &iv, &ct),
            Err(CryptoError::Decryption(_))
        ));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = [9u8; KEY_LENGTH];
        let (iv, mut ct) = seal(&key, b"payload").unwrap();
        ct[0] ^= 0xff;
        assert!(open(&key, &iv, &ct).is_err());
    }

    #[test]
    fn test_nonces_are_unique() {
        let key = [4u8; KEY_LENGTH];
        let (iv1, _) = seal(&key, b"x").unwrap();
        let (iv2, _) = seal(&key, b"x").unwrap();
        assert_ne!(iv1, iv2);
    }

    #[test]
    fn test_type1_layout() {
        let env = Envelope {
            envelope_type: EnvelopeType::Type1,
            sender_public_key: Some([5u8; KEY_LENGTH]),
            iv: Some([6u8; IV_LENGTH]),
            sealed: vec![7, 8, 9],
        };
        let bytes = env.to_bytes();
        assert_eq!(bytes[0], 1);
        assert_eq!(&bytes[1..33], &[5u8; 32]);
        assert_eq!(&bytes[33..45], &[6u8; 12]);
        assert_eq!(Envelope::from_bytes(&bytes).unwrap(), env);
    }

    #[test]
    fn test_rejects_truncated_and_unknown() {
        assert!(Envelope::from_bytes(&[]).is_err());
        assert!(Envelope::from_bytes(&[2, 0, 0]).is_err());
        assert!(Envelope::from_bytes(&[1; 20]).is_err());
        assert!(Envelope::from_bytes(&[9, 1, 2]).is_err());
    }
}
