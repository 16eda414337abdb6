//! JSON payload <-> relay wire string

use super::envelope::{self, Envelope, EnvelopeType};
use super::keychain::decode_public_key;
use super::KeyStore;
use crate::errors::{CryptoError, EngineError, EngineResult};
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use std::sync::Arc;
use tracing::trace;

/// Text encoding of the envelope bytes; link mode uses the URL-safe form
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    #[default]
    Base64,
    Base64Url,
}

impl Encoding {
    fn encode(self, bytes: &[u8]) -> String {
        match self {
            Encoding::Base64 => STANDARD.encode(bytes),
            Encoding::Base64Url => URL_SAFE_NO_PAD.encode(bytes),
        }
    }

    fn decode(self, text: &str) -> Result<Vec<u8>, CryptoError> {
        let result = match self {
            Encoding::Base64 => STANDARD.decode(text),
            Encoding::Base64Url => URL_SAFE_NO_PAD.decode(text.trim_end_matches('=')),
        };
        result.map_err(|e| CryptoError::InvalidEnvelope(format!("bad base64: {}", e)))
    }
}

#[derive(Debug, Clone, Default)]
pub struct EncodeOptions {
    pub envelope_type: EnvelopeType,
    /// Our public key; required for type 1
    pub sender_public_key: Option<String>,
    /// Peer public key; required for type 1
    pub receiver_public_key: Option<String>,
    pub encoding: Encoding,
}

impl EncodeOptions {
    pub fn url_safe() -> Self {
        Self {
            encoding: Encoding::Base64Url,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DecodeOptions {
    /// Our public key; required to open a type 1 envelope
    pub receiver_public_key: Option<String>,
    pub encoding: Encoding,
}

pub struct Codec {
    keystore: Arc<KeyStore>,
}

impl Codec {
    pub fn new(keystore: Arc<KeyStore>) -> Self {
        Self { keystore }
    }

    pub async fn encode(&self, topic: &str, payload: &str, opts: &EncodeOptions) -> EngineResult<String> {
        let envelope = match opts.envelope_type {
            EnvelopeType::Type0 => Envelope {
                envelope_type: EnvelopeType::Type0,
                sender_public_key: None,
                iv: None,
                sealed: payload.as_bytes().to_vec(),
            },
            EnvelopeType::Type1 => {
                let sender = required(&opts.sender_public_key, "sender public key")?;
                let receiver = required(&opts.receiver_public_key, "receiver public key")?;
                let key = self.keystore.derive_sym_key(sender, receiver).await?;
                let (iv, sealed) = envelope::seal(&key, payload.as_bytes())?;
                Envelope {
                    envelope_type: EnvelopeType::Type1,
                    sender_public_key: Some(*decode_public_key(sender)?.as_bytes()),
                    iv: Some(iv),
                    sealed,
                }
            }
            EnvelopeType::Type2 => {
                let key = self.keystore.get_sym_key(topic).await?;
                let (iv, sealed) = envelope::seal(&key, payload.as_bytes())?;
                Envelope {
                    envelope_type: EnvelopeType::Type2,
                    sender_public_key: None,
                    iv: Some(iv),
                    sealed,
                }
            }
        };

        trace!(topic, envelope = ?opts.envelope_type, "encoded payload");
        Ok(opts.encoding.encode(&envelope.to_bytes()))
    }

    pub async fn decode(&self, topic: &str, wire: &str, opts: &DecodeOptions) -> EngineResult<String> {
        let bytes = opts.encoding.decode(wire)?;
        let envelope = Envelope::from_bytes(&bytes)?;

        let plaintext = match envelope.envelope_type {
            EnvelopeType::Type0 => envelope.sealed,
            EnvelopeType::Type1 => {
                let receiver = required(&opts.receiver_public_key, "receiver public key")?;
                let sender = envelope
                    .sender_public_key
                    .map(hex::encode)
                    .ok_or_else(|| CryptoError::InvalidEnvelope("missing sender key".into()))?;
                let key = self.keystore.derive_sym_key(receiver, &sender).await?;
                open_sealed(&key, &envelope)?
            }
            EnvelopeType::Type2 => {
                let key = self.keystore.get_sym_key(topic).await?;
                open_sealed(&key, &envelope)?
            }
        };

        String::from_utf8(plaintext)
            .map_err(|_| CryptoError::InvalidEnvelope("payload is not utf-8".into()).into())
    }

    /// Envelope type without decrypting
    pub fn peek_type(wire: &str, encoding: Encoding) -> EngineResult<EnvelopeType> {
        let bytes = encoding.decode(wire)?;
        let first = bytes
            .first()
            .ok_or_else(|| CryptoError::InvalidEnvelope("empty envelope".into()))?;
        Ok(EnvelopeType::from_byte(*first)?)
    }
}

fn required<'a>(value: &'a Option<String>, what: &str) -> EngineResult<&'a str> {
    value
        .as_deref()
        .ok_or_else(|| EngineError::MissingOrInvalid(format!("{} is required for type 1", what)))
}

fn open_sealed(key: &[u8; super::KEY_LENGTH], envelope: &Envelope) -> Result<Vec<u8>, CryptoError> {
    let iv = envelope
        .iv
        .ok_or_else(|| CryptoError::InvalidEnvelope("missing iv".into()))?;
    envelope::open(key, &iv, &envelope.sealed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_store::MemoryStorage;

    fn codec() -> (Codec, Arc<KeyStore>) {
        let ks = Arc::new(KeyStore::new(
            Arc::new(MemoryStorage::new()),
            "test//keychain".into(),
        ));
        (Codec::new(ks.clone()), ks)
    }

    #[tokio::test]
    async fn test_type2_roundtrip() {
        let (codec, ks) = codec();
        let topic = ks.set_sym_key([5u8; 32], None).await.unwrap();
        let payload = r#"{"id":1,"jsonrpc":"2.0","method":"session_ping","params":{}}"#;

        let wire = codec.encode(&topic, payload, &EncodeOptions::default()).await.unwrap();
        assert_eq!(Codec::peek_type(&wire, Encoding::Base64).unwrap(), EnvelopeType::Type2);

        let decoded = codec.decode(&topic, &wire, &DecodeOptions::default()).await.unwrap();
        assert_eq!(decoded, payload);
    }

    #[tokio::test]
    async fn test_type0_is_plaintext() {
        let (codec, _) = codec();
        let opts = EncodeOptions {
            envelope_type: EnvelopeType::Type0,
            ..Default::default()
        };
        let wire = codec.encode("any", "{}", &opts).await.unwrap();
        let raw = STANDARD.decode(&wire).unwrap();
        assert_eq!(raw, b"\x00{}");
        assert_eq!(codec.decode("any", &wire, &DecodeOptions::default()).await.unwrap(), "{}");
    }

    #[tokio::test]
    async fn test_type1_between_two_keychains() {
        let (alice, alice_ks) = codec();
        let (bob, bob_ks) = codec();
        let a_pub = alice_ks.generate_key_pair().await.unwrap();
        let b_pub = bob_ks.generate_key_pair().await.unwrap();

        let opts = EncodeOptions {
            envelope_type: EnvelopeType::Type1,
            sender_public_key: Some(a_pub.clone()),
            receiver_public_key: Some(b_pub.clone()),
            ..Default::default()
        };
        let wire = alice.encode("t", "hello", &opts).await.unwrap();

        let decode_opts = DecodeOptions {
            receiver_public_key: Some(b_pub),
            ..Default::default()
        };
        assert_eq!(bob.decode("t", &wire, &decode_opts).await.unwrap(), "hello");

        let err = bob.decode("t", &wire, &DecodeOptions::default()).await.unwrap_err();
        assert!(matches!(err, EngineError::MissingOrInvalid(_)));
    }

    #[tokio::test]
    async fn test_unknown_topic_and_wrong_key() {
        let (codec, ks) = codec();
        let topic = ks.set_sym_key([1u8; 32], None).await.unwrap();
        let wire = codec.encode(&topic, "x", &EncodeOptions::default()).await.unwrap();

        let err = codec.decode("missing", &wire, &DecodeOptions::default()).await.unwrap_err();
        assert!(matches!(err, EngineError::NoMatchingKey(_)));

        ks.set_sym_key([2u8; 32], Some("other")).await.unwrap();
        let err = codec.decode("other", &wire, &DecodeOptions::default()).await.unwrap_err();
        assert!(matches!(err, EngineError::Crypto(CryptoError::Decryption(_))));
    }

    #[tokio::test]
    async fn test_url_safe_encoding() {
        let (codec, ks) = codec();
        let topic = ks.set_sym_key([8u8; 32], None).await.unwrap();
        let wire = codec.encode(&topic, "{\"a\":1}", &EncodeOptions::url_safe()).await.unwrap();
        assert!(!wire.contains('+') && !wire.contains('/') && !wire.contains('='));

        let opts = DecodeOptions {
            encoding: Encoding::Base64Url,
            ..Default::default()
        };
        assert_eq!(codec.decode(&topic, &wire, &opts).await.unwrap(), "{\"a\":1}");
    }
}
