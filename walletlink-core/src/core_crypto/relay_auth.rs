//! Relay authentication token
//!
//! The relay accepts an EdDSA JWT whose issuer is the client's `did:key`.
//! `did:key:z<base58btc(0xed 0x01 || ed25519 public key)>`

use crate::errors::CryptoError;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

const DID_PREFIX: &str = "did:key:";
const MULTICODEC_ED25519_HEADER: [u8; 2] = [0xed, 0x01];
const MULTIBASE_BASE58BTC: char = 'z';
const JWT_HEADER: &str = r#"{"alg":"EdDSA","typ":"JWT"}"#;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwtClaims {
    pub iss: String,
    pub sub: String,
    pub aud: String,
    pub iat: u64,
    pub exp: u64,
}

pub fn encode_did_key(key: &VerifyingKey) -> String {
    let mut bytes = MULTICODEC_ED25519_HEADER.to_vec();
    bytes.extend_from_slice(key.as_bytes());
    format!("{}{}{}", DID_PREFIX, MULTIBASE_BASE58BTC, bs58::encode(bytes).into_string())
}

pub fn decode_did_key(did: &str) -> Result<VerifyingKey, CryptoError> {
    let encoded = did
        .strip_prefix(DID_PREFIX)
        .and_then(|rest| rest.strip_prefix(MULTIBASE_BASE58BTC))
        .ok_or_else(|| CryptoError::Jwt(format!("not a base58 did:key: {}", did)))?;
    let bytes = bs58::decode(encoded)
        .into_vec()
        .map_err(|e| CryptoError::Jwt(e.to_string()))?;

    let key = bytes
        .strip_prefix(&MULTICODEC_ED25519_HEADER[..])
        .ok_or_else(|| CryptoError::Jwt("did:key is not ed25519".to_string()))?;
    let key: [u8; 32] = key
        .try_into()
        .map_err(|_| CryptoError::Jwt("ed25519 key must be 32 bytes".to_string()))?;
    VerifyingKey::from_bytes(&key).map_err(|e| CryptoError::Jwt(e.to_string()))
}

/// Sign a token for `aud` valid from `iat` for `ttl` seconds
pub fn issue_jwt(signing: &SigningKey, aud: &str, iat: u64, ttl: u64) -> Result<String, CryptoError> {
    let claims = JwtClaims {
        iss: encode_did_key(&signing.verifying_key()),
        sub: hex::encode(super::random_key()),
        aud: aud.to_string(),
        iat,
        exp: iat.saturating_add(ttl),
    };
    let claims = serde_json::to_vec(&claims).map_err(|e| CryptoError::Jwt(e.to_string()))?;

    let signing_input = format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(JWT_HEADER),
        URL_SAFE_NO_PAD.encode(claims)
    );
    let signature = signing.sign(signing_input.as_bytes());
    Ok(format!(
        "{}.{}",
        signing_input,
        URL_SAFE_NO_PAD.encode(signature.to_bytes())
    ))
}

/// Check the signature against the issuer key and the expiry against `now`
pub fn verify_jwt(token: &str, now: u64) -> Result<JwtClaims, CryptoError> {
    let mut parts = token.split('.');
    let (Some(header_b64), Some(claims_b64), Some(signature_b64), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(CryptoError::Jwt("token must have three parts".to_string()));
    };

    let decode = |part: &str| {
        URL_SAFE_NO_PAD
            .decode(part)
            .map_err(|e| CryptoError::Jwt(e.to_string()))
    };
    let claims: JwtClaims = serde_json::from_slice(&decode(claims_b64)?)
        .map_err(|e| CryptoError::Jwt(e.to_string()))?;
    let signature = Signature::from_slice(&decode(signature_b64)?)
        .map_err(|e| CryptoError::Jwt(e.to_string()))?;

    let key = decode_did_key(&claims.iss)?;
    let signing_input = format!("{}.{}", header_b64, claims_b64);
    key.verify(signing_input.as_bytes(), &signature)
        .map_err(|_| CryptoError::Jwt("signature mismatch".to_string()))?;

    if now >= claims.exp {
        return Err(CryptoError::Jwt("token expired".to_string()));
    }
    Ok(claims)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signing_key() -> SigningKey {
        SigningKey::from_bytes(&[42u8; 32])
    }

    #[test]
    fn test_did_key_roundtrip() {
        let key = signing_key().verifying_key();
        let did = encode_did_key(&key);
        assert!(did.starts_with("did:key:z6Mk"));
        assert_eq!(decode_did_key(&did).unwrap(), key);
    }

    #[test]
    fn test_jwt_verifies() {
        let token = issue_jwt(&signing_key(), "wss://relay.example.com", 1_000, 86_400).unwrap();
        let claims = verify_jwt(&token, 2_000).unwrap();
        assert_eq!(claims.aud, "wss://relay.example.com");
        assert_eq!(claims.exp, 87_400);
    }

    #[test]
    fn test_jwt_expired_and_tampered() {
        let token = issue_jwt(&signing_key(), "aud", 1_000, 10).unwrap();
        assert!(verify_jwt(&token, 1_010).is_err());

        let mut tampered = token.clone();
        tampered.insert(5, 'A');
        assert!(verify_jwt(&tampered, 1_001).is_err());
        assert!(verify_jwt("a.b", 0).is_err());
    }
}
