//! CAIP-2 chain ids and CAIP-10 account ids

use crate::errors::{EngineError, EngineResult};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChainId {
    pub namespace: String,
    pub reference: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AccountId {
    pub chain_id: ChainId,
    pub address: String,
}

fn charset_ok(s: &str, min: usize, max: usize, allowed: impl Fn(char) -> bool) -> bool {
    (min..=max).contains(&s.len()) && s.chars().all(allowed)
}

/// `[-a-z0-9]{3,8}`
pub fn is_valid_namespace(s: &str) -> bool {
    charset_ok(s, 3, 8, |c| c == '-' || c.is_ascii_lowercase() || c.is_ascii_digit())
}

fn is_valid_reference(s: &str) -> bool {
    charset_ok(s, 1, 32, |c| c == '-' || c == '_' || c.is_ascii_alphanumeric())
}

fn is_valid_address(s: &str) -> bool {
    charset_ok(s, 1, 128, |c| matches!(c, '-' | '.' | '%') || c.is_ascii_alphanumeric())
}

impl ChainId {
    pub fn parse(s: &str) -> EngineResult<Self> {
        match s.split_once(':') {
            Some((namespace, reference))
                if is_valid_namespace(namespace) && is_valid_reference(reference) =>
            {
                Ok(Self {
                    namespace: namespace.to_string(),
                    reference: reference.to_string(),
                })
            }
            _ => Err(EngineError::MissingOrInvalid(format!("invalid chain id: {}", s))),
        }
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.reference)
    }
}

impl AccountId {
    pub fn parse(s: &str) -> EngineResult<Self> {
        let invalid = || EngineError::UnsupportedAccounts(format!("invalid account id: {}", s));
        let (chain, address) = s.rsplit_once(':').ok_or_else(invalid)?;
        let chain_id = ChainId::parse(chain).map_err(|_| invalid())?;
        if !is_valid_address(address) {
            return Err(invalid());
        }
        Ok(Self {
            chain_id,
            address: address.to_string(),
        })
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.chain_id, self.address)
    }
}

/// True for `eip155:1`, false for `eip155`
pub fn is_chain_id(s: &str) -> bool {
    ChainId::parse(s).is_ok()
}

/// Namespace family of a key or chain id (`eip155:1` -> `eip155`)
pub fn family(key: &str) -> &str {
    key.split(':').next().unwrap_or(key)
}
