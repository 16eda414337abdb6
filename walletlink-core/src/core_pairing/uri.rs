//! `wc:<topic>@2?relay-protocol=irn&symKey=<hex>&expiryTimestamp=<secs>&methods=<a,b>`

use crate::core_crypto::KEY_LENGTH;
use crate::core_session::RelayProtocol;
use crate::errors::{EngineError, EngineResult};
use std::fmt;
use std::str::FromStr;
use url::form_urlencoded;
use zeroize::Zeroizing;

pub const URI_PROTOCOL: &str = "wc";
pub const URI_VERSION: u32 = 2;

#[derive(Clone, PartialEq, Eq)]
pub struct PairingUri {
    pub topic: String,
    pub version: u32,
    pub sym_key: Zeroizing<[u8; KEY_LENGTH]>,
    pub relay: RelayProtocol,
    pub expiry_timestamp: u64,
    pub methods: Vec<String>,
}

impl fmt::Debug for PairingUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PairingUri")
            .field("topic", &self.topic)
            .field("version", &self.version)
            .field("sym_key", &"[redacted]")
            .field("relay", &self.relay)
            .field("expiry_timestamp", &self.expiry_timestamp)
            .field("methods", &self.methods)
            .finish()
    }
}

impl fmt::Display for PairingUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}@{}?relay-protocol={}&symKey={}&expiryTimestamp={}",
            URI_PROTOCOL,
            self.topic,
            self.version,
            self.relay.protocol,
            hex::encode(&self.sym_key[..]),
            self.expiry_timestamp
        )?;
        if let Some(data) = &self.relay.data {
            let encoded: String = form_urlencoded::byte_serialize(data.as_bytes()).collect();
            write!(f, "&relay-data={}", encoded)?;
        }
        if !self.methods.is_empty() {
            write!(f, "&methods={}", self.methods.join(","))?;
        }
        Ok(())
    }
}

fn invalid(reason: impl Into<String>) -> EngineError {
    EngineError::MissingOrInvalid(format!("pairing uri: {}", reason.into()))
}

impl FromStr for PairingUri {
    type Err = EngineError;

    fn from_str(s: &str) -> EngineResult<Self> {
        let rest = s
            .strip_prefix(URI_PROTOCOL)
            .and_then(|r| r.strip_prefix(':'))
            .ok_or_else(|| invalid("expected wc: scheme"))?;
        let (path, query) = rest.split_once('?').ok_or_else(|| invalid("missing query"))?;
        let (topic, version) = path.split_once('@').ok_or_else(|| invalid("missing version"))?;
        if topic.is_empty() {
            return Err(invalid("empty topic"));
        }
        let version: u32 = version.parse().map_err(|_| invalid("bad version"))?;

        let mut protocol = None;
        let mut data = None;
        let mut sym_key = None;
        let mut expiry_timestamp = None;
        let mut methods = Vec::new();
        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "relay-protocol" => protocol = Some(value.into_owned()),
                "relay-data" => data = Some(value.into_owned()),
                "symKey" => {
                    let mut bytes = Zeroizing::new([0u8; KEY_LENGTH]);
                    hex::decode_to_slice(value.as_bytes(), &mut bytes[..])
                        .map_err(|e| invalid(format!("symKey: {}", e)))?;
                    sym_key = Some(bytes);
                }
                "expiryTimestamp" => {
                    expiry_timestamp = Some(
                        value
                            .parse::<u64>()
                            .map_err(|_| invalid("bad expiryTimestamp"))?,
                    )
                }
                "methods" => {
                    methods = value
                        .split(',')
                        .filter(|m| !m.is_empty())
                        .map(str::to_string)
                        .collect()
                }
                _ => {}
            }
        }

        Ok(PairingUri {
            topic: topic.to_string(),
            version,
            sym_key: sym_key.ok_or_else(|| invalid("missing symKey"))?,
            relay: RelayProtocol {
                protocol: protocol.ok_or_else(|| invalid("missing relay-protocol"))?,
                data,
            },
            expiry_timestamp: expiry_timestamp.ok_or_else(|| invalid("missing expiryTimestamp"))?,
            methods,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PairingUri {
        PairingUri {
            topic: "7f6e504bfad60b485450578e05678ed3e8e8c4751d3c6160be17160d63ec90f9".into(),
            version: URI_VERSION,
            sym_key: Zeroizing::new([0x58; KEY_LENGTH]),
            relay: RelayProtocol::default(),
            expiry_timestamp: 1_700_000_300,
            methods: vec!["wc_sessionPropose".into(), "wc_authRequest".into()],
        }
    }

    #[test]
    fn test_format_is_exact() {
        assert_eq!(
            sample().to_string(),
            format!(
                "wc:7f6e504bfad60b485450578e05678ed3e8e8c4751d3c6160be17160d63ec90f9@2?relay-protocol=irn&symKey={}&expiryTimestamp=1700000300&methods=wc_sessionPropose,wc_authRequest",
                "58".repeat(32)
            )
        );
    }

    #[test]
    fn test_parse_what_we_print() {
        let mut uri = sample();
        uri.relay.data = Some("a b&c".into());
        let parsed: PairingUri = uri.to_string().parse().unwrap();
        assert_eq!(parsed, uri);
    }

    #[test]
    fn test_methods_are_optional() {
        let mut uri = sample();
        uri.methods.clear();
        let text = uri.to_string();
        assert!(!text.contains("methods="));
        assert!(text.parse::<PairingUri>().unwrap().methods.is_empty());
    }

    #[test]
    fn test_rejects_malformed() {
        for bad in [
            "",
            "wc:",
            "http:abc@2?relay-protocol=irn",
            "wc:abc@x?relay-protocol=irn&symKey=00&expiryTimestamp=1",
            "wc:abc@2?relay-protocol=irn&symKey=zz&expiryTimestamp=1",
            "wc:abc@2?relay-protocol=irn&expiryTimestamp=1",
        ] {
            assert!(
                matches!(bad.parse::<PairingUri>(), Err(EngineError::MissingOrInvalid(_))),
                "accepted {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_debug_hides_key() {
        assert!(!format!("{:?}", sample()).contains("5858"));
    }
}
