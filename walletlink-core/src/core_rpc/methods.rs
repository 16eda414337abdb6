//! Method table: wire names and publish options
//!
//! | method          | ttl   | req tag | res tag | prompt |
//! |-----------------|-------|---------|---------|--------|
//! | session_propose | 5m    | 1100    | 1101    | yes    |
//! | session_settle  | 5m    | 1102    | 1103    |        |
//! | session_update  | 1d    | 1104    | 1105    |        |
//! | session_extend  | 1d    | 1106    | 1107    |        |
//! | session_request | 5m    | 1108    | 1109    | yes    |
//! | session_event   | 5m    | 1110    | 1111    | yes    |
//! | session_delete  | 1d    | 1112    | 1113    |        |
//! | session_ping    | 30s   | 1114    | 1115    |        |
//! | pairing_delete  | 1d    | 1000    | 1001    |        |
//! | pairing_ping    | 30s   | 1002    | 1003    |        |

use crate::errors::EngineError;
use crate::time::{FIVE_MINUTES, ONE_DAY};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const THIRTY_SECONDS: u64 = 30;
const PROPOSE_REJECT_TAG: u32 = 1120;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcMethod {
    SessionPropose,
    SessionSettle,
    SessionUpdate,
    SessionExtend,
    SessionRequest,
    SessionEvent,
    SessionDelete,
    SessionPing,
    PairingDelete,
    PairingPing,
}

/// Relay publish options for one direction of a method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodOptions {
    pub ttl: u64,
    pub tag: u32,
    pub prompt: bool,
}

impl MethodOptions {
    const fn new(ttl: u64, tag: u32, prompt: bool) -> Self {
        Self { ttl, tag, prompt }
    }
}

impl RpcMethod {
    pub const ALL: [RpcMethod; 10] = [
        RpcMethod::SessionPropose,
        RpcMethod::SessionSettle,
        RpcMethod::SessionUpdate,
        RpcMethod::SessionExtend,
        RpcMethod::SessionRequest,
        RpcMethod::SessionEvent,
        RpcMethod::SessionDelete,
        RpcMethod::SessionPing,
        RpcMethod::PairingDelete,
        RpcMethod::PairingPing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RpcMethod::SessionPropose => "session_propose",
            RpcMethod::SessionSettle => "session_settle",
            RpcMethod::SessionUpdate => "session_update",
            RpcMethod::SessionExtend => "session_extend",
            RpcMethod::SessionRequest => "session_request",
            RpcMethod::SessionEvent => "session_event",
            RpcMethod::SessionDelete => "session_delete",
            RpcMethod::SessionPing => "session_ping",
            RpcMethod::PairingDelete => "pairing_delete",
            RpcMethod::PairingPing => "pairing_ping",
        }
    }

    /// Methods handled by the pairing engine itself
    pub fn is_pairing_method(&self) -> bool {
        matches!(self, RpcMethod::PairingDelete | RpcMethod::PairingPing)
    }

    pub fn request_options(&self) -> MethodOptions {
        match self {
            RpcMethod::SessionPropose => MethodOptions::new(FIVE_MINUTES, 1100, true),
            RpcMethod::SessionSettle => MethodOptions::new(FIVE_MINUTES, 1102, false),
            RpcMethod::SessionUpdate => MethodOptions::new(ONE_DAY, 1104, false),
            RpcMethod::SessionExtend => MethodOptions::new(ONE_DAY, 1106, false),
            RpcMethod::SessionRequest => MethodOptions::new(FIVE_MINUTES, 1108, true),
            RpcMethod::SessionEvent => MethodOptions::new(FIVE_MINUTES, 1110, true),
            RpcMethod::SessionDelete => MethodOptions::new(ONE_DAY, 1112, false),
            RpcMethod::SessionPing => MethodOptions::new(THIRTY_SECONDS, 1114, false),
            RpcMethod::PairingDelete => MethodOptions::new(ONE_DAY, 1000, false),
            RpcMethod::PairingPing => MethodOptions::new(THIRTY_SECONDS, 1002, false),
        }
    }

    pub fn response_options(&self) -> MethodOptions {
        let req = self.request_options();
        MethodOptions::new(req.ttl, req.tag + 1, false)
    }

    /// Options for an error response; only a proposal rejection differs
    pub fn reject_options(&self) -> MethodOptions {
        match self {
            RpcMethod::SessionPropose => MethodOptions::new(FIVE_MINUTES, PROPOSE_REJECT_TAG, false),
            _ => self.response_options(),
        }
    }
}

impl fmt::Display for RpcMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RpcMethod {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RpcMethod::ALL
            .iter()
            .copied()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| EngineError::MethodNotFound(s.to_string()))
    }
}
