//! Wall-clock helpers
//!
//! Every expiry in the protocol is an absolute unix timestamp in seconds.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const FIVE_MINUTES: u64 = 5 * 60;
pub const ONE_DAY: u64 = 24 * 60 * 60;
pub const SEVEN_DAYS: u64 = 7 * ONE_DAY;

pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

/// Absolute expiry `ttl` seconds from now
pub fn expiry_in(ttl: u64) -> u64 {
    now_secs().saturating_add(ttl)
}

pub fn is_expired(expiry: u64) -> bool {
    now_secs() >= expiry
}
