//! Pairings: the out-of-band bootstrap channel
//!
//! created ──pair()──► paired ──activate()──► active ──► deleted
//!
//! A pairing is a symmetric key shared through a URI. Sessions are proposed
//! over it; once one settles the pairing is activated and kept for a week.

mod engine;
mod types;
mod uri;

pub use engine::{CreatedPairing, ForwardedMessage, PairingEngine};
pub use types::Pairing;
pub use uri::PairingUri;
