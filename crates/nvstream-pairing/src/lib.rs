//! # nvstream-pairing
//!
//! The PIN-authenticated pairing handshake: a sans-IO protocol state machine
//! plus an async driver that runs it against a host's `pair` endpoint.

pub mod driver;
pub mod engine;

#[cfg(test)]
pub(crate) mod mock;
#[cfg(test)]
pub(crate) mod testutil;

pub use driver::pair_host;
pub use engine::{PairOutcome, PairingEngine, StageProgress};
