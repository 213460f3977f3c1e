//! # nvstream-core
//!
//! Core types, traits, and error definitions shared across all nvstream crates.
//!
//! This crate provides:
//! - Host record state, addresses, and serialized form
//! - Video format candidate lists and server codec capability masks
//! - Dotted version ("quad") parsing and comparison
//! - Common error types

pub mod address;
pub mod error;
pub mod formats;
pub mod host;
pub mod stream;
pub mod version;

pub use address::{HostAddress, DEFAULT_HTTPS_PORT, DEFAULT_HTTP_PORT};
pub use error::{
    CryptoError, DiscoveryError, Error, HostProtocolError, NegotiationError, PairingError,
    ParseError, PersistenceError, Result, RuntimeError, TransportError, TransportErrorKind,
};
pub use formats::{SupportedFormats, VideoFormat};
pub use host::{AppEntry, DisplayMode, HostProbe, HostState, PairState, Reachability, SerializedHost};
pub use stream::{AudioConfiguration, StreamConfig, ENCFLG_ALL, ENCFLG_AUDIO, ENCFLG_NONE};
pub use version::{compare_quads, parse_quad};
