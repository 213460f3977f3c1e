//! Error types for the nvstream client core.

use thiserror::Error;

/// Primary error type for all nvstream operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Host protocol error: {0}")]
    HostProtocol(#[from] HostProtocolError),

    #[error("Pairing error: {0}")]
    Pairing(#[from] PairingError),

    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Negotiation error: {0}")]
    Negotiation(#[from] NegotiationError),

    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),
}

/// Network reachability failures: timeouts, resets, DNS, TLS.
///
/// Retryable only in narrow cases; `ServiceUnavailable` drives the one-shot
/// 503 retry in the HTTP client.
#[derive(Error, Debug, Clone)]
#[error("{kind:?}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Timeout,
    ConnectionRefused,
    Dns,
    Tls,
    /// HTTP 503 from the host; the caller may retry once after a pause.
    ServiceUnavailable,
    Io,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Timeout, message)
    }

    pub fn is_service_unavailable(&self) -> bool {
        self.kind == TransportErrorKind::ServiceUnavailable
    }
}

/// Non-success status reported by the host, either at the HTTP layer or in
/// the XML `root@status_code` attribute. Terminal; the message is surfaced
/// to the user.
#[derive(Error, Debug, Clone)]
#[error("{message} (Error {status})")]
pub struct HostProtocolError {
    pub status: i32,
    pub message: String,
}

impl HostProtocolError {
    pub fn new(status: i32, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

/// Errors inside the pairing handshake that are not expressible as a
/// pairing outcome (stage sequencing bugs, malformed host material).
#[derive(Error, Debug)]
pub enum PairingError {
    #[error("Pairing stage out of order: {0}")]
    InvalidState(&'static str),

    #[error("Host returned malformed pairing material: {0}")]
    Protocol(String),

    #[error("Host certificate could not be parsed")]
    BadServerCert,
}

/// Errors during mDNS discovery.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("mDNS daemon error: {0}")]
    Daemon(String),

    #[error("Hostname resolution failed: {0}")]
    Resolution(String),
}

/// The stream could not be negotiated; launch is refused with a specific
/// explanation.
#[derive(Error, Debug)]
pub enum NegotiationError {
    #[error("The server software version on {0} is not supported by this client")]
    UnsupportedServerVersion(String),

    #[error("The host GPU doesn't support streaming video resolutions over 4K")]
    ResolutionUnsupportedByHost,

    #[error("Video resolutions over 4K are not supported by the H.264 codec")]
    ResolutionRequiresModernCodec,

    #[error("Forced hardware decoding cannot be satisfied for {0:#x} on this GPU")]
    ForcedHardwareUnavailable(u32),
}

/// Runtime faults during an active session.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Video decoder was lost and could not be recreated")]
    DecoderLost,

    #[error("Display was lost")]
    DisplayLost,

    #[error("Audio device failed to initialize")]
    AudioInitFailed,
}

/// Cryptographic operation errors.
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },
}

/// Parsing errors for XML leaves, hex fields, and addresses.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid hex value: {0}")]
    InvalidHex(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

/// Persistence back-end failures.
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Stored host list is corrupt: {0}")]
    Corrupt(String),
}

/// Convenience Result type.
pub type Result<T> = std::result::Result<T, Error>;
