//! Distinguishable error taxonomy for the core pipeline (§7).
//!
//! Transient I/O and malformed-input failures are never propagated as
//! process-fatal; callers match on these variants to count and
//! rate-limit-log them per channel instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key must be 32 bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("encrypted data too short: {0} bytes (minimum 28)")]
    CiphertextTooShort(usize),

    #[error("AES-GCM tag verification failed")]
    TagVerificationFailed,

    #[error("failed to encrypt payload: {0}")]
    EncryptionFailed(String),

    #[error("opus encode error: {0}")]
    OpusEncode(String),

    #[error("opus decode error: {0}")]
    OpusDecode(String),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("unknown channel id: {0}")]
    UnknownChannel(String),

    #[error("malformed datagram: {0}")]
    MalformedDatagram(String),

    #[error("session key not installed for channel {0}")]
    ZeroKey(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(String),

    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("software_configuration missing or empty in config")]
    MissingSoftwareConfiguration,

    #[error("session key must decode to exactly 32 bytes")]
    InvalidSessionKey,
}

/// Unifies the three component error taxonomies for call sites that cross
/// module boundaries (e.g. `transport::ChannelTransportState::new`, which
/// can fail on either the opus decoder or, in principle, the crypto layer
/// it shares a channel with).
pub type Result<T> = std::result::Result<T, EchoStreamError>;

#[derive(Debug, Error)]
pub enum EchoStreamError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
