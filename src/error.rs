//! Error types for tactum.

use std::io;

use thiserror::Error;

/// Result type alias for tactum operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for tactum.
#[derive(Error, Debug)]
pub enum Error {
    // Wire-level errors
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("cryptographic error: {0}")]
    Crypto(#[from] CryptoError),

    // Transport errors
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    // Persistence errors
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    // Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // Unrecoverable errors: the device halts rather than continue driving
    // outputs with unvalidated limits
    #[error("fatal: {0}")]
    Fatal(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // General errors
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Check if the error is fatal (the device must halt).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Fatal(_) | Error::Storage(StorageError::LayoutMismatch { .. })
        )
    }

    /// Check if the error is recoverable (the session survives and the peer
    /// is answered with a specific error code).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Frame(_) | Error::Crypto(_) | Error::Storage(StorageError::WriteFailed(_))
        )
    }
}

/// Frame validation errors, one variant per detection point.
///
/// `TooShort` and `NotAddressed` frames are dropped silently; the remaining
/// variants are answered with a wire error code.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame shorter than the minimum envelope")]
    TooShort,

    #[error("frame not addressed to this device")]
    NotAddressed,

    #[error("end-of-frame marker mismatch")]
    Eof,

    #[error("declared length does not match received length")]
    LengthMismatch,

    #[error("checksum mismatch")]
    Crc,

    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("invalid response tag: {0:#04x}")]
    InvalidResponseTag(u8),
}

/// Cryptographic operation errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("invalid IV length: {0} (expected 16)")]
    InvalidIvLength(usize),
}

/// Transport layer errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("failed to arm reception: {0}")]
    ArmFailed(String),

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("peer disconnected")]
    Disconnected,
}

/// Persistence errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("read failed: {0}")]
    ReadFailed(String),

    #[error("write failed: {0}")]
    WriteFailed(String),

    #[error("read-back verification failed")]
    VerifyFailed,

    #[error("record is not valid")]
    InvalidRecord,

    #[error("record layout mismatch: expected {expected} bytes, got {got}")]
    LayoutMismatch { expected: usize, got: usize },

    #[error("identity string too long: {0} bytes (max 31)")]
    IdentityTooLong(usize),
}
