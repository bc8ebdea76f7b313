//! Mi IO error types

use thiserror::Error;

use crate::transport::{CryptoError, TokenError};

/// Mi IO errors
#[derive(Error, Debug)]
pub enum Error {
    /// Datagram too short to carry a header
    #[error("malformed packet: {len} bytes (need at least 32)")]
    MalformedPacket {
        /// Received length
        len: usize,
    },

    /// Stored checksum does not match the recomputed digest
    #[error("packet has invalid checksum")]
    ChecksumInvalid,

    /// Payload cipher failure
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Device did not answer within the timeout
    #[error("no response from device")]
    NoResponse,

    /// Decrypted payload is not a JSON object
    #[error("message is not JSON: {0}")]
    NotJson(String),

    /// Token, device id or address rejected at open time
    #[error("configuration invalid: {0}")]
    ConfigurationInvalid(String),

    /// Command parameters are not a JSON document
    #[error("invalid command parameters: {0}")]
    InvalidParams(#[from] serde_json::Error),

    /// Session was closed
    #[error("session closed")]
    Closed,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<TokenError> for Error {
    fn from(err: TokenError) -> Self {
        Self::ConfigurationInvalid(err.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error marker attached to a command whose exchange failed.
///
/// The display strings are what listeners see in the `"error"` member of the
/// command response.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// Timed out waiting for the device
    #[error("No Response")]
    NoResponse,

    /// Reply checksum mismatch
    #[error("Message has invalid checksum")]
    InvalidChecksum,

    /// Reply could not be decrypted
    #[error("{0}")]
    Crypto(CryptoError),

    /// Decrypted reply is not a JSON object
    #[error("message is not JSON")]
    NotJson,

    /// Socket failure other than a timeout
    #[error("{0}")]
    Transport(String),

    /// Session closed before the command was sent
    #[error("session closed")]
    Closed,
}

impl From<CryptoError> for CommandError {
    fn from(err: CryptoError) -> Self {
        Self::Crypto(err)
    }
}
