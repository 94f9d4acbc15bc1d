//! Error types for the tunnel protocol.

use thiserror::Error;

/// Result type alias for tunnel operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while establishing or driving a tunnel.
#[derive(Error, Debug)]
pub enum Error {
    /// Underlying transport I/O failed; bubbled unchanged.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The puzzle decoder accumulated a 4-tuple with no table entry.
    /// The stream is corrupt or the peers disagree on the seed; fatal.
    #[error("invalid codeword: no table entry for received 4-tuple")]
    InvalidCodeword,

    /// Unsupported AEAD name, or key/IV material too short.
    #[error("cipher setup failed: {0}")]
    CipherSetup(String),

    /// Record decryption or authentication failed; fatal to the connection.
    #[error("record decryption failed")]
    Decrypt,

    /// Handshake timestamp outside the permitted skew window.
    #[error("handshake timestamp skew: server_time={server_time} client_time={client_time}")]
    TimestampSkew {
        /// Server clock at validation, Unix seconds.
        server_time: i64,
        /// Timestamp the client sent, Unix seconds.
        client_time: i64,
    },

    /// Malformed or oversize address.
    #[error("address format error: {0}")]
    AddressFormat(String),

    /// Malformed control frame. Recoverable: the multiplexer re-emits the
    /// bytes as data and keeps scanning.
    #[error("control frame error: {0}")]
    ControlFrame(String),

    /// Key material could not be parsed or normalized.
    #[error("key error: {0}")]
    Key(String),

    /// Configuration rejected by validation.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a cipher setup error.
    pub fn cipher_setup(msg: impl Into<String>) -> Self {
        Error::CipherSetup(msg.into())
    }

    /// Create an address format error.
    pub fn address(msg: impl Into<String>) -> Self {
        Error::AddressFormat(msg.into())
    }

    /// Create a key error.
    pub fn key(msg: impl Into<String>) -> Self {
        Error::Key(msg.into())
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Convert into a `std::io::Error` for surfaces behind the
    /// `AsyncRead`/`AsyncWrite` traits.
    pub fn into_io(self) -> std::io::Error {
        match self {
            Error::Transport(e) => e,
            other => std::io::Error::new(std::io::ErrorKind::InvalidData, other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formats() {
        let err = Error::InvalidCodeword;
        assert!(err.to_string().contains("invalid codeword"));

        let err = Error::TimestampSkew {
            server_time: 100,
            client_time: 300,
        };
        assert!(err.to_string().contains("server_time=100"));
    }

    #[test]
    fn io_conversion_preserves_transport_errors() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err = Error::from(io);
        let back = err.into_io();
        assert_eq!(back.kind(), std::io::ErrorKind::ConnectionReset);
    }
}
