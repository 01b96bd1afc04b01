//! Common error types for Anaglyph.

use thiserror::Error;

/// Result type alias using Anaglyph's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for Anaglyph operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (config file, sockets, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Protocol error (malformed discovery payload, bad join target)
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl Error {
    /// Create a serialization error from any displayable type.
    pub fn serialization(msg: impl std::fmt::Display) -> Self {
        Self::Serialization(msg.to_string())
    }

    /// Create a config error from any displayable type.
    pub fn config(msg: impl std::fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }

    /// Create a protocol error from any displayable type.
    pub fn protocol(msg: impl std::fmt::Display) -> Self {
        Self::Protocol(msg.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors_pick_variant() {
        assert!(matches!(Error::config("bad"), Error::Config(msg) if msg == "bad"));
        assert!(matches!(Error::protocol("bad"), Error::Protocol(_)));
        assert_eq!(
            Error::serialization("eof").to_string(),
            "serialization error: eof"
        );
    }
}
