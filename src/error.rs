//! Error types for Cadence gateway

use thiserror::Error;

/// Result type alias for Cadence operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in Cadence gateway
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Upstream transcription handshake failed
    #[error("connect error: {0}")]
    Connect(String),

    /// Mid-stream failure on the upstream transcription link
    #[error("link error: {0}")]
    Link(String),

    /// Text generation failed
    #[error("generation error: {0}")]
    Generation(String),

    /// Speech synthesis failed
    #[error("synthesis error: {0}")]
    Synthesis(String),

    /// Malformed inbound message
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Audio encoding error
    #[error("audio error: {0}")]
    Audio(String),

    /// Outbound peer channel closed
    #[error("channel error: {0}")]
    Channel(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// WebSocket error on the upstream link
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_category() {
        let err = Error::Connect("handshake refused".to_string());
        assert_eq!(err.to_string(), "connect error: handshake refused");
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
