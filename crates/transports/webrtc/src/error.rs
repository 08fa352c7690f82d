//! Error types for stream orchestration

/// Result type alias using the orchestration Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while orchestrating camera streams
///
/// The first four variants form the connection taxonomy. They are caught at
/// the stream connection boundary and turned into retry-or-fail decisions;
/// the consuming surface only ever sees their display string.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Signaling channel could not be opened (credential or transport issue)
    #[error("Connect error: {0}")]
    Connect(String),

    /// Offer/answer/candidate exchange failed at the protocol level
    #[error("Negotiation error: {0}")]
    Negotiation(String),

    /// Channel opened but the stream did not come up in time
    #[error("Media timeout: {0}")]
    MediaTimeout(String),

    /// Scheduler queue rejected an admission it cannot service
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Stream key is not part of the configured set
    #[error("Stream not found: {0}")]
    StreamNotFound(String),

    /// The owning task has already shut down
    #[error("Shut down: {0}")]
    Shutdown(String),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error should lead to another connection attempt
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Connect(_)
                | Error::Negotiation(_)
                | Error::MediaTimeout(_)
                | Error::WebSocket(_)
                | Error::Io(_)
        )
    }

    /// Check if this error is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::InvalidConfig(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::WebSocket(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Connect("credential rejected".to_string());
        assert_eq!(err.to_string(), "Connect error: credential rejected");

        let err = Error::MediaTimeout("no media after 15000ms".to_string());
        assert_eq!(err.to_string(), "Media timeout: no media after 15000ms");
    }

    #[test]
    fn test_error_is_retryable() {
        assert!(Error::Connect("x".to_string()).is_retryable());
        assert!(Error::Negotiation("x".to_string()).is_retryable());
        assert!(Error::MediaTimeout("x".to_string()).is_retryable());
        assert!(!Error::ResourceExhausted("x".to_string()).is_retryable());
        assert!(!Error::InvalidConfig("x".to_string()).is_retryable());
    }

    #[test]
    fn test_websocket_error_conversion() {
        let err = Error::from(tokio_tungstenite::tungstenite::Error::ConnectionClosed);
        assert!(matches!(err, Error::WebSocket(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_serde_error_conversion() {
        let parse_err = serde_json::from_str::<serde_json::Value>("{nope").unwrap_err();
        let err = Error::from(parse_err);
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = Error::from(io_err);
        assert!(matches!(err, Error::Io(_)));
    }
}
