//! Client error types.

use espconnect_protocol::{CodecError, ProtocolError, ServerError};
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("authentication required (status 401, scheme '{scheme}'): {challenge}")]
    AuthRequired { scheme: String, challenge: String },

    #[error("server error: {}", server_message(.text, .details))]
    Server { text: String, details: Vec<String> },

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("fatal: {0}")]
    Fatal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("request timeout")]
    Timeout,

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

fn server_message(text: &str, details: &[String]) -> String {
    ServerError {
        text: text.to_string(),
        details: details.to_vec(),
    }
    .message()
}

impl From<ServerError> for ClientError {
    fn from(err: ServerError) -> Self {
        ClientError::Server {
            text: err.text,
            details: err.details,
        }
    }
}

impl ClientError {
    /// Errors that end the caller's use of the connection.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ClientError::Config(_) | ClientError::AuthRequired { .. } | ClientError::Fatal(_)
        )
    }

    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Io(_) => true,
            ClientError::WebSocket(_) => true,
            ClientError::Timeout => true,
            ClientError::ConnectionClosed => true,
            ClientError::NotConnected => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_error_display() {
        let err: ClientError = ServerError {
            text: "load failed".to_string(),
            details: vec!["bad window".to_string()],
        }
        .into();
        assert_eq!(err.to_string(), "server error: load failed\nbad window");
        assert!(!err.is_fatal());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_auth_required_is_fatal() {
        let err = ClientError::AuthRequired {
            scheme: "basic".to_string(),
            challenge: "Basic realm=x".to_string(),
        };
        assert!(err.is_fatal());
        assert!(err.to_string().contains("401"));
        assert!(err.to_string().contains("Basic realm=x"));
    }

    #[test]
    fn test_retryable() {
        assert!(ClientError::Timeout.is_retryable());
        assert!(ClientError::ConnectionClosed.is_retryable());
        assert!(!ClientError::Config("no url".to_string()).is_retryable());
        assert!(ClientError::Config("no url".to_string()).is_fatal());
    }
}
