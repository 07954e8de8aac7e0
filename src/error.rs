/// Unified error handling for the portero proxy
///
/// Covers configuration validation, the session-level close/timeout
/// classifications the serve loop dispatches on, pool lifecycle errors,
/// and plain I/O propagation.
use std::io;
use thiserror::Error;

/// Main error type for proxy operations
#[derive(Debug, Error)]
pub enum ProxyError {
    /// `max_connections` was configured as zero
    #[error("max_connections cannot be 0")]
    ZeroMaxConnections,

    /// `max_per_client_connections` was configured as zero
    #[error("max_per_client_connections cannot be 0")]
    ZeroMaxPerClientConnections,

    /// The peer went away at a message boundary, or the proxy is shutting
    /// down. Logged at debug level only.
    #[error("normal close")]
    NormalClose,

    /// The client sent nothing within the idle or getLastError window.
    #[error("client read timeout")]
    ClientReadTimeout,

    /// A forwarded exchange exceeded `message_timeout`.
    #[error("message timeout")]
    MessageTimeout,

    /// The pool refused an acquisition because it is draining.
    #[error("connection pool is closed")]
    PoolClosed,

    /// All dial attempts against the upstream failed.
    #[error("could not connect to {addr}")]
    ConnectFailed { addr: String },

    /// The authentication handshake on a fresh upstream failed.
    #[error("authentication failed: {message}")]
    Auth { message: String },

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Network-related errors
    #[error("network error: {0}")]
    Io(#[from] io::Error),
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("parse error: {0}")]
    ParseError(String),

    #[error("serialize error: {0}")]
    SerializeError(String),

    #[error("validation error: {0}")]
    ValidationError(String),
}

/// Result type alias for proxy operations
pub type ProxyResult<T> = Result<T, ProxyError>;

impl ProxyError {
    /// Create an authentication error
    pub fn auth<S: Into<String>>(message: S) -> Self {
        ProxyError::Auth {
            message: message.into(),
        }
    }

    /// Whether this error is a deadline expiration. Drives the
    /// `message.proxy.timeout` counter in the serve loop.
    pub fn is_timeout(&self) -> bool {
        match self {
            ProxyError::MessageTimeout | ProxyError::ClientReadTimeout => true,
            ProxyError::Io(e) => e.kind() == io::ErrorKind::TimedOut,
            _ => false,
        }
    }

    /// Whether the session should end without an error-level log line.
    pub fn is_normal_close(&self) -> bool {
        matches!(self, ProxyError::NormalClose)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = ProxyError::ConnectFailed {
            addr: "127.0.0.1:27017".to_string(),
        };
        assert_eq!(error.to_string(), "could not connect to 127.0.0.1:27017");

        let error = ProxyError::auth("handshake rejected");
        assert_eq!(
            error.to_string(),
            "authentication failed: handshake rejected"
        );
    }

    #[test]
    fn test_timeout_classification() {
        assert!(ProxyError::MessageTimeout.is_timeout());
        assert!(ProxyError::ClientReadTimeout.is_timeout());
        assert!(ProxyError::Io(io::Error::new(io::ErrorKind::TimedOut, "t")).is_timeout());
        assert!(!ProxyError::NormalClose.is_timeout());
        assert!(!ProxyError::PoolClosed.is_timeout());
    }

    #[test]
    fn test_normal_close_classification() {
        assert!(ProxyError::NormalClose.is_normal_close());
        assert!(!ProxyError::ClientReadTimeout.is_normal_close());
    }

    #[test]
    fn test_config_error_conversion() {
        let error: ProxyError = ConfigError::ValidationError("bad".to_string()).into();
        assert!(matches!(error, ProxyError::Config(_)));
    }
}
