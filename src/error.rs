use http::StatusCode;
use thiserror::Error;

/// Unified error type for the interception proxy and the control-plane client
#[derive(Error, Debug)]
pub enum InterposeError {
    // Listener lifecycle
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Shutdown failed: {0}")]
    Shutdown(String),

    #[error("Proxy is already running")]
    AlreadyRunning,

    // TLS interception
    #[error("TLS handshake failed: {0}")]
    Handshake(String),

    #[error("Certificate error: {0}")]
    Certificate(String),

    // Upstream relay
    #[error("Upstream dial failed: {0}")]
    UpstreamDial(String),

    #[error("Upstream I/O failed: {0}")]
    UpstreamIo(String),

    // Handler chain
    #[error("Handler '{handler}' failed: {message}")]
    Handler { handler: String, message: String },

    // Control-plane client
    #[error("Circuit breaker is open")]
    CircuitOpen,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Server error {status}")]
    Server { status: StatusCode, body: String },

    #[error("Client error {status}")]
    Client { status: StatusCode, body: String },

    #[error("Operation timed out")]
    Timeout,

    #[error("Request failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<InterposeError>,
    },

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("No control host available")]
    NoActiveHost,

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Request errors
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // HTTP errors
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for interpose operations
pub type Result<T> = std::result::Result<T, InterposeError>;

impl InterposeError {
    /// HTTP status reported to a proxy client when this error ends its request
    pub fn status_code(&self) -> StatusCode {
        match self {
            InterposeError::InvalidRequest(_) | InterposeError::InvalidAddress(_) => {
                StatusCode::BAD_REQUEST
            }

            InterposeError::UpstreamDial(_)
            | InterposeError::UpstreamIo(_)
            | InterposeError::Handshake(_)
            | InterposeError::Transport(_)
            | InterposeError::Server { .. }
            | InterposeError::RetriesExhausted { .. } => StatusCode::BAD_GATEWAY,

            InterposeError::Client { status, .. } => *status,

            InterposeError::CircuitOpen | InterposeError::NoActiveHost => {
                StatusCode::SERVICE_UNAVAILABLE
            }

            InterposeError::Timeout => StatusCode::GATEWAY_TIMEOUT,

            InterposeError::Bind { .. }
            | InterposeError::Shutdown(_)
            | InterposeError::AlreadyRunning
            | InterposeError::Certificate(_)
            | InterposeError::Handler { .. }
            | InterposeError::Remote(_)
            | InterposeError::InvalidConfig(_)
            | InterposeError::Io(_)
            | InterposeError::Http(_)
            | InterposeError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Transport faults and 5xx responses may succeed on another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            InterposeError::Transport(_) | InterposeError::Server { .. }
        )
    }
}

impl From<hyper::Error> for InterposeError {
    fn from(err: hyper::Error) -> Self {
        InterposeError::Http(err.to_string())
    }
}

impl From<http::Error> for InterposeError {
    fn from(err: http::Error) -> Self {
        InterposeError::Http(err.to_string())
    }
}

impl From<url::ParseError> for InterposeError {
    fn from(err: url::ParseError) -> Self {
        InterposeError::InvalidAddress(err.to_string())
    }
}

impl From<rcgen::Error> for InterposeError {
    fn from(err: rcgen::Error) -> Self {
        InterposeError::Certificate(err.to_string())
    }
}

impl From<tokio_rustls::rustls::Error> for InterposeError {
    fn from(err: tokio_rustls::rustls::Error) -> Self {
        InterposeError::Certificate(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_code_mapping() {
        assert_eq!(
            InterposeError::InvalidRequest("bad".to_string()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            InterposeError::UpstreamDial("refused".to_string()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            InterposeError::Client {
                status: StatusCode::NOT_FOUND,
                body: String::new(),
            }
            .status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            InterposeError::CircuitOpen.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            InterposeError::Timeout.status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn test_retryable_classification() {
        assert!(InterposeError::Transport("reset".to_string()).is_retryable());
        assert!(InterposeError::Server {
            status: StatusCode::SERVICE_UNAVAILABLE,
            body: String::new(),
        }
        .is_retryable());

        assert!(!InterposeError::Client {
            status: StatusCode::NOT_FOUND,
            body: String::new(),
        }
        .is_retryable());
        assert!(!InterposeError::CircuitOpen.is_retryable());
        assert!(!InterposeError::Timeout.is_retryable());
    }

    #[test]
    fn test_retries_exhausted_mentions_last_failure() {
        let err = InterposeError::RetriesExhausted {
            attempts: 4,
            last: Box::new(InterposeError::Transport("connection reset".to_string())),
        };
        let msg = err.to_string();
        assert!(msg.contains("4 attempts"));
        assert!(msg.contains("connection reset"));
    }
}
