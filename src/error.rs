use hyper::StatusCode;
use thiserror::Error;

/// Unified error type for the relay
#[derive(Error, Debug)]
pub enum RelayError {
    // Upstream errors
    #[error("Upstream refused connection at {addr}")]
    UpstreamConnectionRefused { addr: String },

    #[error("Upstream connection failed: {0}")]
    UpstreamConnectFailed(String),

    #[error("Upstream TLS handshake failed: {0}")]
    UpstreamTlsHandshakeFailed(String),

    #[error("Upstream returned HTTP {status}")]
    UpstreamHttpError { status: u16 },

    #[error("Malformed upstream response: {0}")]
    MalformedUpstreamResponse(String),

    #[error("Upstream connection closed: {0}")]
    UpstreamClosed(String),

    // Retry errors
    #[error("{first_failure} (gave up after {attempts} attempts)")]
    RetryExhausted {
        first_failure: Box<RelayError>,
        attempts: u32,
    },

    #[error("Failure classifier error: {0}")]
    ClassifierError(String),

    #[error("Operation cancelled")]
    Cancelled,

    // Listener errors
    #[error("Failed to bind proxy listener on {addr}: {source}")]
    ListenerBindFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Operation timed out")]
    Timeout,

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Request errors
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid feed: {0}")]
    InvalidFeed(String),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // HTTP errors
    #[error("HTTP error: {0}")]
    Http(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

impl RelayError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            RelayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,

            // Upstream status is reported as-is
            RelayError::UpstreamHttpError { status } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }

            // Exhausted retries report the original cause
            RelayError::RetryExhausted { first_failure, .. } => first_failure.status_code(),

            // 502 Bad Gateway
            RelayError::UpstreamConnectionRefused { .. }
            | RelayError::UpstreamConnectFailed(_)
            | RelayError::UpstreamTlsHandshakeFailed(_)
            | RelayError::MalformedUpstreamResponse(_)
            | RelayError::UpstreamClosed(_)
            | RelayError::InvalidFeed(_) => StatusCode::BAD_GATEWAY,

            // 503 Service Unavailable
            RelayError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,

            // 504 Gateway Timeout
            RelayError::Timeout => StatusCode::GATEWAY_TIMEOUT,

            // 500 Internal Server Error
            RelayError::ClassifierError(_)
            | RelayError::ListenerBindFailed { .. }
            | RelayError::InvalidConfig(_)
            | RelayError::Io(_)
            | RelayError::Http(_)
            | RelayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Check if this is a client error (4xx)
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }

    /// Check if this is a server error (5xx)
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }

    /// Whether the connection was refused, directly or on the first attempt
    /// of an exhausted retry
    pub fn is_connection_refused(&self) -> bool {
        match self {
            RelayError::UpstreamConnectionRefused { .. } => true,
            RelayError::RetryExhausted { first_failure, .. } => first_failure.is_connection_refused(),
            _ => false,
        }
    }
}

// Convert from hyper errors
impl From<hyper::Error> for RelayError {
    fn from(err: hyper::Error) -> Self {
        if err.is_parse() || err.is_parse_status() || err.is_parse_too_large() {
            RelayError::MalformedUpstreamResponse(err.to_string())
        } else if err.is_incomplete_message() || err.is_closed() || err.is_canceled() {
            RelayError::UpstreamClosed(err.to_string())
        } else {
            RelayError::Http(err.to_string())
        }
    }
}

// Convert from regex compile errors
impl From<regex::Error> for RelayError {
    fn from(err: regex::Error) -> Self {
        RelayError::InvalidConfig(format!("invalid rewrite pattern: {}", err))
    }
}
