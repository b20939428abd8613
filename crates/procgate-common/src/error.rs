//! Error types for procgate services

use http::StatusCode;
use std::fmt;

/// Result type alias using GatewayError
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Main error type for the gateway
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Client disconnected or sent a malformed request
    #[error("Transport error: {0}")]
    Transport(String),

    /// No pool slot became available within the configured wait
    #[error("Connection pool exhausted for location '{location}' after {waited_ms}ms")]
    PoolExhausted { location: String, waited_ms: u64 },

    /// Backend rejected the credentials
    #[error("Authentication failed: {message}")]
    Auth {
        message: String,
        /// Whether a retry with fresh credentials may succeed
        recoverable: bool,
    },

    /// Argument shapes did not match the procedure signature
    #[error("Argument shape mismatch calling {procedure}: {message}")]
    ShapeMismatch { procedure: String, message: String },

    /// Argument shapes still did not match after adaptation
    #[error("Argument shape mismatch persisted after describe for {procedure}: {message}")]
    ShapeMismatchFatal { procedure: String, message: String },

    /// Malformed multipart upload
    #[error("Malformed upload: {0}")]
    StreamingFormat(String),

    /// Procedure failed in the backend
    #[error("Backend error {code}: {message}")]
    Backend {
        code: i32,
        message: String,
        /// Statement that produced the error
        call_text: Option<String>,
    },

    /// The backend session is no longer usable
    #[error("Backend connection lost: {0}")]
    StaleConnection(String),

    /// Allocation failed while buffering a request or response
    #[error("Out of memory allocating {size} bytes")]
    OutOfMemory { size: usize },

    /// Malformed percent-escape or character data
    #[error("Invalid encoding: {0}")]
    Encoding(String),

    /// Request exceeds the bind slot cap
    #[error("Too many arguments: {count} exceeds limit of {limit}")]
    TooManyArguments { count: usize, limit: usize },

    /// Procedure name is excluded or malformed
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Nothing to serve for the path
    #[error("Not found: {0}")]
    NotFound(String),

    /// Request body larger than allowed
    #[error("Payload too large: {size} bytes exceeds limit of {limit}")]
    PayloadTooLarge { size: u64, limit: u64 },

    /// Requested byte range lies outside the content
    #[error("Range not satisfiable for content of {length} bytes")]
    RangeNotSatisfiable { length: u64 },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Create an internal error from any error type
    pub fn internal<E: fmt::Display>(err: E) -> Self {
        GatewayError::Internal(err.to_string())
    }

    /// Create a backend error carrying the failing statement
    pub fn backend(code: i32, message: impl Into<String>, call_text: Option<String>) -> Self {
        GatewayError::Backend {
            code,
            message: message.into(),
            call_text,
        }
    }

    /// Get the error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Transport(_) => "TRANSPORT",
            GatewayError::PoolExhausted { .. } => "POOL_EXHAUSTED",
            GatewayError::Auth { .. } => "UNAUTHENTICATED",
            GatewayError::ShapeMismatch { .. } => "SHAPE_MISMATCH",
            GatewayError::ShapeMismatchFatal { .. } => "SHAPE_MISMATCH_FATAL",
            GatewayError::StreamingFormat(_) => "STREAMING_FORMAT",
            GatewayError::Backend { .. } => "BACKEND_ERROR",
            GatewayError::StaleConnection(_) => "STALE_CONNECTION",
            GatewayError::OutOfMemory { .. } => "OUT_OF_MEMORY",
            GatewayError::Encoding(_) => "ENCODING",
            GatewayError::TooManyArguments { .. } => "TOO_MANY_ARGUMENTS",
            GatewayError::Forbidden(_) => "FORBIDDEN",
            GatewayError::NotFound(_) => "NOT_FOUND",
            GatewayError::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            GatewayError::RangeNotSatisfiable { .. } => "RANGE_NOT_SATISFIABLE",
            GatewayError::Config(_) => "CONFIG_ERROR",
            GatewayError::Io(_) => "IO_ERROR",
            GatewayError::Internal(_) => "INTERNAL",
        }
    }

    /// HTTP status used when this error is rendered as a response
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Transport(_) => StatusCode::BAD_REQUEST,
            GatewayError::PoolExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Auth { .. } => StatusCode::UNAUTHORIZED,
            GatewayError::ShapeMismatch { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::ShapeMismatchFatal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::StreamingFormat(_) => StatusCode::BAD_REQUEST,
            GatewayError::Backend { .. } => StatusCode::BAD_REQUEST,
            GatewayError::StaleConnection(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::OutOfMemory { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Encoding(_) => StatusCode::BAD_REQUEST,
            GatewayError::TooManyArguments { .. } => StatusCode::BAD_REQUEST,
            GatewayError::Forbidden(_) => StatusCode::FORBIDDEN,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::RangeNotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            GatewayError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether a failure on a reused pooled session warrants one reconnect
    pub fn is_retryable_on_stale(&self) -> bool {
        matches!(self, GatewayError::StaleConnection(_))
    }

    /// Whether the client connection itself is gone
    pub fn is_transport(&self) -> bool {
        matches!(self, GatewayError::Transport(_))
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Internal(format!("Serialization error: {}", err))
    }
}

impl From<config::ConfigError> for GatewayError {
    fn from(err: config::ConfigError) -> Self {
        GatewayError::Config(err.to_string())
    }
}
