//! # Error Types
//!
//! Semantic error types for robot-link. Every variant carries enough context
//! to show a useful status line without digging through logs.
//!
//! No error here is process-fatal: channel failures degrade the session to a
//! visible status, capture failures end the capture in a `Failed` state.

use thiserror::Error;

use crate::protocol::ChannelKind;

/// Convenient Result alias for robot-link operations.
pub type LinkResult<T> = std::result::Result<T, LinkError>;

/// All errors that can occur while talking to the robot relay server.
#[derive(Error, Debug)]
pub enum LinkError {
    // ─── Connection ─────────────────────────────────────────────────
    /// Failed to establish a transport connection to an endpoint.
    #[error("Failed to connect to {url}: {reason}")]
    ConnectionFailed { url: String, reason: String },

    /// The session task has shut down; the handle is no longer usable.
    #[error("Session task is no longer running")]
    SessionClosed,

    // ─── Channels ───────────────────────────────────────────────────
    /// A send was attempted on a channel that is not open (or not bidirectional).
    #[error("{kind} channel is not connected")]
    ChannelNotReady { kind: ChannelKind },

    /// A channel reported a transport-level error. No automatic reconnect follows.
    #[error("{kind} channel transport error: {reason}")]
    TransportError { kind: ChannelKind, reason: String },

    // ─── Capture / inference ────────────────────────────────────────
    /// Neither a raw payload nor a displayed frame is available to capture.
    #[error("No frame available to capture")]
    NoFrameAvailable,

    /// A capture is already in progress.
    #[error("A capture is already in flight")]
    AlreadyInFlight,

    /// The inference endpoint rejected the upload or did not answer in time.
    #[error("{}", inference_failure_message(.status, .detail))]
    InferenceRequestFailed { status: Option<u16>, detail: String },

    /// The inference response body was not valid JSON. The raw text is still surfaced.
    #[error("Inference response could not be parsed: {reason}")]
    InferenceResponseUnparseable { reason: String },

    // ─── Timeout ────────────────────────────────────────────────────
    /// An operation timed out.
    #[error("Operation timed out after {seconds}s")]
    Timeout { seconds: u64 },

    // ─── Retry ──────────────────────────────────────────────────────
    /// All retry attempts have been exhausted.
    #[error("Operation failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        attempts: u32,
        last_error: Box<LinkError>,
    },

    // ─── Protocol ───────────────────────────────────────────────────
    /// The server answered with something we could not understand.
    #[error("Protocol error: {reason}")]
    ProtocolError { reason: String },

    // ─── Config ─────────────────────────────────────────────────────
    /// Configuration file error (missing, malformed, or invalid values).
    #[error("Configuration error: {reason}")]
    ConfigError { reason: String },

    // ─── Transport ──────────────────────────────────────────────────
    /// Low-level WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Low-level HTTP error.
    #[error("HTTP error: {0}")]
    Http(String),

    /// Frame decode/encode error.
    #[error("Image error: {0}")]
    Image(String),

    // ─── I/O ────────────────────────────────────────────────────────
    /// Filesystem or I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[allow(clippy::ref_option)]
fn inference_failure_message(status: &Option<u16>, detail: &str) -> String {
    match status {
        Some(code) => format!("Model error ({code}): {detail}"),
        None => format!("Model request failed: {detail}"),
    }
}

impl LinkError {
    /// Map a `reqwest` error, turning client-side timeouts into [`LinkError::Timeout`].
    ///
    /// reqwest does not report the configured duration, so the caller passes it.
    pub fn from_http(err: reqwest::Error, timeout: std::time::Duration) -> Self {
        if err.is_timeout() {
            LinkError::Timeout {
                seconds: timeout.as_secs(),
            }
        } else {
            LinkError::Http(err.to_string())
        }
    }

    /// Returns `true` if this error is transient and the operation can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            LinkError::Timeout { .. } | LinkError::Http(_) | LinkError::WebSocket(_) => true,
            LinkError::InferenceRequestFailed {
                status: Some(code), ..
            } => *code >= 500,
            _ => false,
        }
    }

    /// Returns `true` if this error means a transport is gone and the user
    /// must reconnect.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            LinkError::ConnectionFailed { .. }
                | LinkError::TransportError { .. }
                | LinkError::SessionClosed
                | LinkError::WebSocket(_)
        )
    }
}

// ─── From impls for external error types ────────────────────────────────

impl From<tokio_tungstenite::tungstenite::Error> for LinkError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        LinkError::WebSocket(err.to_string())
    }
}

impl From<reqwest::Error> for LinkError {
    fn from(err: reqwest::Error) -> Self {
        LinkError::Http(err.to_string())
    }
}

impl From<url::ParseError> for LinkError {
    fn from(err: url::ParseError) -> Self {
        LinkError::ConfigError {
            reason: format!("invalid URL: {err}"),
        }
    }
}

impl From<image::ImageError> for LinkError {
    fn from(err: image::ImageError) -> Self {
        LinkError::Image(err.to_string())
    }
}

#[cfg(feature = "config-toml")]
impl From<toml::de::Error> for LinkError {
    fn from(err: toml::de::Error) -> Self {
        LinkError::ConfigError {
            reason: err.to_string(),
        }
    }
}
