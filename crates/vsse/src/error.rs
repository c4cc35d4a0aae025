//! Error taxonomy for the SSE client.
//!
//! Configuration problems are fatal and surface synchronously from
//! [`SseClient::post_and_listen`](crate::SseClient::post_and_listen).
//! Transport, stall and stream errors are recovered inside the connection
//! driver by reconnecting; they only reach callers as a terminal callback
//! event once the reconnect ceiling is exhausted.

use std::time::Duration;

use thiserror::Error;

/// The main result type used throughout the crate.
pub type TransportResult<T> = Result<T, TransportError>;

/// Comprehensive error type for all client operations.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Missing or invalid required configuration.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// The SSE url or a resolved trigger url could not be parsed.
    #[error("Invalid URL '{url}': {message}")]
    InvalidUrl { url: String, message: String },

    /// A configured or per-call header name or value is not valid HTTP.
    #[error("Invalid header '{name}': {message}")]
    InvalidHeader { name: String, message: String },

    /// HTTP request errors (wraps reqwest::Error)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-2xx response to a trigger request.
    #[error("API error: status={status}, body={body}")]
    Api {
        status: http::StatusCode,
        body: String,
    },

    /// Non-2xx response to the SSE handshake.
    #[error("SSE handshake rejected with status {status}")]
    SseInvalidStatus { status: http::StatusCode },

    /// The SSE endpoint answered with something other than `text/event-stream`.
    #[error("SSE endpoint returned content-type '{content_type}'")]
    SseInvalidContentType { content_type: String },

    /// The server closed the event stream.
    #[error("SSE stream ended")]
    SseStreamEnded,

    /// A single event payload could not be parsed. The event is dropped.
    #[error("Malformed event payload: {message}")]
    Parse { message: String },

    /// No activity arrived within the heartbeat threshold.
    #[error("Connection stalled: no activity for {silence:?}")]
    Stalled { silence: Duration },

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Timeout errors
    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    /// The client or its background task has shut down.
    #[error("Connection closed{}", reason.as_ref().map(|r| format!(": {r}")).unwrap_or_default())]
    ConnectionClosed { reason: Option<String> },

    /// The reconnect ceiling was reached.
    #[error("Gave up after {attempts} reconnect attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    /// Too many requests are awaiting events.
    #[error("Capacity exceeded: {message}")]
    CapacityExceeded { message: String },
}

impl TransportError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an invalid url error.
    pub fn invalid_url(url: impl Into<String>, message: impl ToString) -> Self {
        Self::InvalidUrl {
            url: url.into(),
            message: message.to_string(),
        }
    }

    /// Create an invalid header error.
    pub fn invalid_header(name: impl Into<String>, message: impl ToString) -> Self {
        Self::InvalidHeader {
            name: name.into(),
            message: message.to_string(),
        }
    }

    /// Create an API error.
    pub fn api(status: http::StatusCode, body: impl Into<String>) -> Self {
        Self::Api {
            status,
            body: body.into(),
        }
    }

    pub fn sse_invalid_status(status: http::StatusCode) -> Self {
        Self::SseInvalidStatus { status }
    }

    pub fn sse_invalid_content_type(content_type: impl Into<String>) -> Self {
        Self::SseInvalidContentType {
            content_type: content_type.into(),
        }
    }

    pub fn sse_stream_ended() -> Self {
        Self::SseStreamEnded
    }

    /// Create an event payload parse error.
    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
        }
    }

    /// Create a heartbeat stall error.
    pub fn stalled(silence: Duration) -> Self {
        Self::Stalled { silence }
    }

    /// Create a timeout error.
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout { duration }
    }

    /// Create a connection closed error.
    pub fn connection_closed(reason: Option<String>) -> Self {
        Self::ConnectionClosed { reason }
    }

    pub fn retries_exhausted(attempts: u32, last_error: impl ToString) -> Self {
        Self::RetriesExhausted {
            attempts,
            last_error: last_error.to_string(),
        }
    }

    /// Create a capacity exceeded error.
    pub fn capacity_exceeded(message: impl Into<String>) -> Self {
        Self::CapacityExceeded {
            message: message.into(),
        }
    }

    /// Whether the connection driver should recover from this error by
    /// reconnecting.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::Config { .. }
                | Self::InvalidUrl { .. }
                | Self::InvalidHeader { .. }
                | Self::RetriesExhausted { .. }
        )
    }
}
