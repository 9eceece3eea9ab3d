//! Error taxonomy for the dispatch engine.
//!
//! # Responsibilities
//! - Classify failures as client faults, upstream faults, or internal faults
//! - Decide which error messages may be shown to the client
//! - Carry a final state snapshot on the observability channel

use hyper::StatusCode;
use thiserror::Error;

use crate::engine::context::State;

/// Failure raised by the upstream connector while contacting the origin or
/// the chained proxy. The message is the flattened source chain of the
/// underlying error so clients see "connection refused" rather than a
/// generic wrapper.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct UpstreamError {
    message: String,
}

impl UpstreamError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Build from any error, flattening its source chain into the message.
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut message = err.to_string();
        let mut source = err.source();
        while let Some(err) = source {
            message.push_str(": ");
            message.push_str(&err.to_string());
            source = err.source();
        }
        Self { message }
    }
}

impl From<std::io::Error> for UpstreamError {
    fn from(err: std::io::Error) -> Self {
        Self {
            message: err.to_string(),
        }
    }
}

/// Error raised inside the middleware chain.
///
/// `Client` and `Upstream` are exposed: their message is returned to the
/// client verbatim. `Internal` is never exposed; the client only sees the
/// status code.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The client sent something unusable (malformed target URI, host:port).
    #[error("{message}")]
    Client { status: StatusCode, message: String },

    /// The upstream connector failed during request or connect.
    #[error("{0}")]
    Upstream(#[from] UpstreamError),

    /// Anything else thrown inside a middleware.
    #[error("{0}")]
    Internal(String),
}

impl ProxyError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::Client {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Client { status, .. } => *status,
            Self::Upstream(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the message is safe to return to the client.
    pub fn exposed(&self) -> bool {
        !matches!(self, Self::Internal(_))
    }
}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

/// Delivered on the engine's error channel for every failure, whether or not
/// the message was exposed to the client.
#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub status: u16,
    pub exposed: bool,
    pub message: String,
    /// Snapshot of the context state at the time the error surfaced.
    pub state: State,
}
