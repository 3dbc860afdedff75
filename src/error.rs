//! Error types for the proxy.

use axum::http::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ProxyError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Invalid inbound body: {message}")]
    InvalidInboundBody { message: String },

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Malformed payload at '{path}': {reason}")]
    MalformedPayload { path: String, reason: String },

    #[error("Upstream transport failed after {attempts} attempt(s): {message}")]
    UpstreamTransport { attempts: u32, message: String },

    #[error("Upstream returned status {status}")]
    UpstreamHttp { status: u16 },

    #[error("Request timed out or was cancelled")]
    RequestTimeout,

    #[error("Proxy is shutting down")]
    ShuttingDown,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl ProxyError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    pub fn invalid_body(msg: impl Into<String>) -> Self {
        Self::InvalidInboundBody {
            message: msg.into(),
        }
    }

    pub fn malformed(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedPayload {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Status code the inbound caller sees for this error.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidInboundBody { .. } => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::RequestTimeout => StatusCode::REQUEST_TIMEOUT,
            Self::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            Self::UpstreamHttp { status } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
