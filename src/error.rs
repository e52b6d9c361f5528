//! Error types for the reqwest-proxy-rotator crate.

use crate::proxy::Protocol;
use thiserror::Error;

/// Errors raised by the pool and its configuration.
///
/// Network failures seen while sending requests are not represented here:
/// they are fed back into proxy health and the transport's own error reaches
/// the caller untouched.
#[derive(Debug, Error)]
pub enum Error {
    /// The pool was constructed from an empty proxy list.
    #[error("proxy list is empty; add proxies or disable rotation")]
    EmptyPool,

    /// The selected proxy has no usable port for the requested protocol.
    #[error("proxy port is missing for protocol={protocol} host={host}")]
    MissingPort { protocol: Protocol, host: String },

    /// A per-proxy request rate that is not finite and positive.
    #[error("invalid per-proxy request rate: {0}")]
    InvalidRateLimit(f64),

    /// A base URL or request path could not be resolved.
    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Reading a proxy list from disk failed.
    #[error("failed to read proxy list: {0}")]
    Io(#[from] std::io::Error),

    /// A proxy list was not valid JSON.
    #[error("failed to parse proxy list: {0}")]
    Json(#[from] serde_json::Error),

    /// Fetching a proxy list or building an HTTP client failed.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl From<Error> for reqwest_middleware::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Http(e) => reqwest_middleware::Error::Reqwest(e),
            other => reqwest_middleware::Error::Middleware(anyhow::Error::new(other)),
        }
    }
}
