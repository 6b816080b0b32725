//! Client error types.

use std::sync::Arc;

use thiserror::Error;

use crate::resolver::ResolveError;
use crate::stream::StreamError;

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors that can occur when talking to the backend service.
#[derive(Debug, Error)]
pub enum ClientError {
    /// HTTP request failed.
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Server returned a non-success status.
    #[error("api error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Server answered 200 with `success: false`.
    #[error("backend error: {0}")]
    Backend(String),

    /// Streaming endpoint refused the request before any frame arrived,
    /// or failed mid-stream.
    #[error(transparent)]
    Stream(#[from] StreamError),

    /// The backend address could not be resolved in time.
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    /// A failure settled by a coalesced fetch shared with other callers.
    #[error(transparent)]
    Shared(#[from] Arc<ClientError>),
}
