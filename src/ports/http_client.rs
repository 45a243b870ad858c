use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response};
use thiserror::Error;

/// Custom error type for HTTP client operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpClientError {
    /// Error when connection to backend fails
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Error when request times out
    #[error("Timeout error after {}", humantime::format_duration(*.0))]
    Timeout(Duration),

    /// Error when request is invalid
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Error while reading the backend response body
    #[error("Failed to read response body: {0}")]
    Body(String),
}

/// Result type alias for HTTP client operations
pub type HttpClientResult<T> = Result<T, HttpClientError>;

/// HttpClient defines the port (interface) for making HTTP requests to backends
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    /// Send a fully buffered request and return the fully buffered response.
    ///
    /// The request URI must be absolute. Status codes are not interpreted:
    /// any response the backend produced is `Ok`.
    async fn send_request(&self, req: Request<Bytes>) -> HttpClientResult<Response<Bytes>>;
}
