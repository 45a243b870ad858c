use std::{fmt, str::FromStr};

use http::Uri;
use thiserror::Error;

use crate::{
    config::LoadBalanceStrategy,
    core::load_balancer::{LoadBalancerFactory, LoadBalancingStrategy},
};

/// Errors related to backend servers
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BackendError {
    /// Error when URL is invalid
    #[error("Invalid backend URL: {0}")]
    InvalidUrl(String),

    /// A server pool needs at least one server
    #[error("Server pool is empty")]
    EmptyPool,
}

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// A type-safe representation of a backend URL
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendUrl {
    /// The base URL, without trailing slash
    url: String,
    /// Whether the URL is secure (HTTPS)
    is_secure: bool,
}

impl BackendUrl {
    /// Creates a new BackendUrl if the provided string is a valid http(s) URL
    pub fn new(url: &str) -> BackendResult<Self> {
        let is_secure = url.starts_with("https://");
        let is_http = url.starts_with("http://");

        if !is_secure && !is_http {
            return Err(BackendError::InvalidUrl(format!(
                "Backend URL must start with http:// or https://, got: {url}"
            )));
        }

        let url = url.trim_end_matches('/');
        url.parse::<Uri>()
            .map_err(|e| BackendError::InvalidUrl(format!("{url}: {e}")))?;

        Ok(BackendUrl {
            url: url.to_string(),
            is_secure,
        })
    }

    /// Get the underlying URL as a string reference
    pub fn as_str(&self) -> &str {
        &self.url
    }

    /// Check if the URL is using HTTPS
    pub fn is_secure(&self) -> bool {
        self.is_secure
    }

    /// Target URI for forwarding a request with the given path and query.
    pub fn join(&self, path_and_query: &str) -> BackendResult<Uri> {
        let joined = if path_and_query.starts_with('/') {
            format!("{}{path_and_query}", self.url)
        } else {
            format!("{}/{path_and_query}", self.url)
        };
        joined
            .parse::<Uri>()
            .map_err(|e| BackendError::InvalidUrl(format!("{joined}: {e}")))
    }
}

impl FromStr for BackendUrl {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BackendUrl::new(s)
    }
}

impl fmt::Display for BackendUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url)
    }
}

/// Set of interchangeable servers with a load-balancing strategy.
pub struct ServerPool {
    servers: Vec<BackendUrl>,
    strategy: Box<dyn LoadBalancingStrategy>,
}

impl ServerPool {
    pub fn new(servers: &[String], strategy: LoadBalanceStrategy) -> BackendResult<Self> {
        if servers.is_empty() {
            return Err(BackendError::EmptyPool);
        }
        let servers = servers
            .iter()
            .map(|server| BackendUrl::new(server))
            .collect::<BackendResult<Vec<_>>>()?;

        Ok(Self {
            servers,
            strategy: LoadBalancerFactory::create_strategy(strategy),
        })
    }

    pub fn servers(&self) -> &[BackendUrl] {
        &self.servers
    }

    /// Next server according to the pool strategy.
    pub fn next(&self) -> Option<&BackendUrl> {
        self.strategy
            .select_index(self.servers.len())
            .and_then(|index| self.servers.get(index))
    }
}
