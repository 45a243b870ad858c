pub mod http_client;
pub mod stages;

/// Re-export commonly used types from adapters
pub use http_client::HttpClientAdapter;
