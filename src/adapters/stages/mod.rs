//! Built-in stage kinds.
//!
//! | slot | kind |
//! |---|---|
//! | fallback | `mock` |
//! | validator | `headers` |
//! | rate_limiter | `governor` |
//! | adaptor | `headers` |
//! | mirror_backend | `http` |
//! | candidate_backend | `http` |
//! | backend | `http` |
//!
//! Circuit breaker and compression have no built-in kind; embedders register
//! their own on the registry returned by [`StageRegistry::with_builtins`].
pub mod adaptor;
pub mod backend;
pub mod candidate;
pub mod fallback;
mod forward;
pub mod mirror;
pub mod rate_limiter;
pub mod validator;

use std::sync::Arc;

pub use adaptor::HeaderAdaptor;
pub use backend::HttpBackend;
pub use candidate::HttpCandidateBackend;
pub use fallback::MockFallback;
pub use mirror::HttpMirror;
pub use rate_limiter::GovernorRateLimiter;
pub use validator::HeaderValidator;

use crate::{
    core::StageRegistry,
    ports::{
        http_client::HttpClient,
        stage::{Adapt, Backend, CandidateBackend, Fallback, Limit, Mirror, Validate},
    },
};

impl StageRegistry {
    /// A registry holding every built-in kind. Upstream stages send their
    /// traffic through `client`.
    pub fn with_builtins(client: Arc<dyn HttpClient>) -> Self {
        let mut registry = Self::new();

        registry
            .register_fallback("mock", |spec, _| {
                Ok(Box::new(MockFallback::new(spec)?) as Box<dyn Fallback>)
            })
            .register_validator("headers", |spec, _| {
                Ok(Box::new(HeaderValidator::new(spec)?) as Box<dyn Validate>)
            })
            .register_rate_limiter("governor", |spec, runtime| {
                Ok(Box::new(GovernorRateLimiter::new(spec, runtime)?) as Box<dyn Limit>)
            })
            .register_adaptor("headers", |spec, _| {
                Ok(Box::new(HeaderAdaptor::new(spec)?) as Box<dyn Adapt>)
            });

        let mirror_client = Arc::clone(&client);
        let candidate_client = Arc::clone(&client);
        registry
            .register_mirror_backend("http", move |spec, _| {
                Ok(Box::new(HttpMirror::new(spec, Arc::clone(&mirror_client))?) as Box<dyn Mirror>)
            })
            .register_candidate_backend("http", move |spec, _| {
                Ok(Box::new(HttpCandidateBackend::new(spec, Arc::clone(&candidate_client))?)
                    as Box<dyn CandidateBackend>)
            })
            .register_backend("http", move |spec, _| {
                Ok(Box::new(HttpBackend::new(spec, Arc::clone(&client))?) as Box<dyn Backend>)
            });

        registry
    }
}
