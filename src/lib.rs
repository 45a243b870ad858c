//! httpproxy - request orchestration core of an HTTP traffic gateway.
//!
//! For every inbound request an [`HttpProxy`] runs a fixed pipeline of
//! optional stages (validation, rate limiting, request adaptation,
//! mirroring, candidate routing, circuit breaking, response adaptation and
//! compression) and decides, whenever a stage fails, whether a fallback
//! responder produces the response instead.
//!
//! # Quick Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use httpproxy::{HttpClientAdapter, ProxyController, StageRegistry, config::load_config};
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let config = load_config("proxy.yaml").await?;
//! let registry = StageRegistry::with_builtins(Arc::new(HttpClientAdapter::new()?));
//! let controller = ProxyController::new(&config, Arc::new(registry))?;
//! let _ticker = controller.spawn_rate_ticker();
//!
//! // for each request accepted by the transport:
//! # let request = http::Request::new(bytes::Bytes::new());
//! let mut ctx = httpproxy::RequestContext::new(request);
//! controller.load().handle(&mut ctx).await;
//! let _response = ctx.finish();
//!
//! controller.shutdown().await;
//! # Ok(()) }
//! ```
//!
//! # Architecture
//! Stage contracts live in [`ports`] as traits; [`core`] holds the
//! orchestrator, the fallback policy and the lifecycle; [`adapters`] provides
//! the hyper client and the built-in stage kinds. Stage kinds are resolved
//! through an explicit [`StageRegistry`], so embedders add their own circuit
//! breaker or compression stage by registering a factory.
//!
//! # Error Handling
//! Stage outcomes are [`StageError`] values carried as the request's
//! cancellation reason. Construction reports [`BuildError`], and application
//! edges (configuration loading, reload) return `eyre::Result` with context
//! attached through `WrapErr`.
pub mod adapters;
pub mod config;
pub mod core;
pub mod metrics;
pub mod ports;
pub mod tracing_setup;

pub use crate::{
    adapters::HttpClientAdapter,
    core::{
        BuildError, FallbackStage, HttpProxy, ProxyController, RequestContext, Runtime,
        StageError, StageRegistry, StageSlot,
    },
    ports::http_client::HttpClient,
};
