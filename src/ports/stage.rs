//! Capability contracts for the pluggable pipeline stages.
//!
//! The orchestrator only ever talks to stages through these traits. Every
//! stage is shared by all in-flight requests, hence the `Send + Sync` bounds,
//! and every stage can be released through [`Close`].
use std::sync::Arc;

use async_trait::async_trait;

use crate::core::{FallbackStage, RequestContext, StageError};

/// Callback invoked by a backend stage once it has obtained a response.
pub type ResponseObserver = Arc<dyn Fn(&mut RequestContext) + Send + Sync>;

/// Release of the resources held by a stage.
pub trait Close {
    fn close(&self) -> Result<(), StageError> {
        Ok(())
    }
}

/// Rejects malformed requests. Must not block.
pub trait Validate: Close + Send + Sync {
    fn validate(&self, ctx: &RequestContext) -> Result<(), StageError>;
}

/// Admission control. May wait for a bounded time before deciding.
#[async_trait]
pub trait Limit: Close + Send + Sync {
    async fn limit(&self, ctx: &RequestContext) -> Result<(), StageError>;
}

/// Anything that can produce a response for a request.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, ctx: &mut RequestContext);
}

/// Circuit breaker protection around a handler call.
///
/// An `Err` means the breaker refused to run `handler`. Failures of the
/// handler itself are the breaker's business and are not surfaced.
#[async_trait]
pub trait Protect: Close + Send + Sync {
    async fn protect(
        &self,
        ctx: &mut RequestContext,
        handler: &dyn Handler,
    ) -> Result<(), StageError>;
}

/// Request and response adaptation. Total: adaptation never fails.
pub trait Adapt: Close + Send + Sync {
    fn adapt_request(&self, ctx: &mut RequestContext);
    fn adapt_response(&self, ctx: &mut RequestContext);
}

/// Fire-and-forget traffic duplication. Never affects the primary response.
pub trait Mirror: Close + Send + Sync {
    fn handle(&self, ctx: &RequestContext);
}

/// The stage that forwards a request and writes the response.
pub trait Backend: Handler + Close {
    /// Register an observer run after each response obtained by this stage.
    /// Only called while the owning proxy is being built.
    fn on_response_got(&mut self, observer: ResponseObserver);
}

/// Alternate backend selected per request by a side-effect-free predicate.
pub trait CandidateBackend: Backend {
    fn filter(&self, ctx: &RequestContext) -> bool;
}

/// Response compression, attached to backend stages as a response observer.
pub trait Compress: Close + Send + Sync {
    fn compress(&self, ctx: &mut RequestContext);
}

/// Alternate responder consulted on stage failures and after every
/// completed handling phase.
///
/// The responder owns the decision: it may overwrite the response whether or
/// not `err` is set, and it is responsible for cancelling the request with
/// `err` when it declines to serve a fallback.
pub trait Fallback: Close + Send + Sync {
    fn try_fallback(
        &self,
        ctx: &mut RequestContext,
        stage: FallbackStage,
        err: Option<&StageError>,
    );
}
