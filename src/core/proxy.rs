//! The request orchestrator.
//!
//! [`HttpProxy::handle`] drives one request through three phases:
//!
//! 1. pre-handle: validation, rate limiting, request adaptation, mirroring
//! 2. handle: backend selection and invocation, optionally behind the
//!    circuit breaker, followed by a fallback consultation
//! 3. post-handle: response adaptation
//!
//! A cancelled request never enters a later phase. The proxy holds no
//! per-request state, so one instance serves any number of concurrent
//! requests.
use std::sync::Arc;

use http::StatusCode;
use tracing::Instrument;

use crate::{
    core::{
        FallbackManager, FallbackStage, RequestContext, StageError, rate::RateCounter,
        selection::{Selected, select_backend},
    },
    metrics,
    ports::stage::{
        Adapt, Backend, CandidateBackend, Compress, Handler, Limit, Mirror, Protect, Validate,
    },
    tracing_setup,
};

/// How the pre-handle phase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PhaseOutcome {
    Continue,
    /// The request already has its final response (or was cancelled).
    Stop,
}

/// One HTTP proxy built from a [`ProxyConfig`](crate::config::ProxyConfig).
///
/// Owns at most one instance of each optional stage and exactly one backend.
/// Built by [`HttpProxy::new`] and released by [`HttpProxy::close`].
pub struct HttpProxy {
    pub(crate) name: Arc<str>,
    pub(crate) rate: Arc<RateCounter>,

    pub(crate) fallback: FallbackManager,

    pub(crate) validator: Option<Box<dyn Validate>>,
    pub(crate) rate_limiter: Option<Box<dyn Limit>>,
    pub(crate) circuit_breaker: Option<Box<dyn Protect>>,
    pub(crate) adaptor: Option<Box<dyn Adapt>>,
    pub(crate) mirror_backend: Option<Box<dyn Mirror>>,
    pub(crate) candidate_backend: Option<Box<dyn CandidateBackend>>,
    pub(crate) backend: Box<dyn Backend>,
    pub(crate) compression: Option<Arc<dyn Compress>>,
}

impl HttpProxy {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Request rate counter shared with the runtime this proxy was built on.
    pub fn rate(&self) -> &RateCounter {
        &self.rate
    }

    /// Run the pipeline for one request. All outcomes are expressed through
    /// the response state and cancellation flag of `ctx`.
    pub async fn handle(&self, ctx: &mut RequestContext) {
        let span = tracing_setup::create_request_span(
            &self.name,
            ctx.request().method().as_str(),
            ctx.request().uri().path(),
        );

        async {
            let rate = Arc::clone(&self.rate);
            let name = Arc::clone(&self.name);
            ctx.on_finish(move |ctx| {
                rate.update(1);
                metrics::increment_request_total(&name, ctx.response().status().as_u16());
            });

            if self.pre_handle(ctx).await == PhaseOutcome::Stop || ctx.is_cancelled() {
                return;
            }

            self.handle_backend(ctx).await;
            if ctx.is_cancelled() {
                return;
            }

            self.post_handle(ctx);
        }
        .instrument(span)
        .await
    }

    async fn pre_handle(&self, ctx: &mut RequestContext) -> PhaseOutcome {
        if let Some(validator) = &self.validator {
            if let Err(err) = validator.validate(ctx) {
                // Invalid traffic is never eligible for fallback.
                tracing::debug!(error = %err, "request rejected by validator");
                metrics::increment_stage_rejection(&self.name, "validator");
                ctx.response_mut().set_status(StatusCode::BAD_REQUEST);
                ctx.cancel(StageError::ValidateFailed(err.to_string()));
                return PhaseOutcome::Stop;
            }
        }

        if let Some(rate_limiter) = &self.rate_limiter {
            if let Err(err) = rate_limiter.limit(ctx).await {
                tracing::debug!(error = %err, "request rejected by rate limiter");
                metrics::increment_stage_rejection(&self.name, "rate_limiter");
                ctx.response_mut().set_status(StatusCode::TOO_MANY_REQUESTS);
                self.fallback
                    .try_fallback(ctx, FallbackStage::RateLimiter, Some(err));
                // Whatever the fallback decided, the request goes no further.
                return PhaseOutcome::Stop;
            }
        }

        if let Some(adaptor) = &self.adaptor {
            adaptor.adapt_request(ctx);
        }

        if let Some(mirror) = &self.mirror_backend {
            mirror.handle(ctx);
        }

        PhaseOutcome::Continue
    }

    /// Pick the handler for this request: the candidate backend when it is
    /// configured and accepts the request, the default backend otherwise.
    pub fn select_backend(&self, ctx: &RequestContext) -> Selected<'_> {
        select_backend(&*self.backend, self.candidate_backend.as_deref(), ctx)
    }

    async fn handle_backend(&self, ctx: &mut RequestContext) {
        let selected = self.select_backend(ctx);
        let stage = selected.tag();
        tracing::debug!(%stage, "selected backend");

        match &self.circuit_breaker {
            Some(circuit_breaker) => match circuit_breaker.protect(ctx, &selected).await {
                Err(err) => {
                    tracing::debug!(error = %err, "call rejected by circuit breaker");
                    metrics::increment_stage_rejection(&self.name, "circuit_breaker");
                    ctx.response_mut()
                        .set_status(StatusCode::SERVICE_UNAVAILABLE);
                    self.fallback
                        .try_fallback(ctx, FallbackStage::CircuitBreaker, Some(err));
                }
                Ok(()) => self.fallback.try_fallback(ctx, stage, None),
            },
            None => {
                selected.handle(ctx).await;
                // Consulted after every completed attempt so the fallback can
                // judge the response itself.
                self.fallback.try_fallback(ctx, stage, None);
            }
        }
    }

    fn post_handle(&self, ctx: &mut RequestContext) {
        if let Some(adaptor) = &self.adaptor {
            adaptor.adapt_response(ctx);
        }
    }
}
