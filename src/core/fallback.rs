//! Fallback eligibility: who gets to produce the response when a stage fails.
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{
    core::{RequestContext, StageError},
    metrics,
    ports::stage::Fallback,
};

/// Stage that triggered (or completed) the phase a fallback is consulted for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackStage {
    RateLimiter,
    CircuitBreaker,
    Backend,
    CandidateBackend,
}

impl FallbackStage {
    pub const ALL: [FallbackStage; 4] = [
        FallbackStage::RateLimiter,
        FallbackStage::CircuitBreaker,
        FallbackStage::Backend,
        FallbackStage::CandidateBackend,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackStage::RateLimiter => "rate_limiter",
            FallbackStage::CircuitBreaker => "circuit_breaker",
            FallbackStage::Backend => "backend",
            FallbackStage::CandidateBackend => "candidate_backend",
        }
    }
}

impl fmt::Display for FallbackStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Routes stage outcomes to the configured fallback responder, or surfaces
/// errors as cancellation when none is configured.
pub struct FallbackManager {
    proxy: String,
    fallback: Option<Box<dyn Fallback>>,
}

impl FallbackManager {
    pub fn new(proxy: impl Into<String>, fallback: Option<Box<dyn Fallback>>) -> Self {
        Self {
            proxy: proxy.into(),
            fallback,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.fallback.is_some()
    }

    pub fn try_fallback(
        &self,
        ctx: &mut RequestContext,
        stage: FallbackStage,
        err: Option<StageError>,
    ) {
        match &self.fallback {
            Some(fallback) => {
                tracing::debug!(
                    proxy = %self.proxy,
                    %stage,
                    error = err.as_ref().map(tracing::field::display),
                    "consulting fallback"
                );
                metrics::increment_fallback_consulted(&self.proxy, stage);
                fallback.try_fallback(ctx, stage, err.as_ref());
            }
            None => {
                if let Some(err) = err {
                    tracing::debug!(proxy = %self.proxy, %stage, error = %err, "no fallback, cancelling request");
                    ctx.cancel(err);
                }
            }
        }
    }

    pub(crate) fn fallback(&self) -> Option<&dyn Fallback> {
        self.fallback.as_deref()
    }
}
