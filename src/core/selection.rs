use async_trait::async_trait;

use crate::{
    core::{FallbackStage, RequestContext},
    ports::stage::{Backend, CandidateBackend, Handler},
};

/// Backend chosen for one request, with the tag used for fallback bookkeeping.
#[derive(Clone, Copy)]
pub enum Selected<'a> {
    Backend(&'a dyn Backend),
    Candidate(&'a dyn CandidateBackend),
}

impl Selected<'_> {
    pub fn tag(&self) -> FallbackStage {
        match self {
            Selected::Backend(_) => FallbackStage::Backend,
            Selected::Candidate(_) => FallbackStage::CandidateBackend,
        }
    }
}

#[async_trait]
impl Handler for Selected<'_> {
    async fn handle(&self, ctx: &mut RequestContext) {
        match self {
            Selected::Backend(backend) => backend.handle(ctx).await,
            Selected::Candidate(candidate) => candidate.handle(ctx).await,
        }
    }
}

/// The candidate wins iff it is configured and its filter accepts the
/// request; otherwise the default backend handles it.
pub fn select_backend<'a>(
    backend: &'a dyn Backend,
    candidate: Option<&'a dyn CandidateBackend>,
    ctx: &RequestContext,
) -> Selected<'a> {
    match candidate {
        Some(candidate) if candidate.filter(ctx) => Selected::Candidate(candidate),
        _ => Selected::Backend(backend),
    }
}
