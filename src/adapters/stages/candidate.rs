use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use http::HeaderName;
use rand::Rng;
use regex::Regex;
use serde::Deserialize;

use super::forward::{Forwarder, UpstreamParams};
use crate::{
    config::StageSpec,
    core::{BuildError, RequestContext, StageSlot},
    ports::{
        http_client::HttpClient,
        stage::{Backend, CandidateBackend, Close, Handler, ResponseObserver},
    },
};

#[derive(Debug, Default, Deserialize)]
struct FilterParams {
    /// Header name to value pattern; every entry must match
    #[serde(default)]
    headers: HashMap<String, String>,
    /// Share of requests, 0 to 100
    #[serde(default)]
    percentage: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct CandidateParams {
    #[serde(flatten)]
    upstream: UpstreamParams,
    #[serde(default)]
    filter: FilterParams,
}

/// Which requests go to the candidate.
struct CandidateFilter {
    headers: Vec<(HeaderName, Regex)>,
    percentage: Option<f64>,
}

impl CandidateFilter {
    fn new(params: FilterParams) -> Result<Self, BuildError> {
        let slot = StageSlot::CandidateBackend;
        let mut headers = params
            .headers
            .into_iter()
            .map(|(name, pattern)| {
                let header = HeaderName::from_bytes(name.as_bytes())
                    .map_err(|e| BuildError::invalid(slot, format!("invalid header '{name}': {e}")))?;
                let regex = Regex::new(&pattern).map_err(|e| {
                    BuildError::invalid(slot, format!("invalid pattern for header '{name}': {e}"))
                })?;
                Ok((header, regex))
            })
            .collect::<Result<Vec<_>, BuildError>>()?;
        headers.sort_by(|a, b| a.0.as_str().cmp(b.0.as_str()));

        if let Some(percentage) = params.percentage {
            if !(0.0..=100.0).contains(&percentage) {
                return Err(BuildError::invalid(
                    slot,
                    format!("percentage must be within 0 and 100, got {percentage}"),
                ));
            }
        }

        Ok(Self {
            headers,
            percentage: params.percentage,
        })
    }

    fn matches(&self, ctx: &RequestContext) -> bool {
        if self.headers.is_empty() && self.percentage.is_none() {
            return false;
        }

        let headers = ctx.request().headers();
        let headers_match = self.headers.iter().all(|(name, regex)| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .is_some_and(|value| regex.is_match(value))
        });
        if !headers_match {
            return false;
        }

        match self.percentage {
            Some(percentage) if percentage >= 100.0 => true,
            Some(percentage) => rand::rng().random_range(0.0..100.0) < percentage,
            None => true,
        }
    }
}

/// Canary backend, chosen per request by header rules and a traffic share.
pub struct HttpCandidateBackend {
    forwarder: Forwarder,
    filter: CandidateFilter,
    observers: Vec<ResponseObserver>,
}

impl HttpCandidateBackend {
    pub fn new(spec: &StageSpec, client: Arc<dyn HttpClient>) -> Result<Self, BuildError> {
        let slot = StageSlot::CandidateBackend;
        let params: CandidateParams = spec.parse_params(slot)?;
        Ok(Self {
            forwarder: Forwarder::new(slot, &params.upstream, client)?,
            filter: CandidateFilter::new(params.filter)?,
            observers: Vec::new(),
        })
    }
}

impl Close for HttpCandidateBackend {}

#[async_trait]
impl Handler for HttpCandidateBackend {
    async fn handle(&self, ctx: &mut RequestContext) {
        self.forwarder.forward(ctx, &self.observers).await;
    }
}

impl Backend for HttpCandidateBackend {
    fn on_response_got(&mut self, observer: ResponseObserver) {
        self.observers.push(observer);
    }
}

impl CandidateBackend for HttpCandidateBackend {
    fn filter(&self, ctx: &RequestContext) -> bool {
        self.filter.matches(ctx)
    }
}
