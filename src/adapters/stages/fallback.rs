use std::collections::BTreeMap;

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use serde::Deserialize;

use crate::{
    config::StageSpec,
    core::{BuildError, FallbackStage, RequestContext, StageError, StageSlot},
    ports::stage::{Close, Fallback},
};

fn default_mock_code() -> u16 {
    200
}

fn default_for_stages() -> Vec<FallbackStage> {
    FallbackStage::ALL.to_vec()
}

#[derive(Debug, Deserialize)]
struct MockParams {
    #[serde(default = "default_mock_code")]
    mock_code: u16,
    #[serde(default)]
    mock_headers: BTreeMap<String, String>,
    #[serde(default)]
    mock_body: String,
    #[serde(default = "default_for_stages")]
    for_stages: Vec<FallbackStage>,
    /// Upstream statuses that trigger the mock after a completed call
    #[serde(default)]
    for_codes: Vec<u16>,
}

/// Serves a static response instead of a failed or unwanted one.
///
/// On a stage error the mock is served when the stage is listed, and the
/// error cancels the request otherwise. After a completed backend call the
/// mock replaces the response only when its status is listed in `for_codes`.
pub struct MockFallback {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    for_stages: Vec<FallbackStage>,
    for_codes: Vec<StatusCode>,
}

impl MockFallback {
    pub fn new(spec: &StageSpec) -> Result<Self, BuildError> {
        let slot = StageSlot::Fallback;
        let params: MockParams = spec.parse_params(slot)?;

        let status = StatusCode::from_u16(params.mock_code)
            .map_err(|_| BuildError::invalid(slot, format!("invalid mock_code {}", params.mock_code)))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &params.mock_headers {
            let header = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| BuildError::invalid(slot, format!("invalid header '{name}': {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| BuildError::invalid(slot, format!("invalid value for '{name}': {e}")))?;
            headers.insert(header, value);
        }

        let for_codes = params
            .for_codes
            .iter()
            .map(|code| {
                StatusCode::from_u16(*code)
                    .map_err(|_| BuildError::invalid(slot, format!("invalid status in for_codes: {code}")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            status,
            headers,
            body: Bytes::from(params.mock_body),
            for_stages: params.for_stages,
            for_codes,
        })
    }

    fn serve(&self, ctx: &mut RequestContext) {
        let response = ctx.response_mut();
        response.set_status(self.status);
        *response.headers_mut() = self.headers.clone();
        response.set_body(self.body.clone());
    }
}

impl Close for MockFallback {}

impl Fallback for MockFallback {
    fn try_fallback(
        &self,
        ctx: &mut RequestContext,
        stage: FallbackStage,
        err: Option<&StageError>,
    ) {
        let eligible = self.for_stages.contains(&stage);
        match err {
            Some(err) if eligible => {
                tracing::info!(%stage, error = %err, status = self.status.as_u16(), "serving mock fallback");
                self.serve(ctx);
            }
            Some(err) => {
                ctx.cancel(err.clone());
            }
            None if eligible && self.for_codes.contains(&ctx.response().status()) => {
                tracing::info!(
                    %stage,
                    upstream_status = ctx.response().status().as_u16(),
                    status = self.status.as_u16(),
                    "replacing upstream response with mock fallback"
                );
                self.serve(ctx);
            }
            None => {}
        }
    }
}
