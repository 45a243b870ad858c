use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use rand::Rng;
use serde::Deserialize;

use super::forward::{Forwarder, UpstreamParams};
use crate::{
    config::StageSpec,
    core::{BuildError, RequestContext, StageSlot},
    ports::{
        http_client::HttpClient,
        stage::{Close, Mirror},
    },
};

fn default_percentage() -> f64 {
    100.0
}

#[derive(Debug, Deserialize)]
struct MirrorParams {
    #[serde(flatten)]
    upstream: UpstreamParams,
    #[serde(default = "default_percentage")]
    percentage: f64,
}

/// Sends a copy of a share of the traffic to a shadow server pool.
///
/// Copies are sent on detached tasks; their responses and errors are only
/// logged and never reach the client.
pub struct HttpMirror {
    forwarder: Forwarder,
    percentage: f64,
    in_flight: Arc<AtomicUsize>,
}

impl HttpMirror {
    pub fn new(spec: &StageSpec, client: Arc<dyn HttpClient>) -> Result<Self, BuildError> {
        let slot = StageSlot::MirrorBackend;
        let params: MirrorParams = spec.parse_params(slot)?;
        if !(0.0..=100.0).contains(&params.percentage) {
            return Err(BuildError::invalid(
                slot,
                format!("percentage must be within 0 and 100, got {}", params.percentage),
            ));
        }

        Ok(Self {
            forwarder: Forwarder::new(slot, &params.upstream, client)?,
            percentage: params.percentage,
            in_flight: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn sampled(&self) -> bool {
        self.percentage >= 100.0 || rand::rng().random_range(0.0..100.0) < self.percentage
    }
}

impl Close for HttpMirror {
    fn close(&self) -> Result<(), crate::core::StageError> {
        let in_flight = self.in_flight.load(Ordering::Relaxed);
        if in_flight > 0 {
            tracing::debug!(in_flight, "closing mirror with copies still in flight");
        }
        Ok(())
    }
}

impl Mirror for HttpMirror {
    fn handle(&self, ctx: &RequestContext) {
        if !self.sampled() {
            return;
        }

        let request = match self.forwarder.upstream_request(ctx.request()) {
            Ok(request) => request,
            Err(err) => {
                tracing::debug!(error = %err, "cannot build mirror request");
                return;
            }
        };

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("no tokio runtime, mirror copy dropped");
            return;
        };

        let client = self.forwarder.client();
        let timeout = self.forwarder.timeout();
        let in_flight = Arc::clone(&self.in_flight);
        in_flight.fetch_add(1, Ordering::Relaxed);

        runtime.spawn(async move {
            let uri = request.uri().clone();
            match Forwarder::send(&*client, request, timeout).await {
                Ok(response) => {
                    tracing::debug!(%uri, status = response.status().as_u16(), "mirror copy answered")
                }
                Err(err) => tracing::debug!(%uri, error = %err, "mirror copy failed"),
            }
            in_flight.fetch_sub(1, Ordering::Relaxed);
        });
    }
}
