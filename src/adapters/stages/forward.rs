//! Upstream forwarding shared by the `http` backend, candidate and mirror stages.
use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use http::{HeaderMap, Request, StatusCode, header};
use serde::Deserialize;

use crate::{
    config::{LoadBalanceStrategy, StageSpec},
    core::{BuildError, RequestContext, StageSlot, backend::ServerPool},
    ports::{
        http_client::{HttpClient, HttpClientError},
        stage::ResponseObserver,
    },
};

pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection-scoped headers that must not be forwarded.
const HOP_BY_HOP: [header::HeaderName; 6] = [
    header::CONNECTION,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

const KEEP_ALIVE: &str = "keep-alive";

/// Parameters common to every stage that talks to upstream servers.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct UpstreamParams {
    pub servers: Vec<String>,
    #[serde(default)]
    pub load_balance: LoadBalanceStrategy,
    #[serde(default)]
    pub timeout: Option<String>,
}

impl UpstreamParams {
    pub fn timeout(&self, slot: StageSlot) -> Result<Duration, BuildError> {
        match &self.timeout {
            Some(timeout) => humantime::parse_duration(timeout)
                .map_err(|e| BuildError::invalid(slot, format!("invalid timeout '{timeout}': {e}"))),
            None => Ok(DEFAULT_TIMEOUT),
        }
    }
}

/// Picks a server from the pool and forwards buffered requests to it.
pub(crate) struct Forwarder {
    slot: StageSlot,
    pool: ServerPool,
    client: Arc<dyn HttpClient>,
    timeout: Duration,
}

impl Forwarder {
    pub fn new(
        slot: StageSlot,
        params: &UpstreamParams,
        client: Arc<dyn HttpClient>,
    ) -> Result<Self, BuildError> {
        let pool = ServerPool::new(&params.servers, params.load_balance)
            .map_err(|e| BuildError::invalid(slot, e.to_string()))?;
        Ok(Self {
            slot,
            pool,
            client,
            timeout: params.timeout(slot)?,
        })
    }

    pub fn from_spec(
        slot: StageSlot,
        spec: &StageSpec,
        client: Arc<dyn HttpClient>,
    ) -> Result<Self, BuildError> {
        let params: UpstreamParams = spec.parse_params(slot)?;
        Self::new(slot, &params, client)
    }

    /// Copy of the inbound request addressed to the next server of the pool.
    pub fn upstream_request(&self, request: &Request<Bytes>) -> Result<Request<Bytes>, HttpClientError> {
        let server = self
            .pool
            .next()
            .ok_or_else(|| HttpClientError::InvalidRequest("no upstream server".to_string()))?;
        let path_and_query = request
            .uri()
            .path_and_query()
            .map_or("/", |pq| pq.as_str());
        let uri = server
            .join(path_and_query)
            .map_err(|e| HttpClientError::InvalidRequest(e.to_string()))?;

        let mut upstream = Request::builder()
            .method(request.method().clone())
            .uri(uri)
            .body(request.body().clone())
            .map_err(|e| HttpClientError::InvalidRequest(e.to_string()))?;
        *upstream.headers_mut() = strip_hop_by_hop(request.headers().clone());
        Ok(upstream)
    }

    /// Send a request under the configured timeout.
    pub async fn send(
        client: &dyn HttpClient,
        request: Request<Bytes>,
        timeout: Duration,
    ) -> Result<http::Response<Bytes>, HttpClientError> {
        match tokio::time::timeout(timeout, client.send_request(request)).await {
            Ok(result) => result,
            Err(_) => Err(HttpClientError::Timeout(timeout)),
        }
    }

    pub fn client(&self) -> Arc<dyn HttpClient> {
        Arc::clone(&self.client)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Forward the request of `ctx` and write the upstream response into it.
    ///
    /// A connection failure yields 502 and a timeout 504; observers only run
    /// when an upstream response was obtained.
    pub async fn forward(&self, ctx: &mut RequestContext, observers: &[ResponseObserver]) {
        let result = match self.upstream_request(ctx.request()) {
            Ok(request) => Self::send(&*self.client, request, self.timeout).await,
            Err(err) => Err(err),
        };

        match result {
            Ok(response) => {
                let (parts, body) = response.into_parts();
                let state = ctx.response_mut();
                state.set_status(parts.status);
                state.headers_mut().extend(strip_hop_by_hop(parts.headers));
                state.set_body(body);

                for observer in observers {
                    observer(&mut *ctx);
                }
            }
            Err(err) => {
                let status = match err {
                    HttpClientError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
                    _ => StatusCode::BAD_GATEWAY,
                };
                tracing::warn!(slot = %self.slot, error = %err, status = status.as_u16(), "upstream request failed");
                ctx.response_mut().set_status(status);
            }
        }
    }
}

/// Drop connection-scoped headers, including those the `Connection` header
/// itself nominates.
fn strip_hop_by_hop(mut headers: HeaderMap) -> HeaderMap {
    let nominated: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();
    for name in nominated {
        headers.remove(name.as_str());
    }
    for name in &HOP_BY_HOP {
        headers.remove(name);
    }
    headers.remove(KEEP_ALIVE);
    headers
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use http::Response;

    use super::*;
    use crate::ports::http_client::HttpClientResult;

    /// Records every request and answers with a fixed status and body.
    pub struct RecordingClient {
        pub status: StatusCode,
        pub body: &'static str,
        pub fail: bool,
        pub requests: Mutex<Vec<Request<Bytes>>>,
    }

    impl RecordingClient {
        pub fn ok(body: &'static str) -> Arc<Self> {
            Arc::new(Self {
                status: StatusCode::OK,
                body,
                fail: false,
                requests: Mutex::new(Vec::new()),
            })
        }

        pub fn failing() -> Arc<Self> {
            Arc::new(Self {
                status: StatusCode::OK,
                body: "",
                fail: true,
                requests: Mutex::new(Vec::new()),
            })
        }

        pub fn uris(&self) -> Vec<String> {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .map(|req| req.uri().to_string())
                .collect()
        }
    }

    #[async_trait]
    impl HttpClient for RecordingClient {
        async fn send_request(&self, req: Request<Bytes>) -> HttpClientResult<Response<Bytes>> {
            self.requests.lock().unwrap().push(req);
            if self.fail {
                return Err(HttpClientError::ConnectionError("refused".to_string()));
            }
            Ok(Response::builder()
                .status(self.status)
                .header("x-upstream", "recording")
                .header(header::CONNECTION, "close, x-upstream-conn")
                .header("keep-alive", "timeout=5")
                .header("x-upstream-conn", "pooled")
                .body(Bytes::from_static(self.body.as_bytes()))
                .unwrap())
        }
    }

    pub fn ctx(uri: &str) -> RequestContext {
        RequestContext::new(
            Request::builder()
                .uri(uri)
                .header(header::CONNECTION, "keep-alive")
                .header("x-trace", "abc")
                .body(Bytes::from_static(b"payload"))
                .unwrap(),
        )
    }
}
