use async_trait::async_trait;
use bytes::Bytes;
use eyre::Result;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::{Request, Response, Version, header, header::HeaderValue};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use rustls_native_certs::load_native_certs;

use crate::ports::http_client::{HttpClient, HttpClientError, HttpClientResult};

/// Largest upstream response body buffered by default.
pub const DEFAULT_MAX_RESPONSE_BODY: usize = 16 * 1024 * 1024;

/// HTTP client adapter using Hyper with Rustls.
///
/// Buffers request and response bodies so that stages can inspect and
/// rewrite them. Timeouts are left to the caller.
pub struct HttpClientAdapter {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
    max_response_body: usize,
}

impl HttpClientAdapter {
    /// Create a new HTTP client adapter.
    pub fn new() -> Result<Self> {
        // Install default crypto provider for rustls if not already set
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let mut http_connector = HttpConnector::new();
        http_connector.enforce_http(false);

        let mut root_cert_store = rustls::RootCertStore::empty();
        let native_certs = load_native_certs();

        if !native_certs.certs.is_empty() {
            for cert in native_certs.certs {
                if root_cert_store.add(cert).is_err() {
                    tracing::warn!("Failed to add native certificate to rustls RootCertStore");
                }
            }
            tracing::info!("Loaded {} native root certificates.", root_cert_store.len());
        }

        if !native_certs.errors.is_empty() {
            tracing::warn!(
                "Some native certificates failed to load: {:?}",
                native_certs.errors
            );
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_cert_store)
            .with_no_client_auth();

        let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http_connector);

        let client = Client::builder(TokioExecutor::new()).build::<_, Full<Bytes>>(https_connector);

        tracing::debug!("Created new upstream HTTP client");
        Ok(Self {
            client,
            max_response_body: DEFAULT_MAX_RESPONSE_BODY,
        })
    }

    /// Reject upstream responses whose body is larger than `limit` bytes.
    pub fn with_max_response_body(mut self, limit: usize) -> Self {
        self.max_response_body = limit;
        self
    }

    /// Point the Host header at the upstream authority.
    fn set_host_header(req: &mut Request<Bytes>) -> HttpClientResult<()> {
        let Some(host) = req.uri().host() else {
            tracing::error!("Outgoing URI has no host: {}", req.uri());
            return Err(HttpClientError::InvalidRequest(
                "Outgoing URI has no host".to_string(),
            ));
        };
        let value = match req.uri().port_u16() {
            Some(port) => HeaderValue::from_str(&format!("{host}:{port}")),
            None => HeaderValue::from_str(host),
        }
        .map_err(|e| HttpClientError::InvalidRequest(format!("invalid host '{host}': {e}")))?;

        req.headers_mut().insert(header::HOST, value);
        Ok(())
    }
}

#[async_trait]
impl HttpClient for HttpClientAdapter {
    async fn send_request(&self, mut req: Request<Bytes>) -> HttpClientResult<Response<Bytes>> {
        Self::set_host_header(&mut req)?;

        let backend_identifier = format!(
            "{}://{}",
            req.uri().scheme_str().unwrap_or("http"),
            req.uri()
                .authority()
                .map_or_else(|| "unknown".to_string(), |a| a.to_string())
        );

        let (mut parts, body) = req.into_parts();
        parts.version = Version::HTTP_11;
        tracing::debug!(
            backend = %backend_identifier,
            method = %parts.method,
            uri = %parts.uri,
            "sending upstream request"
        );

        let method_for_error_log = parts.method.clone();
        let uri_for_error_log = parts.uri.clone();
        let outgoing_request = Request::from_parts(parts, Full::new(body));

        let response = self.client.request(outgoing_request).await.map_err(|e| {
            tracing::warn!(
                backend = %backend_identifier,
                error = %e,
                "upstream request failed"
            );
            HttpClientError::ConnectionError(format!(
                "Request to {method_for_error_log} {uri_for_error_log} failed: {e}"
            ))
        })?;

        let (mut parts, body) = response.into_parts();
        let body = collect_limited(body, self.max_response_body).await?;

        // The body is buffered, framing is recomputed downstream.
        parts.headers.remove(header::TRANSFER_ENCODING);

        tracing::debug!(
            backend = %backend_identifier,
            status = parts.status.as_u16(),
            bytes = body.len(),
            "upstream response received"
        );
        Ok(Response::from_parts(parts, body))
    }
}

/// Buffer `body`, failing once more than `limit` bytes have been read.
async fn collect_limited<B>(body: B, limit: usize) -> HttpClientResult<Bytes>
where
    B: hyper::body::Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let collected = Limited::new(body, limit).collect().await.map_err(|e| {
        if e.downcast_ref::<LengthLimitError>().is_some() {
            HttpClientError::Body(format!("response body exceeds {limit} bytes"))
        } else {
            HttpClientError::Body(e.to_string())
        }
    })?;
    Ok(collected.to_bytes())
}
