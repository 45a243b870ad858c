//! Per-request state shared by every pipeline stage.
//!
//! A [`RequestContext`] is created by the transport layer for each inbound
//! request and handed to [`HttpProxy::handle`](crate::core::HttpProxy::handle).
//! It owns the buffered request, the response being assembled, the one-shot
//! cancellation flag and the completion hooks that run when the transport
//! calls [`RequestContext::finish`].
use std::{
    net::SocketAddr,
    time::{Duration, Instant},
};

use bytes::Bytes;
use http::{HeaderMap, Request, Response, StatusCode};

use crate::core::error::StageError;

/// Client socket address, inserted into the request extensions by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientAddr(pub SocketAddr);

/// Hook executed once the request has completed, successfully or not.
pub type FinishHook = Box<dyn FnOnce(&RequestContext) + Send + Sync>;

/// Mutable response state written by stages.
#[derive(Debug, Clone)]
pub struct ResponseState {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl Default for ResponseState {
    fn default() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }
}

impl ResponseState {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn set_body(&mut self, body: impl Into<Bytes>) {
        self.body = body.into();
    }
}

pub struct RequestContext {
    request: Request<Bytes>,
    response: ResponseState,
    cancelled: Option<StageError>,
    finish_hooks: Vec<FinishHook>,
    started_at: Instant,
}

impl RequestContext {
    pub fn new(request: Request<Bytes>) -> Self {
        Self {
            request,
            response: ResponseState::default(),
            cancelled: None,
            finish_hooks: Vec::new(),
            started_at: Instant::now(),
        }
    }

    pub fn request(&self) -> &Request<Bytes> {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut Request<Bytes> {
        &mut self.request
    }

    pub fn response(&self) -> &ResponseState {
        &self.response
    }

    pub fn response_mut(&mut self) -> &mut ResponseState {
        &mut self.response
    }

    /// Client address recorded by the transport, if any.
    pub fn client_addr(&self) -> Option<SocketAddr> {
        self.request
            .extensions()
            .get::<ClientAddr>()
            .map(|addr| addr.0)
    }

    /// Cancel the request. Only the first reason is kept; returns `false` if
    /// the request was already cancelled.
    pub fn cancel(&mut self, reason: StageError) -> bool {
        if self.cancelled.is_some() {
            tracing::debug!(%reason, "request already cancelled, ignoring new reason");
            return false;
        }
        self.cancelled = Some(reason);
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.is_some()
    }

    pub fn cancel_reason(&self) -> Option<&StageError> {
        self.cancelled.as_ref()
    }

    /// Register a hook to run when the request finishes. Hooks run in reverse
    /// registration order.
    pub fn on_finish<F>(&mut self, hook: F)
    where
        F: FnOnce(&RequestContext) + Send + Sync + 'static,
    {
        self.finish_hooks.push(Box::new(hook));
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Complete the request: run the finish hooks and turn the response state
    /// into an HTTP response. A cancellation reason, if any, is attached as a
    /// response extension for the transport to inspect.
    pub fn finish(mut self) -> Response<Bytes> {
        let hooks = std::mem::take(&mut self.finish_hooks);
        for hook in hooks.into_iter().rev() {
            hook(&self);
        }

        let ResponseState {
            status,
            headers,
            body,
        } = self.response;
        let mut response = Response::new(body);
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        if let Some(reason) = self.cancelled {
            response.extensions_mut().insert(reason);
        }
        response
    }
}
