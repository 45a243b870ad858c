//! Recording stage doubles shared by the integration tests.
//!
//! Every double is registered under the kind `"test"` for its slot and
//! appends what it does to a shared [`Recorder`]. Behaviour is driven by the
//! stage parameters: `fail` makes the stage reject, `fail_close` makes its
//! release fail, `status` sets the status a backend (or fallback) writes and
//! `accept` is the answer of a candidate filter.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderValue, Request, StatusCode, header};
use httpproxy::{
    BuildError, FallbackStage, RequestContext, StageError, StageRegistry, StageSlot,
    config::{ProxyConfig, ProxyConfigBuilder, StageSpec},
    ports::stage::{
        Adapt, Backend, CandidateBackend, Close, Compress, Fallback, Handler, Limit, Mirror,
        Protect, ResponseObserver, Validate,
    },
};
use serde::Deserialize;

#[derive(Clone, Default)]
pub struct Recorder(Arc<Mutex<Vec<String>>>);

impl Recorder {
    pub fn record(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn matching(&self, prefix: &str) -> Vec<String> {
        self.events()
            .into_iter()
            .filter(|event| event.starts_with(prefix))
            .collect()
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DoubleParams {
    fail: bool,
    fail_close: bool,
    status: Option<u16>,
    accept: bool,
    label: Option<String>,
}

/// One double implementing every stage contract.
pub struct TestStage {
    name: String,
    params: DoubleParams,
    recorder: Recorder,
    observers: Vec<ResponseObserver>,
}

impl TestStage {
    fn new(slot: StageSlot, spec: &StageSpec, recorder: &Recorder) -> Result<Self, BuildError> {
        let params: DoubleParams = spec.parse_params(slot)?;
        let name = params
            .label
            .clone()
            .unwrap_or_else(|| slot.as_str().to_string());
        Ok(Self {
            name,
            params,
            recorder: recorder.clone(),
            observers: Vec::new(),
        })
    }

    fn status(&self) -> Option<StatusCode> {
        self.params
            .status
            .map(|code| StatusCode::from_u16(code).unwrap())
    }
}

impl Close for TestStage {
    fn close(&self) -> Result<(), StageError> {
        self.recorder.record(format!("close:{}", self.name));
        if self.params.fail_close {
            return Err(StageError::Other(format!("{} refused to close", self.name)));
        }
        Ok(())
    }
}

impl Validate for TestStage {
    fn validate(&self, _ctx: &RequestContext) -> Result<(), StageError> {
        self.recorder.record("validator:check");
        if self.params.fail {
            return Err(StageError::Invalid("bad".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Limit for TestStage {
    async fn limit(&self, _ctx: &RequestContext) -> Result<(), StageError> {
        self.recorder.record("rate_limiter:check");
        if self.params.fail {
            return Err(StageError::RateLimited("always".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Protect for TestStage {
    async fn protect(
        &self,
        ctx: &mut RequestContext,
        handler: &dyn Handler,
    ) -> Result<(), StageError> {
        if self.params.fail {
            self.recorder.record("circuit_breaker:reject");
            return Err(StageError::CircuitOpen("open".to_string()));
        }
        self.recorder.record("circuit_breaker:protect");
        handler.handle(ctx).await;
        Ok(())
    }
}

impl Adapt for TestStage {
    fn adapt_request(&self, _ctx: &mut RequestContext) {
        self.recorder.record("adaptor:request");
    }

    fn adapt_response(&self, _ctx: &mut RequestContext) {
        self.recorder.record("adaptor:response");
    }
}

impl Mirror for TestStage {
    fn handle(&self, _ctx: &RequestContext) {
        self.recorder.record("mirror");
    }
}

#[async_trait]
impl Handler for TestStage {
    async fn handle(&self, ctx: &mut RequestContext) {
        self.recorder.record(format!("{}:handle", self.name));
        let response = ctx.response_mut();
        response.set_status(self.status().unwrap_or(StatusCode::OK));
        response.set_body(self.name.clone());
        for observer in &self.observers {
            observer(&mut *ctx);
        }
    }
}

impl Backend for TestStage {
    fn on_response_got(&mut self, observer: ResponseObserver) {
        self.observers.push(observer);
    }
}

impl CandidateBackend for TestStage {
    fn filter(&self, _ctx: &RequestContext) -> bool {
        self.params.accept
    }
}

impl Compress for TestStage {
    fn compress(&self, ctx: &mut RequestContext) {
        let status = ctx.response().status().as_u16();
        let body = String::from_utf8_lossy(ctx.response().body()).into_owned();
        self.recorder.record(format!("compression:{body}:{status}"));
        ctx.response_mut()
            .headers_mut()
            .insert(header::CONTENT_ENCODING, HeaderValue::from_static("test"));
    }
}

impl Fallback for TestStage {
    fn try_fallback(
        &self,
        ctx: &mut RequestContext,
        stage: FallbackStage,
        err: Option<&StageError>,
    ) {
        self.recorder.record(format!(
            "fallback:{stage}:{}:{}",
            ctx.response().status().as_u16(),
            err.map_or_else(|| "none".to_string(), ToString::to_string)
        ));
        match (self.status(), err) {
            (Some(status), _) => {
                ctx.response_mut().set_status(status);
                ctx.response_mut().set_body("fallback");
            }
            (None, Some(err)) => {
                ctx.cancel(err.clone());
            }
            (None, None) => {}
        }
    }
}

/// A registry where kind `"test"` builds a [`TestStage`] for every slot.
pub fn registry(recorder: &Recorder) -> StageRegistry {
    let mut registry = StageRegistry::new();

    let rec = recorder.clone();
    registry.register_fallback("test", move |spec, _| {
        Ok(Box::new(TestStage::new(StageSlot::Fallback, spec, &rec)?) as Box<dyn Fallback>)
    });
    let rec = recorder.clone();
    registry.register_validator("test", move |spec, _| {
        Ok(Box::new(TestStage::new(StageSlot::Validator, spec, &rec)?) as Box<dyn Validate>)
    });
    let rec = recorder.clone();
    registry.register_rate_limiter("test", move |spec, _| {
        Ok(Box::new(TestStage::new(StageSlot::RateLimiter, spec, &rec)?) as Box<dyn Limit>)
    });
    let rec = recorder.clone();
    registry.register_circuit_breaker("test", move |spec, _| {
        Ok(Box::new(TestStage::new(StageSlot::CircuitBreaker, spec, &rec)?) as Box<dyn Protect>)
    });
    let rec = recorder.clone();
    registry.register_adaptor("test", move |spec, _| {
        Ok(Box::new(TestStage::new(StageSlot::Adaptor, spec, &rec)?) as Box<dyn Adapt>)
    });
    let rec = recorder.clone();
    registry.register_mirror_backend("test", move |spec, _| {
        Ok(Box::new(TestStage::new(StageSlot::MirrorBackend, spec, &rec)?) as Box<dyn Mirror>)
    });
    let rec = recorder.clone();
    registry.register_candidate_backend("test", move |spec, _| {
        Ok(Box::new(TestStage::new(StageSlot::CandidateBackend, spec, &rec)?)
            as Box<dyn CandidateBackend>)
    });
    let rec = recorder.clone();
    registry.register_backend("test", move |spec, _| {
        Ok(Box::new(TestStage::new(StageSlot::Backend, spec, &rec)?) as Box<dyn Backend>)
    });
    let rec = recorder.clone();
    registry.register_compression("test", move |spec, _| {
        Ok(Arc::new(TestStage::new(StageSlot::Compression, spec, &rec)?) as Arc<dyn Compress>)
    });

    registry
}

/// Spec of a well-behaved double.
pub fn stage() -> StageSpec {
    StageSpec::new("test")
}

/// Spec of a double that rejects.
pub fn failing() -> StageSpec {
    stage().with_param("fail", serde_json::json!(true))
}

/// A builder with server and backend already set.
pub fn config() -> ProxyConfigBuilder {
    ProxyConfig::builder().server("test-server").backend(stage())
}

/// Every optional stage configured with a well-behaved double.
pub fn full_config() -> ProxyConfigBuilder {
    config()
        .fallback(stage())
        .validator(stage())
        .rate_limiter(stage())
        .circuit_breaker(stage())
        .adaptor(stage())
        .mirror_backend(stage())
        .candidate_backend(stage())
        .compression(stage())
}

pub fn request() -> RequestContext {
    RequestContext::new(
        Request::builder()
            .method("GET")
            .uri("/orders/42")
            .body(Bytes::new())
            .unwrap(),
    )
}
