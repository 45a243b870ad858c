use std::sync::Arc;

use async_trait::async_trait;

use super::forward::Forwarder;
use crate::{
    config::StageSpec,
    core::{BuildError, RequestContext, StageSlot},
    ports::{
        http_client::HttpClient,
        stage::{Backend, Close, Handler, ResponseObserver},
    },
};

/// Default backend: forwards every request to a load-balanced server pool.
pub struct HttpBackend {
    forwarder: Forwarder,
    observers: Vec<ResponseObserver>,
}

impl HttpBackend {
    pub fn new(spec: &StageSpec, client: Arc<dyn HttpClient>) -> Result<Self, BuildError> {
        Ok(Self {
            forwarder: Forwarder::from_spec(StageSlot::Backend, spec, client)?,
            observers: Vec::new(),
        })
    }
}

impl Close for HttpBackend {}

#[async_trait]
impl Handler for HttpBackend {
    async fn handle(&self, ctx: &mut RequestContext) {
        self.forwarder.forward(ctx, &self.observers).await;
    }
}

impl Backend for HttpBackend {
    fn on_response_got(&mut self, observer: ResponseObserver) {
        self.observers.push(observer);
    }
}
