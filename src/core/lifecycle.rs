//! Construction, hook wiring, teardown and hot reload of [`HttpProxy`].
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use arc_swap::ArcSwap;
use eyre::{Result, WrapErr};
use tokio::task::JoinHandle;

use crate::{
    config::{ProxyConfig, ProxyConfigValidator},
    core::{
        FallbackManager, HttpProxy, RequestContext, StageError,
        error::BuildError,
        rate::TICK_INTERVAL,
        registry::{StageRegistry, StageSlot},
        runtime::Runtime,
    },
    metrics,
    ports::stage::ResponseObserver,
};

/// How often a retired proxy is checked for remaining in-flight requests.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long a retired proxy may wait for in-flight requests before it is
/// given up on.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

impl HttpProxy {
    /// Build a proxy from its configuration.
    ///
    /// Each configured stage is built through `registry` with the state
    /// carried by `runtime` for its slot. Absent stages are simply not
    /// built. When compression is configured it is attached as a response
    /// observer to the backend and, if present, the candidate backend.
    pub fn new(
        config: &ProxyConfig,
        runtime: &Runtime,
        registry: &StageRegistry,
    ) -> Result<Self, BuildError> {
        let name = config.display_name();
        tracing::info!(proxy = %name, server = %config.server, "building http proxy");

        let fallback = config
            .fallback
            .as_ref()
            .map(|spec| registry.build_fallback(spec, &runtime.stage(StageSlot::Fallback)))
            .transpose()?;
        let validator = config
            .validator
            .as_ref()
            .map(|spec| registry.build_validator(spec, &runtime.stage(StageSlot::Validator)))
            .transpose()?;
        let rate_limiter = config
            .rate_limiter
            .as_ref()
            .map(|spec| {
                registry.build_rate_limiter(spec, &runtime.stage(StageSlot::RateLimiter))
            })
            .transpose()?;
        let circuit_breaker = config
            .circuit_breaker
            .as_ref()
            .map(|spec| {
                registry.build_circuit_breaker(spec, &runtime.stage(StageSlot::CircuitBreaker))
            })
            .transpose()?;
        let adaptor = config
            .adaptor
            .as_ref()
            .map(|spec| registry.build_adaptor(spec, &runtime.stage(StageSlot::Adaptor)))
            .transpose()?;
        let mirror_backend = config
            .mirror_backend
            .as_ref()
            .map(|spec| {
                registry.build_mirror_backend(spec, &runtime.stage(StageSlot::MirrorBackend))
            })
            .transpose()?;
        let mut candidate_backend = config
            .candidate_backend
            .as_ref()
            .map(|spec| {
                registry
                    .build_candidate_backend(spec, &runtime.stage(StageSlot::CandidateBackend))
            })
            .transpose()?;
        let mut backend =
            registry.build_backend(&config.backend, &runtime.stage(StageSlot::Backend))?;
        let compression = config
            .compression
            .as_ref()
            .map(|spec| registry.build_compression(spec, &runtime.stage(StageSlot::Compression)))
            .transpose()?;

        if let Some(compression) = &compression {
            let compress = Arc::clone(compression);
            let observer: ResponseObserver =
                Arc::new(move |ctx: &mut RequestContext| compress.compress(ctx));
            if let Some(candidate) = candidate_backend.as_mut() {
                candidate.on_response_got(Arc::clone(&observer));
            }
            backend.on_response_got(observer);
        }

        Ok(Self {
            fallback: FallbackManager::new(name.clone(), fallback),
            name: Arc::from(name),
            rate: runtime.rate(),
            validator,
            rate_limiter,
            circuit_breaker,
            adaptor,
            mirror_backend,
            candidate_backend,
            backend,
            compression,
        })
    }

    /// Release every stage, in a fixed order: fallback, validator, rate
    /// limiter, circuit breaker, adaptor, mirror, candidate backend, backend,
    /// compression. A failing stage is logged and does not stop the others.
    pub fn close(self) {
        tracing::info!(proxy = %self.name, "closing http proxy");

        let Self {
            name,
            fallback,
            validator,
            rate_limiter,
            circuit_breaker,
            adaptor,
            mirror_backend,
            candidate_backend,
            backend,
            compression,
            ..
        } = self;

        let report = |slot: StageSlot, outcome: Option<Result<(), StageError>>| match outcome {
            None => {}
            Some(Ok(())) => tracing::debug!(proxy = %name, %slot, "stage closed"),
            Some(Err(err)) => {
                tracing::warn!(proxy = %name, %slot, error = %err, "failed to close stage")
            }
        };

        report(StageSlot::Fallback, fallback.fallback().map(|s| s.close()));
        report(StageSlot::Validator, validator.as_ref().map(|s| s.close()));
        report(StageSlot::RateLimiter, rate_limiter.as_ref().map(|s| s.close()));
        report(StageSlot::CircuitBreaker, circuit_breaker.as_ref().map(|s| s.close()));
        report(StageSlot::Adaptor, adaptor.as_ref().map(|s| s.close()));
        report(StageSlot::MirrorBackend, mirror_backend.as_ref().map(|s| s.close()));
        report(StageSlot::CandidateBackend, candidate_backend.as_ref().map(|s| s.close()));
        report(StageSlot::Backend, Some(backend.close()));
        report(StageSlot::Compression, compression.as_ref().map(|s| s.close()));
    }
}

/// Owns the live proxy for one configuration lineage and swaps it on reload.
///
/// Requests take a snapshot with [`ProxyController::load`]; a reload builds
/// the new proxy on the same [`Runtime`], publishes it, and closes the
/// previous proxy once the last in-flight request has released it.
pub struct ProxyController {
    runtime: Arc<Runtime>,
    registry: Arc<StageRegistry>,
    current: ArcSwap<HttpProxy>,
    retired: Mutex<Vec<JoinHandle<()>>>,
    drain_timeout: Duration,
    rate_gauge: metrics::RateGauge,
}

impl ProxyController {
    /// Validate `config` and build the first proxy.
    pub fn new(config: &ProxyConfig, registry: Arc<StageRegistry>) -> Result<Self> {
        Self::with_runtime(config, registry, Arc::new(Runtime::new()))
    }

    pub fn with_runtime(
        config: &ProxyConfig,
        registry: Arc<StageRegistry>,
        runtime: Arc<Runtime>,
    ) -> Result<Self> {
        let proxy = Self::build(config, &runtime, &registry)?;
        let rate_gauge = metrics::register_rate_gauge(proxy.name(), runtime.rate());

        Ok(Self {
            runtime,
            registry,
            current: ArcSwap::from_pointee(proxy),
            retired: Mutex::new(Vec::new()),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            rate_gauge,
        })
    }

    /// Bound the wait for in-flight requests of a retired proxy. A proxy
    /// still in use after `timeout` is left unclosed.
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    fn build(config: &ProxyConfig, runtime: &Runtime, registry: &StageRegistry) -> Result<HttpProxy> {
        ProxyConfigValidator::validate(config, Some(registry))
            .wrap_err_with(|| format!("Invalid configuration for proxy '{}'", config.display_name()))?;
        HttpProxy::new(config, runtime, registry)
            .wrap_err_with(|| format!("Failed to build proxy '{}'", config.display_name()))
    }

    /// Snapshot of the live proxy.
    pub fn load(&self) -> Arc<HttpProxy> {
        self.current.load_full()
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    pub fn rate_gauge(&self) -> &metrics::RateGauge {
        &self.rate_gauge
    }

    /// Build a proxy for `config` and make it live. On error the current
    /// proxy stays in place.
    pub async fn reload(&self, config: &ProxyConfig) -> Result<()> {
        let proxy = Self::build(config, &self.runtime, &self.registry)?;
        tracing::info!(proxy = %proxy.name(), "reloading http proxy");
        self.rate_gauge.rename(proxy.name());
        let previous = self.current.swap(Arc::new(proxy));
        self.retire(previous);
        Ok(())
    }

    fn retire(&self, proxy: Arc<HttpProxy>) {
        let handle = tokio::spawn(drain_and_close(proxy, self.drain_timeout));
        let mut retired = match self.retired.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        retired.retain(|handle| !handle.is_finished());
        retired.push(handle);
    }

    /// Tick the request rate and run stage housekeeping every
    /// [`TICK_INTERVAL`] until the task is aborted.
    pub fn spawn_rate_ticker(&self) -> JoinHandle<()> {
        let runtime = Arc::clone(&self.runtime);
        tokio::spawn(async move {
            let rate = runtime.rate();
            let mut interval = tokio::time::interval(TICK_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the first tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                rate.tick();
                runtime.housekeep();
            }
        })
    }

    /// Retire the live proxy and wait until every retired proxy is closed.
    pub async fn shutdown(self) {
        let Self {
            current,
            retired,
            drain_timeout,
            ..
        } = self;
        tracing::info!("shutting down proxy controller");

        let mut handles = match retired.into_inner() {
            Ok(handles) => handles,
            Err(poisoned) => poisoned.into_inner(),
        };
        handles.push(tokio::spawn(drain_and_close(
            current.into_inner(),
            drain_timeout,
        )));

        for handle in handles {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "proxy drain task failed");
            }
        }
    }
}

/// Wait for every other holder of `proxy` to let go, then close it. Gives
/// up without closing once `timeout` has elapsed.
async fn drain_and_close(proxy: Arc<HttpProxy>, timeout: Duration) {
    let name = proxy.name().to_string();
    let drained = async move {
        let mut proxy = proxy;
        loop {
            match Arc::try_unwrap(proxy) {
                Ok(proxy) => return proxy,
                Err(still_shared) => {
                    proxy = still_shared;
                    tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
                }
            }
        }
    };

    match tokio::time::timeout(timeout, drained).await {
        Ok(proxy) => proxy.close(),
        Err(_) => tracing::warn!(
            proxy = %name,
            timeout = %humantime::format_duration(timeout),
            "drain timeout exceeded, proxy still in use and left unclosed"
        ),
    }
}
