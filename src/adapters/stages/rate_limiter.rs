//! Admission control built atop `governor`.
//!
//! One quota is enforced either for the whole proxy, per client IP or per
//! value of a request header. The limiter state lives in the stage runtime,
//! so a reload with an unchanged quota keeps the buckets already consumed.
use std::{hash::Hash, net::IpAddr, num::NonZeroU32, sync::Arc, time::Duration};

use async_trait::async_trait;
use governor::{
    Quota, RateLimiter,
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed, keyed::DefaultKeyedStateStore},
};
use http::HeaderName;
use serde::Deserialize;

use crate::{
    config::StageSpec,
    core::{BuildError, RequestContext, StageError, StageRuntime, StageSlot},
    ports::stage::{Close, Limit},
};

pub type DirectRateLimiterImpl = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;
pub type KeyedRateLimiterImpl<K> = RateLimiter<K, DefaultKeyedStateStore<K>, DefaultClock>;

/// Rate limiting discriminator for how keys are derived.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitBy {
    #[default]
    Proxy,
    Ip,
    Header,
}

/// Behaviour when a key could not be extracted (missing IP/header etc.).
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MissingKeyPolicy {
    #[default]
    Allow,
    Deny,
}

#[derive(Debug, Deserialize)]
struct GovernorParams {
    requests: u32,
    period: String,
    #[serde(default)]
    by: RateLimitBy,
    #[serde(default)]
    header_name: Option<String>,
    #[serde(default)]
    on_missing_key: MissingKeyPolicy,
    /// Wait up to this long for a permit instead of rejecting at once
    #[serde(default)]
    timeout: Option<String>,
}

enum LimiterState {
    Proxy(DirectRateLimiterImpl),
    Ip(KeyedRateLimiterImpl<IpAddr>),
    Header(KeyedRateLimiterImpl<String>),
}

impl LimiterState {
    /// Forget keys whose bucket is back to full.
    fn retain_recent(&self) {
        match self {
            LimiterState::Proxy(_) => {}
            LimiterState::Ip(limiter) => {
                limiter.retain_recent();
                limiter.shrink_to_fit();
            }
            LimiterState::Header(limiter) => {
                limiter.retain_recent();
                limiter.shrink_to_fit();
            }
        }
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        match self {
            LimiterState::Proxy(_) => 0,
            LimiterState::Ip(limiter) => limiter.len(),
            LimiterState::Header(limiter) => limiter.len(),
        }
    }
}

pub struct GovernorRateLimiter {
    state: Arc<LimiterState>,
    header_name: Option<HeaderName>,
    on_missing_key: MissingKeyPolicy,
    wait: Option<Duration>,
    description: String,
}

impl GovernorRateLimiter {
    pub fn new(spec: &StageSpec, runtime: &StageRuntime) -> Result<Self, BuildError> {
        let slot = StageSlot::RateLimiter;
        let params: GovernorParams = spec.parse_params(slot)?;

        let period = humantime::parse_duration(&params.period).map_err(|e| {
            BuildError::invalid(slot, format!("invalid period '{}': {e}", params.period))
        })?;
        let requests = NonZeroU32::new(params.requests)
            .ok_or_else(|| BuildError::invalid(slot, "requests must be greater than 0"))?;
        let quota = Quota::with_period(period / requests.get())
            .ok_or_else(|| BuildError::invalid(slot, format!("invalid period duration: {period:?}")))?
            .allow_burst(requests);

        let header_name = match (params.by, &params.header_name) {
            (RateLimitBy::Header, Some(name)) => Some(
                HeaderName::from_bytes(name.as_bytes())
                    .map_err(|e| BuildError::invalid(slot, format!("invalid header_name '{name}': {e}")))?,
            ),
            (RateLimitBy::Header, None) => {
                return Err(BuildError::invalid(slot, "header_name is required when by = header"));
            }
            _ => None,
        };

        let wait = params
            .timeout
            .as_deref()
            .map(humantime::parse_duration)
            .transpose()
            .map_err(|e| BuildError::invalid(slot, format!("invalid timeout: {e}")))?;

        let by = params.by;
        let state = runtime.get_or_init(&spec.fingerprint(), || {
            tracing::info!(?by, requests = requests.get(), period = %params.period, "creating rate limiter state");
            match by {
                RateLimitBy::Proxy => LimiterState::Proxy(RateLimiter::direct(quota)),
                RateLimitBy::Ip => LimiterState::Ip(RateLimiter::keyed(quota)),
                RateLimitBy::Header => LimiterState::Header(RateLimiter::keyed(quota)),
            }
        });
        if !matches!(*state, LimiterState::Proxy(_)) {
            let keyed = Arc::clone(&state);
            runtime.set_housekeeping(Arc::new(move || keyed.retain_recent()));
        }

        Ok(Self {
            state,
            header_name,
            on_missing_key: params.on_missing_key,
            wait,
            description: format!("{} requests per {}", requests, params.period),
        })
    }

    fn rejected(&self) -> StageError {
        StageError::RateLimited(format!("quota of {} exceeded", self.description))
    }

    fn missing_key(&self, what: String) -> Result<(), StageError> {
        match self.on_missing_key {
            MissingKeyPolicy::Allow => Ok(()),
            MissingKeyPolicy::Deny => Err(StageError::RateLimited(what)),
        }
    }

    async fn check_direct(&self, limiter: &DirectRateLimiterImpl) -> Result<(), StageError> {
        match self.wait {
            Some(wait) => tokio::time::timeout(wait, limiter.until_ready())
                .await
                .map(|_| ())
                .map_err(|_| self.rejected()),
            None => limiter.check().map_err(|_| self.rejected()),
        }
    }

    async fn check_keyed<K>(&self, limiter: &KeyedRateLimiterImpl<K>, key: &K) -> Result<(), StageError>
    where
        K: Clone + Hash + Eq + Send + Sync + 'static,
    {
        match self.wait {
            Some(wait) => tokio::time::timeout(wait, limiter.until_key_ready(key))
                .await
                .map(|_| ())
                .map_err(|_| self.rejected()),
            None => limiter.check_key(key).map_err(|_| self.rejected()),
        }
    }
}

impl Close for GovernorRateLimiter {}

#[async_trait]
impl Limit for GovernorRateLimiter {
    async fn limit(&self, ctx: &RequestContext) -> Result<(), StageError> {
        match &*self.state {
            LimiterState::Proxy(limiter) => self.check_direct(limiter).await,
            LimiterState::Ip(limiter) => match ctx.client_addr() {
                Some(addr) => self.check_keyed(limiter, &addr.ip()).await,
                None => self.missing_key("no client IP available".to_string()),
            },
            LimiterState::Header(limiter) => {
                let Some(header_name) = &self.header_name else {
                    return Ok(());
                };
                let value = ctx
                    .request()
                    .headers()
                    .get(header_name)
                    .and_then(|value| value.to_str().ok())
                    .map(str::to_string);
                match value {
                    Some(value) => self.check_keyed(limiter, &value).await,
                    None => self.missing_key(format!("required header '{header_name}' is missing")),
                }
            }
        }
    }
}
