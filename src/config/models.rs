//! Configuration data structures for an HTTP proxy.
//!
//! These types map directly to YAML (also JSON / TOML) configuration files.
//! Every optional stage is a [`StageSpec`]: a `kind` naming the factory in the
//! [`StageRegistry`](crate::core::StageRegistry) plus free-form parameters
//! handed to that factory. Builders here are part of the public API for
//! embedding.
use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
};

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::core::{BuildError, StageSlot};

/// Configuration of one pluggable stage.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct StageSpec {
    /// Registered kind of the stage, e.g. `"http"` or `"mock"`
    pub kind: String,
    /// Remaining keys, interpreted by the stage factory
    #[serde(flatten)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

impl StageSpec {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            params: serde_json::Map::new(),
        }
    }

    /// Add one parameter
    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    /// Deserialize the parameters into the factory's own settings type.
    pub fn parse_params<T: DeserializeOwned>(&self, slot: StageSlot) -> Result<T, BuildError> {
        serde_json::from_value(serde_json::Value::Object(self.params.clone()))
            .map_err(|e| BuildError::invalid(slot, format!("{} parameters: {e}", self.kind)))
    }

    /// Stable digest of kind and parameters, used to decide whether state
    /// kept for a previous build of the stage can be reused.
    pub fn fingerprint(&self) -> String {
        let mut hasher = DefaultHasher::new();
        // serde_json::Map is ordered, so the rendering is deterministic
        serde_json::Value::Object(self.params.clone())
            .to_string()
            .hash(&mut hasher);
        format!("{}:{:016x}", self.kind, hasher.finish())
    }
}

/// How a built-in backend picks one of its servers.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceStrategy {
    #[default]
    RoundRobin,
    Random,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ProxyConfig {
    /// Name used in logs and metrics; defaults to `server`
    #[serde(default)]
    pub name: String,
    /// Name of the server (listener) this proxy is attached to
    pub server: String,
    #[serde(default)]
    pub fallback: Option<StageSpec>,
    #[serde(default)]
    pub validator: Option<StageSpec>,
    #[serde(default)]
    pub rate_limiter: Option<StageSpec>,
    #[serde(default)]
    pub circuit_breaker: Option<StageSpec>,
    #[serde(default)]
    pub adaptor: Option<StageSpec>,
    #[serde(default)]
    pub mirror_backend: Option<StageSpec>,
    #[serde(default)]
    pub candidate_backend: Option<StageSpec>,
    pub backend: StageSpec,
    #[serde(default)]
    pub compression: Option<StageSpec>,
}

impl ProxyConfig {
    /// Create a new proxy configuration builder
    pub fn builder() -> ProxyConfigBuilder {
        ProxyConfigBuilder::default()
    }

    pub fn display_name(&self) -> String {
        if self.name.is_empty() {
            self.server.clone()
        } else {
            self.name.clone()
        }
    }

    /// Every configured stage with its slot, in pipeline declaration order.
    pub fn stages(&self) -> impl Iterator<Item = (StageSlot, &StageSpec)> {
        [
            (StageSlot::Fallback, self.fallback.as_ref()),
            (StageSlot::Validator, self.validator.as_ref()),
            (StageSlot::RateLimiter, self.rate_limiter.as_ref()),
            (StageSlot::CircuitBreaker, self.circuit_breaker.as_ref()),
            (StageSlot::Adaptor, self.adaptor.as_ref()),
            (StageSlot::MirrorBackend, self.mirror_backend.as_ref()),
            (StageSlot::CandidateBackend, self.candidate_backend.as_ref()),
            (StageSlot::Backend, Some(&self.backend)),
            (StageSlot::Compression, self.compression.as_ref()),
        ]
        .into_iter()
        .filter_map(|(slot, spec)| spec.map(|spec| (slot, spec)))
    }
}

/// Builder for ProxyConfig to allow for cleaner configuration creation
#[derive(Default)]
pub struct ProxyConfigBuilder {
    name: Option<String>,
    server: Option<String>,
    fallback: Option<StageSpec>,
    validator: Option<StageSpec>,
    rate_limiter: Option<StageSpec>,
    circuit_breaker: Option<StageSpec>,
    adaptor: Option<StageSpec>,
    mirror_backend: Option<StageSpec>,
    candidate_backend: Option<StageSpec>,
    backend: Option<StageSpec>,
    compression: Option<StageSpec>,
}

impl ProxyConfigBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn server(mut self, server: impl Into<String>) -> Self {
        self.server = Some(server.into());
        self
    }

    pub fn fallback(mut self, spec: StageSpec) -> Self {
        self.fallback = Some(spec);
        self
    }

    pub fn validator(mut self, spec: StageSpec) -> Self {
        self.validator = Some(spec);
        self
    }

    pub fn rate_limiter(mut self, spec: StageSpec) -> Self {
        self.rate_limiter = Some(spec);
        self
    }

    pub fn circuit_breaker(mut self, spec: StageSpec) -> Self {
        self.circuit_breaker = Some(spec);
        self
    }

    pub fn adaptor(mut self, spec: StageSpec) -> Self {
        self.adaptor = Some(spec);
        self
    }

    pub fn mirror_backend(mut self, spec: StageSpec) -> Self {
        self.mirror_backend = Some(spec);
        self
    }

    pub fn candidate_backend(mut self, spec: StageSpec) -> Self {
        self.candidate_backend = Some(spec);
        self
    }

    pub fn backend(mut self, spec: StageSpec) -> Self {
        self.backend = Some(spec);
        self
    }

    pub fn compression(mut self, spec: StageSpec) -> Self {
        self.compression = Some(spec);
        self
    }

    /// Build the final ProxyConfig
    pub fn build(self) -> Result<ProxyConfig, String> {
        let server = self
            .server
            .ok_or_else(|| "server is required".to_string())?;
        let backend = self
            .backend
            .ok_or_else(|| "backend is required".to_string())?;

        Ok(ProxyConfig {
            name: self.name.unwrap_or_default(),
            server,
            fallback: self.fallback,
            validator: self.validator,
            rate_limiter: self.rate_limiter,
            circuit_breaker: self.circuit_breaker,
            adaptor: self.adaptor,
            mirror_backend: self.mirror_backend,
            candidate_backend: self.candidate_backend,
            backend,
            compression: self.compression,
        })
    }
}
