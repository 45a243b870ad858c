//! Explicit registry of stage factories.
//!
//! Every configured stage names a `kind`; the registry maps
//! `(slot, kind)` to the factory that builds it. A registry is populated once
//! at startup (see [`StageRegistry::with_builtins`]) and then shared,
//! read-only, by every proxy construction.
use std::{collections::HashMap, fmt, sync::Arc};

use crate::{
    config::StageSpec,
    core::{error::BuildError, runtime::StageRuntime},
    ports::stage::{
        Adapt, Backend, CandidateBackend, Compress, Fallback, Limit, Mirror, Protect, Validate,
    },
};

/// Position of a stage in the proxy configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StageSlot {
    Fallback,
    Validator,
    RateLimiter,
    CircuitBreaker,
    Adaptor,
    MirrorBackend,
    CandidateBackend,
    Backend,
    Compression,
}

impl StageSlot {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageSlot::Fallback => "fallback",
            StageSlot::Validator => "validator",
            StageSlot::RateLimiter => "rate_limiter",
            StageSlot::CircuitBreaker => "circuit_breaker",
            StageSlot::Adaptor => "adaptor",
            StageSlot::MirrorBackend => "mirror_backend",
            StageSlot::CandidateBackend => "candidate_backend",
            StageSlot::Backend => "backend",
            StageSlot::Compression => "compression",
        }
    }
}

impl fmt::Display for StageSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builds one stage from its spec and the runtime state carried for its slot.
pub type StageFactory<T> =
    Arc<dyn Fn(&StageSpec, &StageRuntime) -> Result<T, BuildError> + Send + Sync>;

struct Factories<T> {
    slot: StageSlot,
    by_kind: HashMap<String, StageFactory<T>>,
}

impl<T> Factories<T> {
    fn new(slot: StageSlot) -> Self {
        Self {
            slot,
            by_kind: HashMap::new(),
        }
    }

    fn insert(&mut self, kind: String, factory: StageFactory<T>) {
        if self.by_kind.insert(kind.clone(), factory).is_some() {
            tracing::warn!(slot = %self.slot, %kind, "replacing registered stage factory");
        }
    }

    fn build(&self, spec: &StageSpec, runtime: &StageRuntime) -> Result<T, BuildError> {
        let factory = self
            .by_kind
            .get(&spec.kind)
            .ok_or_else(|| BuildError::UnknownKind {
                slot: self.slot,
                kind: spec.kind.clone(),
            })?;
        factory(spec, runtime)
    }

    fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.by_kind.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}

macro_rules! registry_slots {
    ($($field:ident: $ty:ty => $slot:ident, $register:ident, $build:ident;)*) => {
        /// Stage factories for every slot of the proxy configuration.
        pub struct StageRegistry {
            $($field: Factories<$ty>,)*
        }

        impl StageRegistry {
            /// An empty registry, with no kind available for any slot.
            pub fn new() -> Self {
                Self {
                    $($field: Factories::new(StageSlot::$slot),)*
                }
            }

            $(
                pub fn $register<F>(&mut self, kind: impl Into<String>, factory: F) -> &mut Self
                where
                    F: Fn(&StageSpec, &StageRuntime) -> Result<$ty, BuildError> + Send + Sync + 'static,
                {
                    self.$field.insert(kind.into(), Arc::new(factory));
                    self
                }

                pub(crate) fn $build(
                    &self,
                    spec: &StageSpec,
                    runtime: &StageRuntime,
                ) -> Result<$ty, BuildError> {
                    self.$field.build(spec, runtime)
                }
            )*

            /// Registered kinds for a slot, sorted.
            pub fn kinds(&self, slot: StageSlot) -> Vec<&str> {
                match slot {
                    $(StageSlot::$slot => self.$field.kinds(),)*
                }
            }
        }
    };
}

registry_slots! {
    fallbacks: Box<dyn Fallback> => Fallback, register_fallback, build_fallback;
    validators: Box<dyn Validate> => Validator, register_validator, build_validator;
    rate_limiters: Box<dyn Limit> => RateLimiter, register_rate_limiter, build_rate_limiter;
    circuit_breakers: Box<dyn Protect> => CircuitBreaker, register_circuit_breaker, build_circuit_breaker;
    adaptors: Box<dyn Adapt> => Adaptor, register_adaptor, build_adaptor;
    mirrors: Box<dyn Mirror> => MirrorBackend, register_mirror_backend, build_mirror_backend;
    candidates: Box<dyn CandidateBackend> => CandidateBackend, register_candidate_backend, build_candidate_backend;
    backends: Box<dyn Backend> => Backend, register_backend, build_backend;
    compressions: Arc<dyn Compress> => Compression, register_compression, build_compression;
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StageRegistry {
    pub fn contains(&self, slot: StageSlot, kind: &str) -> bool {
        self.kinds(slot).contains(&kind)
    }
}
