//! State carried across proxy reconstruction.
//!
//! A [`Runtime`] outlives the proxies built from it: when the configuration
//! is reloaded the new proxy is built against the same runtime, so the request
//! rate keeps its history and stages can pick their previous state back up.
use std::{
    any::Any,
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use crate::core::{rate::RateCounter, registry::StageSlot};

type SharedState = Arc<dyn Any + Send + Sync>;

/// Periodic maintenance of the state held by a [`StageRuntime`], such as
/// evicting idle keys.
pub type Housekeeping = Arc<dyn Fn() + Send + Sync>;

/// Opaque per-slot state carrier handed to stage factories.
///
/// Holds at most one value, tagged with the fingerprint of the `StageSpec` it was
/// built for. A factory asking with a different fingerprint gets fresh state.
pub struct StageRuntime {
    slot: StageSlot,
    state: Mutex<Option<(String, SharedState)>>,
    housekeeping: Mutex<Option<Housekeeping>>,
}

impl StageRuntime {
    pub fn new(slot: StageSlot) -> Self {
        Self {
            slot,
            state: Mutex::new(None),
            housekeeping: Mutex::new(None),
        }
    }

    pub fn slot(&self) -> StageSlot {
        self.slot
    }

    /// Return the state stored for `fingerprint`, or build and store it with
    /// `init`. A stored value of another type or fingerprint is replaced.
    pub fn get_or_init<T, F>(&self, fingerprint: &str, init: F) -> Arc<T>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        let mut guard = lock(&self.state);

        if let Some((stored_fingerprint, value)) = guard.as_ref() {
            if stored_fingerprint == fingerprint {
                if let Ok(value) = Arc::clone(value).downcast::<T>() {
                    tracing::debug!(slot = %self.slot, "reusing stage runtime state");
                    return value;
                }
            }
        }

        let value = Arc::new(init());
        *guard = Some((fingerprint.to_string(), value.clone() as SharedState));
        // maintenance registered for the replaced state no longer applies
        *lock(&self.housekeeping) = None;
        value
    }

    /// Register the maintenance task of the stored state, replacing any
    /// previous one. Dropped together with the state.
    pub fn set_housekeeping(&self, task: Housekeeping) {
        *lock(&self.housekeeping) = Some(task);
    }

    /// Run the registered maintenance task, if any.
    pub fn housekeep(&self) {
        let task = lock(&self.housekeeping).clone();
        if let Some(task) = task {
            task();
        }
    }

    /// Drop the stored state.
    pub fn reset(&self) {
        *lock(&self.state) = None;
        *lock(&self.housekeeping) = None;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Mutable runtime handle shared by every proxy built for one configuration
/// lineage.
pub struct Runtime {
    rate: Arc<RateCounter>,
    stages: Mutex<BTreeMap<StageSlot, Arc<StageRuntime>>>,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    pub fn new() -> Self {
        Self {
            rate: Arc::new(RateCounter::one_minute()),
            stages: Mutex::new(BTreeMap::new()),
        }
    }

    /// Request rate counter updated once per completed request.
    pub fn rate(&self) -> Arc<RateCounter> {
        Arc::clone(&self.rate)
    }

    /// State carrier for `slot`, created on first use.
    pub fn stage(&self, slot: StageSlot) -> Arc<StageRuntime> {
        lock(&self.stages)
            .entry(slot)
            .or_insert_with(|| Arc::new(StageRuntime::new(slot)))
            .clone()
    }

    /// Run the maintenance task of every stage state.
    pub fn housekeep(&self) {
        let stages: Vec<Arc<StageRuntime>> = lock(&self.stages).values().cloned().collect();
        for stage in stages {
            stage.housekeep();
        }
    }
}
