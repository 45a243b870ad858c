use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;

use crate::config::LoadBalanceStrategy;

/// Picks one of `len` servers for the next request.
pub trait LoadBalancingStrategy: Send + Sync + 'static {
    /// Index of the selected server, `None` when there is nothing to pick.
    fn select_index(&self, len: usize) -> Option<usize>;

    fn boxed(self) -> Box<dyn LoadBalancingStrategy>
    where
        Self: Sized,
    {
        Box::new(self)
    }
}

pub struct RoundRobinStrategy {
    counter: AtomicUsize,
}

impl Default for RoundRobinStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl RoundRobinStrategy {
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }
}

impl LoadBalancingStrategy for RoundRobinStrategy {
    fn select_index(&self, len: usize) -> Option<usize> {
        if len == 0 {
            return None;
        }
        Some(self.counter.fetch_add(1, Ordering::Relaxed) % len)
    }
}

#[derive(Default)]
pub struct RandomStrategy;

impl LoadBalancingStrategy for RandomStrategy {
    fn select_index(&self, len: usize) -> Option<usize> {
        if len == 0 {
            return None;
        }
        Some(rand::rng().random_range(0..len))
    }
}

/// Factory for creating load balancing strategies from configuration
pub struct LoadBalancerFactory;

impl LoadBalancerFactory {
    pub fn create_strategy(strategy: LoadBalanceStrategy) -> Box<dyn LoadBalancingStrategy> {
        match strategy {
            LoadBalanceStrategy::RoundRobin => RoundRobinStrategy::new().boxed(),
            LoadBalanceStrategy::Random => RandomStrategy.boxed(),
        }
    }
}
