//! This module provides named monotonic counters.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// A monotonic counter handle, cheap to clone and safe to increment from any thread.
#[derive(Debug, Default, Clone)]
pub struct Counter(Arc<AtomicU64>);

impl Counter {
    #[inline]
    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// A registry of named counters.
#[derive(Debug, Default)]
pub struct Metrics {
    counters: RwLock<HashMap<String, Counter>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a counter, or return the one already registered under `name`.
    pub fn register_counter(&self, name: &str) -> Counter {
        if let Some(counter) = self.counter(name) {
            return counter;
        }

        self.counters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_owned())
            .or_default()
            .clone()
    }

    pub fn counter(&self, name: &str) -> Option<Counter> {
        self.counters.read().unwrap_or_else(PoisonError::into_inner).get(name).cloned()
    }

    /// Current value of every counter, sorted by name.
    pub fn snapshot(&self) -> Vec<(String, u64)> {
        let mut values: Vec<_> = self
            .counters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, counter)| (name.clone(), counter.get()))
            .collect();
        values.sort_unstable();
        values
    }
}
