//! Named event counters

use std::collections::BTreeMap;

/// Monotonic counters keyed by static event names ("enqueued", "rejected", ...).
pub struct Counter {
    counters: BTreeMap<&'static str, usize>,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            counters: BTreeMap::new(),
        }
    }

    pub fn increment(&mut self, name: &'static str, value: usize) {
        *self.counters.entry(name).or_insert(0) += value;
    }

    pub fn get(&self, name: &str) -> usize {
        self.counters.get(name).copied().unwrap_or(0)
    }

    pub fn reset_all(&mut self) {
        self.counters.clear();
    }

    /// Counters in name order.
    pub fn snapshot(&self) -> Vec<(&'static str, usize)> {
        self.counters.iter().map(|(k, v)| (*k, *v)).collect()
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}
