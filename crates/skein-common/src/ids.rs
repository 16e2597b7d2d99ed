//! Deterministic id generation.
//!
//! Unlike user-facing platform ids (which favor randomness for
//! unguessability), filter instance names and `$GINC` tokens must be
//! *stable and reproducible* across runs of the same pipeline, so this
//! module is all monotonic counters rather than random generators.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Per-session counter handing out the `<register_name>#<n>` auto name
/// assigned to a filter instance that wasn't given an explicit `N=` arg.
#[derive(Debug, Default)]
pub struct AutoNamer {
    next: Mutex<HashMap<String, u64>>,
}

impl AutoNamer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the next auto-assigned name for `register_name`, e.g. `rfnalu#2`.
    pub fn next_name(&self, register_name: &str) -> String {
        let mut next = self.next.lock().unwrap();
        let counter = next.entry(register_name.to_string()).or_insert(0);
        let n = *counter;
        *counter += 1;
        format!("{register_name}#{n}")
    }
}

/// Implements the `$GINC(seed[,step])` argument token: a value that is
/// stable per `(filter register, seed)` and increases by `step` (default 1)
/// across filter instances sharing the same seed.
#[derive(Debug, Default)]
pub struct GincCounters {
    counters: Mutex<HashMap<String, AtomicU64>>,
}

impl GincCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the next value for `seed`, advancing it by `step`.
    pub fn next(&self, seed: &str, step: u64) -> u64 {
        let mut counters = self.counters.lock().unwrap();
        let entry = counters
            .entry(seed.to_string())
            .or_insert_with(|| AtomicU64::new(0));
        entry.fetch_add(step.max(1), Ordering::SeqCst)
    }
}
