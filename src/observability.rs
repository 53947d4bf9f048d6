//! Structured logging and lightweight runtime counters.
//!
//! Grounded on the teacher crate's `observability` module: tracing spans
//! wrap each control-loop tick and each batch read/write, and a small
//! counter type tracks cumulative statistics the way
//! `observability/metrics.rs::Counter` does, trimmed to what the control
//! plane actually needs (no histogram/gauge machinery, since nothing here
//! reports latency distributions).

use std::collections::HashMap;

/// Installs a process-wide `tracing` subscriber reading `RUST_LOG`,
/// defaulting to `info`. Safe to call more than once; subsequent calls are
/// no-ops (mirrors `tracing_subscriber`'s own idempotent `try_init`).
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// A monotonically increasing, labeled counter.
#[derive(Debug, Clone)]
pub struct Counter {
    name: String,
    value: u64,
    labels: HashMap<String, String>,
}

impl Counter {
    /// Creates a new counter starting at zero.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: 0,
            labels: HashMap::new(),
        }
    }

    /// Attaches a label, returning `self` for chaining.
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// The counter's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The counter's current value.
    #[must_use]
    pub const fn value(&self) -> u64 {
        self.value
    }

    /// Increments the counter by `amount`, saturating at `u64::MAX`.
    pub fn increment(&mut self, amount: u64) {
        self.value = self.value.saturating_add(amount);
    }

    /// Increments the counter by one.
    pub fn inc(&mut self) {
        self.increment(1);
    }
}
