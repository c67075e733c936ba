//! Runtime Configuration
//!
//! Tunables for the per-thread reactive runtime. The configuration is plain
//! data so hosts can load it from JSON alongside their own settings.

use serde::{Deserialize, Serialize};

/// Default number of flush passes a single batch may take before a write is
/// treated as a runaway cycle.
pub const DEFAULT_MAX_FLUSH_ITERATIONS: u32 = 100;

/// Configuration for the reactive runtime of the current thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Number of flush passes after which writing a source fails with
    /// `Error::CycleDetected`.
    pub max_flush_iterations: u32,
}

impl RuntimeConfig {
    /// Parse a configuration from a JSON string. Missing fields keep their
    /// defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serialize the configuration to JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Override the flush pass limit.
    pub fn with_max_flush_iterations(mut self, limit: u32) -> Self {
        self.max_flush_iterations = limit;
        self
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_flush_iterations: DEFAULT_MAX_FLUSH_ITERATIONS,
        }
    }
}
