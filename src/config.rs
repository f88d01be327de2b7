// src/config.rs

//! Engine configuration.
//!
//! Every field has a default so a config file only needs to list what it
//! changes. Durations are written as milliseconds.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::error::EngineError;

/// Tunables shared by every scan an engine runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on module invocations running at once within one scan.
    pub max_threads: usize,
    /// Time allowed for a single module invocation.
    #[serde(with = "millis")]
    pub module_timeout: Duration,
    /// Quiet period the pool must stay idle before a scan is declared finished.
    #[serde(with = "millis")]
    pub settle_window: Duration,
    /// Stored-event ceiling per scan. `None` disables the circuit breaker.
    pub max_events: Option<usize>,
    /// Events deeper than this are stored but never dispatched.
    pub max_depth: Option<u32>,
    /// Largest accepted event payload, in bytes.
    pub max_event_bytes: usize,
    /// Stop invoking a module for the rest of the scan after its first failure.
    pub disable_module_on_error: bool,
    /// Correlation results of rules below this confidence are not reported.
    pub confidence_floor: u8,
    /// Capacity of each scan's lifecycle signal channel.
    pub signal_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_threads: 3,
            module_timeout: Duration::from_secs(300),
            settle_window: Duration::from_millis(250),
            max_events: Some(100_000),
            max_depth: None,
            max_event_bytes: 1024 * 1024,
            disable_module_on_error: true,
            confidence_floor: 0,
            signal_buffer: 256,
        }
    }
}

impl EngineConfig {
    /// Loads a JSON config file; missing fields keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, EngineError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("cannot read {}: {e}", path.display())))?;
        let config: EngineConfig = serde_json::from_str(&raw)
            .map_err(|e| EngineError::Config(format!("cannot parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.max_threads == 0 {
            return Err(EngineError::Config("max_threads must be at least 1".into()));
        }
        if self.module_timeout.is_zero() {
            return Err(EngineError::Config("module_timeout must be positive".into()));
        }
        if self.settle_window.is_zero() {
            return Err(EngineError::Config("settle_window must be positive".into()));
        }
        if self.max_events == Some(0) {
            return Err(EngineError::Config("max_events must be at least 1".into()));
        }
        if self.confidence_floor > 100 {
            return Err(EngineError::Config("confidence_floor must be within 0-100".into()));
        }
        if self.signal_buffer == 0 {
            return Err(EngineError::Config("signal_buffer must be at least 1".into()));
        }
        Ok(())
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
