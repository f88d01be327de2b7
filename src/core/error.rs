// src/core/error.rs

//! Typed errors for every layer of the engine.
//!
//! Module and rule errors are recovered locally by the engine and only ever
//! show up in logs and run summaries. Store and validation errors are the ones
//! that terminate a scan or surface to the caller.

use thiserror::Error;

use crate::core::models::ScanId;

/// Failure reported by the result store. Fatal to the scan that hit it.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("scan {0} is not known to the store")]
    UnknownScan(ScanId),
    #[error("store write failed: {0}")]
    Write(String),
    #[error("store read failed: {0}")]
    Read(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Failure of a single module invocation or module construction.
#[derive(Debug, Clone, Error)]
pub enum ModuleError {
    #[error("module {module} failed: {message}")]
    Failed { module: String, message: String },
    #[error("module {module} timed out after {timeout_ms} ms")]
    TimedOut { module: String, timeout_ms: u64 },
    #[error("module {module} panicked")]
    Panicked { module: String },
    #[error("invalid options for module {module}: {message}")]
    InvalidOptions { module: String, message: String },
}

impl ModuleError {
    /// Shorthand used by module implementations to report a failed call.
    pub fn failed(module: &str, message: impl Into<String>) -> Self {
        ModuleError::Failed { module: module.to_string(), message: message.into() }
    }
}

/// Failure while compiling or evaluating one correlation rule.
#[derive(Debug, Clone, Error)]
pub enum RuleError {
    #[error("rule {rule} is invalid: {message}")]
    Invalid { rule: String, message: String },
    #[error("rule {rule} has a bad pattern '{pattern}': {message}")]
    BadPattern { rule: String, pattern: String, message: String },
    #[error("rule {rule} panicked during evaluation")]
    Panicked { rule: String },
    #[error("rule {rule} was interrupted before it finished")]
    Interrupted { rule: String },
}

/// Errors surfaced to callers of the orchestration API.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown module '{0}'")]
    UnknownModule(String),
    #[error("invalid target '{target}': {message}")]
    InvalidTarget { scan_id: ScanId, target: String, message: String },
    #[error("unknown scan {0}")]
    UnknownScan(ScanId),
    #[error("scan {0} is still running")]
    ScanStillRunning(ScanId),
    #[error("unknown correlation rule '{0}'")]
    UnknownRule(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("operation cancelled")]
    Cancelled,
}

pub type EngineResult<T> = Result<T, EngineError>;
