// src/core/mod.rs

// Everything engine-related lives under `core`: the data model and errors,
// the module registry, the scan machinery (dispatch graph, worker pool,
// scan controller), correlation, the built-in modules and the orchestrator.

/// Events, scans, target types and the other shared data structures.
pub mod models;

/// Typed errors for every layer.
pub mod error;

pub mod registry;
pub mod store;
pub mod dispatch;
pub mod pool;

/// Scan lifecycle: state machine, handles and lifecycle signals.
pub mod scan;

/// Rule language, evaluator and runner for correlating stored events.
pub mod correlation;

/// Built-in collection modules.
pub mod modules;

pub mod orchestrator;
