// src/lib.rs

//! Reconnaissance scan engine: modules feed each other's discoveries through
//! a per-scan dispatch graph, and a rule engine correlates what they found.

pub mod config;
pub mod core;
pub mod logging;

pub use crate::config::EngineConfig;
pub use crate::core::correlation::{CorrelationEngine, CorrelationResult, CorrelationRun};
pub use crate::core::error::{EngineError, EngineResult, ModuleError, RuleError, StoreError};
pub use crate::core::models::{Event, EventDraft, ScanId, ScanStatus, TargetType};
pub use crate::core::orchestrator::{ScanManager, Workspace, WorkspaceReport};
pub use crate::core::registry::{Module, ModuleDescriptor, ModuleRegistry};
pub use crate::core::scan::{ScanOutcome, ScanRequest};
pub use crate::core::store::{MemoryStore, ResultStore};
