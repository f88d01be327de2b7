// src/core/orchestrator.rs

//! The caller-facing API: create scans, follow them, stop them and
//! correlate their results. [`Workspace`] fans a set of targets out over one
//! [`ScanManager`] and correlates across all of them.

use std::sync::Arc;

use dashmap::DashMap;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::core::correlation::{CorrelationEngine, CorrelationResult, CorrelationRun};
use crate::core::error::{EngineError, EngineResult};
use crate::core::models::{Event, EventFilter, ScanId, ScanLogEntry, ScanRecord, ScanStatus};
use crate::core::registry::ModuleRegistry;
use crate::core::scan::{ScanController, ScanHandle, ScanOutcome, ScanRequest, ScanSignal};
use crate::core::store::ResultStore;

/// A scan the manager launched and has not released yet.
struct LiveScan {
    handle: ScanHandle,
    outcome: watch::Receiver<Option<ScanOutcome>>,
}

/// Owns the scanId -> controller map and the shared engine collaborators.
pub struct ScanManager {
    registry: Arc<ModuleRegistry>,
    store: Arc<dyn ResultStore>,
    config: EngineConfig,
    correlation: CorrelationEngine,
    scans: DashMap<ScanId, LiveScan>,
}

impl ScanManager {
    pub fn new(registry: ModuleRegistry, store: Arc<dyn ResultStore>, config: EngineConfig) -> Self {
        let correlation = CorrelationEngine::with_builtin_rules()
            .unwrap_or_else(|e| {
                warn!(error = %e, "Built-in correlation rules failed to load.");
                CorrelationEngine::default()
            })
            .confidence_floor(config.confidence_floor);
        Self { registry: Arc::new(registry), store, config, correlation, scans: DashMap::new() }
    }

    /// Replaces the built-in rule set. The configured confidence floor is kept.
    pub fn with_correlation(mut self, engine: CorrelationEngine) -> Self {
        self.correlation = engine.confidence_floor(self.config.confidence_floor);
        self
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn ResultStore> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn correlation(&self) -> &CorrelationEngine {
        &self.correlation
    }

    /// Validates and launches a scan, returning its id immediately.
    ///
    /// An invalid target is still recorded, as `SKIPPED`, before the error is returned.
    pub async fn create_scan(&self, request: ScanRequest) -> EngineResult<ScanId> {
        self.registry.list_modules(&request.module_set)?;
        if let Some(config) = &request.config {
            config.validate()?;
        }
        let target = request.target.clone();
        let controller = ScanController::new(request, self.registry.clone(), self.store.clone(), self.config.clone());
        let scan_id = controller.id().clone();

        if let Err(message) = controller.validate_target() {
            let outcome = controller.run().await;
            warn!(scan_id = %scan_id, target = %target, status = %outcome.status, "Rejected scan target.");
            return Err(EngineError::InvalidTarget { scan_id, target, message });
        }

        let handle = controller.handle();
        let (outcome_tx, outcome) = watch::channel(None);
        tokio::spawn(async move {
            let finished = controller.run().await;
            outcome_tx.send_replace(Some(finished));
        });
        self.scans.insert(scan_id.clone(), LiveScan { handle, outcome });
        info!(scan_id = %scan_id, target = %target, "Scan launched.");
        Ok(scan_id)
    }

    fn handle(&self, scan_id: &ScanId) -> Option<ScanHandle> {
        self.scans.get(scan_id).map(|live| live.handle.clone())
    }

    async fn record(&self, scan_id: &ScanId) -> EngineResult<ScanRecord> {
        self.store.get_scan(scan_id).await?.ok_or_else(|| EngineError::UnknownScan(scan_id.clone()))
    }

    pub async fn get_status(&self, scan_id: &ScanId) -> EngineResult<ScanStatus> {
        match self.handle(scan_id) {
            Some(handle) => Ok(handle.status()),
            None => Ok(self.record(scan_id).await?.status),
        }
    }

    /// The stored record. A live scan's event count is read from its runtime.
    pub async fn get_scan(&self, scan_id: &ScanId) -> EngineResult<ScanRecord> {
        let mut record = self.record(scan_id).await?;
        if let Some(handle) = self.handle(scan_id) {
            if !record.status.is_terminal() {
                record.event_count = handle.event_count();
            }
        }
        Ok(record)
    }

    pub async fn list_scans(&self) -> EngineResult<Vec<ScanRecord>> {
        Ok(self.store.list_scans().await?)
    }

    /// Requests an operator stop. Stopping a finished scan is a no-op.
    pub async fn stop(&self, scan_id: &ScanId) -> EngineResult<()> {
        match self.handle(scan_id) {
            Some(handle) => {
                info!(scan_id = %scan_id, "Stop requested.");
                handle.stop();
                Ok(())
            }
            None => self.record(scan_id).await.map(|_| ()),
        }
    }

    /// Aborts a running scan for a policy reason.
    pub async fn abort(&self, scan_id: &ScanId, reason: &str) -> EngineResult<()> {
        match self.handle(scan_id) {
            Some(handle) => {
                handle.abort(reason);
                Ok(())
            }
            None => self.record(scan_id).await.map(|_| ()),
        }
    }

    pub fn subscribe(&self, scan_id: &ScanId) -> EngineResult<broadcast::Receiver<ScanSignal>> {
        self.handle(scan_id)
            .map(|handle| handle.subscribe())
            .ok_or_else(|| EngineError::UnknownScan(scan_id.clone()))
    }

    /// Waits for a launched scan to end and returns its outcome.
    pub async fn wait(&self, scan_id: &ScanId) -> EngineResult<ScanOutcome> {
        let receiver = self.scans.get(scan_id).map(|live| live.outcome.clone());
        let Some(mut receiver) = receiver else {
            let record = self.record(scan_id).await?;
            return Ok(outcome_from_record(&record));
        };
        let finished = receiver.wait_for(Option::is_some).await.map(|outcome| outcome.clone());
        match finished {
            Ok(Some(outcome)) => Ok(outcome),
            _ => {
                warn!(scan_id = %scan_id, "Scan task ended without reporting an outcome.");
                Ok(outcome_from_record(&self.record(scan_id).await?))
            }
        }
    }

    /// Drops the manager's handle on a terminated scan. Its results stay in the store.
    pub fn release(&self, scan_id: &ScanId) -> EngineResult<()> {
        let status = self.handle(scan_id).map(|h| h.status()).ok_or_else(|| EngineError::UnknownScan(scan_id.clone()))?;
        if !status.is_terminal() {
            return Err(EngineError::ScanStillRunning(scan_id.clone()));
        }
        self.scans.remove(scan_id);
        Ok(())
    }

    /// Deletes a terminated scan and everything stored for it.
    pub async fn delete_scan(&self, scan_id: &ScanId) -> EngineResult<()> {
        if let Some(handle) = self.handle(scan_id) {
            if !handle.status().is_terminal() {
                return Err(EngineError::ScanStillRunning(scan_id.clone()));
            }
            self.scans.remove(scan_id);
        }
        self.record(scan_id).await?;
        self.store.delete_scan(scan_id).await?;
        info!(scan_id = %scan_id, "Scan deleted.");
        Ok(())
    }

    pub async fn events(&self, scan_id: &ScanId, filter: &EventFilter) -> EngineResult<Vec<Event>> {
        Ok(self.store.get_events(scan_id, filter).await?)
    }

    pub async fn logs(&self, scan_id: &ScanId) -> EngineResult<Vec<ScanLogEntry>> {
        Ok(self.store.get_logs(scan_id).await?)
    }

    pub async fn correlations(&self, scan_id: &ScanId) -> EngineResult<Vec<CorrelationResult>> {
        Ok(self.store.get_correlations(scan_id).await?)
    }

    /// Flags (or clears) events and their descendants as false positives.
    pub async fn mark_false_positive(&self, scan_id: &ScanId, hashes: &[String], flag: bool) -> EngineResult<usize> {
        Ok(self.store.mark_false_positive(scan_id, hashes, flag).await?)
    }

    pub async fn run_correlation(
        &self,
        scan_ids: &[ScanId],
        rule_ids: Option<&[String]>,
    ) -> EngineResult<CorrelationRun> {
        self.run_correlation_until(scan_ids, rule_ids, &CancellationToken::new()).await
    }

    /// Like [`Self::run_correlation`], abandoning the run without writing anything if `cancel` fires.
    pub async fn run_correlation_until(
        &self,
        scan_ids: &[ScanId],
        rule_ids: Option<&[String]>,
        cancel: &CancellationToken,
    ) -> EngineResult<CorrelationRun> {
        self.correlation.run(self.store.as_ref(), scan_ids, rule_ids, cancel).await
    }
}

fn outcome_from_record(record: &ScanRecord) -> ScanOutcome {
    ScanOutcome {
        scan_id: record.id.clone(),
        status: record.status,
        reason: record.reason.clone(),
        event_count: record.event_count,
        module_errors: 0,
    }
}

// --- Workspace ---

/// A named set of targets scanned together.
#[derive(Debug, Clone, Default)]
pub struct Workspace {
    pub name: String,
    pub targets: Vec<ScanRequest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedTarget {
    pub target: String,
    pub scan_id: Option<ScanId>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkspaceReport {
    pub name: String,
    pub outcomes: Vec<ScanOutcome>,
    pub rejected: Vec<RejectedTarget>,
    pub correlation: CorrelationRun,
}

impl Workspace {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string(), targets: Vec::new() }
    }

    pub fn target(mut self, request: ScanRequest) -> Self {
        self.targets.push(request);
        self
    }

    /// Scans every target concurrently, then correlates across all scans that ran.
    pub async fn run(&self, manager: &ScanManager) -> EngineResult<WorkspaceReport> {
        info!(workspace = %self.name, targets = self.targets.len(), "Starting workspace run.");
        let mut launched = Vec::new();
        let mut rejected = Vec::new();
        for request in &self.targets {
            match manager.create_scan(request.clone()).await {
                Ok(scan_id) => launched.push(scan_id),
                Err(EngineError::InvalidTarget { scan_id, target, message }) => {
                    rejected.push(RejectedTarget { target, scan_id: Some(scan_id), message });
                }
                Err(EngineError::UnknownModule(module)) => rejected.push(RejectedTarget {
                    target: request.target.clone(),
                    scan_id: None,
                    message: format!("unknown module '{module}'"),
                }),
                Err(e) => return Err(e),
            }
        }

        let outcomes = join_all(launched.iter().map(|scan_id| manager.wait(scan_id)))
            .await
            .into_iter()
            .collect::<EngineResult<Vec<_>>>()?;

        let correlation = if launched.is_empty() {
            CorrelationRun::default()
        } else {
            manager.run_correlation(&launched, None).await?
        };
        info!(
            workspace = %self.name,
            scans = outcomes.len(),
            rejected = rejected.len(),
            correlations = correlation.results.len(),
            "Workspace run finished."
        );
        Ok(WorkspaceReport { name: self.name.clone(), outcomes, rejected, correlation })
    }
}
