// src/core/scan.rs

//! One scan from creation to a terminal state.
//!
//! The [`ScanController`] owns everything a scan needs: its module instances,
//! dispatch graph, delivery ledger and worker pool. Callers keep a cheap
//! [`ScanHandle`] to watch the status, subscribe to lifecycle signals and
//! request a stop.
//!
//! States: `CREATED -> STARTING -> RUNNING -> {FINISHED | ABORTED | ERROR-FAILED | STOPPED}`,
//! plus `CREATED -> SKIPPED` when the target does not validate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::core::dispatch::{DispatchGraph, Lane};
use crate::core::error::{ModuleError, StoreError};
use crate::core::models::{
    Event, EventDraft, LogLevel, PutOutcome, ScanId, ScanLogEntry, ScanRecord, ScanStatus, TargetType,
};
use crate::core::pool::{self, PoolSettings, PoolStats, Submitter, Task, TaskHandler, WorkerPool};
use crate::core::registry::{ModuleInstance, ModuleRegistry};
use crate::core::store::ResultStore;

/// Reason attached to scans stopped by the event-count circuit breaker.
pub const CEILING_REASON: &str = "resource ceiling exceeded";

// --- Requests & Signals ---

/// Everything needed to create a scan.
#[derive(Debug, Clone, Default)]
pub struct ScanRequest {
    pub id: Option<ScanId>,
    pub name: Option<String>,
    pub target: String,
    /// Detected from the target when not given.
    pub target_type: Option<TargetType>,
    /// Module names to run. Empty means every registered module.
    pub module_set: Vec<String>,
    /// Per-module option overrides, keyed by module name.
    pub module_options: HashMap<String, Map<String, Value>>,
    /// Replaces the manager's engine settings for this scan only.
    pub config: Option<EngineConfig>,
}

impl ScanRequest {
    pub fn new(target: &str) -> Self {
        Self { target: target.to_string(), ..Default::default() }
    }

    pub fn id(mut self, id: ScanId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn target_type(mut self, target_type: TargetType) -> Self {
        self.target_type = Some(target_type);
        self
    }

    pub fn modules<I, S>(mut self, modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.module_set = modules.into_iter().map(Into::into).collect();
        self
    }

    pub fn option(mut self, module: &str, key: &str, value: Value) -> Self {
        self.module_options.entry(module.to_string()).or_default().insert(key.to_string(), value);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SignalKind {
    Started,
    StatusChanged { from: ScanStatus, to: ScanStatus },
    Finished { status: ScanStatus },
    Error { message: String },
}

/// Lifecycle notification for external dispatchers (webhooks, UIs). The
/// engine never retries or delivers these itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanSignal {
    pub scan_id: ScanId,
    pub kind: SignalKind,
    pub at: DateTime<Utc>,
}

/// Final report returned when a scan's controller exits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanOutcome {
    pub scan_id: ScanId,
    pub status: ScanStatus,
    pub reason: Option<String>,
    pub event_count: usize,
    pub module_errors: usize,
}

// --- Halting ---

#[derive(Debug, Clone, PartialEq, Eq)]
enum Halt {
    Stopped,
    Aborted(String),
    Failed(String),
}

impl Halt {
    fn status(&self) -> ScanStatus {
        match self {
            Halt::Stopped => ScanStatus::Stopped,
            Halt::Aborted(_) => ScanStatus::Aborted,
            Halt::Failed(_) => ScanStatus::ErrorFailed,
        }
    }

    fn reason(&self) -> Option<String> {
        match self {
            Halt::Stopped => Some("stopped by request".to_string()),
            Halt::Aborted(reason) | Halt::Failed(reason) => Some(reason.clone()),
        }
    }
}

/// State shared between a scan's controller, runtime and handles. The first
/// recorded halt wins.
#[derive(Debug, Default)]
struct ScanControl {
    cancel: CancellationToken,
    halt: OnceLock<Halt>,
    stored: AtomicUsize,
}

impl ScanControl {
    fn halt(&self, halt: Halt) {
        if self.halt.set(halt).is_ok() {
            self.cancel.cancel();
        }
    }

    fn is_halted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn stored(&self) -> usize {
        self.stored.load(Ordering::SeqCst)
    }
}

/// Cheap, cloneable view of a running scan.
#[derive(Debug, Clone)]
pub struct ScanHandle {
    id: ScanId,
    status: watch::Receiver<ScanStatus>,
    signals: broadcast::Sender<ScanSignal>,
    control: Arc<ScanControl>,
}

impl ScanHandle {
    pub fn id(&self) -> &ScanId {
        &self.id
    }

    pub fn status(&self) -> ScanStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ScanSignal> {
        self.signals.subscribe()
    }

    /// Events stored so far.
    pub fn event_count(&self) -> usize {
        self.control.stored()
    }

    /// Operator stop. The scan ends `STOPPED`.
    pub fn stop(&self) {
        self.control.halt(Halt::Stopped);
    }

    /// Policy abort. The scan ends `ABORTED` with `reason`.
    pub fn abort(&self, reason: &str) {
        self.control.halt(Halt::Aborted(reason.to_string()));
    }

    /// Resolves once the scan reaches a terminal state.
    pub async fn wait(&self) -> ScanStatus {
        let mut status = self.status.clone();
        let result = status.wait_for(|s| s.is_terminal()).await.map(|s| *s);
        result.unwrap_or_else(|_| *self.status.borrow())
    }
}

// --- Controller ---

pub struct ScanController {
    request: ScanRequest,
    record: ScanRecord,
    config: EngineConfig,
    registry: Arc<ModuleRegistry>,
    store: Arc<dyn ResultStore>,
    status: watch::Sender<ScanStatus>,
    signals: broadcast::Sender<ScanSignal>,
    control: Arc<ScanControl>,
}

impl ScanController {
    pub fn new(
        request: ScanRequest,
        registry: Arc<ModuleRegistry>,
        store: Arc<dyn ResultStore>,
        config: EngineConfig,
    ) -> Self {
        let id = request.id.clone().unwrap_or_else(ScanId::generate);
        let config = request.config.clone().unwrap_or(config);
        let record = ScanRecord {
            id: id.clone(),
            name: request.name.clone().unwrap_or_else(|| request.target.clone()),
            target: request.target.clone(),
            target_type: request
                .target_type
                .or_else(|| TargetType::detect(&request.target))
                .unwrap_or(TargetType::DomainName),
            module_set: request.module_set.clone(),
            status: ScanStatus::Created,
            reason: None,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            event_count: 0,
        };
        let (status, _) = watch::channel(ScanStatus::Created);
        let (signals, _) = broadcast::channel(config.signal_buffer.max(1));
        Self { request, record, config, registry, store, status, signals, control: Arc::default() }
    }

    pub fn id(&self) -> &ScanId {
        &self.record.id
    }

    pub fn handle(&self) -> ScanHandle {
        ScanHandle {
            id: self.record.id.clone(),
            status: self.status.subscribe(),
            signals: self.signals.clone(),
            control: self.control.clone(),
        }
    }

    /// Resolves the target's type and seed data, or explains why it is invalid.
    pub fn validate_target(&self) -> Result<(TargetType, String), String> {
        resolve_target(&self.request.target, self.request.target_type)
    }

    /// Drives the scan to a terminal state. Never returns while `RUNNING`.
    pub async fn run(mut self) -> ScanOutcome {
        let scan_id = self.record.id.clone();
        info!(scan_id = %scan_id, target = %self.record.target, "Creating scan.");

        if let Err(e) = self.store.put_scan(&self.record).await {
            error!(scan_id = %scan_id, error = %e, "Could not register scan with the store.");
            self.record.reason = Some(e.to_string());
            self.set_status(ScanStatus::ErrorFailed);
            self.signal(SignalKind::Error { message: e.to_string() });
            return self.outcome(0);
        }

        let (target_type, seed_data) = match self.validate_target() {
            Ok(resolved) => resolved,
            Err(message) => {
                warn!(scan_id = %scan_id, target = %self.record.target, %message, "Target validation failed.");
                self.log(LogLevel::Error, "engine", format!("Invalid target: {message}")).await;
                return self.finish(ScanStatus::Skipped, Some(message), 0, 0).await;
            }
        };
        self.record.target_type = target_type;

        let registry = self.registry.clone();
        let descriptors = match registry.list_modules(&self.request.module_set) {
            Ok(descriptors) => descriptors,
            Err(e) => {
                self.log(LogLevel::Error, "engine", e.to_string()).await;
                return self.finish(ScanStatus::ErrorFailed, Some(e.to_string()), 0, 0).await;
            }
        };

        if let Err(e) = self.transition(ScanStatus::Starting).await {
            return self.finish(ScanStatus::ErrorFailed, Some(e.to_string()), 0, 0).await;
        }
        self.signal(SignalKind::Started);

        let mut instances = Vec::new();
        let mut module_errors = 0;
        let no_options = Map::new();
        for descriptor in descriptors {
            let overrides = self.request.module_options.get(&descriptor.name).unwrap_or(&no_options);
            match descriptor.instantiate(overrides) {
                Ok(instance) => instances.push(instance),
                Err(e) => {
                    module_errors += 1;
                    warn!(scan_id = %scan_id, module = %descriptor.name, error = %e, "Module could not be started.");
                    self.log(LogLevel::Error, &descriptor.name, e.to_string()).await;
                }
            }
        }
        info!(scan_id = %scan_id, modules = instances.len(), "Modules instantiated.");

        let graph = DispatchGraph::build(instances, self.config.max_depth);
        let lane_limits = graph.lane_limits();
        let (submitter, inbox) = pool::channel();
        let runtime = Arc::new(ScanRuntime::new(
            scan_id.clone(),
            graph,
            self.store.clone(),
            submitter,
            self.control.clone(),
            &self.config,
            module_errors,
        ));
        let pool = WorkerPool::start(
            inbox,
            runtime.clone(),
            lane_limits,
            PoolSettings { max_threads: self.config.max_threads, timeout: self.config.module_timeout },
            self.control.cancel.child_token(),
        );

        let seed = Event::seed(&scan_id, target_type.seed_event_type(), &seed_data);
        debug!(scan_id = %scan_id, hash = %seed.hash, event_type = %seed.event_type, "Seeding scan.");
        if let Err(e) = runtime.emit(seed).await {
            self.control.halt(Halt::Failed(format!("store write failed: {e}")));
        }

        if !self.control.is_halted() {
            if let Err(e) = self.transition(ScanStatus::Running).await {
                self.control.halt(Halt::Failed(e.to_string()));
            }
        }

        let mut stats = pool.subscribe();
        self.await_quiescence(&mut stats).await;
        let final_stats = pool.shutdown().await;
        debug!(scan_id = %scan_id, ?final_stats, "Worker pool drained.");

        let (status, reason) = match self.control.halt.get() {
            Some(halt) => (halt.status(), halt.reason()),
            None => (ScanStatus::Finished, None),
        };
        let event_count = runtime.stored();
        let module_errors = runtime.module_errors();
        drop(runtime);
        self.finish(status, reason, event_count, module_errors).await
    }

    /// Returns once the pool has stayed idle for a full settle window, or
    /// as soon as the scan is halted.
    async fn await_quiescence(&self, stats: &mut watch::Receiver<PoolStats>) {
        let settle = self.config.settle_window;
        loop {
            tokio::select! {
                _ = self.control.cancel.cancelled() => return,
                idle = stats.wait_for(PoolStats::is_idle) => {
                    if idle.is_err() {
                        return;
                    }
                }
            }
            let mark = stats.borrow().submitted;
            tokio::select! {
                _ = self.control.cancel.cancelled() => return,
                _ = tokio::time::sleep(settle) => {}
            }
            let now = *stats.borrow();
            if now.is_idle() && now.submitted == mark {
                debug!(scan_id = %self.record.id, submitted = now.submitted, "Scan is quiescent.");
                return;
            }
        }
    }

    async fn transition(&mut self, next: ScanStatus) -> Result<(), StoreError> {
        let previous = self.record.status;
        if !previous.can_transition_to(next) {
            warn!(scan_id = %self.record.id, from = %previous, to = %next, "Ignoring invalid status transition.");
            return Ok(());
        }
        self.record.status = next;
        self.record.event_count = self.control.stored();
        match next {
            ScanStatus::Starting => self.record.started_at = Some(Utc::now()),
            s if s.is_terminal() => self.record.ended_at = Some(Utc::now()),
            _ => {}
        }
        self.set_status(next);
        self.signal(SignalKind::StatusChanged { from: previous, to: next });
        info!(scan_id = %self.record.id, from = %previous, to = %next, "Scan status changed.");
        self.store.update_scan(&self.record).await
    }

    async fn finish(
        mut self,
        status: ScanStatus,
        reason: Option<String>,
        event_count: usize,
        module_errors: usize,
    ) -> ScanOutcome {
        self.record.reason = reason.clone();
        self.record.event_count = event_count;
        let mut status = status;
        if let Err(e) = self.transition(status).await {
            error!(scan_id = %self.record.id, error = %e, "Could not persist final scan status.");
            status = ScanStatus::ErrorFailed;
            self.record.status = status;
            self.record.reason = Some(e.to_string());
            self.set_status(status);
        }
        if status == ScanStatus::ErrorFailed {
            let message = self.record.reason.clone().unwrap_or_else(|| "scan failed".to_string());
            self.log(LogLevel::Error, "engine", message.clone()).await;
            self.signal(SignalKind::Error { message });
        }
        if let Some(reason) = &reason {
            if status != ScanStatus::ErrorFailed {
                self.log(LogLevel::Info, "engine", format!("Scan ended {status}: {reason}")).await;
            }
        }
        self.signal(SignalKind::Finished { status });
        info!(scan_id = %self.record.id, %status, events = event_count, module_errors, "Scan ended.");
        self.outcome(module_errors)
    }

    fn outcome(&self, module_errors: usize) -> ScanOutcome {
        ScanOutcome {
            scan_id: self.record.id.clone(),
            status: self.record.status,
            reason: self.record.reason.clone(),
            event_count: self.record.event_count,
            module_errors,
        }
    }

    fn set_status(&mut self, status: ScanStatus) {
        self.record.status = status;
        self.status.send_replace(status);
    }

    fn signal(&self, kind: SignalKind) {
        let _ = self.signals.send(ScanSignal { scan_id: self.record.id.clone(), kind, at: Utc::now() });
    }

    async fn log(&self, level: LogLevel, component: &str, message: String) {
        append_log(self.store.as_ref(), &self.record.id, level, component, message).await;
    }
}

/// Resolves a raw target into its type and the seed event's data.
pub fn resolve_target(target: &str, explicit: Option<TargetType>) -> Result<(TargetType, String), String> {
    let target_type = match explicit {
        Some(target_type) => {
            target_type.validate(target)?;
            target_type
        }
        None => TargetType::detect(target).ok_or_else(|| "target type could not be determined".to_string())?,
    };
    Ok((target_type, target_type.normalize(target)))
}

async fn append_log(store: &dyn ResultStore, scan_id: &ScanId, level: LogLevel, component: &str, message: String) {
    let entry = ScanLogEntry::new(scan_id, level, component, message);
    if let Err(e) = store.append_log(&entry).await {
        warn!(scan_id = %scan_id, error = %e, "Could not write scan log entry.");
    }
}

// --- Runtime ---

/// State shared by every task of one scan: routing, persistence, ceilings.
struct ScanRuntime {
    scan_id: ScanId,
    graph: DispatchGraph,
    store: Arc<dyn ResultStore>,
    submitter: Submitter,
    control: Arc<ScanControl>,
    max_events: Option<usize>,
    max_event_bytes: usize,
    disable_on_error: bool,
    reserved: AtomicUsize,
    module_errors: AtomicUsize,
    disabled: Vec<AtomicBool>,
}

impl ScanRuntime {
    fn new(
        scan_id: ScanId,
        graph: DispatchGraph,
        store: Arc<dyn ResultStore>,
        submitter: Submitter,
        control: Arc<ScanControl>,
        config: &EngineConfig,
        startup_errors: usize,
    ) -> Self {
        let disabled = graph.modules().iter().map(|_| AtomicBool::new(false)).collect();
        Self {
            scan_id,
            graph,
            store,
            submitter,
            control,
            max_events: config.max_events,
            max_event_bytes: config.max_event_bytes,
            disable_on_error: config.disable_module_on_error,
            reserved: AtomicUsize::new(0),
            module_errors: AtomicUsize::new(startup_errors),
            disabled,
        }
    }

    fn stored(&self) -> usize {
        self.control.stored()
    }

    fn module_errors(&self) -> usize {
        self.module_errors.load(Ordering::SeqCst)
    }

    /// Persists an event and dispatches it to every interested module that
    /// has not seen it yet. Only store failures are returned.
    async fn emit(&self, event: Event) -> Result<(), StoreError> {
        if let Some(max_events) = self.max_events {
            let reservation = self
                .reserved
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < max_events).then_some(n + 1));
            if reservation.is_err() {
                warn!(scan_id = %self.scan_id, max_events, "Event ceiling reached, aborting scan.");
                self.control.halt(Halt::Aborted(format!("{CEILING_REASON} ({max_events} events)")));
                return Ok(());
            }
        }

        match self.store.put_event(&event).await {
            Ok(PutOutcome::Stored) => {
                self.control.stored.fetch_add(1, Ordering::SeqCst);
            }
            Ok(PutOutcome::Duplicate) => {
                self.release_reservation();
                debug!(scan_id = %self.scan_id, hash = %event.hash, "Duplicate event not stored.");
                return Ok(());
            }
            Err(e) => {
                self.release_reservation();
                return Err(e);
            }
        }

        if self.control.is_halted() {
            return Ok(());
        }
        let event = Arc::new(event);
        for lane in self.graph.route(&event) {
            self.submitter.submit(Task { lane, event: event.clone() });
        }
        Ok(())
    }

    fn release_reservation(&self) {
        if self.max_events.is_some() {
            self.reserved.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Drops drafts the engine will not accept, with a warning for each.
    fn accept_draft(&self, module: &ModuleInstance, draft: &EventDraft) -> bool {
        if !module.produces(&draft.event_type) {
            warn!(
                scan_id = %self.scan_id,
                module = %module.name,
                event_type = %draft.event_type,
                "Module emitted an undeclared event type, dropping it."
            );
            return false;
        }
        if draft.data.is_empty() || draft.data.len() > self.max_event_bytes {
            warn!(
                scan_id = %self.scan_id,
                module = %module.name,
                bytes = draft.data.len(),
                "Event payload empty or over the size bound, dropping it."
            );
            return false;
        }
        true
    }

    async fn module_failed(&self, lane: Lane, error: ModuleError) {
        let module = self.graph.module(lane);
        self.module_errors.fetch_add(1, Ordering::SeqCst);
        error!(scan_id = %self.scan_id, module = %module.name, error = %error, "Module invocation failed.");
        append_log(self.store.as_ref(), &self.scan_id, LogLevel::Error, &module.name, error.to_string()).await;
        if self.disable_on_error && !self.disabled[lane].swap(true, Ordering::SeqCst) {
            info!(scan_id = %self.scan_id, module = %module.name, "Module disabled for the rest of the scan.");
        }
    }
}

#[async_trait]
impl TaskHandler for ScanRuntime {
    async fn invoke(&self, task: &Task) -> Result<Vec<EventDraft>, ModuleError> {
        if self.control.is_halted() || self.disabled[task.lane].load(Ordering::SeqCst) {
            return Ok(Vec::new());
        }
        let module = self.graph.module(task.lane);
        debug!(
            scan_id = %self.scan_id,
            module = %module.name,
            event_type = %task.event.event_type,
            hash = %task.event.hash,
            "Invoking module."
        );
        module.module.handle(&task.event).await
    }

    async fn complete(&self, task: Task, outcome: Result<Vec<EventDraft>, ModuleError>) {
        let drafts = match outcome {
            Ok(drafts) => drafts,
            Err(e) => return self.module_failed(task.lane, e).await,
        };
        let module = self.graph.module(task.lane);
        for draft in drafts {
            if !self.accept_draft(module, &draft) {
                continue;
            }
            let child = Event::derive(&task.event, &module.name, draft);
            if let Err(e) = self.emit(child).await {
                error!(scan_id = %self.scan_id, error = %e, "Store write failed, failing scan.");
                self.control.halt(Halt::Failed(format!("store write failed: {e}")));
                return;
            }
        }
    }

    fn lane_name(&self, lane: Lane) -> String {
        self.graph.module(lane).name.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_target_detects_and_normalises() {
        let (target_type, data) = resolve_target("Example.com", None).unwrap();
        assert_eq!(target_type, TargetType::DomainName);
        assert_eq!(data, "example.com");
    }

    #[test]
    fn test_resolve_target_rejects_mismatched_type() {
        assert!(resolve_target("example.com", Some(TargetType::IpAddress)).is_err());
        assert!(resolve_target("???", None).is_err());
    }

    #[test]
    fn test_first_halt_wins() {
        let control = ScanControl::default();
        control.halt(Halt::Aborted(CEILING_REASON.into()));
        control.halt(Halt::Stopped);
        assert!(control.is_halted());
        assert_eq!(control.halt.get().map(Halt::status), Some(ScanStatus::Aborted));
    }

    #[test]
    fn test_request_builder() {
        let request = ScanRequest::new("example.com")
            .modules(["dns_resolve", "port_scan"])
            .option("port_scan", "ports", serde_json::json!([443]));
        assert_eq!(request.module_set.len(), 2);
        assert!(request.module_options["port_scan"].contains_key("ports"));
    }
}
