// tests/common/mod.rs

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use reconflow::core::error::StoreResult;
use reconflow::core::models::{EventFilter, PutOutcome, ScanLogEntry, ScanRecord};
use reconflow::{
    CorrelationResult, EngineConfig, Event, EventDraft, MemoryStore, Module, ModuleDescriptor, ModuleError,
    ModuleRegistry, ResultStore, ScanId, StoreError,
};

pub fn fast_config() -> EngineConfig {
    EngineConfig {
        settle_window: Duration::from_millis(20),
        module_timeout: Duration::from_secs(2),
        ..EngineConfig::default()
    }
}

type MapFn = Arc<dyn Fn(&str) -> Vec<String> + Send + Sync>;

/// Emits `map(data)` as events of `produced` for every `watched` event.
struct Mapper {
    watched: &'static str,
    produced: &'static str,
    map: MapFn,
}

#[async_trait]
impl Module for Mapper {
    fn watched_types(&self) -> Vec<String> {
        vec![self.watched.to_string()]
    }

    fn produced_types(&self) -> Vec<String> {
        vec![self.produced.to_string()]
    }

    async fn handle(&self, event: &Event) -> Result<Vec<EventDraft>, ModuleError> {
        Ok((self.map)(&event.data).into_iter().map(|data| EventDraft::new(self.produced, data)).collect())
    }
}

pub fn mapper<F>(name: &str, watched: &'static str, produced: &'static str, map: F) -> ModuleDescriptor
where
    F: Fn(&str) -> Vec<String> + Send + Sync + 'static,
{
    let map: MapFn = Arc::new(map);
    ModuleDescriptor::new(name, &[watched], &[produced], move |_| {
        Ok(Box::new(Mapper { watched, produced, map: map.clone() }))
    })
    .max_instances(2)
}

struct Broken {
    name: String,
}

#[async_trait]
impl Module for Broken {
    fn watched_types(&self) -> Vec<String> {
        vec!["DOMAIN_NAME".into()]
    }

    fn produced_types(&self) -> Vec<String> {
        vec!["IP_ADDRESS".into()]
    }

    async fn handle(&self, _event: &Event) -> Result<Vec<EventDraft>, ModuleError> {
        Err(ModuleError::failed(&self.name, "upstream service unavailable"))
    }
}

/// Fails every invocation.
pub fn broken(name: &str) -> ModuleDescriptor {
    let owned = name.to_string();
    ModuleDescriptor::new(name, &["DOMAIN_NAME"], &["IP_ADDRESS"], move |_| {
        Ok(Box::new(Broken { name: owned.clone() }))
    })
}

struct Sleeper;

#[async_trait]
impl Module for Sleeper {
    fn watched_types(&self) -> Vec<String> {
        vec!["DOMAIN_NAME".into()]
    }

    fn produced_types(&self) -> Vec<String> {
        Vec::new()
    }

    async fn handle(&self, _event: &Event) -> Result<Vec<EventDraft>, ModuleError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(Vec::new())
    }
}

/// Blocks on every DOMAIN_NAME well past any test's patience.
pub fn sleeper(name: &str) -> ModuleDescriptor {
    ModuleDescriptor::new(name, &["DOMAIN_NAME"], &[], |_| Ok(Box::new(Sleeper)))
}

/// resolver: DOMAIN_NAME -> IP_ADDRESS, ports: IP_ADDRESS -> TCP_PORT_OPEN.
pub fn chain_registry(ip: &'static str) -> ModuleRegistry {
    let mut registry = ModuleRegistry::new();
    registry
        .register(mapper("resolver", "DOMAIN_NAME", "IP_ADDRESS", move |_| vec![ip.to_string()]))
        .register(mapper("ports", "IP_ADDRESS", "TCP_PORT_OPEN", |ip| vec![format!("{ip}:443")]));
    registry
}

/// Accepts the first `allowed` events, then fails every write.
pub struct FlakyStore {
    inner: MemoryStore,
    allowed: usize,
    writes: AtomicUsize,
}

impl FlakyStore {
    pub fn new(allowed: usize) -> Self {
        Self { inner: MemoryStore::new(), allowed, writes: AtomicUsize::new(0) }
    }
}

#[async_trait]
impl ResultStore for FlakyStore {
    async fn put_scan(&self, scan: &ScanRecord) -> StoreResult<()> {
        self.inner.put_scan(scan).await
    }

    async fn update_scan(&self, scan: &ScanRecord) -> StoreResult<()> {
        self.inner.update_scan(scan).await
    }

    async fn get_scan(&self, scan_id: &ScanId) -> StoreResult<Option<ScanRecord>> {
        self.inner.get_scan(scan_id).await
    }

    async fn list_scans(&self) -> StoreResult<Vec<ScanRecord>> {
        self.inner.list_scans().await
    }

    async fn delete_scan(&self, scan_id: &ScanId) -> StoreResult<()> {
        self.inner.delete_scan(scan_id).await
    }

    async fn put_event(&self, event: &Event) -> StoreResult<PutOutcome> {
        if self.writes.fetch_add(1, Ordering::SeqCst) >= self.allowed {
            return Err(StoreError::Write("disk full".into()));
        }
        self.inner.put_event(event).await
    }

    async fn get_events(&self, scan_id: &ScanId, filter: &EventFilter) -> StoreResult<Vec<Event>> {
        self.inner.get_events(scan_id, filter).await
    }

    async fn mark_false_positive(&self, scan_id: &ScanId, hashes: &[String], flag: bool) -> StoreResult<usize> {
        self.inner.mark_false_positive(scan_id, hashes, flag).await
    }

    async fn put_correlation(&self, result: &CorrelationResult) -> StoreResult<PutOutcome> {
        self.inner.put_correlation(result).await
    }

    async fn get_correlations(&self, scan_id: &ScanId) -> StoreResult<Vec<CorrelationResult>> {
        self.inner.get_correlations(scan_id).await
    }

    async fn append_log(&self, entry: &ScanLogEntry) -> StoreResult<()> {
        self.inner.append_log(entry).await
    }

    async fn get_logs(&self, scan_id: &ScanId) -> StoreResult<Vec<ScanLogEntry>> {
        self.inner.get_logs(scan_id).await
    }
}
