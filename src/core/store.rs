// src/core/store.rs

//! The persistence boundary.
//!
//! The engine only needs idempotent appends and filtered reads, so
//! [`ResultStore`] is deliberately small. [`MemoryStore`] is the in-process
//! implementation used by the CLI and the tests; database-backed stores
//! implement the same trait.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::core::correlation::CorrelationResult;
use crate::core::error::{StoreError, StoreResult};
use crate::core::models::{Event, EventFilter, PutOutcome, ScanId, ScanLogEntry, ScanRecord};

/// Contract the engine requires from a result store.
///
/// Implementations must tolerate concurrent writers from many scans and make
/// `put_event` / `put_correlation` atomic "insert if absent" operations.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Registers a new scan. Events for unknown scans are rejected.
    async fn put_scan(&self, scan: &ScanRecord) -> StoreResult<()>;

    async fn update_scan(&self, scan: &ScanRecord) -> StoreResult<()>;

    async fn get_scan(&self, scan_id: &ScanId) -> StoreResult<Option<ScanRecord>>;

    async fn list_scans(&self) -> StoreResult<Vec<ScanRecord>>;

    /// Removes a scan with its events and logs. The scan is dropped from every
    /// correlation that references it; correlations left without scans go too.
    async fn delete_scan(&self, scan_id: &ScanId) -> StoreResult<()>;

    async fn put_event(&self, event: &Event) -> StoreResult<PutOutcome>;

    /// Events of one scan in insertion order.
    async fn get_events(&self, scan_id: &ScanId, filter: &EventFilter) -> StoreResult<Vec<Event>>;

    /// Events of several scans, for cross-scan reads.
    async fn get_events_multi(&self, scan_ids: &[ScanId], filter: &EventFilter) -> StoreResult<Vec<Event>> {
        let mut events = Vec::new();
        for scan_id in scan_ids {
            events.extend(self.get_events(scan_id, filter).await?);
        }
        Ok(events)
    }

    /// Sets or clears the false-positive flag on `hashes` and all of their
    /// descendants. Returns how many events changed.
    async fn mark_false_positive(&self, scan_id: &ScanId, hashes: &[String], flag: bool) -> StoreResult<usize>;

    /// Stores a result once per identity. A duplicate adds its `scan_ids` to
    /// the stored result.
    async fn put_correlation(&self, result: &CorrelationResult) -> StoreResult<PutOutcome>;

    /// Correlations referencing `scan_id`.
    async fn get_correlations(&self, scan_id: &ScanId) -> StoreResult<Vec<CorrelationResult>>;

    async fn append_log(&self, entry: &ScanLogEntry) -> StoreResult<()>;

    async fn get_logs(&self, scan_id: &ScanId) -> StoreResult<Vec<ScanLogEntry>>;
}

#[derive(Debug, Default)]
struct ScanBucket {
    record: Option<ScanRecord>,
    events: Vec<Event>,
    index: HashMap<String, usize>,
    logs: Vec<ScanLogEntry>,
}

/// Thread-safe in-memory store. Every write takes the lock for its whole
/// check-and-insert, so duplicates can never be stored twice.
#[derive(Debug, Default)]
pub struct MemoryStore {
    scans: RwLock<HashMap<ScanId, ScanBucket>>,
    correlations: RwLock<BTreeMap<String, CorrelationResult>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResultStore for MemoryStore {
    async fn put_scan(&self, scan: &ScanRecord) -> StoreResult<()> {
        let mut scans = self.scans.write().await;
        let bucket = scans.entry(scan.id.clone()).or_default();
        bucket.record = Some(scan.clone());
        Ok(())
    }

    async fn update_scan(&self, scan: &ScanRecord) -> StoreResult<()> {
        let mut scans = self.scans.write().await;
        let bucket = scans.get_mut(&scan.id).ok_or_else(|| StoreError::UnknownScan(scan.id.clone()))?;
        bucket.record = Some(scan.clone());
        Ok(())
    }

    async fn get_scan(&self, scan_id: &ScanId) -> StoreResult<Option<ScanRecord>> {
        let scans = self.scans.read().await;
        Ok(scans.get(scan_id).and_then(|b| b.record.clone()))
    }

    async fn list_scans(&self) -> StoreResult<Vec<ScanRecord>> {
        let scans = self.scans.read().await;
        let mut records: Vec<ScanRecord> = scans.values().filter_map(|b| b.record.clone()).collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(records)
    }

    async fn delete_scan(&self, scan_id: &ScanId) -> StoreResult<()> {
        let removed = self.scans.write().await.remove(scan_id);
        if removed.is_none() {
            return Err(StoreError::UnknownScan(scan_id.clone()));
        }
        self.correlations.write().await.retain(|_, c| {
            c.scan_ids.retain(|id| id != scan_id);
            !c.scan_ids.is_empty()
        });
        debug!(scan_id = %scan_id, "Scan deleted from memory store.");
        Ok(())
    }

    async fn put_event(&self, event: &Event) -> StoreResult<PutOutcome> {
        let mut scans = self.scans.write().await;
        let bucket = scans
            .get_mut(&event.scan_id)
            .ok_or_else(|| StoreError::UnknownScan(event.scan_id.clone()))?;
        if bucket.index.contains_key(&event.hash) {
            return Ok(PutOutcome::Duplicate);
        }
        bucket.index.insert(event.hash.clone(), bucket.events.len());
        bucket.events.push(event.clone());
        Ok(PutOutcome::Stored)
    }

    async fn get_events(&self, scan_id: &ScanId, filter: &EventFilter) -> StoreResult<Vec<Event>> {
        let scans = self.scans.read().await;
        let bucket = scans.get(scan_id).ok_or_else(|| StoreError::UnknownScan(scan_id.clone()))?;
        Ok(bucket.events.iter().filter(|e| filter.matches(e)).cloned().collect())
    }

    async fn mark_false_positive(&self, scan_id: &ScanId, hashes: &[String], flag: bool) -> StoreResult<usize> {
        let mut scans = self.scans.write().await;
        let bucket = scans.get_mut(scan_id).ok_or_else(|| StoreError::UnknownScan(scan_id.clone()))?;

        let mut children: HashMap<&str, Vec<usize>> = HashMap::new();
        for (position, event) in bucket.events.iter().enumerate() {
            if let Some(source) = &event.source_hash {
                children.entry(source.as_str()).or_default().push(position);
            }
        }

        let mut pending: Vec<usize> = hashes.iter().filter_map(|h| bucket.index.get(h).copied()).collect();
        let mut visited = HashSet::new();
        while let Some(position) = pending.pop() {
            if !visited.insert(position) {
                continue;
            }
            if let Some(kids) = children.get(bucket.events[position].hash.as_str()) {
                pending.extend(kids.iter().copied());
            }
        }

        let mut changed = 0;
        for position in visited {
            let event = &mut bucket.events[position];
            if event.false_positive != flag {
                event.false_positive = flag;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn put_correlation(&self, result: &CorrelationResult) -> StoreResult<PutOutcome> {
        let mut correlations = self.correlations.write().await;
        if let Some(existing) = correlations.get_mut(&result.id) {
            for scan_id in &result.scan_ids {
                if !existing.scan_ids.contains(scan_id) {
                    existing.scan_ids.push(scan_id.clone());
                }
            }
            existing.scan_ids.sort();
            return Ok(PutOutcome::Duplicate);
        }
        correlations.insert(result.id.clone(), result.clone());
        Ok(PutOutcome::Stored)
    }

    async fn get_correlations(&self, scan_id: &ScanId) -> StoreResult<Vec<CorrelationResult>> {
        let correlations = self.correlations.read().await;
        Ok(correlations.values().filter(|c| c.scan_ids.contains(scan_id)).cloned().collect())
    }

    async fn append_log(&self, entry: &ScanLogEntry) -> StoreResult<()> {
        let mut scans = self.scans.write().await;
        let bucket = scans
            .get_mut(&entry.scan_id)
            .ok_or_else(|| StoreError::UnknownScan(entry.scan_id.clone()))?;
        bucket.logs.push(entry.clone());
        Ok(())
    }

    async fn get_logs(&self, scan_id: &ScanId) -> StoreResult<Vec<ScanLogEntry>> {
        let scans = self.scans.read().await;
        let bucket = scans.get(scan_id).ok_or_else(|| StoreError::UnknownScan(scan_id.clone()))?;
        Ok(bucket.logs.clone())
    }
}
