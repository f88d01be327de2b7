// src/core/correlation/engine.rs

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use tokio::task::{self, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::correlation::eval::{evaluate, EventSnapshot, RuleMatch};
use crate::core::correlation::rule::{compile, RuleDefinition, RuleScope};
use crate::core::correlation::{builtin_rules, result_identity, CorrelationResult, CorrelationRun, RuleFailure};
use crate::core::error::{EngineError, EngineResult, RuleError};
use crate::core::models::{EventFilter, LogLevel, PutOutcome, ScanId, ScanLogEntry};
use crate::core::store::ResultStore;

/// Evaluates a rule set over stored events.
///
/// Every run works on one snapshot taken up front, so no rule sees results
/// of another and re-running over unchanged events yields the same result
/// identities.
#[derive(Debug, Clone, Default)]
pub struct CorrelationEngine {
    rules: Vec<Arc<RuleDefinition>>,
    confidence_floor: u8,
}

/// One unit of parallel work: a rule over a set of candidate events.
struct Job {
    rule: Arc<RuleDefinition>,
    scans: Vec<ScanId>,
    candidates: Vec<usize>,
}

type JobOutcome = (Arc<RuleDefinition>, Vec<ScanId>, Result<Vec<CorrelationResult>, RuleError>);

impl CorrelationEngine {
    pub fn new(rules: Vec<RuleDefinition>) -> Self {
        let mut engine = Self::default();
        engine.add_rules(rules);
        engine
    }

    /// An engine loaded with the built-in catalogue.
    pub fn with_builtin_rules() -> Result<Self, RuleError> {
        Ok(Self::new(builtin_rules()?))
    }

    /// Results of rules with a lower confidence are evaluated but not reported.
    pub fn confidence_floor(mut self, floor: u8) -> Self {
        self.confidence_floor = floor;
        self
    }

    /// Adds rules, replacing any existing rule with the same id.
    pub fn add_rules(&mut self, rules: Vec<RuleDefinition>) {
        for definition in rules {
            self.rules.retain(|r| r.id != definition.id);
            self.rules.push(Arc::new(definition));
        }
    }

    pub fn rules(&self) -> impl Iterator<Item = &RuleDefinition> {
        self.rules.iter().map(Arc::as_ref)
    }

    fn select(&self, rule_ids: Option<&[String]>) -> EngineResult<Vec<Arc<RuleDefinition>>> {
        match rule_ids {
            None | Some([]) => Ok(self.rules.clone()),
            Some(ids) => ids
                .iter()
                .collect::<BTreeSet<_>>()
                .into_iter()
                .map(|id| {
                    self.rules
                        .iter()
                        .find(|r| &r.id == id)
                        .cloned()
                        .ok_or_else(|| EngineError::UnknownRule(id.clone()))
                })
                .collect(),
        }
    }

    /// Runs the selected rules over `scan_ids` and persists new results.
    ///
    /// Single-scan rules run once per scan, cross-scan rules once over the
    /// union. A failing rule is reported in the summary and the run carries
    /// on. If `cancel` fires before persistence, nothing is written.
    pub async fn run(
        &self,
        store: &dyn ResultStore,
        scan_ids: &[ScanId],
        rule_ids: Option<&[String]>,
        cancel: &CancellationToken,
    ) -> EngineResult<CorrelationRun> {
        let rules = self.select(rule_ids)?;
        let scans: Vec<ScanId> = scan_ids.iter().cloned().collect::<BTreeSet<_>>().into_iter().collect();
        for scan_id in &scans {
            if store.get_scan(scan_id).await?.is_none() {
                return Err(EngineError::UnknownScan(scan_id.clone()));
            }
        }
        info!(scans = scans.len(), rules = rules.len(), "Starting correlation run.");

        let events = store.get_events_multi(&scans, &EventFilter::default()).await?;
        let snapshot = Arc::new(EventSnapshot::new(events));
        debug!(events = snapshot.len(), "Correlation snapshot taken.");

        let mut jobs = JoinSet::new();
        let mut pending: HashMap<task::Id, (Arc<RuleDefinition>, Vec<ScanId>)> = HashMap::new();
        let mut evaluated = 0;
        for rule in &rules {
            let planned: Vec<Job> = match rule.scope {
                RuleScope::SingleScan => scans
                    .iter()
                    .map(|scan| Job {
                        rule: rule.clone(),
                        scans: vec![scan.clone()],
                        candidates: snapshot.scan_indices(scan),
                    })
                    .collect(),
                RuleScope::CrossScan => {
                    vec![Job { rule: rule.clone(), scans: scans.clone(), candidates: snapshot.all_indices() }]
                }
            };
            for job in planned {
                evaluated += 1;
                let snapshot = snapshot.clone();
                let owner = (job.rule.clone(), job.scans.clone());
                let handle = jobs.spawn_blocking(move || run_job(job, &snapshot));
                pending.insert(handle.id(), owner);
            }
        }

        let mut results: BTreeMap<String, CorrelationResult> = BTreeMap::new();
        let mut failures: BTreeMap<String, RuleFailure> = BTreeMap::new();
        let mut filtered = 0;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    jobs.abort_all();
                    warn!("Correlation run cancelled before completion.");
                    return Err(EngineError::Cancelled);
                }
                next = jobs.join_next_with_id() => next,
            };
            let Some(joined) = next else { break };
            let (rule, job_scans, outcome) = match joined {
                Ok((id, outcome)) => {
                    pending.remove(&id);
                    outcome
                }
                Err(e) => match pending.remove(&e.id()) {
                    Some((rule, job_scans)) => {
                        let failure = join_failure(&rule.id, &e);
                        (rule, job_scans, Err(failure))
                    }
                    None => {
                        error!(error = %e, "Correlation task of unknown rule did not complete.");
                        continue;
                    }
                },
            };
            match outcome {
                Ok(found) => {
                    if rule.confidence < self.confidence_floor {
                        filtered += found.len();
                        continue;
                    }
                    for result in found {
                        merge(&mut results, result);
                    }
                }
                Err(e) => {
                    error!(rule = %rule.id, error = %e, "Correlation rule failed.");
                    for scan_id in &job_scans {
                        let entry = ScanLogEntry::new(scan_id, LogLevel::Error, "correlation", e.to_string());
                        if let Err(log_error) = store.append_log(&entry).await {
                            warn!(scan_id = %scan_id, error = %log_error, "Could not write correlation log entry.");
                        }
                    }
                    failures
                        .entry(rule.id.clone())
                        .or_insert_with(|| RuleFailure { rule_id: rule.id.clone(), message: e.to_string() });
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let mut run = CorrelationRun {
            filtered,
            failed_rules: failures.into_values().collect(),
            rules_evaluated: evaluated,
            ..Default::default()
        };
        for result in results.into_values() {
            match store.put_correlation(&result).await? {
                PutOutcome::Stored => run.stored += 1,
                PutOutcome::Duplicate => run.duplicates += 1,
            }
            run.results.push(result);
        }
        info!(
            results = run.results.len(),
            stored = run.stored,
            duplicates = run.duplicates,
            filtered = run.filtered,
            failed = run.failed_rules.len(),
            "Correlation run complete."
        );
        Ok(run)
    }
}

/// Two jobs can find the same identity when scans share events; their scan lists are merged.
fn merge(results: &mut BTreeMap<String, CorrelationResult>, result: CorrelationResult) {
    match results.get_mut(&result.id) {
        Some(existing) => {
            let scans: BTreeSet<ScanId> = existing.scan_ids.drain(..).chain(result.scan_ids).collect();
            existing.scan_ids = scans.into_iter().collect();
        }
        None => {
            results.insert(result.id.clone(), result);
        }
    }
}

/// A task that never returned its outcome still fails its rule.
fn join_failure(rule: &str, e: &JoinError) -> RuleError {
    if e.is_panic() {
        RuleError::Panicked { rule: rule.to_string() }
    } else {
        RuleError::Interrupted { rule: rule.to_string() }
    }
}

fn run_job(job: Job, snapshot: &EventSnapshot) -> JobOutcome {
    let Job { rule, scans, candidates } = job;
    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| -> Result<Vec<CorrelationResult>, RuleError> {
        let compiled = compile(&rule)?;
        let matches = evaluate(&compiled, snapshot, &candidates);
        Ok(matches.iter().map(|m| to_result(&rule, snapshot, m)).collect())
    }))
    .unwrap_or_else(|_| Err(RuleError::Panicked { rule: rule.id.clone() }));
    (rule, scans, outcome)
}

fn to_result(rule: &RuleDefinition, snapshot: &EventSnapshot, found: &RuleMatch) -> CorrelationResult {
    let mut hashes: Vec<String> = found.events.iter().map(|i| snapshot.event(*i).hash.clone()).collect();
    hashes.sort();
    hashes.dedup();
    let scan_ids: BTreeSet<ScanId> = found.events.iter().map(|i| snapshot.event(*i).scan_id.clone()).collect();
    let headline = rule.headline.replace("{key}", &found.key).replace("{count}", &found.count.to_string());
    CorrelationResult {
        id: result_identity(&rule.id, &hashes),
        rule_id: rule.id.clone(),
        rule_name: if rule.name.is_empty() { rule.id.clone() } else { rule.name.clone() },
        headline,
        matched_event_hashes: hashes,
        scan_ids: scan_ids.into_iter().collect(),
        risk: rule.risk,
        confidence: rule.confidence,
        created_at: Utc::now(),
    }
}
