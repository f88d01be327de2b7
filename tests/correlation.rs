// tests/correlation.rs

mod common;

use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use reconflow::core::correlation::{RiskLevel, RuleDefinition};
use reconflow::core::models::EventFilter;
use reconflow::{
    CorrelationEngine, EngineConfig, EngineError, MemoryStore, ScanId, ScanManager, ScanRequest, ScanStatus,
    Workspace,
};

use common::{chain_registry, fast_config};

fn rule(value: serde_json::Value) -> RuleDefinition {
    serde_json::from_value(value).unwrap()
}

fn ip_rule(id: &str, confidence: u8) -> RuleDefinition {
    rule(json!({
        "id": id,
        "confidence": confidence,
        "collections": [{"match": {"field": "type", "values": ["IP_ADDRESS"]}}],
        "aggregation": "data",
        "headline": "Address {key}"
    }))
}

async fn finished_scan(manager: &ScanManager, target: &str) -> ScanId {
    let scan_id = manager.create_scan(ScanRequest::new(target)).await.unwrap();
    assert_eq!(manager.wait(&scan_id).await.unwrap().status, ScanStatus::Finished);
    scan_id
}

fn only(rule_id: &str) -> Vec<String> {
    vec![rule_id.to_string()]
}

#[tokio::test]
async fn test_open_port_rule_references_whole_chain() {
    let manager = ScanManager::new(chain_registry("10.0.0.1"), Arc::new(MemoryStore::new()), fast_config());
    let scan_id = finished_scan(&manager, "example.com").await;

    let rule_ids = only("open_port_on_resolved_domain");
    let run = manager.run_correlation(std::slice::from_ref(&scan_id), Some(&rule_ids)).await.unwrap();
    assert_eq!(run.results.len(), 1);

    let result = &run.results[0];
    let mut hashes: Vec<String> = manager
        .events(&scan_id, &EventFilter::default())
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.hash)
        .collect();
    hashes.sort();
    assert_eq!(result.matched_event_hashes, hashes);
    assert_eq!(result.scan_ids, vec![scan_id.clone()]);
    assert_eq!(result.risk, RiskLevel::Medium);
    assert_eq!(result.headline, "Open port 10.0.0.1:443 on a host resolved from a domain");
}

#[tokio::test]
async fn test_rerun_adds_no_duplicates() {
    let manager = ScanManager::new(chain_registry("10.0.0.1"), Arc::new(MemoryStore::new()), fast_config());
    let scan_id = finished_scan(&manager, "example.com").await;
    let scans = [scan_id.clone()];

    let first = manager.run_correlation(&scans, None).await.unwrap();
    let second = manager.run_correlation(&scans, None).await.unwrap();

    assert!(first.stored > 0);
    assert_eq!(second.stored, 0);
    assert_eq!(second.duplicates, first.stored);
    let first_ids: Vec<&str> = first.results.iter().map(|r| r.id.as_str()).collect();
    let second_ids: Vec<&str> = second.results.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(first_ids, second_ids);
    assert_eq!(manager.correlations(&scan_id).await.unwrap().len(), first.stored);
}

#[tokio::test]
async fn test_workspace_correlates_across_scans() {
    let manager = ScanManager::new(chain_registry("10.0.0.9"), Arc::new(MemoryStore::new()), fast_config());
    let workspace = Workspace::new("estate")
        .target(ScanRequest::new("alpha.example.com"))
        .target(ScanRequest::new("beta.example.com"))
        .target(ScanRequest::new("not a target"));

    let report = workspace.run(&manager).await.unwrap();

    assert_eq!(report.outcomes.len(), 2);
    assert!(report.outcomes.iter().all(|o| o.status == ScanStatus::Finished));
    assert_eq!(report.rejected.len(), 1);
    assert_eq!(report.rejected[0].target, "not a target");

    let shared: Vec<_> =
        report.correlation.results.iter().filter(|r| r.rule_id == "host_shared_across_scans").collect();
    assert_eq!(shared.len(), 1);
    assert_eq!(shared[0].matched_event_hashes.len(), 2);
    let mut expected: Vec<ScanId> = report.outcomes.iter().map(|o| o.scan_id.clone()).collect();
    expected.sort();
    assert_eq!(shared[0].scan_ids, expected);

    let per_scan = report.correlation.results.iter().filter(|r| r.rule_id == "open_port_on_resolved_domain").count();
    assert_eq!(per_scan, 2);
}

#[tokio::test]
async fn test_confidence_floor_hides_weak_rules() {
    let config = EngineConfig { confidence_floor: 60, ..fast_config() };
    let manager = ScanManager::new(chain_registry("10.0.0.1"), Arc::new(MemoryStore::new()), config)
        .with_correlation(CorrelationEngine::new(vec![ip_rule("confident", 90), ip_rule("hunch", 30)]));
    let scan_id = finished_scan(&manager, "example.com").await;

    let run = manager.run_correlation(std::slice::from_ref(&scan_id), None).await.unwrap();
    assert_eq!(run.rules_evaluated, 2);
    assert_eq!(run.filtered, 1);
    assert_eq!(run.results.len(), 1);
    assert_eq!(run.results[0].rule_id, "confident");
    assert_eq!(run.results[0].headline, "Address 10.0.0.1");
}

#[tokio::test]
async fn test_broken_rule_is_isolated() {
    let bad = rule(json!({
        "id": "bad_pattern",
        "collections": [{"match": {"field": "data", "method": "regex", "values": ["(unclosed"]}}],
        "headline": "never"
    }));
    let manager = ScanManager::new(chain_registry("10.0.0.1"), Arc::new(MemoryStore::new()), fast_config())
        .with_correlation(CorrelationEngine::new(vec![bad, ip_rule("addresses", 100)]));
    let scan_id = finished_scan(&manager, "example.com").await;

    let run = manager.run_correlation(std::slice::from_ref(&scan_id), None).await.unwrap();
    assert_eq!(run.failed_rules.len(), 1);
    assert_eq!(run.failed_rules[0].rule_id, "bad_pattern");
    assert_eq!(run.results.len(), 1);
    assert_eq!(run.results[0].rule_id, "addresses");

    let logs = manager.logs(&scan_id).await.unwrap();
    assert!(logs.iter().any(|entry| entry.component == "correlation"));
}

#[tokio::test]
async fn test_false_positives_are_excluded() {
    let manager = ScanManager::new(chain_registry("10.0.0.1"), Arc::new(MemoryStore::new()), fast_config());
    let scan_id = finished_scan(&manager, "example.com").await;
    let ip = manager
        .events(&scan_id, &EventFilter::types(&["IP_ADDRESS"]))
        .await
        .unwrap()
        .remove(0);

    let changed = manager.mark_false_positive(&scan_id, &[ip.hash], true).await.unwrap();
    assert_eq!(changed, 2);

    let rule_ids = only("open_port_on_resolved_domain");
    let run = manager.run_correlation(std::slice::from_ref(&scan_id), Some(&rule_ids)).await.unwrap();
    assert!(run.results.is_empty());
}

#[tokio::test]
async fn test_cancelled_run_persists_nothing() {
    let manager = ScanManager::new(chain_registry("10.0.0.1"), Arc::new(MemoryStore::new()), fast_config());
    let scan_id = finished_scan(&manager, "example.com").await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = manager.run_correlation_until(std::slice::from_ref(&scan_id), None, &cancel).await;
    assert!(matches!(result, Err(EngineError::Cancelled)));
    assert!(manager.correlations(&scan_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_scan_is_rejected() {
    let manager = ScanManager::new(chain_registry("10.0.0.1"), Arc::new(MemoryStore::new()), fast_config());
    let result = manager.run_correlation(&[ScanId::from("missing")], None).await;
    assert!(matches!(result, Err(EngineError::UnknownScan(_))));
}

#[tokio::test]
async fn test_rescanned_target_keeps_its_correlations() {
    let manager = ScanManager::new(chain_registry("10.0.0.1"), Arc::new(MemoryStore::new()), fast_config());
    let first = finished_scan(&manager, "example.com").await;
    let second = finished_scan(&manager, "example.com").await;
    let rule_ids = only("open_port_on_resolved_domain");

    let run_a = manager.run_correlation(std::slice::from_ref(&first), Some(&rule_ids)).await.unwrap();
    let run_b = manager.run_correlation(std::slice::from_ref(&second), Some(&rule_ids)).await.unwrap();
    assert_eq!((run_a.stored, run_b.duplicates), (1, 1));
    assert_eq!(run_a.results[0].id, run_b.results[0].id);

    let for_second = manager.correlations(&second).await.unwrap();
    assert_eq!(for_second.len(), 1);
    let mut both = vec![first.clone(), second.clone()];
    both.sort();
    assert_eq!(for_second[0].scan_ids, both);

    manager.delete_scan(&first).await.unwrap();
    let for_second = manager.correlations(&second).await.unwrap();
    assert_eq!(for_second.len(), 1);
    assert_eq!(for_second[0].scan_ids, vec![second]);
}
