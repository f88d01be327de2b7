// src/core/correlation/mod.rs

//! Rule-based pattern matching over stored events.
//!
//! [`rule`] holds the declarative rule language and its compiler,
//! [`eval`] evaluates one rule over a snapshot, and [`engine`] runs a rule
//! set over one or more scans and persists what it finds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::core::models::ScanId;

pub mod engine;
pub mod eval;
pub mod rule;

pub use engine::CorrelationEngine;
pub use rule::{RiskLevel, RuleDefinition, RuleScope};

/// Rule set shipped with the binary.
const BUILTIN_RULES: &str = include_str!("rules.json");

/// Parses the built-in rule catalogue.
pub fn builtin_rules() -> Result<Vec<RuleDefinition>, crate::core::error::RuleError> {
    rule::parse_rules(BUILTIN_RULES)
}

/// A rule match, persisted once per identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelationResult {
    /// Content address: SHA-256 over the rule id and the sorted matched hashes.
    pub id: String,
    pub rule_id: String,
    pub rule_name: String,
    pub headline: String,
    /// Sorted, deduplicated.
    pub matched_event_hashes: Vec<String>,
    /// Every scan that contributed a matched event, sorted.
    pub scan_ids: Vec<ScanId>,
    pub risk: RiskLevel,
    pub confidence: u8,
    pub created_at: DateTime<Utc>,
}

/// Identity of a correlation result. Independent of evaluation order.
pub fn result_identity(rule_id: &str, sorted_hashes: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update((rule_id.len() as u64).to_be_bytes());
    hasher.update(rule_id.as_bytes());
    for hash in sorted_hashes {
        hasher.update((hash.len() as u64).to_be_bytes());
        hasher.update(hash.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// A rule that could not be compiled or evaluated during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleFailure {
    pub rule_id: String,
    pub message: String,
}

/// Summary of one correlation run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CorrelationRun {
    /// Results above the confidence floor, whether newly stored or already known.
    pub results: Vec<CorrelationResult>,
    pub stored: usize,
    pub duplicates: usize,
    /// Results dropped by the confidence floor.
    pub filtered: usize,
    pub failed_rules: Vec<RuleFailure>,
    pub rules_evaluated: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_rules_compile() {
        let rules = builtin_rules().unwrap();
        assert!(rules.len() >= 5);
        for definition in &rules {
            rule::compile(definition).unwrap();
        }
        assert!(rules.iter().any(|r| r.scope == RuleScope::CrossScan));
    }

    #[test]
    fn test_identity_depends_on_rule_and_hashes() {
        let hashes = vec!["a".to_string(), "b".to_string()];
        assert_eq!(result_identity("r", &hashes), result_identity("r", &hashes));
        assert_ne!(result_identity("r", &hashes), result_identity("q", &hashes));
        assert_ne!(result_identity("r", &hashes), result_identity("r", &hashes[..1]));
    }
}
