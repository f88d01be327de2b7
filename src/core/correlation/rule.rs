// src/core/correlation/rule.rs

//! Declarative correlation rules and their compiled form.
//!
//! Rules are plain data (JSON through serde). Compiling one validates every
//! field path, compiles every regex once and turns the predicate trees into
//! something the evaluator can run without further checks.

use std::collections::HashSet;
use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};
use strum::Display;

use crate::core::error::RuleError;

// --- Definitions ---

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum RuleScope {
    /// Evaluated once per scan, over that scan's events.
    #[default]
    #[strum(serialize = "single_scan")]
    SingleScan,
    /// Evaluated once over the union of every requested scan.
    #[strum(serialize = "cross_scan")]
    CrossScan,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum RiskLevel {
    #[default]
    Info,
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMethod {
    #[default]
    Exact,
    Regex,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldMatch {
    pub field: String,
    #[serde(default)]
    pub method: MatchMethod,
    pub values: Vec<String>,
}

/// A condition tree over one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    All(Vec<Predicate>),
    Any(Vec<Predicate>),
    Not(Box<Predicate>),
    Match(FieldMatch),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinMethod {
    #[default]
    Exact,
    /// The later value contains the first collection's value.
    Contains,
}

/// Post-processing steps, applied in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum Analysis {
    /// Keeps groups whose count of `field` values lies within bounds.
    Threshold {
        field: String,
        #[serde(default)]
        minimum: usize,
        #[serde(default)]
        maximum: Option<usize>,
        #[serde(default)]
        unique: bool,
    },
    /// Keeps first-collection events whose `field` appears in no other collection.
    FirstCollectionOnly { field: String },
    /// Keeps later-collection events whose `field` matches a first-collection event, and those first-collection events.
    MatchAllToFirstCollection {
        field: String,
        #[serde(default)]
        method: JoinMethod,
    },
    /// Keeps rare groups: drops any above `maximum_percent` of all events, and
    /// everything when the average group share is below `noisy_percent`.
    Outlier {
        maximum_percent: u8,
        #[serde(default)]
        noisy_percent: u8,
    },
}

fn default_confidence() -> u8 {
    100
}

/// A correlation rule as written by an analyst.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub scope: RuleScope,
    #[serde(default)]
    pub risk: RiskLevel,
    #[serde(default = "default_confidence")]
    pub confidence: u8,
    /// Event types considered at all. Empty means every type.
    #[serde(default)]
    pub applies_to: Vec<String>,
    pub collections: Vec<Predicate>,
    #[serde(default)]
    pub aggregation: Option<String>,
    #[serde(default)]
    pub analysis: Vec<Analysis>,
    #[serde(default)]
    pub include_lineage: bool,
    pub headline: String,
}

/// Parses a JSON array of rule definitions.
pub fn parse_rules(json: &str) -> Result<Vec<RuleDefinition>, RuleError> {
    serde_json::from_str(json).map_err(|e| RuleError::Invalid { rule: "<rule set>".into(), message: e.to_string() })
}

// --- Field paths ---

/// Address of a value relative to an event.
///
/// `source.` follows the parent, `child.` fans out to direct children and
/// `entity.` jumps to the nearest ancestor whose type is an entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldPath {
    Type,
    Data,
    Module,
    ScanId,
    Hash,
    Source(Box<FieldPath>),
    Child(Box<FieldPath>),
    Entity(Box<FieldPath>),
}

impl FieldPath {
    pub fn parse(path: &str) -> Option<FieldPath> {
        match path.split_once('.') {
            Some(("source", rest)) => Some(FieldPath::Source(Box::new(Self::parse(rest)?))),
            Some(("child", rest)) => Some(FieldPath::Child(Box::new(Self::parse(rest)?))),
            Some(("entity", rest)) => Some(FieldPath::Entity(Box::new(Self::parse(rest)?))),
            Some(_) => None,
            None => match path {
                "type" => Some(FieldPath::Type),
                "data" => Some(FieldPath::Data),
                "module" => Some(FieldPath::Module),
                "scan_id" => Some(FieldPath::ScanId),
                "hash" => Some(FieldPath::Hash),
                _ => None,
            },
        }
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldPath::Type => write!(f, "type"),
            FieldPath::Data => write!(f, "data"),
            FieldPath::Module => write!(f, "module"),
            FieldPath::ScanId => write!(f, "scan_id"),
            FieldPath::Hash => write!(f, "hash"),
            FieldPath::Source(rest) => write!(f, "source.{rest}"),
            FieldPath::Child(rest) => write!(f, "child.{rest}"),
            FieldPath::Entity(rest) => write!(f, "entity.{rest}"),
        }
    }
}

// --- Compiled form ---

#[derive(Debug, Clone)]
pub enum Matcher {
    Exact(Vec<String>),
    Regex(Vec<Regex>),
}

impl Matcher {
    pub fn is_match(&self, value: &str) -> bool {
        match self {
            Matcher::Exact(values) => values.iter().any(|v| v == value),
            Matcher::Regex(patterns) => patterns.iter().any(|re| re.is_match(value)),
        }
    }
}

#[derive(Debug, Clone)]
pub enum CompiledPredicate {
    All(Vec<CompiledPredicate>),
    Any(Vec<CompiledPredicate>),
    Not(Box<CompiledPredicate>),
    Match { field: FieldPath, matcher: Matcher },
}

#[derive(Debug, Clone)]
pub enum CompiledAnalysis {
    Threshold { field: FieldPath, minimum: usize, maximum: Option<usize>, unique: bool },
    FirstCollectionOnly { field: FieldPath },
    MatchAllToFirstCollection { field: FieldPath, method: JoinMethod },
    Outlier { maximum_percent: u8, noisy_percent: u8 },
}

impl CompiledAnalysis {
    /// Whether the step works on collections (before aggregation) rather than groups.
    pub fn is_collection_stage(&self) -> bool {
        matches!(
            self,
            CompiledAnalysis::FirstCollectionOnly { .. } | CompiledAnalysis::MatchAllToFirstCollection { .. }
        )
    }
}

/// A validated rule, ready to evaluate any number of times.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub definition: RuleDefinition,
    pub applies_to: HashSet<String>,
    pub collections: Vec<CompiledPredicate>,
    pub aggregation: Option<FieldPath>,
    pub analysis: Vec<CompiledAnalysis>,
}

impl CompiledRule {
    pub fn id(&self) -> &str {
        &self.definition.id
    }
}

/// Validates and compiles one rule definition.
pub fn compile(definition: &RuleDefinition) -> Result<CompiledRule, RuleError> {
    let rule = definition.id.as_str();
    let invalid = |message: String| RuleError::Invalid { rule: rule.to_string(), message };

    if rule.trim().is_empty() {
        return Err(invalid("rule id is empty".into()));
    }
    if definition.collections.is_empty() {
        return Err(invalid("at least one collection is required".into()));
    }
    if definition.headline.trim().is_empty() {
        return Err(invalid("headline is empty".into()));
    }
    if definition.confidence > 100 {
        return Err(invalid(format!("confidence {} is above 100", definition.confidence)));
    }

    let collections = definition
        .collections
        .iter()
        .map(|p| compile_predicate(rule, p))
        .collect::<Result<Vec<_>, _>>()?;
    let aggregation = definition.aggregation.as_deref().map(|f| field(rule, f)).transpose()?;
    let analysis = definition
        .analysis
        .iter()
        .map(|a| compile_analysis(rule, a, definition.collections.len()))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(CompiledRule {
        definition: definition.clone(),
        applies_to: definition.applies_to.iter().cloned().collect(),
        collections,
        aggregation,
        analysis,
    })
}

fn field(rule: &str, path: &str) -> Result<FieldPath, RuleError> {
    FieldPath::parse(path)
        .ok_or_else(|| RuleError::Invalid { rule: rule.to_string(), message: format!("unknown field '{path}'") })
}

fn compile_predicate(rule: &str, predicate: &Predicate) -> Result<CompiledPredicate, RuleError> {
    Ok(match predicate {
        Predicate::All(children) => CompiledPredicate::All(
            children.iter().map(|c| compile_predicate(rule, c)).collect::<Result<_, _>>()?,
        ),
        Predicate::Any(children) => {
            if children.is_empty() {
                return Err(RuleError::Invalid { rule: rule.to_string(), message: "'any' needs at least one branch".into() });
            }
            CompiledPredicate::Any(children.iter().map(|c| compile_predicate(rule, c)).collect::<Result<_, _>>()?)
        }
        Predicate::Not(inner) => CompiledPredicate::Not(Box::new(compile_predicate(rule, inner)?)),
        Predicate::Match(m) => {
            if m.values.is_empty() {
                return Err(RuleError::Invalid {
                    rule: rule.to_string(),
                    message: format!("match on '{}' has no values", m.field),
                });
            }
            let matcher = match m.method {
                MatchMethod::Exact => Matcher::Exact(m.values.clone()),
                MatchMethod::Regex => Matcher::Regex(
                    m.values
                        .iter()
                        .map(|pattern| {
                            Regex::new(pattern).map_err(|e| RuleError::BadPattern {
                                rule: rule.to_string(),
                                pattern: pattern.clone(),
                                message: e.to_string(),
                            })
                        })
                        .collect::<Result<_, _>>()?,
                ),
            };
            CompiledPredicate::Match { field: field(rule, &m.field)?, matcher }
        }
    })
}

fn compile_analysis(rule: &str, analysis: &Analysis, collections: usize) -> Result<CompiledAnalysis, RuleError> {
    let invalid = |message: String| RuleError::Invalid { rule: rule.to_string(), message };
    Ok(match analysis {
        Analysis::Threshold { field: f, minimum, maximum, unique } => {
            if let Some(maximum) = maximum {
                if maximum < minimum {
                    return Err(invalid(format!("threshold maximum {maximum} is below minimum {minimum}")));
                }
            }
            CompiledAnalysis::Threshold { field: field(rule, f)?, minimum: *minimum, maximum: *maximum, unique: *unique }
        }
        Analysis::FirstCollectionOnly { field: f } => {
            if collections < 2 {
                return Err(invalid("first_collection_only needs at least two collections".into()));
            }
            CompiledAnalysis::FirstCollectionOnly { field: field(rule, f)? }
        }
        Analysis::MatchAllToFirstCollection { field: f, method } => {
            if collections < 2 {
                return Err(invalid("match_all_to_first_collection needs at least two collections".into()));
            }
            CompiledAnalysis::MatchAllToFirstCollection { field: field(rule, f)?, method: *method }
        }
        Analysis::Outlier { maximum_percent, noisy_percent } => {
            if *maximum_percent > 100 || *noisy_percent > 100 {
                return Err(invalid("outlier percentages must be between 0 and 100".into()));
            }
            CompiledAnalysis::Outlier { maximum_percent: *maximum_percent, noisy_percent: *noisy_percent }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rule(value: serde_json::Value) -> RuleDefinition {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_field_paths_nest() {
        assert_eq!(
            FieldPath::parse("source.source.type"),
            Some(FieldPath::Source(Box::new(FieldPath::Source(Box::new(FieldPath::Type)))))
        );
        assert_eq!(FieldPath::parse("entity.data").map(|p| p.to_string()), Some("entity.data".into()));
        assert_eq!(FieldPath::parse("parent.type"), None);
        assert_eq!(FieldPath::parse("colour"), None);
    }

    #[test]
    fn test_compiles_predicate_tree() {
        let definition = rule(json!({
            "id": "r",
            "headline": "x",
            "collections": [{"all": [
                {"match": {"field": "type", "values": ["IP_ADDRESS"]}},
                {"not": {"match": {"field": "data", "method": "regex", "values": ["^10\\."]}}}
            ]}],
            "analysis": [{"kind": "threshold", "field": "scan_id", "minimum": 2, "unique": true}]
        }));
        let compiled = compile(&definition).unwrap();
        assert_eq!(compiled.collections.len(), 1);
        assert_eq!(compiled.definition.confidence, 100);
        assert!(!compiled.analysis[0].is_collection_stage());
    }

    #[test]
    fn test_bad_regex_is_reported() {
        let definition = rule(json!({
            "id": "broken",
            "headline": "x",
            "collections": [{"match": {"field": "data", "method": "regex", "values": ["(unclosed"]}}]
        }));
        assert!(matches!(compile(&definition), Err(RuleError::BadPattern { rule, .. }) if rule == "broken"));
    }

    #[test]
    fn test_structural_errors_are_reported() {
        let unknown_field = rule(json!({
            "id": "r", "headline": "x",
            "collections": [{"match": {"field": "colour", "values": ["red"]}}]
        }));
        assert!(compile(&unknown_field).is_err());

        let lonely_join = rule(json!({
            "id": "r", "headline": "x",
            "collections": [{"match": {"field": "type", "values": ["IP_ADDRESS"]}}],
            "analysis": [{"kind": "first_collection_only", "field": "data"}]
        }));
        assert!(compile(&lonely_join).is_err());
    }

    #[test]
    fn test_unknown_keys_rejected_at_parse_time() {
        assert!(parse_rules(r#"[{"id": "r", "headline": "x", "collections": [], "colour": 1}]"#).is_err());
    }
}
