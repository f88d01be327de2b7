// src/core/correlation/eval.rs

//! Evaluation of a compiled rule against an immutable event snapshot.
//!
//! The pipeline is: applies-to filter, collections, collection-level analysis,
//! aggregation into groups, group-level analysis, then one match per
//! surviving group. Nothing here touches the store.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::core::correlation::rule::{CompiledAnalysis, CompiledPredicate, CompiledRule, FieldPath, JoinMethod};
use crate::core::models::{event_types, Event, ScanId};

/// Read-only view of one or more scans' events with lineage lookups.
#[derive(Debug, Default)]
pub struct EventSnapshot {
    events: Vec<Event>,
    by_hash: HashMap<(ScanId, String), usize>,
    children: HashMap<(ScanId, String), Vec<usize>>,
}

impl EventSnapshot {
    pub fn new(events: Vec<Event>) -> Self {
        let mut by_hash = HashMap::new();
        let mut children: HashMap<(ScanId, String), Vec<usize>> = HashMap::new();
        for (i, event) in events.iter().enumerate() {
            by_hash.insert((event.scan_id.clone(), event.hash.clone()), i);
            if let Some(parent) = &event.source_hash {
                children.entry((event.scan_id.clone(), parent.clone())).or_default().push(i);
            }
        }
        Self { events, by_hash, children }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn event(&self, index: usize) -> &Event {
        &self.events[index]
    }

    /// Events belonging to `scan_id`, as indices.
    pub fn scan_indices(&self, scan_id: &ScanId) -> Vec<usize> {
        (0..self.events.len()).filter(|i| &self.events[*i].scan_id == scan_id).collect()
    }

    pub fn all_indices(&self) -> Vec<usize> {
        (0..self.events.len()).collect()
    }

    fn parent(&self, index: usize) -> Option<usize> {
        let event = &self.events[index];
        let parent = event.source_hash.as_ref()?;
        self.by_hash.get(&(event.scan_id.clone(), parent.clone())).copied()
    }

    fn children_of(&self, index: usize) -> &[usize] {
        let event = &self.events[index];
        self.children
            .get(&(event.scan_id.clone(), event.hash.clone()))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Nearest strict ancestor whose type is an entity type.
    fn entity(&self, index: usize) -> Option<usize> {
        let mut current = self.parent(index);
        let mut hops = 0;
        while let Some(i) = current {
            if event_types::ENTITY_TYPES.contains(&self.events[i].event_type.as_str()) {
                return Some(i);
            }
            hops += 1;
            if hops > self.events.len() {
                return None;
            }
            current = self.parent(i);
        }
        None
    }

    /// Every ancestor of `index`, nearest first.
    pub fn lineage(&self, index: usize) -> Vec<usize> {
        let mut chain = Vec::new();
        let mut current = self.parent(index);
        while let Some(i) = current {
            if chain.contains(&i) {
                break;
            }
            chain.push(i);
            current = self.parent(i);
        }
        chain
    }

    /// Values of `path` for the event at `index`. Relative paths can yield
    /// zero values (no parent) or many (several children).
    pub fn resolve(&self, index: usize, path: &FieldPath) -> Vec<String> {
        let event = &self.events[index];
        match path {
            FieldPath::Type => vec![event.event_type.clone()],
            FieldPath::Data => vec![event.data.clone()],
            FieldPath::Module => vec![event.module.clone()],
            FieldPath::ScanId => vec![event.scan_id.to_string()],
            FieldPath::Hash => vec![event.hash.clone()],
            FieldPath::Source(rest) => self.parent(index).map(|p| self.resolve(p, rest)).unwrap_or_default(),
            FieldPath::Child(rest) => self.children_of(index).iter().flat_map(|c| self.resolve(*c, rest)).collect(),
            FieldPath::Entity(rest) => self.entity(index).map(|e| self.resolve(e, rest)).unwrap_or_default(),
        }
    }

    fn matches(&self, index: usize, predicate: &CompiledPredicate) -> bool {
        match predicate {
            CompiledPredicate::All(children) => children.iter().all(|p| self.matches(index, p)),
            CompiledPredicate::Any(children) => children.iter().any(|p| self.matches(index, p)),
            CompiledPredicate::Not(inner) => !self.matches(index, inner),
            CompiledPredicate::Match { field, matcher } => {
                self.resolve(index, field).iter().any(|value| matcher.is_match(value))
            }
        }
    }
}

/// One group of events that satisfied a rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleMatch {
    /// Aggregation value, empty when the rule does not aggregate.
    pub key: String,
    /// Number of matched events in the group, lineage excluded.
    pub count: usize,
    /// Snapshot indices of the matched events plus any included lineage.
    pub events: BTreeSet<usize>,
}

/// Runs `rule` over the events at `candidates`.
pub fn evaluate(rule: &CompiledRule, snapshot: &EventSnapshot, candidates: &[usize]) -> Vec<RuleMatch> {
    let candidates: Vec<usize> = candidates
        .iter()
        .copied()
        .filter(|i| {
            let event = snapshot.event(*i);
            !event.false_positive && (rule.applies_to.is_empty() || rule.applies_to.contains(&event.event_type))
        })
        .collect();

    let mut collections: Vec<Vec<usize>> = rule
        .collections
        .iter()
        .map(|predicate| candidates.iter().copied().filter(|i| snapshot.matches(*i, predicate)).collect())
        .collect();

    for stage in rule.analysis.iter().filter(|a| a.is_collection_stage()) {
        apply_collection_stage(stage, snapshot, &mut collections);
    }

    let mut matched: Vec<usize> = Vec::new();
    let mut seen = HashSet::new();
    for index in collections.into_iter().flatten() {
        if seen.insert(index) {
            matched.push(index);
        }
    }
    if matched.is_empty() {
        return Vec::new();
    }

    let mut groups: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    match &rule.aggregation {
        Some(field) => {
            for index in matched {
                let values: BTreeSet<String> = snapshot.resolve(index, field).into_iter().collect();
                for value in values {
                    groups.entry(value).or_default().push(index);
                }
            }
        }
        None => {
            groups.insert(String::new(), matched);
        }
    }

    for stage in rule.analysis.iter().filter(|a| !a.is_collection_stage()) {
        apply_group_stage(stage, snapshot, &mut groups);
    }

    groups
        .into_iter()
        .filter(|(_, members)| !members.is_empty())
        .map(|(key, members)| {
            let count = members.len();
            let mut events: BTreeSet<usize> = members.iter().copied().collect();
            if rule.definition.include_lineage {
                for index in &members {
                    events.extend(snapshot.lineage(*index));
                }
            }
            RuleMatch { key, count, events }
        })
        .collect()
}

fn apply_collection_stage(stage: &CompiledAnalysis, snapshot: &EventSnapshot, collections: &mut [Vec<usize>]) {
    let Some((first, rest)) = collections.split_first_mut() else {
        return;
    };
    match stage {
        CompiledAnalysis::FirstCollectionOnly { field } => {
            let elsewhere: HashSet<String> =
                rest.iter().flatten().flat_map(|i| snapshot.resolve(*i, field)).collect();
            first.retain(|i| snapshot.resolve(*i, field).iter().all(|v| !elsewhere.contains(v)));
            rest.iter_mut().for_each(Vec::clear);
        }
        CompiledAnalysis::MatchAllToFirstCollection { field, method } => {
            let anchors: Vec<(usize, Vec<String>)> =
                first.iter().map(|i| (*i, snapshot.resolve(*i, field))).collect();
            let mut joined = HashSet::new();
            for collection in rest.iter_mut() {
                collection.retain(|i| {
                    let values = snapshot.resolve(*i, field);
                    let mut hit = false;
                    for (anchor, anchor_values) in &anchors {
                        let linked = values.iter().any(|v| {
                            anchor_values.iter().any(|a| match method {
                                JoinMethod::Exact => v == a,
                                JoinMethod::Contains => v.contains(a.as_str()),
                            })
                        });
                        if linked {
                            joined.insert(*anchor);
                            hit = true;
                        }
                    }
                    hit
                });
            }
            first.retain(|i| joined.contains(i));
        }
        _ => {}
    }
}

fn apply_group_stage(stage: &CompiledAnalysis, snapshot: &EventSnapshot, groups: &mut BTreeMap<String, Vec<usize>>) {
    match stage {
        CompiledAnalysis::Threshold { field, minimum, maximum, unique } => {
            groups.retain(|_, members| {
                let values = members.iter().flat_map(|i| snapshot.resolve(*i, field));
                let count = if *unique { values.collect::<HashSet<_>>().len() } else { values.count() };
                count >= *minimum && maximum.is_none_or(|max| count <= max)
            });
        }
        CompiledAnalysis::Outlier { maximum_percent, noisy_percent } => {
            let total: usize = groups.values().map(Vec::len).sum();
            if total == 0 || groups.is_empty() {
                return;
            }
            let average = 100.0 / groups.len() as f64;
            if average < f64::from(*noisy_percent) {
                groups.clear();
                return;
            }
            groups.retain(|_, members| (members.len() as f64 * 100.0 / total as f64) <= f64::from(*maximum_percent));
        }
        _ => {}
    }
}
