// src/core/dispatch.rs

//! Per-scan routing table from event type to interested module instances.
//!
//! The graph also owns the delivery ledger: a concurrent set of
//! `(module, event hash)` pairs. Inserting into it is the single atomic
//! check-and-mark that guarantees a module sees a given event at most once.
//!
//! Hashes include the source, so the ledger alone cannot stop a semantic
//! cycle such as IP -> domain -> IP. The graph therefore also indexes every
//! routed event's `(type, data, source)`; an event repeating the type and
//! data of one of its ancestors is stored but never dispatched.

use std::collections::HashMap;

use dashmap::{DashMap, DashSet};
use tracing::{debug, trace};

use crate::core::models::{event_types, Event};
use crate::core::registry::ModuleInstance;

/// Index of a module instance inside its scan's dispatch graph. Doubles as
/// the worker pool lane the module's tasks are queued on.
pub type Lane = usize;

/// What the graph remembers about a routed event to walk its lineage.
#[derive(Debug)]
struct Fingerprint {
    event_type: String,
    data: String,
    source: Option<String>,
}

#[derive(Debug)]
pub struct DispatchGraph {
    modules: Vec<ModuleInstance>,
    routes: HashMap<String, Vec<Lane>>,
    wildcard: Vec<Lane>,
    delivered: DashSet<(Lane, String)>,
    lineage: DashMap<String, Fingerprint>,
    max_depth: Option<u32>,
}

impl DispatchGraph {
    /// Builds the routing table once for the lifetime of a scan.
    pub fn build(modules: Vec<ModuleInstance>, max_depth: Option<u32>) -> Self {
        let mut routes: HashMap<String, Vec<Lane>> = HashMap::new();
        let mut wildcard = Vec::new();
        for (lane, module) in modules.iter().enumerate() {
            for watched in &module.watched_types {
                if watched == event_types::WILDCARD {
                    wildcard.push(lane);
                } else {
                    let subscribers = routes.entry(watched.clone()).or_default();
                    if !subscribers.contains(&lane) {
                        subscribers.push(lane);
                    }
                }
            }
        }
        debug!(modules = modules.len(), event_types = routes.len(), "Dispatch graph built.");
        Self { modules, routes, wildcard, delivered: DashSet::new(), lineage: DashMap::new(), max_depth }
    }

    pub fn modules(&self) -> &[ModuleInstance] {
        &self.modules
    }

    pub fn module(&self, lane: Lane) -> &ModuleInstance {
        &self.modules[lane]
    }

    /// Per-lane concurrency ceilings, in lane order.
    pub fn lane_limits(&self) -> Vec<usize> {
        self.modules.iter().map(|m| m.max_instances).collect()
    }

    /// Lanes subscribed to `event_type`, ignoring delivery history.
    pub fn subscribers(&self, event_type: &str) -> Vec<Lane> {
        let mut lanes: Vec<Lane> = self.routes.get(event_type).cloned().unwrap_or_default();
        for lane in &self.wildcard {
            if !lanes.contains(lane) {
                lanes.push(*lane);
            }
        }
        lanes
    }

    /// Lanes that should receive `event` now, marking each as delivered.
    ///
    /// Two concurrent calls for the same event yield each lane at most once
    /// between them.
    pub fn route(&self, event: &Event) -> Vec<Lane> {
        self.lineage.entry(event.hash.clone()).or_insert_with(|| Fingerprint {
            event_type: event.event_type.clone(),
            data: event.data.clone(),
            source: event.source_hash.clone(),
        });
        if self.repeats_ancestor(event) {
            debug!(hash = %event.hash, event_type = %event.event_type, "Event repeats an ancestor, not dispatched.");
            return Vec::new();
        }
        if let Some(max_depth) = self.max_depth {
            if event.depth > max_depth {
                debug!(hash = %event.hash, depth = event.depth, "Event beyond max depth, not dispatched.");
                return Vec::new();
            }
        }
        self.subscribers(&event.event_type)
            .into_iter()
            .filter(|lane| {
                let module = &self.modules[*lane];
                if module.name == event.module && !module.accepts_own_events {
                    return false;
                }
                let fresh = self.delivered.insert((*lane, event.hash.clone()));
                if !fresh {
                    trace!(module = %module.name, hash = %event.hash, "Duplicate delivery suppressed.");
                }
                fresh
            })
            .collect()
    }

    /// Whether an ancestor of `event` carries the same type and data.
    pub fn repeats_ancestor(&self, event: &Event) -> bool {
        let mut cursor = event.source_hash.clone();
        while let Some(hash) = cursor {
            let Some(ancestor) = self.lineage.get(&hash) else {
                return false;
            };
            if ancestor.event_type == event.event_type && ancestor.data == event.data {
                return true;
            }
            cursor = ancestor.source.clone();
        }
        false
    }

    /// Number of (module, event) deliveries made so far.
    pub fn delivered_count(&self) -> usize {
        self.delivered.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ModuleError;
    use crate::core::models::{EventDraft, ScanId};
    use crate::core::registry::{Module, ModuleDescriptor};
    use async_trait::async_trait;
    use serde_json::Map;

    struct Stub {
        watched: Vec<String>,
    }

    #[async_trait]
    impl Module for Stub {
        fn watched_types(&self) -> Vec<String> {
            self.watched.clone()
        }

        fn produced_types(&self) -> Vec<String> {
            vec![event_types::IP_ADDRESS.into()]
        }

        async fn handle(&self, _event: &Event) -> Result<Vec<EventDraft>, ModuleError> {
            Ok(Vec::new())
        }
    }

    fn instance(name: &str, watched: &[&str], accepts_own: bool) -> ModuleInstance {
        let watched: Vec<String> = watched.iter().map(|s| s.to_string()).collect();
        let types = watched.clone();
        ModuleDescriptor::new(name, &[], &[], move |_| Ok(Box::new(Stub { watched: types.clone() })))
            .accepts_own_events(accepts_own)
            .instantiate(&Map::new())
            .unwrap()
    }

    fn seed() -> Event {
        Event::seed(&ScanId::from("s"), event_types::DOMAIN_NAME, "example.com")
    }

    #[test]
    fn test_routes_by_type_and_wildcard() {
        let graph = DispatchGraph::build(
            vec![
                instance("dns", &[event_types::DOMAIN_NAME], false),
                instance("ports", &[event_types::IP_ADDRESS], false),
                instance("all", &["*"], false),
            ],
            None,
        );
        let mut lanes = graph.route(&seed());
        lanes.sort();
        assert_eq!(lanes, vec![0, 2]);
    }

    #[test]
    fn test_same_event_is_delivered_once() {
        let graph = DispatchGraph::build(vec![instance("dns", &[event_types::DOMAIN_NAME], false)], None);
        assert_eq!(graph.route(&seed()), vec![0]);
        assert!(graph.route(&seed()).is_empty());
        assert_eq!(graph.delivered_count(), 1);
    }

    #[test]
    fn test_concurrent_routing_delivers_exactly_once() {
        let graph = DispatchGraph::build(
            vec![
                instance("a", &[event_types::DOMAIN_NAME], false),
                instance("b", &[event_types::DOMAIN_NAME], false),
            ],
            None,
        );
        let event = seed();
        let total: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..16).map(|_| scope.spawn(|| graph.route(&event).len())).collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });
        assert_eq!(total, 2);
    }

    #[test]
    fn test_own_events_suppressed_unless_opted_in() {
        let graph = DispatchGraph::build(
            vec![
                instance("loop", &[event_types::IP_ADDRESS], false),
                instance("selfish", &[event_types::IP_ADDRESS], true),
            ],
            None,
        );
        let ip = Event::derive(&seed(), "loop", EventDraft::new(event_types::IP_ADDRESS, "1.2.3.4"));
        assert!(graph.route(&ip).iter().all(|lane| *lane != 0));
        let ip = Event::derive(&seed(), "selfish", EventDraft::new(event_types::IP_ADDRESS, "1.2.3.4"));
        assert!(graph.route(&ip).contains(&1));
    }

    #[test]
    fn test_repeated_fact_in_lineage_is_not_dispatched() {
        let graph = DispatchGraph::build(
            vec![
                instance("forward", &[event_types::DOMAIN_NAME], false),
                instance("reverse", &[event_types::IP_ADDRESS], false),
            ],
            None,
        );
        let domain = seed();
        assert_eq!(graph.route(&domain), vec![0]);
        let ip = Event::derive(&domain, "forward", EventDraft::new(event_types::IP_ADDRESS, "10.0.0.1"));
        assert_eq!(graph.route(&ip), vec![1]);

        let again = Event::derive(&ip, "reverse", EventDraft::new(event_types::DOMAIN_NAME, "example.com"));
        assert!(graph.repeats_ancestor(&again));
        assert!(graph.route(&again).is_empty());

        let other = Event::derive(&ip, "reverse", EventDraft::new(event_types::DOMAIN_NAME, "mail.example.com"));
        assert_eq!(graph.route(&other), vec![0]);
    }

    #[test]
    fn test_depth_limit_stops_dispatch() {
        let graph = DispatchGraph::build(vec![instance("ports", &[event_types::IP_ADDRESS], false)], Some(0));
        let ip = Event::derive(&seed(), "dns", EventDraft::new(event_types::IP_ADDRESS, "1.2.3.4"));
        assert!(graph.route(&ip).is_empty());
    }
}
