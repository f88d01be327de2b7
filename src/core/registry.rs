// src/core/registry.rs

//! The module catalogue.
//!
//! A module is anything implementing [`Module`]: it declares which event types
//! it watches and produces, and turns one event into zero or more drafts.
//! The registry only knows how to describe and construct modules; scheduling
//! lives in the dispatch graph and worker pool.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::core::error::{EngineError, ModuleError};
use crate::core::models::{Event, EventDraft};

/// Capability interface every collection module satisfies.
///
/// A module may be invoked concurrently for different events, up to its
/// descriptor's `max_instances`. Making that safe is the module's own concern.
#[async_trait]
pub trait Module: Send + Sync {
    /// Event types this module wants to receive. `"*"` subscribes to all of them.
    fn watched_types(&self) -> Vec<String>;

    /// Event types this module may emit.
    fn produced_types(&self) -> Vec<String>;

    /// Processes one event and returns what was discovered from it.
    async fn handle(&self, event: &Event) -> Result<Vec<EventDraft>, ModuleError>;
}

/// Validated, immutable options handed to a module at construction.
#[derive(Debug, Clone, Default)]
pub struct ModuleConfig {
    pub module: String,
    options: Arc<Map<String, Value>>,
}

impl ModuleConfig {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.options.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(Value::as_u64)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Value::as_bool)
    }

    pub fn get_list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default()
    }
}

pub type ModuleFactory = Arc<dyn Fn(ModuleConfig) -> Result<Box<dyn Module>, ModuleError> + Send + Sync>;

/// Static description of a module plus the means to build an instance of it.
#[derive(Clone)]
pub struct ModuleDescriptor {
    pub name: String,
    pub summary: String,
    pub watched_types: Vec<String>,
    pub produced_types: Vec<String>,
    pub default_options: Map<String, Value>,
    /// Concurrency ceiling for this module within one scan.
    pub max_instances: usize,
    /// Whether the module should receive events it produced itself.
    pub accepts_own_events: bool,
    factory: ModuleFactory,
}

impl fmt::Debug for ModuleDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleDescriptor")
            .field("name", &self.name)
            .field("watched_types", &self.watched_types)
            .field("produced_types", &self.produced_types)
            .field("max_instances", &self.max_instances)
            .finish_non_exhaustive()
    }
}

impl ModuleDescriptor {
    pub fn new<F>(name: &str, watched: &[&str], produced: &[&str], factory: F) -> Self
    where
        F: Fn(ModuleConfig) -> Result<Box<dyn Module>, ModuleError> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            summary: String::new(),
            watched_types: watched.iter().map(|t| t.to_string()).collect(),
            produced_types: produced.iter().map(|t| t.to_string()).collect(),
            default_options: Map::new(),
            max_instances: 1,
            accepts_own_events: false,
            factory: Arc::new(factory),
        }
    }

    pub fn summary(mut self, summary: &str) -> Self {
        self.summary = summary.to_string();
        self
    }

    pub fn max_instances(mut self, max_instances: usize) -> Self {
        self.max_instances = max_instances.max(1);
        self
    }

    pub fn accepts_own_events(mut self, accepts: bool) -> Self {
        self.accepts_own_events = accepts;
        self
    }

    pub fn option(mut self, key: &str, default: Value) -> Self {
        self.default_options.insert(key.to_string(), default);
        self
    }

    /// Merges `overrides` onto the defaults, rejecting unknown keys and type changes.
    pub fn validate_options(&self, overrides: &Map<String, Value>) -> Result<ModuleConfig, ModuleError> {
        let mut merged = self.default_options.clone();
        for (key, value) in overrides {
            let Some(default) = self.default_options.get(key) else {
                return Err(ModuleError::InvalidOptions {
                    module: self.name.clone(),
                    message: format!("unknown option '{key}'"),
                });
            };
            if !same_kind(default, value) {
                return Err(ModuleError::InvalidOptions {
                    module: self.name.clone(),
                    message: format!("option '{key}' expects {}", kind_name(default)),
                });
            }
            merged.insert(key.clone(), value.clone());
        }
        Ok(ModuleConfig { module: self.name.clone(), options: Arc::new(merged) })
    }

    /// Builds a fresh instance for one scan.
    pub fn instantiate(&self, overrides: &Map<String, Value>) -> Result<ModuleInstance, ModuleError> {
        let config = self.validate_options(overrides)?;
        let module = (self.factory)(config)?;
        Ok(ModuleInstance {
            name: self.name.clone(),
            watched_types: module.watched_types(),
            produced_types: module.produced_types(),
            max_instances: self.max_instances,
            accepts_own_events: self.accepts_own_events,
            module,
        })
    }
}

fn same_kind(a: &Value, b: &Value) -> bool {
    kind_name(a) == kind_name(b)
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
}

/// A module constructed for one scan. Dropped when the scan terminates.
pub struct ModuleInstance {
    pub name: String,
    pub watched_types: Vec<String>,
    pub produced_types: Vec<String>,
    pub max_instances: usize,
    pub accepts_own_events: bool,
    pub module: Box<dyn Module>,
}

impl fmt::Debug for ModuleInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleInstance")
            .field("name", &self.name)
            .field("watched_types", &self.watched_types)
            .field("max_instances", &self.max_instances)
            .finish_non_exhaustive()
    }
}

impl ModuleInstance {
    pub fn produces(&self, event_type: &str) -> bool {
        self.produced_types.iter().any(|t| t == event_type)
    }
}

/// Catalogue of every module the engine can run, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct ModuleRegistry {
    modules: BTreeMap<String, ModuleDescriptor>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a module, replacing any earlier registration with the same name.
    pub fn register(&mut self, descriptor: ModuleDescriptor) -> &mut Self {
        self.modules.insert(descriptor.name.clone(), descriptor);
        self
    }

    pub fn get(&self, name: &str) -> Option<&ModuleDescriptor> {
        self.modules.get(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.modules.keys().cloned().collect()
    }

    /// Descriptors for `module_set`, or for every module when the set is empty.
    pub fn list_modules(&self, module_set: &[String]) -> Result<Vec<&ModuleDescriptor>, EngineError> {
        if module_set.is_empty() {
            return Ok(self.modules.values().collect());
        }
        let mut seen = std::collections::BTreeSet::new();
        module_set
            .iter()
            .filter(|name| seen.insert(name.as_str()))
            .map(|name| self.get(name).ok_or_else(|| EngineError::UnknownModule(name.clone())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl Module for Echo {
        fn watched_types(&self) -> Vec<String> {
            vec!["DOMAIN_NAME".into()]
        }

        fn produced_types(&self) -> Vec<String> {
            vec!["INTERNET_NAME".into()]
        }

        async fn handle(&self, event: &Event) -> Result<Vec<EventDraft>, ModuleError> {
            Ok(vec![EventDraft::new("INTERNET_NAME", event.data.clone())])
        }
    }

    fn echo_descriptor() -> ModuleDescriptor {
        ModuleDescriptor::new("echo", &["DOMAIN_NAME"], &["INTERNET_NAME"], |_| Ok(Box::new(Echo)))
            .option("retries", json!(3))
            .option("verify", json!(true))
    }

    #[test]
    fn test_options_merge_over_defaults() {
        let descriptor = echo_descriptor();
        let overrides = json!({"retries": 5}).as_object().cloned().unwrap();
        let config = descriptor.validate_options(&overrides).unwrap();
        assert_eq!(config.get_u64("retries"), Some(5));
        assert_eq!(config.get_bool("verify"), Some(true));
    }

    #[test]
    fn test_unknown_option_rejected() {
        let descriptor = echo_descriptor();
        let overrides = json!({"bogus": 1}).as_object().cloned().unwrap();
        assert!(matches!(
            descriptor.validate_options(&overrides),
            Err(ModuleError::InvalidOptions { .. })
        ));
    }

    #[test]
    fn test_option_type_mismatch_rejected() {
        let descriptor = echo_descriptor();
        let overrides = json!({"retries": "five"}).as_object().cloned().unwrap();
        assert!(descriptor.validate_options(&overrides).is_err());
    }

    #[test]
    fn test_list_modules_reports_unknown_names() {
        let mut registry = ModuleRegistry::new();
        registry.register(echo_descriptor());
        assert_eq!(registry.list_modules(&[]).unwrap().len(), 1);
        assert_eq!(registry.list_modules(&["echo".into(), "echo".into()]).unwrap().len(), 1);
        assert!(matches!(
            registry.list_modules(&["missing".into()]),
            Err(EngineError::UnknownModule(name)) if name == "missing"
        ));
    }

    #[test]
    fn test_instantiate_caches_capabilities() {
        let instance = echo_descriptor().max_instances(0).instantiate(&Map::new()).unwrap();
        assert_eq!(instance.watched_types, vec!["DOMAIN_NAME".to_string()]);
        assert!(instance.produces("INTERNET_NAME"));
        assert_eq!(instance.max_instances, 1);
    }
}
