//! Plugin registry with closed capabilities.
//!
//! A plugin declares which hooks it implements through [`Capability`]; the
//! registry only dispatches a hook to plugins that declared it. Hooks run in
//! registration order.

use serde::{Deserialize, Serialize};
use tracing::info;

use mnemo_core::error::{MnemoError, Result};
use mnemo_core::types::{MetaValue, Node};

/// Hooks a plugin may take part in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// `on_node_added` after a new node is stored.
    ObserveWrites,
    /// `adjust_importance` during consolidation scoring.
    AdjustImportance,
    /// `accept_result` on every query result.
    FilterResults,
}

pub trait MemoryPlugin: Send + Sync {
    /// Unique name within a registry.
    fn name(&self) -> &str;

    fn capabilities(&self) -> &[Capability];

    fn on_node_added(&self, _node: &Node) {}

    fn adjust_importance(&self, _node: &Node, score: f64) -> f64 {
        score
    }

    fn accept_result(&self, _node: &Node) -> bool {
        true
    }
}

/// Registered plugins, in registration order.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: Vec<Box<dyn MemoryPlugin>>,
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.names())
            .finish()
    }
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin. Names must be unique.
    pub fn register(&mut self, plugin: Box<dyn MemoryPlugin>) -> Result<()> {
        if self.plugins.iter().any(|p| p.name() == plugin.name()) {
            return Err(MnemoError::Config(format!(
                "plugin already registered: {}",
                plugin.name()
            )));
        }
        info!(
            plugin = plugin.name(),
            capabilities = ?plugin.capabilities(),
            "Plugin registered"
        );
        self.plugins.push(plugin);
        Ok(())
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        let before = self.plugins.len();
        self.plugins.retain(|p| p.name() != name);
        self.plugins.len() != before
    }

    pub fn names(&self) -> Vec<String> {
        self.plugins.iter().map(|p| p.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Whether any plugin declares `capability`.
    pub fn has(&self, capability: Capability) -> bool {
        self.with(capability).next().is_some()
    }

    fn with(&self, capability: Capability) -> impl Iterator<Item = &dyn MemoryPlugin> {
        self.plugins
            .iter()
            .map(|p| p.as_ref())
            .filter(move |p| p.capabilities().contains(&capability))
    }

    pub fn notify_added(&self, node: &Node) {
        for plugin in self.with(Capability::ObserveWrites) {
            plugin.on_node_added(node);
        }
    }

    /// Thread `score` through every importance adjuster.
    pub fn adjust_importance(&self, node: &Node, score: f64) -> f64 {
        self.with(Capability::AdjustImportance)
            .fold(score, |s, plugin| plugin.adjust_importance(node, s))
    }

    /// True unless some result filter rejects `node`.
    pub fn accepts(&self, node: &Node) -> bool {
        self.with(Capability::FilterResults)
            .all(|plugin| plugin.accept_result(node))
    }
}

// ---------------------------------------------------------------------------
// Built-ins
// ---------------------------------------------------------------------------

/// Multiplies the consolidation score of one node type.
#[derive(Debug, Clone)]
pub struct TypeBoost {
    name: String,
    node_type: String,
    factor: f64,
}

impl TypeBoost {
    pub fn new(node_type: impl Into<String>, factor: f64) -> Self {
        let node_type = node_type.into();
        Self {
            name: format!("type-boost:{node_type}"),
            node_type,
            factor,
        }
    }
}

impl MemoryPlugin for TypeBoost {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> &[Capability] {
        &[Capability::AdjustImportance]
    }

    fn adjust_importance(&self, node: &Node, score: f64) -> f64 {
        if node.node_type == self.node_type {
            score * self.factor
        } else {
            score
        }
    }
}

/// Hides query results whose metadata `key` is not equal to `value`.
#[derive(Debug, Clone)]
pub struct MetadataFilter {
    name: String,
    key: String,
    value: MetaValue,
}

impl MetadataFilter {
    pub fn new(key: impl Into<String>, value: impl Into<MetaValue>) -> Self {
        let key = key.into();
        Self {
            name: format!("metadata-filter:{key}"),
            key,
            value: value.into(),
        }
    }
}

impl MemoryPlugin for MetadataFilter {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> &[Capability] {
        &[Capability::FilterResults]
    }

    fn accept_result(&self, node: &Node) -> bool {
        node.metadata.get(&self.key) == Some(&self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Counter {
        seen: Arc<AtomicUsize>,
    }

    impl MemoryPlugin for Counter {
        fn name(&self) -> &str {
            "counter"
        }

        fn capabilities(&self) -> &[Capability] {
            &[Capability::ObserveWrites]
        }

        fn on_node_added(&self, _node: &Node) {
            self.seen.fetch_add(1, Ordering::SeqCst);
        }

        // Not declared, so never called through the registry.
        fn accept_result(&self, _node: &Node) -> bool {
            false
        }
    }

    #[test]
    fn test_dispatch_respects_capabilities() {
        let seen = Arc::new(AtomicUsize::new(0));
        let mut registry = PluginRegistry::new();
        registry
            .register(Box::new(Counter { seen: seen.clone() }))
            .unwrap();

        let node = Node::new("x", "note");
        registry.notify_added(&node);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(registry.accepts(&node));
        assert!(registry.has(Capability::ObserveWrites));
        assert!(!registry.has(Capability::FilterResults));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut registry = PluginRegistry::new();
        registry.register(Box::new(TypeBoost::new("fact", 2.0))).unwrap();
        assert!(registry
            .register(Box::new(TypeBoost::new("fact", 3.0)))
            .is_err());
        assert_eq!(registry.len(), 1);
        assert!(registry.unregister("type-boost:fact"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_type_boost_chains() {
        let mut registry = PluginRegistry::new();
        registry.register(Box::new(TypeBoost::new("fact", 2.0))).unwrap();
        registry.register(Box::new(TypeBoost::new("task", 0.5))).unwrap();

        let fact = Node::new("water boils", "fact");
        let note = Node::new("random", "note");
        assert_eq!(registry.adjust_importance(&fact, 0.3), 0.6);
        assert_eq!(registry.adjust_importance(&note, 0.3), 0.3);
    }

    #[test]
    fn test_metadata_filter() {
        let filter = MetadataFilter::new("project", "mnemo");
        let mut hit = Node::new("a", "note");
        hit.metadata.insert("project".into(), MetaValue::from("mnemo"));
        let miss = Node::new("b", "note");
        assert!(filter.accept_result(&hit));
        assert!(!filter.accept_result(&miss));
    }
}
