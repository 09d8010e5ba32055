use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

// =============================================================================
// Enums
// =============================================================================

/// Distance function used by the vector index. Smaller is closer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    /// `1 - cosine_similarity`, in `[0, 2]`.
    #[default]
    Cosine,
    /// Euclidean (L2) distance.
    L2,
}

impl fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DistanceMetric::Cosine => write!(f, "cosine"),
            DistanceMetric::L2 => write!(f, "l2"),
        }
    }
}

/// How a nearest-neighbor query is answered.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    /// Brute force over every stored vector. Always correct, O(n).
    #[default]
    Exact,
    /// Index-accelerated search with possible recall loss.
    Approximate,
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchMode::Exact => write!(f, "exact"),
            SearchMode::Approximate => write!(f, "approximate"),
        }
    }
}

impl std::str::FromStr for SearchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exact" => Ok(SearchMode::Exact),
            "approximate" | "approx" => Ok(SearchMode::Approximate),
            other => Err(format!("unknown search mode: {other}")),
        }
    }
}

// =============================================================================
// Metadata and content
// =============================================================================

/// Schema-flexible metadata value.
///
/// Serialized untagged, so a metadata map round-trips as plain JSON.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    List(Vec<MetaValue>),
    Map(BTreeMap<String, MetaValue>),
}

impl MetaValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetaValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetaValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            MetaValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Collect every text leaf, depth first.
    fn collect_text<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            MetaValue::Text(s) => out.push(s),
            MetaValue::List(items) => items.iter().for_each(|v| v.collect_text(out)),
            MetaValue::Map(map) => map.values().for_each(|v| v.collect_text(out)),
            _ => {}
        }
    }
}

impl From<&str> for MetaValue {
    fn from(s: &str) -> Self {
        MetaValue::Text(s.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(s: String) -> Self {
        MetaValue::Text(s)
    }
}

impl From<f64> for MetaValue {
    fn from(n: f64) -> Self {
        MetaValue::Number(n)
    }
}

impl From<i64> for MetaValue {
    fn from(n: i64) -> Self {
        MetaValue::Number(n as f64)
    }
}

impl From<bool> for MetaValue {
    fn from(b: bool) -> Self {
        MetaValue::Bool(b)
    }
}

/// Open key/value metadata attached to a node.
pub type Metadata = BTreeMap<String, MetaValue>;

/// The payload of a node: free text or a structured document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Content {
    Text(String),
    Structured(MetaValue),
}

impl Content {
    /// Hex SHA-256 over the canonical JSON encoding.
    ///
    /// Maps are `BTreeMap`s, so key order is stable and equal documents hash
    /// equally regardless of insertion order.
    pub fn content_hash(&self) -> String {
        let canonical = serde_json::to_vec(self).unwrap_or_else(|_| format!("{:?}", self).into_bytes());
        let mut hasher = Sha256::new();
        hasher.update(&canonical);
        hex::encode(hasher.finalize())
    }

    /// Text used for word-overlap comparisons.
    pub fn text(&self) -> String {
        match self {
            Content::Text(s) => s.clone(),
            Content::Structured(value) => {
                let mut parts = Vec::new();
                value.collect_text(&mut parts);
                parts.join(" ")
            }
        }
    }
}

impl From<&str> for Content {
    fn from(s: &str) -> Self {
        Content::Text(s.to_string())
    }
}

impl From<String> for Content {
    fn from(s: String) -> Self {
        Content::Text(s)
    }
}

// =============================================================================
// Graph records
// =============================================================================

/// Default explicit importance for new nodes.
pub const DEFAULT_IMPORTANCE: f64 = 0.5;

/// A stored unit of content with an optional embedding.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: Uuid,
    pub content: Content,
    pub content_hash: String,
    pub node_type: String,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    #[serde(default)]
    pub access_count: u64,
    #[serde(default = "default_importance")]
    pub importance: f64,
    #[serde(default = "default_strength")]
    pub strength: f64,
    /// False once the forgetting curve has dropped this node below the
    /// strength floor. Inactive nodes are not similarity-searchable.
    #[serde(default = "default_active")]
    pub active: bool,
    /// When the forgetting curve last ran over this node. Decay measures
    /// elapsed time from the later of this and `last_accessed_at`.
    #[serde(default)]
    pub decayed_at: Option<DateTime<Utc>>,
    /// Ids absorbed into this node by consolidation merges.
    #[serde(default)]
    pub merged_from: Vec<Uuid>,
}

fn default_importance() -> f64 {
    DEFAULT_IMPORTANCE
}

fn default_strength() -> f64 {
    1.0
}

fn default_active() -> bool {
    true
}

impl Node {
    pub fn new(content: impl Into<Content>, node_type: impl Into<String>) -> Self {
        let content = content.into();
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            content_hash: content.content_hash(),
            content,
            node_type: node_type.into(),
            embedding: None,
            metadata: Metadata::new(),
            created_at: now,
            last_accessed_at: now,
            access_count: 0,
            importance: DEFAULT_IMPORTANCE,
            strength: 1.0,
            active: true,
            decayed_at: None,
            merged_from: Vec::new(),
        }
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_importance(mut self, importance: f64) -> Self {
        self.importance = importance.clamp(0.0, 1.0);
        self
    }

    /// Whether this node can take part in similarity queries.
    pub fn is_searchable(&self) -> bool {
        self.active && self.embedding.is_some()
    }
}

/// A directed, typed, weighted relationship between two nodes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: Uuid,
    pub source_id: Uuid,
    pub target_id: Uuid,
    pub edge_type: String,
    pub weight: f64,
    pub created_at: DateTime<Utc>,
}

impl Edge {
    pub fn new(source_id: Uuid, target_id: Uuid, edge_type: impl Into<String>, weight: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_id,
            target_id,
            edge_type: edge_type.into(),
            weight,
            created_at: Utc::now(),
        }
    }

    /// True if either endpoint is `id`.
    pub fn touches(&self, id: Uuid) -> bool {
        self.source_id == id || self.target_id == id
    }

    /// The endpoint opposite `id`, if `id` is an endpoint.
    pub fn other(&self, id: Uuid) -> Option<Uuid> {
        if self.source_id == id {
            Some(self.target_id)
        } else if self.target_id == id {
            Some(self.source_id)
        } else {
            None
        }
    }
}

// =============================================================================
// Consolidation reports
// =============================================================================

/// Outcome of a consolidation pass.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ReportStatus {
    Completed,
    Failed { reason: String },
}

/// One merge group: absorbed nodes folded into `base_id`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MergeRecord {
    pub base_id: Uuid,
    pub absorbed_ids: Vec<Uuid>,
}

/// Point-in-time record of a consolidation pass. Never mutated once built.
///
/// `kept_count + pruned_count == original_count`. Merges happen inside the
/// kept set, so the store holds `kept_count - merged_count` nodes afterwards.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationReport {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub original_count: usize,
    pub kept_count: usize,
    pub pruned_count: usize,
    pub merged_count: usize,
    /// Mean importance score over every node present when the pass began.
    pub avg_importance: f64,
    pub pruned_ids: Vec<Uuid>,
    pub merges: Vec<MergeRecord>,
    pub status: ReportStatus,
}

impl ConsolidationReport {
    pub fn is_completed(&self) -> bool {
        matches!(self.status, ReportStatus::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_is_stable() {
        let a = Content::from("hello world");
        let b = Content::Text("hello world".to_string());
        assert_eq!(a.content_hash(), b.content_hash());
        assert_eq!(a.content_hash().len(), 64);
    }

    #[test]
    fn test_content_hash_differs_by_kind() {
        let text = Content::from("x");
        let structured = Content::Structured(MetaValue::Text("x".into()));
        assert_ne!(text.content_hash(), structured.content_hash());
    }

    #[test]
    fn test_structured_hash_ignores_insertion_order() {
        let mut m1 = BTreeMap::new();
        m1.insert("b".to_string(), MetaValue::from(2.0));
        m1.insert("a".to_string(), MetaValue::from("one"));
        let mut m2 = BTreeMap::new();
        m2.insert("a".to_string(), MetaValue::from("one"));
        m2.insert("b".to_string(), MetaValue::from(2.0));
        assert_eq!(
            Content::Structured(MetaValue::Map(m1)).content_hash(),
            Content::Structured(MetaValue::Map(m2)).content_hash()
        );
    }

    #[test]
    fn test_structured_text_collects_leaves() {
        let mut map = BTreeMap::new();
        map.insert("title".to_string(), MetaValue::from("rust memory"));
        map.insert(
            "tags".to_string(),
            MetaValue::List(vec![MetaValue::from("cache"), MetaValue::from(1.0)]),
        );
        let content = Content::Structured(MetaValue::Map(map));
        let text = content.text();
        assert!(text.contains("rust memory"));
        assert!(text.contains("cache"));
    }

    #[test]
    fn test_meta_value_untagged_json() {
        let mut map = Metadata::new();
        map.insert("source".into(), MetaValue::from("chat"));
        map.insert("score".into(), MetaValue::from(0.5));
        map.insert("pinned".into(), MetaValue::from(true));
        let json = serde_json::to_string(&map).unwrap();
        assert_eq!(json, r#"{"pinned":true,"score":0.5,"source":"chat"}"#);
        let back: Metadata = serde_json::from_str(&json).unwrap();
        assert_eq!(back, map);
    }

    #[test]
    fn test_node_defaults() {
        let node = Node::new("fact", "note");
        assert_eq!(node.importance, DEFAULT_IMPORTANCE);
        assert_eq!(node.strength, 1.0);
        assert!(node.active);
        assert!(!node.is_searchable());
        assert!(node.with_embedding(vec![0.1]).is_searchable());
    }

    #[test]
    fn test_node_deserialize_fills_defaults() {
        let node = Node::new("fact", "note");
        let mut json = serde_json::to_value(&node).unwrap();
        let obj = json.as_object_mut().unwrap();
        obj.remove("strength");
        obj.remove("active");
        obj.remove("merged_from");
        let back: Node = serde_json::from_value(json).unwrap();
        assert_eq!(back.strength, 1.0);
        assert!(back.active);
        assert!(back.merged_from.is_empty());
    }

    #[test]
    fn test_edge_other() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let edge = Edge::new(a, b, "related", 1.0);
        assert_eq!(edge.other(a), Some(b));
        assert_eq!(edge.other(b), Some(a));
        assert_eq!(edge.other(Uuid::new_v4()), None);
        assert!(edge.touches(a));
    }

    #[test]
    fn test_search_mode_parse() {
        assert_eq!("exact".parse::<SearchMode>().unwrap(), SearchMode::Exact);
        assert_eq!(
            "approx".parse::<SearchMode>().unwrap(),
            SearchMode::Approximate
        );
        assert!("fuzzy".parse::<SearchMode>().is_err());
    }

    #[test]
    fn test_enum_serialization() {
        assert_eq!(
            serde_json::to_string(&DistanceMetric::L2).unwrap(),
            "\"l2\""
        );
        assert_eq!(
            serde_json::to_string(&SearchMode::Approximate).unwrap(),
            "\"approximate\""
        );
        let failed = ReportStatus::Failed {
            reason: "boom".into(),
        };
        let json = serde_json::to_string(&failed).unwrap();
        assert_eq!(json, r#"{"state":"failed","reason":"boom"}"#);
    }
}
