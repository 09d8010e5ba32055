//! Near-duplicate detection and merge planning.
//!
//! Similarity is word-set Jaccard scaled by temporal proximity:
//! `jaccard(words) * exp(-|Δcreated| / time_scale)`. Only nodes of the same
//! `node_type` are compared. Linked pairs form a graph whose connected
//! components each collapse into their most recently created member.

use std::collections::{BTreeMap, HashSet};

use mnemo_core::types::Node;
use mnemo_store::MergePlan;

/// Lowercased words with surrounding punctuation stripped.
pub fn word_set(text: &str) -> HashSet<String> {
    text.split_whitespace()
        .map(|w| {
            w.to_lowercase()
                .trim_matches(|c: char| !c.is_alphanumeric())
                .to_string()
        })
        .filter(|w| !w.is_empty())
        .collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

fn temporal_factor(a: &Node, b: &Node, time_scale_hours: f64) -> f64 {
    let gap_hours = (a.created_at - b.created_at).num_milliseconds().abs() as f64 / 3_600_000.0;
    (-gap_hours / time_scale_hours).exp()
}

/// Merge similarity between two nodes, in `[0, 1]`.
pub fn similarity(a: &Node, b: &Node, time_scale_hours: f64) -> f64 {
    let words_a = word_set(&a.content.text());
    let words_b = word_set(&b.content.text());
    jaccard(&words_a, &words_b) * temporal_factor(a, b, time_scale_hours)
}

/// Plan merges among `kept`. Nodes not in any returned group are untouched.
pub fn plan_merges(kept: &[Node], threshold: f64, time_scale_hours: f64) -> Vec<MergePlan> {
    let mut by_type: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (i, node) in kept.iter().enumerate() {
        by_type.entry(node.node_type.as_str()).or_default().push(i);
    }

    let words: Vec<HashSet<String>> = kept.iter().map(|n| word_set(&n.content.text())).collect();

    let mut plans = Vec::new();
    for members in by_type.values() {
        let n = members.len();
        let mut adj: Vec<Vec<usize>> = vec![Vec::new(); n];
        for i in 0..n {
            for j in (i + 1)..n {
                let (a, b) = (members[i], members[j]);
                let sim = jaccard(&words[a], &words[b])
                    * temporal_factor(&kept[a], &kept[b], time_scale_hours);
                if sim > threshold {
                    adj[i].push(j);
                    adj[j].push(i);
                }
            }
        }

        // Connected components via DFS
        let mut visited = vec![false; n];
        for start in 0..n {
            if visited[start] || adj[start].is_empty() {
                continue;
            }
            let mut component = Vec::new();
            let mut stack = vec![start];
            while let Some(i) = stack.pop() {
                if visited[i] {
                    continue;
                }
                visited[i] = true;
                component.push(&kept[members[i]]);
                stack.extend(adj[i].iter().copied().filter(|j| !visited[*j]));
            }
            if component.len() >= 2 {
                plans.push(merge_component(&component));
            }
        }
    }
    plans
}

/// Fold a component into its most recently created member.
fn merge_component(component: &[&Node]) -> MergePlan {
    let base_ref = component
        .iter()
        .copied()
        .max_by(|a, b| a.created_at.cmp(&b.created_at).then(b.id.cmp(&a.id)))
        .unwrap_or(component[0]);

    let mut base = base_ref.clone();
    let mut absorbed: Vec<&Node> = component
        .iter()
        .copied()
        .filter(|n| n.id != base.id)
        .collect();
    absorbed.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

    let count = component.len() as f64;
    base.access_count = component.iter().map(|n| n.access_count).sum();
    base.importance = component.iter().map(|n| n.importance).sum::<f64>() / count;
    base.created_at = component.iter().map(|n| n.created_at).min().unwrap_or(base.created_at);
    base.last_accessed_at = component
        .iter()
        .map(|n| n.last_accessed_at)
        .max()
        .unwrap_or(base.last_accessed_at);
    base.decayed_at = component.iter().filter_map(|n| n.decayed_at).max();
    base.strength = component.iter().map(|n| n.strength).fold(0.0, f64::max);
    base.active = component.iter().any(|n| n.active);

    for other in &absorbed {
        base.merged_from.push(other.id);
        base.merged_from.extend_from_slice(&other.merged_from);
        if base.embedding.is_none() {
            base.embedding = other.embedding.clone();
        }
        for (key, value) in &other.metadata {
            base.metadata
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
    }

    MergePlan {
        base,
        absorbed: absorbed.iter().map(|n| n.id).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use mnemo_core::types::MetaValue;

    #[test]
    fn test_word_set_normalizes() {
        let words = word_set("Rust, rust! RUST? memory");
        assert_eq!(words.len(), 2);
        assert!(words.contains("rust"));
        assert!(words.contains("memory"));
    }

    #[test]
    fn test_similarity_identical_text_same_time() {
        let a = Node::new("the cache evicts old keys", "note");
        let mut b = Node::new("the cache evicts old keys!", "note");
        b.created_at = a.created_at;
        assert!((similarity(&a, &b, 24.0) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_similarity_decays_with_time_gap() {
        let a = Node::new("deploy the service", "note");
        let mut b = Node::new("deploy the service now", "note");
        b.created_at = a.created_at;
        let close = similarity(&a, &b, 24.0);
        b.created_at = a.created_at - Duration::hours(48);
        let far = similarity(&a, &b, 24.0);
        assert!(far < close);
        assert!((far - close * (-2.0f64).exp()).abs() < 1e-6);
    }

    #[test]
    fn test_plan_merges_groups_components() {
        let now = chrono::Utc::now();
        let mut a = Node::new("alpha beta gamma delta", "note");
        let mut b = Node::new("alpha beta gamma delta epsilon", "note");
        let mut c = Node::new("totally unrelated words here", "note");
        a.created_at = now - Duration::minutes(2);
        b.created_at = now - Duration::minutes(1);
        c.created_at = now;
        a.access_count = 2;
        b.access_count = 3;
        a.importance = 0.2;
        b.importance = 0.6;
        a.strength = 0.9;
        b.strength = 0.4;
        a.metadata.insert("source".into(), MetaValue::from("chat"));

        let plans = plan_merges(&[a.clone(), b.clone(), c], 0.75, 24.0);
        assert_eq!(plans.len(), 1);
        let plan = &plans[0];
        assert_eq!(plan.base.id, b.id);
        assert_eq!(plan.absorbed, vec![a.id]);
        assert_eq!(plan.base.access_count, 5);
        assert!((plan.base.importance - 0.4).abs() < 1e-9);
        assert_eq!(plan.base.created_at, a.created_at);
        assert_eq!(plan.base.strength, 0.9);
        assert_eq!(plan.base.merged_from, vec![a.id]);
        assert_eq!(plan.base.metadata["source"].as_str(), Some("chat"));
    }

    #[test]
    fn test_different_types_never_merge() {
        let a = Node::new("same words exactly", "note");
        let mut b = Node::new("same words exactly.", "fact");
        b.created_at = a.created_at;
        assert!(plan_merges(&[a, b], 0.5, 24.0).is_empty());
    }

    #[test]
    fn test_transitive_component() {
        let now = chrono::Utc::now();
        let mut a = Node::new("one two three four", "note");
        let mut b = Node::new("one two three four five", "note");
        let mut c = Node::new("two three four five six", "note");
        a.created_at = now;
        b.created_at = now;
        c.created_at = now;
        // a~b and b~c exceed the threshold, a~c does not.
        assert!(similarity(&a, &c, 24.0) < 0.6);
        let plans = plan_merges(&[a, b, c], 0.6, 24.0);
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].absorbed.len(), 2);
    }
}
