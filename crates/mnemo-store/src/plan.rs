//! Consolidation plans: a fully computed set of prunes and merges that the
//! store commits in one exclusive section.

use std::collections::HashSet;

use mnemo_core::types::Node;
use uuid::Uuid;

/// One merge group.
#[derive(Debug, Clone)]
pub struct MergePlan {
    /// The surviving node with its merged fields already computed. Its id
    /// must name an existing node.
    pub base: Node,
    /// Nodes folded into `base` and removed.
    pub absorbed: Vec<Uuid>,
}

/// Everything a consolidation pass wants to change.
#[derive(Debug, Clone, Default)]
pub struct ConsolidationPlan {
    pub prune: Vec<Uuid>,
    pub merges: Vec<MergePlan>,
}

impl ConsolidationPlan {
    pub fn is_empty(&self) -> bool {
        self.prune.is_empty() && self.merges.is_empty()
    }

    /// Every id the plan touches, in plan order. Duplicates are kept so
    /// validation can reject them.
    pub fn referenced_ids(&self) -> Vec<Uuid> {
        let mut ids = self.prune.clone();
        for merge in &self.merges {
            ids.push(merge.base.id);
            ids.extend_from_slice(&merge.absorbed);
        }
        ids
    }

    /// Ids that stop existing once the plan is applied.
    pub fn removed_ids(&self) -> Vec<Uuid> {
        let mut ids = self.prune.clone();
        for merge in &self.merges {
            ids.extend_from_slice(&merge.absorbed);
        }
        ids
    }

    /// The first id named more than once, if any.
    pub fn first_duplicate(&self) -> Option<Uuid> {
        let mut seen = HashSet::new();
        self.referenced_ids().into_iter().find(|id| !seen.insert(*id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_removed_and_duplicate_ids() {
        let base = Node::new("base", "note");
        let a = Uuid::new_v4();
        let p = Uuid::new_v4();
        let plan = ConsolidationPlan {
            prune: vec![p],
            merges: vec![MergePlan {
                base: base.clone(),
                absorbed: vec![a],
            }],
        };
        assert_eq!(plan.removed_ids(), vec![p, a]);
        assert!(plan.first_duplicate().is_none());

        let bad = ConsolidationPlan {
            prune: vec![a],
            merges: vec![MergePlan {
                base,
                absorbed: vec![a],
            }],
        };
        assert_eq!(bad.first_duplicate(), Some(a));
        assert!(ConsolidationPlan::default().is_empty());
    }
}
