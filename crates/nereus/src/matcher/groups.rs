//! Transitive closure of pairwise matches.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;

use petgraph::unionfind::UnionFind;

use super::MatchResult;
use crate::types::NodeId;

/// Equivalence classes of matched nodes.
///
/// A~B and B~C put A, B and C in one group. Groups and their members are
/// ordered by first appearance in the match list. Members are node ids by
/// default; the merge engine groups node positions instead.
#[derive(Debug, Clone)]
pub struct MatchGroups<K = NodeId> {
    groups: Vec<Vec<K>>,
    index: HashMap<K, usize>,
}

impl<K> Default for MatchGroups<K> {
    fn default() -> Self {
        Self {
            groups: Vec::new(),
            index: HashMap::new(),
        }
    }
}

impl MatchGroups<NodeId> {
    /// Build groups from pairwise matches.
    #[must_use]
    pub fn from_matches(matches: &[MatchResult]) -> Self {
        Self::from_pairs(
            matches
                .iter()
                .map(|m| (m.source_node_id.clone(), m.target_node_id.clone())),
        )
    }
}

impl<K: Clone + Eq + Hash> MatchGroups<K> {
    /// Build groups from pairs of equivalent members.
    #[must_use]
    pub fn from_pairs(pairs: impl IntoIterator<Item = (K, K)>) -> Self {
        let mut keys: Vec<K> = Vec::new();
        let mut slots: HashMap<K, usize> = HashMap::new();
        let mut slot = |key: K, keys: &mut Vec<K>| -> usize {
            *slots.entry(key).or_insert_with_key(|key| {
                keys.push(key.clone());
                keys.len() - 1
            })
        };

        let pairs: Vec<(usize, usize)> = pairs
            .into_iter()
            .map(|(a, b)| (slot(a, &mut keys), slot(b, &mut keys)))
            .collect();

        let mut sets = UnionFind::<usize>::new(keys.len());
        for (a, b) in pairs {
            sets.union(a, b);
        }

        let mut root_to_group: HashMap<usize, usize> = HashMap::new();
        let mut groups: Vec<Vec<K>> = Vec::new();
        let mut index = HashMap::with_capacity(keys.len());
        for (i, key) in keys.into_iter().enumerate() {
            let root = sets.find_mut(i);
            let group = *root_to_group.entry(root).or_insert_with(|| {
                groups.push(Vec::new());
                groups.len() - 1
            });
            groups[group].push(key.clone());
            index.insert(key, group);
        }

        Self { groups, index }
    }

    /// All groups; every group has at least two members.
    #[must_use]
    pub fn groups(&self) -> &[Vec<K>] {
        &self.groups
    }

    /// Group containing `key`, if it was matched at all.
    #[must_use]
    pub fn group_of<Q>(&self, key: &Q) -> Option<usize>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.index.get(key).copied()
    }

    /// Number of groups.
    #[must_use]
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// `true` when there were no matches.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}
