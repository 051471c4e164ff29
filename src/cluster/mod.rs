//! Transitive grouping of alias candidates.

pub mod skip;

use std::collections::HashMap;
use std::hash::Hash;

/// Index of a cluster inside a [`ClusterManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClusterId(usize);

/// Groups members into clusters under union.
///
/// Every member maps to exactly one cluster. Merging two clusters moves the
/// members of the smaller into the larger; clusters never split.
#[derive(Debug)]
pub struct ClusterManager<K> {
    clusters: Vec<Option<Vec<K>>>,
    index: HashMap<K, ClusterId>,
}

impl<K> Default for ClusterManager<K> {
    fn default() -> Self {
        Self {
            clusters: Vec::new(),
            index: HashMap::new(),
        }
    }
}

impl<K: Copy + Eq + Hash> ClusterManager<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cluster holding `k`, if any.
    pub fn find(&self, k: &K) -> Option<ClusterId> {
        self.index.get(k).copied()
    }

    pub fn members(&self, id: ClusterId) -> &[K] {
        self.clusters
            .get(id.0)
            .and_then(Option::as_deref)
            .unwrap_or(&[])
    }

    /// Put `k` in a cluster of its own unless it is already clustered.
    pub fn insert_singleton(&mut self, k: K) -> ClusterId {
        if let Some(id) = self.find(&k) {
            return id;
        }
        self.new_cluster(vec![k])
    }

    /// Record that `a` and `b` belong together.
    pub fn merge(&mut self, a: K, b: K) -> ClusterId {
        match (self.find(&a), self.find(&b)) {
            (None, None) => self.new_cluster(vec![a, b]),
            (Some(ca), None) => {
                self.push(ca, b);
                ca
            }
            (None, Some(cb)) => {
                self.push(cb, a);
                cb
            }
            (Some(ca), Some(cb)) if ca == cb => ca,
            (Some(ca), Some(cb)) => {
                let (into, from) = if self.members(cb).len() > self.members(ca).len() {
                    (cb, ca)
                } else {
                    (ca, cb)
                };
                let moved = self
                    .clusters
                    .get_mut(from.0)
                    .and_then(Option::take)
                    .unwrap_or_default();
                for k in moved {
                    self.push(into, k);
                }
                into
            }
        }
    }

    /// Number of live clusters.
    pub fn len(&self) -> usize {
        self.clusters.iter().filter(|c| c.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Consume the manager, yielding live clusters in creation order.
    pub fn into_clusters(self) -> Vec<Vec<K>> {
        self.clusters.into_iter().flatten().collect()
    }

    fn new_cluster(&mut self, members: Vec<K>) -> ClusterId {
        let id = ClusterId(self.clusters.len());
        for k in &members {
            self.index.insert(*k, id);
        }
        self.clusters.push(Some(members));
        id
    }

    fn push(&mut self, id: ClusterId, k: K) {
        if let Some(Some(members)) = self.clusters.get_mut(id.0) {
            members.push(k);
            self.index.insert(k, id);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    fn sorted(mut clusters: Vec<Vec<u32>>) -> Vec<Vec<u32>> {
        for c in &mut clusters {
            c.sort_unstable();
        }
        clusters.sort();
        clusters
    }

    #[test]
    fn test_merge_new_pair() {
        let mut cm = ClusterManager::new();
        let id = cm.merge(1u32, 2);
        assert_eq!(cm.members(id), &[1, 2]);
        assert_eq!(cm.find(&1), Some(id));
        assert_eq!(cm.find(&2), Some(id));
        assert_eq!(cm.len(), 1);
    }

    #[test]
    fn test_merge_extends_existing() {
        let mut cm = ClusterManager::new();
        let id = cm.merge(1u32, 2);
        assert_eq!(cm.merge(3, 2), id);
        assert_eq!(cm.merge(1, 4), id);
        assert_eq!(cm.members(id), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_merge_two_clusters_smaller_into_larger() {
        let mut cm = ClusterManager::new();
        let small = cm.merge(1u32, 2);
        let large = cm.merge(10, 11);
        cm.merge(10, 12);

        let id = cm.merge(1, 12);
        assert_eq!(id, large);
        assert_eq!(cm.members(large), &[10, 11, 12, 1, 2]);
        assert!(cm.members(small).is_empty());
        assert_eq!(cm.find(&2), Some(large));
        assert_eq!(cm.len(), 1);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut cm = ClusterManager::new();
        cm.merge(1u32, 2);
        cm.merge(1, 2);
        cm.merge(2, 1);
        assert_eq!(sorted(cm.into_clusters()), vec![vec![1, 2]]);
    }

    #[test]
    fn test_merge_order_independent() {
        let mut first = ClusterManager::new();
        first.merge(1u32, 2);
        first.merge(2, 3);

        let mut second = ClusterManager::new();
        second.merge(2u32, 3);
        second.merge(1, 2);

        assert_eq!(sorted(first.into_clusters()), sorted(second.into_clusters()));
    }

    #[test]
    fn test_singletons_join_on_merge() {
        let mut cm = ClusterManager::new();
        let a = cm.insert_singleton(1u32);
        cm.insert_singleton(2);
        cm.insert_singleton(3);
        assert_eq!(cm.insert_singleton(1), a);

        cm.merge(1, 3);
        assert_eq!(sorted(cm.into_clusters()), vec![vec![1, 3], vec![2]]);
    }

    #[test]
    fn test_into_clusters_creation_order() {
        let mut cm = ClusterManager::new();
        cm.merge(5u32, 6);
        cm.merge(1, 2);
        assert_eq!(cm.into_clusters(), vec![vec![5, 6], vec![1, 2]]);
    }
}
