//! Self-join of the index: groups records whose codes lie within the search
//! radius of each other into near-duplicate clusters.
//!
//! Every record is searched against the tree that contains it. The resulting
//! neighbor relation is closed transitively with a union-find, so `a ~ b` and
//! `b ~ c` put `a`, `b` and `c` in one cluster even when `a` and `c` are
//! further apart than the radius. [`ClusterMode::Seeded`] instead lets each
//! unclaimed record pull in only its own unclaimed neighbors.

use super::bktree::BkTree;
use super::code::{Code, CodeError};
use crate::database::RecordId;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Disjoint-set forest with path compression and union by rank.
pub struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl UnionFind {
    pub fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            rank: vec![0; n],
        }
    }

    pub fn find(&mut self, x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }

        let mut current = x;
        while self.parent[current] != root {
            let next = self.parent[current];
            self.parent[current] = root;
            current = next;
        }
        root
    }

    /// Merge the sets holding `x` and `y`. Returns false if they were already joined.
    pub fn union(&mut self, x: usize, y: usize) -> bool {
        let rx = self.find(x);
        let ry = self.find(y);
        if rx == ry {
            return false;
        }

        match self.rank[rx].cmp(&self.rank[ry]) {
            std::cmp::Ordering::Less => self.parent[rx] = ry,
            std::cmp::Ordering::Greater => self.parent[ry] = rx,
            std::cmp::Ordering::Equal => {
                self.parent[ry] = rx;
                self.rank[rx] += 1;
            }
        }
        true
    }
}

/// How the neighbor relation is turned into clusters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ClusterMode {
    /// Connected components of the neighbor relation
    #[default]
    Transitive,
    /// Each unclaimed record seeds a cluster of its unclaimed neighbors
    Seeded,
}

/// A group of near-duplicate records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Cluster {
    pub id: usize,
    /// Members in store order.
    pub members: Vec<RecordId>,
    /// Neighbor pairs that formed the cluster.
    pub edges: usize,
}

impl Cluster {
    fn new(id: usize) -> Self {
        Self {
            id,
            members: Vec::new(),
            edges: 0,
        }
    }

    /// True for clusters holding actual duplicates rather than a lone record.
    pub fn is_group(&self) -> bool {
        self.members.len() > 1
    }
}

pub struct ClusterFinder<'a> {
    tree: &'a BkTree,
    radius: u32,
    mode: ClusterMode,
}

impl<'a> ClusterFinder<'a> {
    pub fn new(tree: &'a BkTree, radius: u32) -> Self {
        Self {
            tree,
            radius,
            mode: ClusterMode::Transitive,
        }
    }

    pub fn with_mode(mut self, mode: ClusterMode) -> Self {
        self.mode = mode;
        self
    }

    /// Cluster `records`, skipping any that are not live in the tree.
    ///
    /// Clusters come back ordered by their first member; singletons are included.
    pub fn find(&self, records: &[(RecordId, Code)]) -> Result<Vec<Cluster>, CodeError> {
        let live: Vec<&(RecordId, Code)> = records
            .iter()
            .filter(|(id, _)| self.tree.contains(id))
            .collect();
        let neighbors = self.neighbors(&live)?;

        let clusters = match self.mode {
            ClusterMode::Transitive => Self::components(&live, &neighbors),
            ClusterMode::Seeded => Self::seeded(&live, &neighbors),
        };

        log::debug!(
            "Clustered {} records into {} clusters at radius {} ({:?})",
            live.len(),
            clusters.len(),
            self.radius,
            self.mode
        );
        Ok(clusters)
    }

    /// Positions (into `live`) of every other record within the radius of each record.
    fn neighbors(&self, live: &[&(RecordId, Code)]) -> Result<Vec<Vec<usize>>, CodeError> {
        let positions: HashMap<&RecordId, usize> = live
            .iter()
            .enumerate()
            .map(|(i, (id, _))| (id, i))
            .collect();

        // Searches are read-only, so they fan out across threads
        live.par_iter()
            .map(|(id, code)| -> Result<Vec<usize>, CodeError> {
                let mut found: Vec<usize> = self
                    .tree
                    .search(code, self.radius)?
                    .filter(|neighbor| neighbor.id != id)
                    .filter_map(|neighbor| positions.get(neighbor.id).copied())
                    .collect();
                found.sort_unstable();
                Ok(found)
            })
            .collect()
    }

    fn components(live: &[&(RecordId, Code)], neighbors: &[Vec<usize>]) -> Vec<Cluster> {
        let mut sets = UnionFind::new(live.len());
        for (i, list) in neighbors.iter().enumerate() {
            for &j in list {
                sets.union(i, j);
            }
        }

        let mut slots: HashMap<usize, usize> = HashMap::new();
        let mut clusters: Vec<Cluster> = Vec::new();
        for (i, (id, _)) in live.iter().enumerate() {
            let root = sets.find(i);
            let slot = *slots.entry(root).or_insert_with(|| {
                clusters.push(Cluster::new(clusters.len()));
                clusters.len() - 1
            });
            clusters[slot].members.push(id.clone());
            clusters[slot].edges += neighbors[i].iter().filter(|&&j| j > i).count();
        }
        clusters
    }

    fn seeded(live: &[&(RecordId, Code)], neighbors: &[Vec<usize>]) -> Vec<Cluster> {
        let mut claimed = vec![false; live.len()];
        let mut clusters: Vec<Cluster> = Vec::new();
        for seed in 0..live.len() {
            if claimed[seed] {
                continue;
            }
            claimed[seed] = true;

            let mut cluster = Cluster::new(clusters.len());
            let mut members = vec![seed];
            for &j in &neighbors[seed] {
                if !claimed[j] {
                    claimed[j] = true;
                    members.push(j);
                    cluster.edges += 1;
                }
            }
            members.sort_unstable();
            cluster.members = members.into_iter().map(|i| live[i].0.clone()).collect();
            clusters.push(cluster);
        }
        clusters
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::code::HashMethod;

    fn code4(value: u64) -> Code {
        Code::from_u64(HashMethod::Dhash, 4, value).unwrap()
    }

    fn tree_of(entries: &[(RecordId, Code)]) -> BkTree {
        let mut tree = BkTree::new(HashMethod::Dhash, 4);
        for (id, code) in entries {
            tree.insert(code.clone(), id.clone()).unwrap();
        }
        tree
    }

    fn entries(items: &[(&str, u64)]) -> Vec<(RecordId, Code)> {
        items
            .iter()
            .map(|(name, value)| (RecordId::new(*name), code4(*value)))
            .collect()
    }

    fn member_names(clusters: &[Cluster]) -> Vec<Vec<String>> {
        clusters
            .iter()
            .map(|c| c.members.iter().map(|id| id.to_string()).collect())
            .collect()
    }

    #[test]
    fn test_union_find_chain() {
        let mut uf = UnionFind::new(5);
        assert!(uf.union(0, 1));
        assert!(uf.union(1, 2));
        assert!(!uf.union(0, 2));

        assert_eq!(uf.find(0), uf.find(2));
        assert_ne!(uf.find(0), uf.find(3));
        assert_ne!(uf.find(3), uf.find(4));
    }

    #[test]
    fn test_union_find_compresses_paths() {
        let mut uf = UnionFind::new(64);
        for i in 0..63 {
            uf.union(i, i + 1);
        }
        let root = uf.find(63);
        for i in 0..64 {
            uf.find(i);
            assert_eq!(uf.parent[i], root);
        }
    }

    #[test]
    fn test_scenario_transitive() {
        let records = entries(&[("A", 0b0000), ("B", 0b0001), ("C", 0b1111), ("D", 0b0011)]);
        let tree = tree_of(&records);

        // D sits one bit from B, so it joins the A-B component
        let clusters = ClusterFinder::new(&tree, 1).find(&records).unwrap();
        assert_eq!(
            member_names(&clusters),
            vec![vec!["A", "B", "D"], vec!["C"]]
        );
    }

    #[test]
    fn test_scenario_seeded() {
        let records = entries(&[("A", 0b0000), ("B", 0b0001), ("C", 0b1111), ("D", 0b0011)]);
        let tree = tree_of(&records);

        let clusters = ClusterFinder::new(&tree, 1)
            .with_mode(ClusterMode::Seeded)
            .find(&records)
            .unwrap();
        assert_eq!(
            member_names(&clusters),
            vec![vec!["A", "B"], vec!["C"], vec!["D"]]
        );
        assert_eq!(clusters[0].edges, 1);
        assert_eq!(clusters[2].edges, 0);
    }

    #[test]
    fn test_radius_zero_keeps_distinct_codes_apart() {
        let records = entries(&[("A", 0b0000), ("B", 0b0001), ("C", 0b1111), ("D", 0b0011)]);
        let tree = tree_of(&records);

        let clusters = ClusterFinder::new(&tree, 0).find(&records).unwrap();
        assert_eq!(clusters.len(), 4);
        assert!(clusters.iter().all(|c| !c.is_group()));
    }

    #[test]
    fn test_pairwise_clusters_without_chaining() {
        let records = entries(&[("A", 0b0000), ("B", 0b0001), ("C", 0b1111), ("D", 0b1100)]);
        let tree = tree_of(&records);

        let clusters = ClusterFinder::new(&tree, 1).find(&records).unwrap();
        assert_eq!(
            member_names(&clusters),
            vec![vec!["A", "B"], vec!["C"], vec!["D"]]
        );
        assert_eq!(clusters[0].edges, 1);
        assert_eq!(clusters[1].id, 1);
    }

    #[test]
    fn test_clusters_are_transitive() {
        // A~B and B~C at radius 1, while A and C are two bits apart
        let records = entries(&[("A", 0b0000), ("B", 0b0001), ("C", 0b0011), ("D", 0b1100)]);
        let tree = tree_of(&records);

        let clusters = ClusterFinder::new(&tree, 1).find(&records).unwrap();
        assert_eq!(
            member_names(&clusters),
            vec![vec!["A", "B", "C"], vec!["D"]]
        );
        assert_eq!(clusters[0].edges, 2);
    }

    #[test]
    fn test_tombstoned_records_never_clustered() {
        let records = entries(&[("A", 0b0000), ("B", 0b0001), ("C", 0b0011)]);
        let mut tree = tree_of(&records);
        tree.delete(&RecordId::new("B"));

        let clusters = ClusterFinder::new(&tree, 1).find(&records).unwrap();
        assert_eq!(member_names(&clusters), vec![vec!["A"], vec!["C"]]);
    }

    #[test]
    fn test_identical_codes_cluster_at_radius_zero() {
        let records = entries(&[("A", 0b0101), ("B", 0b0101), ("C", 0b0100)]);
        let tree = tree_of(&records);

        let clusters = ClusterFinder::new(&tree, 0).find(&records).unwrap();
        assert_eq!(member_names(&clusters), vec![vec!["A", "B"], vec!["C"]]);
    }
}
