//! BK-tree over perceptual hash codes under Hamming distance.
//!
//! Nodes live in an arena (`Vec<Node>`) with the root at index 0. Every child is
//! keyed by its distance to the parent, which is what makes triangle-inequality
//! pruning possible during search:
//!
//! ```text
//!               0000 {a}
//!            1/   2|    \4
//!      0001 {b}  0011 {d}  1111 {c}
//!         2|
//!      0010 {e}
//! ```
//!
//! Nodes are never moved or unlinked once created. Deletion is a tombstone:
//! the id leaves its node's id set and enters the deletion ledger, and the node
//! stays behind as a routing-only node until the next [`BkTree::rebuild`].

use super::code::{Code, CodeError, HashMethod};
use crate::database::RecordId;
use serde::{Deserialize, Serialize};
use std::collections::{btree_set, BTreeMap, BTreeSet, HashMap};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TreeError {
    #[error("node {node}: {source}")]
    Code {
        node: usize,
        #[source]
        source: CodeError,
    },

    #[error("node {parent} links to missing node {child}")]
    DanglingChild { parent: usize, child: usize },

    #[error("node {0} is linked more than once")]
    SharedNode(usize),

    #[error("node {0} is unreachable from the root")]
    Unreachable(usize),

    #[error("edge {parent} -> {child} is keyed {key} but the distance is {actual}")]
    BadEdge {
        parent: usize,
        child: usize,
        key: u32,
        actual: u32,
    },

    #[error("record {0} appears in more than one node")]
    DuplicateId(RecordId),

    #[error("record {0} is both indexed and tombstoned")]
    LiveTombstone(RecordId),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub code: Code,
    pub children: BTreeMap<u32, usize>,
    pub ids: BTreeSet<RecordId>,
}

impl Node {
    fn leaf(code: Code) -> Self {
        Self {
            code,
            children: BTreeMap::new(),
            ids: BTreeSet::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BkTree {
    method: HashMethod,
    size: u32,
    nodes: Vec<Node>,
    locations: HashMap<RecordId, usize>,
    tombstones: BTreeSet<RecordId>,
}

impl BkTree {
    pub fn new(method: HashMethod, size: u32) -> Self {
        Self {
            method,
            size,
            nodes: Vec::new(),
            locations: HashMap::new(),
            tombstones: BTreeSet::new(),
        }
    }

    /// Reassemble a tree from persisted parts, validating every structural invariant.
    pub fn restore(
        method: HashMethod,
        size: u32,
        nodes: Vec<Node>,
        tombstones: BTreeSet<RecordId>,
    ) -> Result<Self, TreeError> {
        check_structure(method, size, &nodes)?;

        let mut locations = HashMap::new();
        for (index, node) in nodes.iter().enumerate() {
            for id in &node.ids {
                if tombstones.contains(id) {
                    return Err(TreeError::LiveTombstone(id.clone()));
                }
                if locations.insert(id.clone(), index).is_some() {
                    return Err(TreeError::DuplicateId(id.clone()));
                }
            }
        }

        Ok(Self {
            method,
            size,
            nodes,
            locations,
            tombstones,
        })
    }

    pub fn method(&self) -> HashMethod {
        self.method
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    fn check(&self, code: &Code) -> Result<(), CodeError> {
        if code.method() == self.method && code.size() == self.size {
            Ok(())
        } else {
            Err(CodeError::Incompatible {
                left_method: self.method,
                left_size: self.size,
                right_method: code.method(),
                right_size: code.size(),
            })
        }
    }

    /// Index `id` under `code`. Returns false if `id` was already live with this code.
    pub fn insert(&mut self, code: Code, id: RecordId) -> Result<bool, CodeError> {
        self.check(&code)?;
        self.tombstones.remove(&id);

        if let Some(&index) = self.locations.get(&id) {
            if self.nodes[index].code.equals(&code)? {
                return Ok(false);
            }
            self.nodes[index].ids.remove(&id);
        }

        let index = self.place(code);
        self.nodes[index].ids.insert(id.clone());
        self.locations.insert(id, index);
        Ok(true)
    }

    /// Find the node holding exactly `code`, creating a leaf if there is none.
    fn place(&mut self, code: Code) -> usize {
        if self.nodes.is_empty() {
            self.nodes.push(Node::leaf(code));
            return 0;
        }

        let mut current = 0;
        loop {
            let distance = self.nodes[current].code.hamming(&code);
            if distance == 0 {
                return current;
            }
            match self.nodes[current].children.get(&distance) {
                Some(&child) => current = child,
                None => {
                    let index = self.nodes.len();
                    self.nodes.push(Node::leaf(code));
                    self.nodes[current].children.insert(distance, index);
                    return index;
                }
            }
        }
    }

    /// Tombstone `id`. Returns false if it is not live in the tree.
    pub fn delete(&mut self, id: &RecordId) -> bool {
        let Some(index) = self.locations.remove(id) else {
            return false;
        };
        self.nodes[index].ids.remove(id);
        self.tombstones.insert(id.clone());
        true
    }

    /// Lazily yield every live id within `radius` of `query`.
    pub fn search<'a>(&'a self, query: &'a Code, radius: u32) -> Result<Search<'a>, CodeError> {
        self.check(query)?;
        let stack = if self.nodes.is_empty() { Vec::new() } else { vec![0] };
        Ok(Search {
            tree: self,
            query,
            radius,
            stack,
            pending: None,
        })
    }

    /// Discard the tree and reinsert `entries` in the given order.
    ///
    /// On error the current tree is left untouched.
    pub fn rebuild<I>(&mut self, entries: I) -> Result<(), CodeError>
    where
        I: IntoIterator<Item = (RecordId, Code)>,
    {
        let mut fresh = BkTree::new(self.method, self.size);
        for (id, code) in entries {
            fresh.insert(code, id)?;
        }
        *self = fresh;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), TreeError> {
        check_structure(self.method, self.size, &self.nodes)
    }

    /// Live `(id, code)` pairs in node order.
    pub fn entries(&self) -> impl Iterator<Item = (&RecordId, &Code)> + '_ {
        self.nodes
            .iter()
            .flat_map(|node| node.ids.iter().map(move |id| (id, &node.code)))
    }

    pub fn code_of(&self, id: &RecordId) -> Option<&Code> {
        self.locations.get(id).map(|&index| &self.nodes[index].code)
    }

    pub fn contains(&self, id: &RecordId) -> bool {
        self.locations.contains_key(id)
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn tombstones(&self) -> &BTreeSet<RecordId> {
        &self.tombstones
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }

    /// Number of live ids.
    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Length of the longest root-to-leaf path, counted in nodes.
    pub fn depth(&self) -> usize {
        if self.nodes.is_empty() {
            return 0;
        }
        let mut deepest = 0;
        let mut stack = vec![(0usize, 1usize)];
        while let Some((index, level)) = stack.pop() {
            deepest = deepest.max(level);
            stack.extend(
                self.nodes[index]
                    .children
                    .values()
                    .map(|&child| (child, level + 1)),
            );
        }
        deepest
    }
}

fn check_structure(method: HashMethod, size: u32, nodes: &[Node]) -> Result<(), TreeError> {
    for (index, node) in nodes.iter().enumerate() {
        if node.code.method() != method || node.code.size() != size {
            return Err(TreeError::Code {
                node: index,
                source: CodeError::Incompatible {
                    left_method: method,
                    left_size: size,
                    right_method: node.code.method(),
                    right_size: node.code.size(),
                },
            });
        }
    }

    if nodes.is_empty() {
        return Ok(());
    }

    let mut visited = vec![false; nodes.len()];
    visited[0] = true;
    let mut stack = vec![0usize];
    while let Some(parent) = stack.pop() {
        for (&key, &child) in &nodes[parent].children {
            if child >= nodes.len() {
                return Err(TreeError::DanglingChild { parent, child });
            }
            if visited[child] {
                return Err(TreeError::SharedNode(child));
            }
            let actual = nodes[parent].code.hamming(&nodes[child].code);
            if actual != key || key == 0 {
                return Err(TreeError::BadEdge {
                    parent,
                    child,
                    key,
                    actual,
                });
            }
            visited[child] = true;
            stack.push(child);
        }
    }

    match visited.iter().position(|seen| !seen) {
        Some(index) => Err(TreeError::Unreachable(index)),
        None => Ok(()),
    }
}

/// A match produced by [`BkTree::search`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Neighbor<'a> {
    pub id: &'a RecordId,
    pub distance: u32,
}

/// Lazy radius search. Cloning it restarts from the same point.
#[derive(Debug, Clone)]
pub struct Search<'a> {
    tree: &'a BkTree,
    query: &'a Code,
    radius: u32,
    stack: Vec<usize>,
    pending: Option<(btree_set::Iter<'a, RecordId>, u32)>,
}

impl<'a> Iterator for Search<'a> {
    type Item = Neighbor<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some((ids, distance)) = self.pending.as_mut() {
                if let Some(id) = ids.next() {
                    return Some(Neighbor {
                        id,
                        distance: *distance,
                    });
                }
            }
            self.pending = None;

            let index = self.stack.pop()?;
            let tree: &'a BkTree = self.tree;
            let node = &tree.nodes[index];
            let distance = node.code.hamming(self.query);

            // Only children keyed within [d - r, d + r] can hold a match
            let low = distance.saturating_sub(self.radius);
            let high = distance.saturating_add(self.radius);
            self.stack
                .extend(node.children.range(low..=high).map(|(_, &child)| child));

            if distance <= self.radius && !node.ids.is_empty() {
                self.pending = Some((node.ids.iter(), distance));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn code4(value: u64) -> Code {
        Code::from_u64(HashMethod::Dhash, 4, value).unwrap()
    }

    fn id(name: &str) -> RecordId {
        RecordId::new(name)
    }

    fn ids(tree: &BkTree, query: &Code, radius: u32) -> HashSet<String> {
        tree.search(query, radius)
            .unwrap()
            .map(|n| n.id.to_string())
            .collect()
    }

    fn set(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn sample_tree() -> BkTree {
        let mut tree = BkTree::new(HashMethod::Dhash, 4);
        tree.insert(code4(0b0000), id("A")).unwrap();
        tree.insert(code4(0b0001), id("B")).unwrap();
        tree.insert(code4(0b1111), id("C")).unwrap();
        tree.insert(code4(0b0011), id("D")).unwrap();
        tree
    }

    /// Deterministic 16-bit codes from a linear congruential generator.
    fn pseudo_random_codes(count: usize, seed: u64) -> Vec<Code> {
        let mut state = seed;
        (0..count)
            .map(|_| {
                state = state
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);
                Code::from_u64(HashMethod::Dhash, 16, (state >> 33) & 0xffff).unwrap()
            })
            .collect()
    }

    #[test]
    fn test_search_scenario() {
        let tree = sample_tree();
        let query = code4(0b0000);

        assert_eq!(ids(&tree, &query, 1), set(&["A", "B"]));
        assert_eq!(ids(&tree, &query, 2), set(&["A", "B", "D"]));
        assert_eq!(ids(&tree, &query, 4), set(&["A", "B", "C", "D"]));
        assert_eq!(ids(&tree, &code4(0b0111), 0), set(&[]));
    }

    #[test]
    fn test_search_reports_distances() {
        let tree = sample_tree();
        let query = code4(0b0000);
        for neighbor in tree.search(&query, 4).unwrap() {
            let expected = match neighbor.id.as_str() {
                "A" => 0,
                "B" => 1,
                "D" => 2,
                "C" => 4,
                other => panic!("unexpected id {other}"),
            };
            assert_eq!(neighbor.distance, expected);
        }
    }

    #[test]
    fn test_children_keyed_by_distance() {
        let tree = sample_tree();
        let root = &tree.nodes()[0];
        assert_eq!(
            root.children.keys().copied().collect::<Vec<_>>(),
            vec![1, 2, 4]
        );
        assert_eq!(tree.node_count(), 4);
        assert_eq!(tree.depth(), 2);

        let mut deeper = sample_tree();
        deeper.insert(code4(0b0010), id("E")).unwrap();
        assert_eq!(deeper.depth(), 3);
        deeper.validate().unwrap();
        tree.validate().unwrap();
    }

    #[test]
    fn test_search_matches_brute_force() {
        let codes = pseudo_random_codes(400, 7);
        let mut tree = BkTree::new(HashMethod::Dhash, 16);
        for (i, code) in codes.iter().enumerate() {
            tree.insert(code.clone(), id(&i.to_string())).unwrap();
        }
        tree.validate().unwrap();

        for (q, query) in pseudo_random_codes(25, 99).iter().enumerate() {
            let radius = (q % 6) as u32;
            let expected: HashSet<String> = codes
                .iter()
                .enumerate()
                .filter(|(_, code)| code.distance(query).unwrap() <= radius)
                .map(|(i, _)| i.to_string())
                .collect();
            assert_eq!(ids(&tree, query, radius), expected);
        }
    }

    #[test]
    fn test_identical_codes_coalesce() {
        let mut tree = BkTree::new(HashMethod::Dhash, 4);
        tree.insert(code4(0b0101), id("x")).unwrap();
        tree.insert(code4(0b0101), id("y")).unwrap();

        assert_eq!(tree.node_count(), 1);
        assert_eq!(tree.len(), 2);
        assert_eq!(ids(&tree, &code4(0b0101), 0), set(&["x", "y"]));
    }

    #[test]
    fn test_insert_is_idempotent() {
        let mut once = sample_tree();
        let mut twice = sample_tree();
        assert!(!twice.insert(code4(0b0001), id("B")).unwrap());
        once.insert(code4(0b0111), id("E")).unwrap();
        twice.insert(code4(0b0111), id("E")).unwrap();
        twice.insert(code4(0b0111), id("E")).unwrap();

        for value in 0..16 {
            for radius in 0..=4 {
                let query = code4(value);
                assert_eq!(ids(&once, &query, radius), ids(&twice, &query, radius));
            }
        }
        assert_eq!(once.node_count(), twice.node_count());
    }

    #[test]
    fn test_reinsert_with_new_code_moves_id() {
        let mut tree = sample_tree();
        tree.insert(code4(0b1110), id("B")).unwrap();

        assert_eq!(ids(&tree, &code4(0b0001), 0), set(&[]));
        assert_eq!(ids(&tree, &code4(0b1110), 0), set(&["B"]));
        assert_eq!(tree.len(), 4);
    }

    #[test]
    fn test_tombstoned_ids_never_returned() {
        let mut tree = sample_tree();
        assert!(tree.delete(&id("A")));
        assert!(!tree.delete(&id("A")));
        assert!(!tree.delete(&id("missing")));

        // The root keeps routing even though it no longer matches
        assert_eq!(ids(&tree, &code4(0b0000), 1), set(&["B"]));
        assert_eq!(ids(&tree, &code4(0b0000), 4), set(&["B", "C", "D"]));
        assert_eq!(tree.node_count(), 4);
        assert_eq!(tree.tombstone_count(), 1);
        assert!(!tree.contains(&id("A")));
    }

    #[test]
    fn test_insert_revives_tombstoned_id() {
        let mut tree = sample_tree();
        tree.delete(&id("C"));
        assert!(tree.insert(code4(0b1111), id("C")).unwrap());

        assert_eq!(tree.tombstone_count(), 0);
        assert_eq!(ids(&tree, &code4(0b1111), 0), set(&["C"]));
    }

    #[test]
    fn test_rebuild_preserves_search_results() {
        let codes = pseudo_random_codes(200, 3);
        let mut tree = BkTree::new(HashMethod::Dhash, 16);
        for (i, code) in codes.iter().enumerate() {
            tree.insert(code.clone(), id(&i.to_string())).unwrap();
        }
        for i in (0..200).step_by(3) {
            tree.delete(&id(&i.to_string()));
        }

        let queries = pseudo_random_codes(10, 11);
        let before: Vec<HashSet<String>> = queries.iter().map(|q| ids(&tree, q, 4)).collect();

        let survivors: Vec<(RecordId, Code)> = codes
            .iter()
            .enumerate()
            .filter(|(i, _)| i % 3 != 0)
            .map(|(i, code)| (id(&i.to_string()), code.clone()))
            .collect();
        tree.rebuild(survivors).unwrap();

        let after: Vec<HashSet<String>> = queries.iter().map(|q| ids(&tree, q, 4)).collect();
        assert_eq!(before, after);
        assert_eq!(tree.tombstone_count(), 0);
    }

    #[test]
    fn test_incompatible_codes_rejected() {
        let mut tree = sample_tree();
        let other = Code::from_u64(HashMethod::Ahash, 4, 0).unwrap();
        let wider = Code::from_u64(HashMethod::Dhash, 8, 0).unwrap();

        assert!(matches!(
            tree.insert(other.clone(), id("Z")),
            Err(CodeError::Incompatible { .. })
        ));
        assert!(tree.search(&wider, 1).is_err());
        assert!(tree.rebuild(vec![(id("Z"), other)]).is_err());
        assert_eq!(tree.len(), 4);
    }

    #[test]
    fn test_empty_tree_search() {
        let tree = BkTree::new(HashMethod::Dhash, 4);
        assert_eq!(tree.search(&code4(0), 4).unwrap().count(), 0);
        assert_eq!(tree.depth(), 0);
    }

    #[test]
    fn test_search_is_restartable() {
        let tree = sample_tree();
        let query = code4(0b0000);
        let search = tree.search(&query, 2).unwrap();
        let first: Vec<_> = search.clone().collect();
        let second: Vec<_> = search.collect();
        assert_eq!(first, second);
        assert_eq!(first.len(), 3);
    }

    #[test]
    fn test_restore_round_trip() {
        let mut tree = sample_tree();
        tree.delete(&id("D"));
        let restored = BkTree::restore(
            HashMethod::Dhash,
            4,
            tree.nodes().to_vec(),
            tree.tombstones().clone(),
        )
        .unwrap();

        assert_eq!(restored.len(), 3);
        assert_eq!(restored.tombstone_count(), 1);
        assert_eq!(ids(&restored, &code4(0), 4), set(&["A", "B", "C"]));
    }

    #[test]
    fn test_restore_rejects_broken_structure() {
        let tree = sample_tree();

        let mut bad_key = tree.nodes().to_vec();
        let child = bad_key[0].children.remove(&4).unwrap();
        bad_key[0].children.insert(3, child);
        assert!(matches!(
            BkTree::restore(HashMethod::Dhash, 4, bad_key, BTreeSet::new()),
            Err(TreeError::BadEdge { key: 3, actual: 4, .. })
        ));

        let mut dangling = tree.nodes().to_vec();
        dangling[0].children.insert(3, 42);
        assert!(matches!(
            BkTree::restore(HashMethod::Dhash, 4, dangling, BTreeSet::new()),
            Err(TreeError::DanglingChild { child: 42, .. })
        ));

        let mut orphan = tree.nodes().to_vec();
        orphan[0].children.remove(&4);
        assert_eq!(
            BkTree::restore(HashMethod::Dhash, 4, orphan, BTreeSet::new()).unwrap_err(),
            TreeError::Unreachable(2)
        );

        let mut duplicate = tree.nodes().to_vec();
        duplicate[2].ids.insert(id("A"));
        assert_eq!(
            BkTree::restore(HashMethod::Dhash, 4, duplicate, BTreeSet::new()).unwrap_err(),
            TreeError::DuplicateId(id("A"))
        );

        assert!(matches!(
            BkTree::restore(HashMethod::Ahash, 4, tree.nodes().to_vec(), BTreeSet::new()),
            Err(TreeError::Code { node: 0, .. })
        ));
    }
}
