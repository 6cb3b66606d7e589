use super::bktree::BkTree;
use super::code::{Code, CodeError, HashMethod};
use crate::database::RecordId;
use std::collections::{BTreeSet, HashMap};

/// Equality index from code to the live ids sharing it. Serves radius-zero searches
/// without walking the tree.
#[derive(Debug, Clone)]
pub struct ExactIndex {
    method: HashMethod,
    size: u32,
    entries: HashMap<Code, BTreeSet<RecordId>>,
}

impl ExactIndex {
    pub fn new(method: HashMethod, size: u32) -> Self {
        Self {
            method,
            size,
            entries: HashMap::new(),
        }
    }

    pub fn from_tree(tree: &BkTree) -> Self {
        let mut index = Self::new(tree.method(), tree.size());
        for (id, code) in tree.entries() {
            index
                .entries
                .entry(code.clone())
                .or_default()
                .insert(id.clone());
        }
        index
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

    pub fn insert(&mut self, code: Code, id: RecordId) -> Result<(), CodeError> {
        self.check(&code)?;
        self.entries.entry(code).or_default().insert(id);
        Ok(())
    }

    /// Drop `id` from the set under `code`. Returns false if it was not there.
    pub fn remove(&mut self, code: &Code, id: &RecordId) -> bool {
        let Some(ids) = self.entries.get_mut(code) else {
            return false;
        };
        let removed = ids.remove(id);
        if ids.is_empty() {
            self.entries.remove(code);
        }
        removed
    }

    pub fn lookup<'a>(
        &'a self,
        query: &Code,
    ) -> Result<impl Iterator<Item = &'a RecordId> + use<'a>, CodeError> {
        self.check(query)?;
        Ok(self.entries.get(query).into_iter().flatten())
    }

    /// Number of distinct codes.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
