//! Owns the record store, the BK-tree and the exact-match index, and keeps the
//! three consistent across build, update, search and duplicate detection.
//!
//! The store is authoritative. The tree and exact index are derived from it and
//! persisted only as a cache: a missing, stale or damaged index file is rebuilt
//! from the store's live records.

use super::bktree::BkTree;
use super::cluster::ClusterFinder;
use super::code::{Code, CodeError};
use super::exact::ExactIndex;
use super::persist;
use crate::config::{Config, IndexConfig};
use crate::database::{Record, RecordId, RecordStore, StoreError};
use crate::services::hash::{HashError, HashProvider, ProgressCallback, compute_batch};
use crate::services::scanner::absolute_path;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("Incompatible code: {0}")]
    IncompatibleCode(#[from] CodeError),

    #[error("Record store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexState {
    Empty,
    Building,
    Ready,
    Updating,
    Rebuilding,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedImage {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub indexed: usize,
    pub skipped: Vec<SkippedImage>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateReport {
    pub added: usize,
    /// Records whose stored code predates the current hash settings.
    pub rehashed: usize,
    pub removed: usize,
    pub unchanged: usize,
    pub skipped: Vec<SkippedImage>,
    pub rebuilt: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Match {
    pub id: RecordId,
    pub path: PathBuf,
    pub distance: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub query: PathBuf,
    pub query_id: RecordId,
    pub matches: Vec<Match>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchReport {
    pub threshold: u32,
    pub results: Vec<QueryResult>,
    pub skipped: Vec<SkippedImage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Member {
    pub id: RecordId,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct DuplicateCluster {
    pub id: usize,
    pub members: Vec<Member>,
    pub edges: usize,
}

impl DuplicateCluster {
    pub fn is_group(&self) -> bool {
        self.members.len() > 1
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DuplicateReport {
    pub threshold: u32,
    pub records: usize,
    pub clusters: Vec<DuplicateCluster>,
}

impl DuplicateReport {
    /// Clusters with more than one member.
    pub fn groups(&self) -> impl Iterator<Item = &DuplicateCluster> {
        self.clusters.iter().filter(|cluster| cluster.is_group())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub index: IndexConfig,
    pub records: usize,
    pub tombstoned_records: usize,
    pub indexed: usize,
    pub ledger: usize,
    pub nodes: usize,
    pub depth: usize,
    pub distinct_codes: usize,
}

struct Hashed {
    id: RecordId,
    path: PathBuf,
    code: Code,
}

pub struct IndexManager<S: RecordStore, H: HashProvider> {
    config: Config,
    store: S,
    hasher: H,
    tree: BkTree,
    exact: ExactIndex,
    state: IndexState,
    progress: Option<ProgressCallback>,
}

impl<S: RecordStore, H: HashProvider> IndexManager<S, H> {
    pub fn new(config: Config, store: S, hasher: H) -> Self {
        let index = config.index_config();
        Self {
            config,
            store,
            hasher,
            tree: BkTree::new(index.method, index.size),
            exact: ExactIndex::new(index.method, index.size),
            state: IndexState::Empty,
            progress: None,
        }
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> IndexState {
        self.state
    }

    pub fn tree(&self) -> &BkTree {
        &self.tree
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Index exactly `paths`, discarding any previous store contents and index file.
    pub fn build(&mut self, paths: &[PathBuf]) -> Result<BuildReport, IndexError> {
        self.state = IndexState::Building;
        let result = self.build_records(paths);
        self.settle(result)
    }

    /// Bring the index in line with `paths`: hash new images, tombstone vanished ones.
    pub fn update(&mut self, paths: &[PathBuf]) -> Result<UpdateReport, IndexError> {
        let result = self.update_records(paths);
        self.settle(result)
    }

    /// Find stored images within the distance threshold of each query image.
    pub fn search(&mut self, queries: &[PathBuf]) -> Result<SearchReport, IndexError> {
        let result = self.search_images(queries);
        self.settle(result)
    }

    /// Matches for an already hashed query. `query_id` is left out of the results.
    pub fn search_code(
        &mut self,
        code: &Code,
        query_id: Option<&RecordId>,
    ) -> Result<Vec<Match>, IndexError> {
        let result = self
            .load_or_rebuild()
            .and_then(|()| self.matches(code, query_id));
        self.settle(result)
    }

    pub fn find_duplicates(&mut self) -> Result<DuplicateReport, IndexError> {
        let result = self.cluster_records();
        self.settle(result)
    }

    /// Load the persisted index, rebuilding it from the store when it cannot be trusted.
    pub fn ensure_ready(&mut self) -> Result<(), IndexError> {
        let result = self.load_or_rebuild();
        self.settle(result)
    }

    pub fn stats(&mut self) -> Result<IndexStats, IndexError> {
        let result = self.load_or_rebuild().and_then(|()| {
            let all = self.store.list_all()?;
            let records = all.iter().filter(|record| record.is_live()).count();
            Ok(IndexStats {
                index: self.config.index_config(),
                records,
                tombstoned_records: all.len() - records,
                indexed: self.tree.len(),
                ledger: self.tree.tombstone_count(),
                nodes: self.tree.node_count(),
                depth: self.tree.depth(),
                distinct_codes: self.exact.len(),
            })
        });
        self.settle(result)
    }

    fn settle<T>(&mut self, result: Result<T, IndexError>) -> Result<T, IndexError> {
        match result {
            Ok(value) => {
                self.state = IndexState::Ready;
                Ok(value)
            }
            // A foreign query code leaves the index itself intact
            Err(e @ IndexError::IncompatibleCode(_)) => {
                self.state = IndexState::Ready;
                Err(e)
            }
            Err(e) => {
                log::error!("Index operation failed: {}", e);
                self.state = IndexState::Failed;
                Err(e)
            }
        }
    }

    fn build_records(&mut self, paths: &[PathBuf]) -> Result<BuildReport, IndexError> {
        let index_path = self.config.index_path();
        self.store.clear()?;
        if let Err(e) = persist::remove(&index_path) {
            log::warn!("{}", e);
        }

        let (hashed, skipped) = self.hash_all(paths);
        for item in &hashed {
            self.store.upsert(&item.id, &item.path, &item.code)?;
        }
        self.store.flush()?;

        let records = self.store.live_records()?;
        self.rebuild_from(records)?;
        self.save();

        log::info!(
            "Built index of {} images ({} skipped)",
            self.tree.len(),
            skipped.len()
        );
        Ok(BuildReport {
            indexed: hashed.len(),
            skipped,
        })
    }

    fn update_records(&mut self, paths: &[PathBuf]) -> Result<UpdateReport, IndexError> {
        if self.store.list_all()?.is_empty() && !self.config.index_path().exists() {
            log::info!("No existing index, building from scratch");
            self.state = IndexState::Building;
            let report = self.build_records(paths)?;
            return Ok(UpdateReport {
                added: report.indexed,
                rehashed: 0,
                removed: 0,
                unchanged: 0,
                skipped: report.skipped,
                rebuilt: true,
            });
        }

        self.load_or_rebuild()?;
        self.state = IndexState::Updating;

        let wanted: BTreeMap<RecordId, PathBuf> = paths
            .iter()
            .map(|path| {
                let path = absolute_path(path);
                (RecordId::from_path(&path), path)
            })
            .collect();
        let live: HashMap<RecordId, Record> = self
            .store
            .live_records()?
            .into_iter()
            .map(|record| (record.id.clone(), record))
            .collect();

        let mut to_hash = Vec::new();
        let mut stale = BTreeSet::new();
        let mut unchanged = 0;
        for (id, path) in &wanted {
            match live.get(id) {
                Some(record) if self.is_current(&record.code) => unchanged += 1,
                Some(_) => {
                    log::debug!("Rehashing {} with current settings", path.display());
                    stale.insert(id.clone());
                    to_hash.push(path.clone());
                }
                None => to_hash.push(path.clone()),
            }
        }

        let mut removed = 0;
        for id in live.keys().filter(|id| !wanted.contains_key(*id)) {
            self.store.mark_deleted(id)?;
            self.forget(id);
            removed += 1;
        }

        let (hashed, skipped) = self.hash_all(&to_hash);
        let mut added = 0;
        let mut rehashed = 0;
        for item in hashed {
            self.store.upsert(&item.id, &item.path, &item.code)?;
            self.forget(&item.id);
            self.tree.insert(item.code.clone(), item.id.clone())?;
            if stale.contains(&item.id) {
                rehashed += 1;
            } else {
                added += 1;
            }
            self.exact.insert(item.code, item.id)?;
        }

        let rebuilt = self.rebuild_if_degraded()?;
        self.store.flush()?;
        self.save();

        log::info!(
            "Updated index: {} added, {} rehashed, {} removed, {} unchanged, {} skipped",
            added,
            rehashed,
            removed,
            unchanged,
            skipped.len()
        );
        Ok(UpdateReport {
            added,
            rehashed,
            removed,
            unchanged,
            skipped,
            rebuilt,
        })
    }

    fn search_images(&mut self, queries: &[PathBuf]) -> Result<SearchReport, IndexError> {
        self.load_or_rebuild()?;

        let (hashed, skipped) = self.hash_all(queries);
        let mut results = Vec::with_capacity(hashed.len());
        for item in hashed {
            let matches = self.matches(&item.code, Some(&item.id))?;
            log::debug!(
                "{} matches for {}",
                matches.len(),
                item.path.display()
            );
            results.push(QueryResult {
                query: item.path,
                query_id: item.id,
                matches,
            });
        }

        Ok(SearchReport {
            threshold: self.config.distance_threshold,
            results,
            skipped,
        })
    }

    fn cluster_records(&mut self) -> Result<DuplicateReport, IndexError> {
        self.load_or_rebuild()?;

        // Store keys are digests, so path order is what makes clusters reproducible
        let mut records = self.store.live_records()?;
        records.sort_by(|a, b| a.path.cmp(&b.path));
        let entries: Vec<(RecordId, Code)> = records
            .iter()
            .map(|record| (record.id.clone(), record.code.clone()))
            .collect();
        let paths: HashMap<RecordId, PathBuf> = records
            .into_iter()
            .map(|record| (record.id, record.path))
            .collect();

        let threshold = self.config.distance_threshold;
        let clusters = ClusterFinder::new(&self.tree, threshold)
            .with_mode(self.config.cluster_mode)
            .find(&entries)?;

        let clusters: Vec<DuplicateCluster> = clusters
            .into_iter()
            .map(|cluster| DuplicateCluster {
                id: cluster.id,
                members: cluster
                    .members
                    .into_iter()
                    .map(|id| Member {
                        path: paths.get(&id).cloned().unwrap_or_default(),
                        id,
                    })
                    .collect(),
                edges: cluster.edges,
            })
            .collect();

        let groups = clusters.iter().filter(|c| c.is_group()).count();
        log::info!(
            "Found {} duplicate groups among {} images",
            groups,
            entries.len()
        );
        Ok(DuplicateReport {
            threshold,
            records: entries.len(),
            clusters,
        })
    }

    fn load_or_rebuild(&mut self) -> Result<(), IndexError> {
        if self.state == IndexState::Ready {
            return Ok(());
        }

        let records = self.store.live_records()?;
        let path = self.config.index_path();
        let loaded = match persist::load(&path, &self.config.index_config()) {
            Ok(tree) => tree,
            Err(e) => {
                log::warn!("{}; rebuilding from the record store", e);
                None
            }
        };

        match loaded {
            Some(tree) if self.agrees_with(&tree, &records) => {
                log::info!(
                    "Loaded index of {} images from {}",
                    tree.len(),
                    path.display()
                );
                self.exact = ExactIndex::from_tree(&tree);
                self.tree = tree;
            }
            Some(_) => {
                log::warn!(
                    "Index file {} disagrees with the record store, rebuilding",
                    path.display()
                );
                self.state = IndexState::Rebuilding;
                self.rebuild_from(records)?;
                self.purge_tombstoned()?;
                self.save();
            }
            None => {
                self.state = IndexState::Rebuilding;
                self.rebuild_from(records)?;
                self.purge_tombstoned()?;
                if !self.tree.is_empty() {
                    self.save();
                }
            }
        }
        Ok(())
    }

    /// Drop store records left tombstoned by earlier deletions. Only safe right after a
    /// full rebuild, when the tree holds no ids pending deletion.
    fn purge_tombstoned(&mut self) -> Result<(), IndexError> {
        let purged = self.store.purge_deleted()?;
        if purged > 0 {
            log::info!("Purged {} deleted records from the store", purged);
        }
        Ok(())
    }

    /// True if `tree` holds exactly the live records indexable under the current settings.
    fn agrees_with(&self, tree: &BkTree, records: &[Record]) -> bool {
        let mut indexable = 0;
        for record in records.iter().filter(|r| self.is_current(&r.code)) {
            if tree.code_of(&record.id) != Some(&record.code) {
                return false;
            }
            indexable += 1;
        }
        indexable == tree.len()
    }

    fn rebuild_from(&mut self, records: Vec<Record>) -> Result<(), IndexError> {
        let mut entries = Vec::with_capacity(records.len());
        for record in records {
            if self.is_current(&record.code) {
                entries.push((record.id, record.code));
            } else {
                log::warn!(
                    "Skipping {}: stored {} code of {} bits does not match current settings",
                    record.path.display(),
                    record.code.method(),
                    record.code.size()
                );
            }
        }

        self.tree.rebuild(entries)?;
        self.exact = ExactIndex::from_tree(&self.tree);
        log::debug!(
            "Rebuilt tree: {} images, {} nodes, depth {}",
            self.tree.len(),
            self.tree.node_count(),
            self.tree.depth()
        );
        Ok(())
    }

    /// Rebuild once tombstones make up more than `rebuild_fraction` of the tree's ids.
    fn rebuild_if_degraded(&mut self) -> Result<bool, IndexError> {
        let ledger = self.tree.tombstone_count();
        let total = self.tree.len() + ledger;
        if ledger == 0 || (ledger as f64) <= self.config.rebuild_fraction * total as f64 {
            return Ok(false);
        }

        self.state = IndexState::Rebuilding;
        let records = self.store.live_records()?;
        self.rebuild_from(records)?;
        let purged = self.store.purge_deleted()?;
        log::info!(
            "Rebuilt index after {} deletions, purged {} records",
            ledger,
            purged
        );
        Ok(true)
    }

    fn matches(&self, code: &Code, query_id: Option<&RecordId>) -> Result<Vec<Match>, IndexError> {
        let threshold = self.config.distance_threshold;
        let hits: Vec<(RecordId, u32)> = if threshold == 0 {
            self.exact.lookup(code)?.map(|id| (id.clone(), 0)).collect()
        } else {
            self.tree
                .search(code, threshold)?
                .map(|neighbor| (neighbor.id.clone(), neighbor.distance))
                .collect()
        };

        let mut matches = Vec::with_capacity(hits.len());
        for (id, distance) in hits {
            if query_id == Some(&id) {
                continue;
            }
            match self.store.get(&id)? {
                Some(record) if record.is_live() => matches.push(Match {
                    id,
                    path: record.path,
                    distance,
                }),
                _ => log::debug!("Indexed id {} has no live record", id.short()),
            }
        }
        matches.sort_by(|a, b| a.distance.cmp(&b.distance).then_with(|| a.path.cmp(&b.path)));
        Ok(matches)
    }

    /// Drop `id` from the tree and exact index, if present.
    fn forget(&mut self, id: &RecordId) {
        if let Some(code) = self.tree.code_of(id).cloned() {
            self.exact.remove(&code, id);
        }
        self.tree.delete(id);
    }

    fn is_current(&self, code: &Code) -> bool {
        code.method() == self.tree.method() && code.size() == self.tree.size()
    }

    fn hash_all(&self, paths: &[PathBuf]) -> (Vec<Hashed>, Vec<SkippedImage>) {
        let unique: BTreeSet<PathBuf> = paths.iter().map(|p| absolute_path(p)).collect();
        let unique: Vec<PathBuf> = unique.into_iter().collect();

        let results = compute_batch(
            &self.hasher,
            &unique,
            self.config.hash_method,
            self.config.hash_size,
            self.progress.as_ref(),
        );

        let mut hashed = Vec::with_capacity(results.len());
        let mut skipped = Vec::new();
        for (path, result) in results {
            let result = result.and_then(|code| self.checked(code));
            match result {
                Ok(code) => hashed.push(Hashed {
                    id: RecordId::from_path(&path),
                    path,
                    code,
                }),
                Err(e) => {
                    log::warn!("Skipping {}: {}", path.display(), e);
                    skipped.push(SkippedImage {
                        reason: e.to_string(),
                        path,
                    });
                }
            }
        }
        (hashed, skipped)
    }

    fn checked(&self, code: Code) -> Result<Code, HashError> {
        if self.is_current(&code) {
            Ok(code)
        } else {
            Err(HashError::Code(CodeError::Incompatible {
                left_method: self.tree.method(),
                left_size: self.tree.size(),
                right_method: code.method(),
                right_size: code.size(),
            }))
        }
    }

    fn save(&self) {
        let path = self.config.index_path();
        if let Err(e) = persist::save(&path, &self.config.index_config(), &self.tree) {
            log::warn!("Index not saved, it will be rebuilt on next use: {}", e);
        }
    }
}
