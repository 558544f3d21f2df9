//! Incremental explanation cache.
//!
//! Memory LRU in front of an optional disk tier, keyed by (proof, config
//! hash). A lookup whose source bytes match the stored fingerprint is a pure
//! hit; otherwise the edit is classified and as much of the cached tree as
//! the classification allows is reused through [`ReuseProvider`]. Concurrent
//! lookups for the same key and source coalesce into a single build that
//! runs to completion even if every caller abandons it.

mod diff;
mod disk;
mod entry;
mod reuse;

pub use diff::{classify_change, BlockedSubtreePlan, ChangeClass};
pub use disk::DiskCacheConfig;
pub use entry::{
    dependency_hash, CacheEntry, CacheKey, CacheLayer, CacheReport, CacheStatus, Diagnostic,
    DiagnosticCode, EntryDefect, FlightKey,
};

use std::collections::{BTreeMap, BTreeSet};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::clock::{BuildIdFactory, KernelClock, SystemClock, UuidBuildIds};
use crate::error::{CacheError, ContractError};
use crate::graph::DependencyGraph;
use crate::policy::ExplanationConfig;
use crate::provider::SummarizationProvider;
use crate::types::{ExplanationTree, LeafId, LeafSet, TreeNode};
use crate::TreeBuilder;

use disk::{DiskCache, DiskFailure};
use reuse::ReuseProvider;

/// Cache sizing and tiering.
#[derive(Debug, Clone, PartialEq)]
pub struct ExplanationCacheConfig {
    /// Trees kept in the memory LRU.
    pub memory_capacity: NonZeroUsize,
    /// Disk tier; `None` keeps the cache purely in memory.
    pub disk: Option<DiskCacheConfig>,
}

impl Default for ExplanationCacheConfig {
    fn default() -> Self {
        Self {
            // 64 trees at typical proof sizes stays well under 100 MB.
            memory_capacity: NonZeroUsize::new(64).unwrap_or(NonZeroUsize::MIN),
            disk: None,
        }
    }
}

/// What a lookup produced: the tree plus the report describing how.
#[derive(Debug, Clone)]
pub struct CacheOutcome {
    /// The served tree.
    pub tree: Arc<ExplanationTree>,
    /// Hit/miss status, tier, and diagnostics.
    pub report: CacheReport,
}

type FlightResult = Result<CacheOutcome, CacheError>;

/// The incremental cache. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct ExplanationCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    provider: Arc<dyn SummarizationProvider>,
    config: ExplanationConfig,
    config_hash: String,
    memory: Mutex<LruCache<CacheKey, Arc<CacheEntry>>>,
    disk: Option<DiskCache>,
    disk_degraded: AtomicBool,
    flights: Mutex<BTreeMap<FlightKey, broadcast::Sender<FlightResult>>>,
    clock: Arc<dyn KernelClock>,
    build_ids: Arc<dyn BuildIdFactory>,
}

impl ExplanationCache {
    /// Create a cache with the production clock and uuid build ids.
    pub fn new(
        provider: Arc<dyn SummarizationProvider>,
        config: ExplanationConfig,
        cache_config: ExplanationCacheConfig,
    ) -> Result<Self, ContractError> {
        Self::with_sources(
            provider,
            config,
            cache_config,
            Arc::new(SystemClock),
            Arc::new(UuidBuildIds),
        )
    }

    /// Create a cache with injected time and id sources.
    pub fn with_sources(
        provider: Arc<dyn SummarizationProvider>,
        config: ExplanationConfig,
        cache_config: ExplanationCacheConfig,
        clock: Arc<dyn KernelClock>,
        build_ids: Arc<dyn BuildIdFactory>,
    ) -> Result<Self, ContractError> {
        config.validate()?;
        let config_hash = config.config_hash();
        Ok(Self {
            inner: Arc::new(CacheInner {
                provider,
                config,
                config_hash,
                memory: Mutex::new(LruCache::new(cache_config.memory_capacity)),
                disk: cache_config.disk.map(DiskCache::new),
                disk_degraded: AtomicBool::new(false),
                flights: Mutex::new(BTreeMap::new()),
                clock,
                build_ids,
            }),
        })
    }

    /// The storage tier lookups currently resolve against.
    pub fn layer(&self) -> CacheLayer {
        self.inner.layer()
    }

    /// Drop all in-memory state: cached trees, in-flight coalescing, and the
    /// disk-degraded latch. Disk records are untouched.
    pub fn reset(&self) {
        self.inner.memory.lock().clear();
        self.inner.flights.lock().clear();
        self.inner.disk_degraded.store(false, Ordering::SeqCst);
        info!("explanation cache reset");
    }

    /// Serve a tree for the given proof and leaves, building as needed.
    ///
    /// Callers racing on the same (proof, config, source bytes) share one
    /// build. The shared build is detached: dropping this future does not
    /// cancel it, and its result still lands in the cache.
    pub async fn get(&self, proof_id: &str, leaves: Vec<crate::Leaf>) -> FlightResult {
        let leaf_set = LeafSet::new(leaves)?;
        let key = CacheKey {
            proof_id: proof_id.to_string(),
            config_hash: self.inner.config_hash.clone(),
        };
        let flight_key = FlightKey {
            key,
            fingerprint: leaf_set.fingerprint().clone(),
        };

        let mut rx = {
            let mut flights = self.inner.flights.lock();
            if let Some(tx) = flights.get(&flight_key) {
                tx.subscribe()
            } else {
                let (tx, rx) = broadcast::channel(1);
                flights.insert(flight_key.clone(), tx.clone());
                let inner = Arc::clone(&self.inner);
                let fk = flight_key;
                tokio::spawn(async move {
                    let outcome = inner.serve(&fk.key, leaf_set).await;
                    // Removal precedes the send so a caller that misses the
                    // broadcast finds the finished entry in memory instead of
                    // a stale flight.
                    inner.flights.lock().remove(&fk);
                    let _ = tx.send(outcome);
                });
                rx
            }
        };

        rx.recv().await.map_err(|_| CacheError::FlightInterrupted)?
    }
}

impl CacheInner {
    fn layer(&self) -> CacheLayer {
        if self.disk.is_some() && !self.disk_degraded.load(Ordering::SeqCst) {
            CacheLayer::Persistent
        } else {
            CacheLayer::Ephemeral
        }
    }

    fn active_disk(&self) -> Option<&DiskCache> {
        if self.disk_degraded.load(Ordering::SeqCst) {
            None
        } else {
            self.disk.as_ref()
        }
    }

    async fn serve(&self, key: &CacheKey, leaf_set: LeafSet) -> FlightResult {
        let mut diagnostics: Vec<Diagnostic> = Vec::new();
        let prior = self.load_prior(key, &mut diagnostics);

        let Some(prior) = prior else {
            diagnostics.push(Diagnostic::new(
                DiagnosticCode::Miss,
                format!("no cached tree for proof {}", key.proof_id),
            ));
            return self.full_build(key, leaf_set, diagnostics, None, false).await;
        };

        if &prior.fingerprint == leaf_set.fingerprint() {
            diagnostics.push(Diagnostic::new(
                DiagnosticCode::Hit,
                "source fingerprint unchanged",
            ));
            let reused = prior.tree.parent_count() as u64;
            return Ok(self.outcome(&prior, CacheStatus::Hit, diagnostics, reused, 0, None, false));
        }

        match classify_change(&prior.leaves, leaf_set.leaves()) {
            ChangeClass::SemanticNoop => self.semantic_hit(key, &prior, leaf_set, diagnostics),
            ChangeClass::Localized { changed } => {
                self.localized_rebuild(key, &prior, leaf_set, changed, diagnostics)
                    .await
            }
            ChangeClass::Topology { changed, added, .. } => {
                let mut seeds = changed;
                seeds.extend(added);
                let graph = DependencyGraph::build(leaf_set.leaves());
                let plan = BlockedSubtreePlan::compute(&graph, &seeds);
                diagnostics.push(
                    Diagnostic::new(
                        DiagnosticCode::IncrementalTopologyRebuild,
                        "leaf ids or dependency edges changed",
                    )
                    .with("seed_count", plan.changed.len())
                    .with("blocked", plan.blocked.len()),
                );
                self.reuse_build(key, &prior, leaf_set, plan, diagnostics)
                    .await
            }
        }
    }

    /// Memory first, then a validated disk read promoted into memory.
    fn load_prior(
        &self,
        key: &CacheKey,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Option<Arc<CacheEntry>> {
        if let Some(entry) = self.memory.lock().get(key) {
            return Some(Arc::clone(entry));
        }
        let disk = self.active_disk()?;
        match disk.read(key) {
            Ok(None) => None,
            Ok(Some(entry)) => match entry.validate(key) {
                Ok(()) => {
                    let entry = Arc::new(entry);
                    self.memory.lock().put(key.clone(), Arc::clone(&entry));
                    Some(entry)
                }
                Err(defect) => {
                    warn!(proof = %key.proof_id, ?defect, "discarding invalid cache record");
                    diagnostics.push(
                        Diagnostic::new(defect.code(), "stored entry failed validation")
                            .with("defect", format!("{defect:?}")),
                    );
                    if !matches!(defect, EntryDefect::SchemaVersion(_)) {
                        disk.remove(key);
                    }
                    None
                }
            },
            Err(DiskFailure::Corrupt(msg)) => {
                warn!(proof = %key.proof_id, %msg, "removing corrupt cache record");
                diagnostics.push(Diagnostic::new(DiagnosticCode::EntryInvalid, msg));
                disk.remove(key);
                None
            }
            Err(DiskFailure::Io(msg)) => {
                diagnostics.push(Diagnostic::new(DiagnosticCode::ReadFailed, msg));
                None
            }
        }
    }

    /// Fingerprint changed, content did not: re-key the stored entry under
    /// the new fingerprint. Tree, leaves, and snapshot hash stay
    /// byte-for-byte identical; no provider call, no new build id.
    fn semantic_hit(
        &self,
        key: &CacheKey,
        prior: &Arc<CacheEntry>,
        leaf_set: LeafSet,
        mut diagnostics: Vec<Diagnostic>,
    ) -> FlightResult {
        diagnostics.push(Diagnostic::new(
            DiagnosticCode::SemanticHit,
            "source text changed but every leaf is semantically identical",
        ));

        let entry = prior.with_fingerprint(leaf_set.fingerprint().clone());
        let entry = self.store(key, entry, &mut diagnostics);
        let reused = entry.tree.parent_count() as u64;
        Ok(self.outcome(&entry, CacheStatus::Hit, diagnostics, reused, 0, None, false))
    }

    async fn localized_rebuild(
        &self,
        key: &CacheKey,
        prior: &Arc<CacheEntry>,
        leaf_set: LeafSet,
        changed: BTreeSet<LeafId>,
        mut diagnostics: Vec<Diagnostic>,
    ) -> FlightResult {
        let graph = DependencyGraph::build(leaf_set.leaves());
        let plan = BlockedSubtreePlan::compute(&graph, &changed);

        let subtrees = diff::invalidated_subtrees(&prior.tree, &plan.blocked);
        let invalidated_leaves: BTreeSet<&LeafId> = subtrees
            .iter()
            .filter_map(|id| match prior.tree.node(id) {
                Some(TreeNode::Parent(p)) => Some(p.evidence_refs.iter()),
                _ => None,
            })
            .flatten()
            .collect();

        if plan.covers_everything(leaf_set.len()) || invalidated_leaves.len() >= leaf_set.len() {
            diagnostics.push(
                Diagnostic::new(
                    DiagnosticCode::BlockedSubtreeFullRebuild,
                    "blocked set spans the whole tree; rebuilding from scratch",
                )
                .with("changed", plan.changed.len())
                .with("blocked", plan.blocked.len()),
            );
            return self.full_build(key, leaf_set, diagnostics, Some(plan), true).await;
        }

        diagnostics.push(
            Diagnostic::new(
                DiagnosticCode::IncrementalSubtreeRebuild,
                "content edits confined to a dependency-closed subtree",
            )
            .with("changed", plan.changed.len())
            .with("blocked", plan.blocked.len())
            .with("rebuild_batches", plan.batches.len())
            .with("invalidated_subtrees", subtrees.len()),
        );
        self.reuse_build(key, prior, leaf_set, plan, diagnostics)
            .await
    }

    /// Rebuild with the prior tree available for parent reuse.
    async fn reuse_build(
        &self,
        key: &CacheKey,
        prior: &Arc<CacheEntry>,
        leaf_set: LeafSet,
        plan: BlockedSubtreePlan,
        mut diagnostics: Vec<Diagnostic>,
    ) -> FlightResult {
        let reuse = Arc::new(ReuseProvider::new(
            Arc::clone(&self.provider),
            &prior.tree,
            plan.blocked.clone(),
        ));
        let builder = TreeBuilder::new(
            Arc::clone(&reuse) as Arc<dyn SummarizationProvider>,
            self.config.clone(),
        );
        let tree = builder.build(&leaf_set).await.map_err(CacheError::Build)?;

        let (reused, regenerated) = (reuse.reused(), reuse.regenerated());
        debug!(proof = %key.proof_id, reused, regenerated, "incremental rebuild complete");

        let entry = CacheEntry::new(
            key,
            leaf_set.leaves().to_vec(),
            tree,
            self.clock.now_unix(),
            self.build_ids.next_build_id(),
        );
        let entry = self.store(key, entry, &mut diagnostics);
        let status = if regenerated == 0 {
            CacheStatus::Hit
        } else {
            CacheStatus::Miss
        };
        Ok(self.outcome(&entry, status, diagnostics, reused, regenerated, Some(plan), false))
    }

    async fn full_build(
        &self,
        key: &CacheKey,
        leaf_set: LeafSet,
        mut diagnostics: Vec<Diagnostic>,
        plan: Option<BlockedSubtreePlan>,
        full_rebuild_fallback: bool,
    ) -> FlightResult {
        let builder = TreeBuilder::new(Arc::clone(&self.provider), self.config.clone());
        let tree = builder.build(&leaf_set).await.map_err(CacheError::Build)?;
        let regenerated = tree.parent_count() as u64;

        let entry = CacheEntry::new(
            key,
            leaf_set.leaves().to_vec(),
            tree,
            self.clock.now_unix(),
            self.build_ids.next_build_id(),
        );
        let entry = self.store(key, entry, &mut diagnostics);
        Ok(self.outcome(
            &entry,
            CacheStatus::Miss,
            diagnostics,
            0,
            regenerated,
            plan,
            full_rebuild_fallback,
        ))
    }

    /// Insert into memory, then best-effort persist. A disk write failure
    /// latches the cache into ephemeral mode rather than failing the lookup.
    fn store(
        &self,
        key: &CacheKey,
        entry: CacheEntry,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Arc<CacheEntry> {
        let entry = Arc::new(entry);
        self.memory.lock().put(key.clone(), Arc::clone(&entry));

        if let Some(disk) = self.active_disk() {
            if let Err(failure) = disk.write(key, &entry) {
                warn!(proof = %key.proof_id, ?failure, "cache write failed; degrading to ephemeral");
                diagnostics.push(
                    Diagnostic::new(
                        DiagnosticCode::WriteFailed,
                        "disk write failed; cache is now ephemeral",
                    )
                    .with("failure", format!("{failure:?}")),
                );
                self.disk_degraded.store(true, Ordering::SeqCst);
            }
        }
        entry
    }

    #[allow(clippy::too_many_arguments)]
    fn outcome(
        &self,
        entry: &Arc<CacheEntry>,
        status: CacheStatus,
        diagnostics: Vec<Diagnostic>,
        reused_parents: u64,
        regenerated_parents: u64,
        blocked_subtree_plan: Option<BlockedSubtreePlan>,
        full_rebuild_fallback: bool,
    ) -> CacheOutcome {
        CacheOutcome {
            tree: Arc::new(entry.tree.clone()),
            report: CacheReport {
                status,
                layer: self.layer(),
                cache_key: CacheKey {
                    proof_id: entry.proof_id.clone(),
                    config_hash: entry.config_hash.clone(),
                },
                source_fingerprint: entry.fingerprint.clone(),
                snapshot_hash: entry.snapshot_hash.clone(),
                entry_hash: entry.entry_hash.clone(),
                build_id: entry.build_id.clone(),
                created_at_unix: entry.created_at_unix,
                diagnostics,
                reused_parents,
                regenerated_parents,
                blocked_subtree_plan,
                full_rebuild_fallback,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{FixedClock, SequentialBuildIds};
    use crate::provider::StubProvider;
    use crate::types::{Leaf, SourceSpan};

    fn leaf(id: &str, statement: &str, prereqs: &[&str]) -> Leaf {
        Leaf::new(
            id,
            format!("Decl.{id}"),
            statement,
            Some(1),
            prereqs.iter().map(|p| LeafId::new(*p)).collect(),
            SourceSpan::new("Main.lean", 1, 1),
        )
    }

    fn cache() -> ExplanationCache {
        ExplanationCache::with_sources(
            Arc::new(StubProvider::new()),
            ExplanationConfig::default(),
            ExplanationCacheConfig::default(),
            Arc::new(FixedClock::at(1_000)),
            Arc::new(SequentialBuildIds::default()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let cache = cache();
        let leaves = vec![leaf("l1", "a", &[]), leaf("l2", "b", &[])];

        let first = cache.get("nat.add", leaves.clone()).await.unwrap();
        assert_eq!(first.report.status, CacheStatus::Miss);
        assert!(first.report.has(DiagnosticCode::Miss));
        assert_eq!(first.report.build_id, "build-1");

        let second = cache.get("nat.add", leaves).await.unwrap();
        assert_eq!(second.report.status, CacheStatus::Hit);
        assert!(second.report.has(DiagnosticCode::Hit));
        assert_eq!(second.report.build_id, "build-1");
        assert_eq!(second.report.snapshot_hash, first.report.snapshot_hash);
        assert_eq!(second.tree, first.tree);
    }

    #[tokio::test]
    async fn test_whitespace_edit_is_semantic_hit() {
        let cache = cache();
        let first = cache
            .get("p", vec![leaf("l1", "n + 0 = n", &[]), leaf("l2", "b", &[])])
            .await
            .unwrap();

        let out = cache
            .get("p", vec![leaf("l1", "n  +  0 = n", &[]), leaf("l2", "b", &[])])
            .await
            .unwrap();
        assert_eq!(out.report.status, CacheStatus::Hit);
        assert!(out.report.has(DiagnosticCode::SemanticHit));
        assert_eq!(out.report.regenerated_parents, 0);
        // Re-keyed under the new fingerprint, tree untouched.
        assert_eq!(out.report.snapshot_hash, first.report.snapshot_hash);
        assert_eq!(out.report.build_id, first.report.build_id);
        assert_ne!(out.report.source_fingerprint, first.report.source_fingerprint);
    }

    #[tokio::test]
    async fn test_content_edit_is_subtree_rebuild() {
        let cache = cache();
        let base = vec![
            leaf("l1", "a", &[]),
            leaf("l2", "b", &[]),
            leaf("l3", "c", &[]),
            leaf("l4", "d", &[]),
            leaf("l5", "e", &[]),
            leaf("l6", "f", &[]),
        ];
        cache.get("p", base.clone()).await.unwrap();

        let mut edited = base;
        edited[5] = leaf("l6", "f (sharpened)", &[]);
        let out = cache.get("p", edited).await.unwrap();

        assert!(out.report.has(DiagnosticCode::IncrementalSubtreeRebuild));
        assert!(out.report.reused_parents >= 1);
        assert!(out.report.regenerated_parents >= 1);
        assert!(!out.report.full_rebuild_fallback);
        let plan = out.report.blocked_subtree_plan.as_ref().unwrap();
        assert_eq!(plan.changed.len(), 1);
        assert!(out.tree.validate().ok);
    }

    #[tokio::test]
    async fn test_added_leaf_is_topology_rebuild() {
        let cache = cache();
        let base = vec![
            leaf("l1", "a", &[]),
            leaf("l2", "b", &[]),
            leaf("l3", "c", &[]),
            leaf("l4", "d", &[]),
            leaf("l5", "e", &[]),
        ];
        cache.get("p", base.clone()).await.unwrap();

        let mut grown = base;
        grown.push(leaf("l6", "f", &[]));
        let out = cache.get("p", grown).await.unwrap();

        assert!(out.report.has(DiagnosticCode::IncrementalTopologyRebuild));
        assert!(!out.report.full_rebuild_fallback);
        assert!(out.tree.validate().ok);
        assert_eq!(out.tree.leaf_ids.len(), 6);
    }

    #[tokio::test]
    async fn test_edit_touching_everything_falls_back_to_full_rebuild() {
        let cache = cache();
        // l2 and l3 both depend on l1: editing l1 blocks every leaf.
        let base = vec![
            leaf("l1", "a", &[]),
            leaf("l2", "b", &["l1"]),
            leaf("l3", "c", &["l1"]),
        ];
        cache.get("p", base).await.unwrap();

        let edited = vec![
            leaf("l1", "a (edited)", &[]),
            leaf("l2", "b", &["l1"]),
            leaf("l3", "c", &["l1"]),
        ];
        let out = cache.get("p", edited).await.unwrap();
        assert!(out.report.has(DiagnosticCode::BlockedSubtreeFullRebuild));
        assert!(out.report.full_rebuild_fallback);
        assert_eq!(out.report.reused_parents, 0);
    }

    #[tokio::test]
    async fn test_reset_forgets_cached_trees() {
        let cache = cache();
        let leaves = vec![leaf("l1", "a", &[]), leaf("l2", "b", &[])];
        cache.get("p", leaves.clone()).await.unwrap();

        cache.reset();
        let out = cache.get("p", leaves).await.unwrap();
        assert_eq!(out.report.status, CacheStatus::Miss);
        assert_eq!(out.report.build_id, "build-2");
    }

    #[tokio::test]
    async fn test_duplicate_leaf_ids_rejected() {
        let cache = cache();
        let err = cache
            .get("p", vec![leaf("l1", "a", &[]), leaf("l1", "b", &[])])
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::LeafSet(_)));
    }
}
