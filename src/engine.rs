//! Scan state machine.
//!
//! ```text
//! Idle ──start──▶ Counting ──▶ Sizing ──▶ Completed
//!   ▲                │            │           │
//!   └──── cancel ────┴────────────┘           │
//!   ▲                                         │
//!   └──────────── clear / failure ────────────┘
//! ```
//!
//! One worker thread runs the whole walk. Callers issue commands from any
//! thread, poll [`ScanEngine::snapshot`] or subscribe to [`ScanEvent`]s.
//! The tree belongs to the worker until the scan completes and is only
//! then published into the shared state, where deletion reconciliation
//! may mutate it under the state's write lock.

use crate::deletion::QueuedNode;
use crate::error::ScanError;
use crate::fs::{normalize, FileSystem, OsFileSystem};
use crate::node::{FileTree, NodeId, NodeSnapshot, SortOrder};
use crate::path_cache::PathCache;
use crate::progress::{ProgressThrottle, ScanProgress};
use crate::scanner::{Interrupted, ScanOptions, Scanner, ScannerState};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Instant, SystemTime};
use tracing::{debug, error, info, warn};

static NEXT_SCAN_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanPhase {
    Idle,
    Counting,
    Sizing,
    Completed,
}

impl ScanPhase {
    pub fn is_scanning(self) -> bool {
        matches!(self, ScanPhase::Counting | ScanPhase::Sizing)
    }
}

/// What is remembered about a finished scan after its tree is gone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanSummary {
    pub scan_id: u64,
    pub root_path: PathBuf,
    pub total_items: u64,
    pub total_files: u64,
    pub total_dirs: u64,
    pub total_size: u64,
    pub started_at: SystemTime,
    pub finished_at: SystemTime,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScanEvent {
    PhaseChanged { scan_id: u64, phase: ScanPhase },
    Progress { scan_id: u64, progress: ScanProgress },
    Completed { scan_id: u64, summary: ScanSummary },
    /// Neutral: the user asked for it
    Cancelled { scan_id: u64 },
    Failed { scan_id: u64, error: String },
    TreeUpdated { removed_nodes: usize, reclaimed_bytes: u64 },
}

/// Point-in-time copy of everything a presentation layer renders.
#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    pub phase: ScanPhase,
    pub scanning: bool,
    pub progress: ScanProgress,
    pub root: Option<NodeSnapshot>,
    pub summary: Option<ScanSummary>,
    pub last_error: Option<String>,
}

/// Result of pruning deleted nodes out of the tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub removed_nodes: usize,
    pub reclaimed_bytes: u64,
}

struct EngineState {
    phase: ScanPhase,
    scan_id: u64,
    progress: ScanProgress,
    tree: Option<FileTree>,
    summary: Option<ScanSummary>,
    last_error: Option<Arc<ScanError>>,
    cancel: Option<Arc<ScannerState>>,
}

impl EngineState {
    fn is_current(&self, scan_id: u64) -> bool {
        self.scan_id == scan_id && self.phase.is_scanning()
    }
}

struct Shared {
    fs: Arc<dyn FileSystem>,
    options: ScanOptions,
    cache: PathCache,
    state: RwLock<EngineState>,
    subscribers: Mutex<Vec<Sender<ScanEvent>>>,
}

impl Shared {
    fn emit(&self, event: ScanEvent) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

enum WalkFailure {
    Cancelled,
    Failed(ScanError),
}

impl From<Interrupted> for WalkFailure {
    fn from(_: Interrupted) -> Self {
        WalkFailure::Cancelled
    }
}

impl From<ScanError> for WalkFailure {
    fn from(err: ScanError) -> Self {
        WalkFailure::Failed(err)
    }
}

pub struct ScanEngine {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ScanEngine {
    pub fn new(fs: Arc<dyn FileSystem>, options: ScanOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                fs,
                options,
                cache: PathCache::new(),
                state: RwLock::new(EngineState {
                    phase: ScanPhase::Idle,
                    scan_id: 0,
                    progress: ScanProgress::default(),
                    tree: None,
                    summary: None,
                    last_error: None,
                    cancel: None,
                }),
                subscribers: Mutex::new(Vec::new()),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn with_os_fs(options: ScanOptions) -> Self {
        Self::new(Arc::new(OsFileSystem), options)
    }

    pub fn subscribe(&self) -> Receiver<ScanEvent> {
        let (tx, rx) = unbounded();
        self.shared.subscribers.lock().push(tx);
        rx
    }

    /// Begin scanning `root` on a background worker. Returns `false`
    /// without doing anything while another scan is running, and also when
    /// the worker thread cannot be spawned; that case is reported like a
    /// failed scan.
    pub fn start_scan(&self, root: impl AsRef<Path>) -> bool {
        let requested = root.as_ref().to_path_buf();
        let token = Arc::new(ScannerState::new());

        let (scan_id, generation) = {
            let mut state = self.shared.state.write();
            if state.phase.is_scanning() {
                debug!(path = %requested.display(), "scan already running, ignoring start");
                return false;
            }
            let scan_id = NEXT_SCAN_ID.fetch_add(1, Ordering::Relaxed);
            let generation = self.shared.cache.clear();
            state.scan_id = scan_id;
            state.phase = ScanPhase::Counting;
            state.progress = ScanProgress::default();
            state.tree = None;
            state.last_error = None;
            state.cancel = Some(token.clone());
            (scan_id, generation)
        };

        info!(scan_id, path = %requested.display(), "starting scan");
        self.shared.emit(ScanEvent::PhaseChanged {
            scan_id,
            phase: ScanPhase::Counting,
        });

        let shared = self.shared.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("spacescan-scan-{}", scan_id))
            .spawn(move || run_worker(shared, scan_id, generation, requested, token));

        match spawned {
            Ok(handle) => {
                // A previous worker may still be unwinding after a cancel;
                // it can no longer publish anything, so let it finish alone.
                *self.worker.lock() = Some(handle);
                true
            }
            Err(err) => {
                let state = self.shared.state.write();
                fail_scan(
                    &self.shared,
                    state,
                    scan_id,
                    ScanError::Unknown {
                        path: PathBuf::new(),
                        source: err,
                    },
                );
                false
            }
        }
    }

    /// Abort the running scan. The partial tree and every cache entry are
    /// dropped immediately; the worker unwinds at its next check.
    pub fn cancel_scan(&self) -> bool {
        let scan_id = {
            let mut state = self.shared.state.write();
            if !state.phase.is_scanning() {
                return false;
            }
            if let Some(token) = state.cancel.take() {
                token.cancel();
            }
            self.shared.cache.clear();
            state.tree = None;
            state.progress = ScanProgress::default();
            state.phase = ScanPhase::Idle;
            state.scan_id
        };

        info!(scan_id, "scan cancelled");
        self.shared.emit(ScanEvent::Cancelled { scan_id });
        self.shared.emit(ScanEvent::PhaseChanged {
            scan_id,
            phase: ScanPhase::Idle,
        });
        true
    }

    /// Forget the tree but keep the summary of the last completed scan.
    pub fn clear_scan_result(&self) -> Result<(), ScanError> {
        let scan_id = {
            let mut state = self.shared.state.write();
            if state.phase.is_scanning() {
                return Err(ScanError::Busy);
            }
            self.shared.cache.clear();
            state.tree = None;
            state.phase = ScanPhase::Idle;
            state.scan_id
        };
        debug!(scan_id, "scan result cleared");
        self.shared.emit(ScanEvent::PhaseChanged {
            scan_id,
            phase: ScanPhase::Idle,
        });
        Ok(())
    }

    /// Block until the most recently started worker has exited.
    pub fn wait(&self) {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("scan worker panicked");
            }
        }
    }

    pub fn phase(&self) -> ScanPhase {
        self.shared.state.read().phase
    }

    pub fn is_scanning(&self) -> bool {
        self.phase().is_scanning()
    }

    pub fn progress(&self) -> ScanProgress {
        self.shared.state.read().progress.clone()
    }

    pub fn summary(&self) -> Option<ScanSummary> {
        self.shared.state.read().summary.clone()
    }

    pub fn last_error(&self) -> Option<Arc<ScanError>> {
        self.shared.state.read().last_error.clone()
    }

    pub fn has_tree(&self) -> bool {
        self.shared.state.read().tree.is_some()
    }

    /// Snapshot with the root subtree copied `depth` levels deep.
    pub fn snapshot(&self, depth: usize) -> EngineSnapshot {
        let state = self.shared.state.read();
        EngineSnapshot {
            phase: state.phase,
            scanning: state.phase.is_scanning(),
            progress: state.progress.clone(),
            root: state
                .tree
                .as_ref()
                .and_then(|t| t.snapshot(t.root_id(), depth)),
            summary: state.summary.clone(),
            last_error: state.last_error.as_ref().map(|e| e.to_string()),
        }
    }

    /// Read access to the published tree.
    pub fn with_tree<R>(&self, f: impl FnOnce(&FileTree) -> R) -> Option<R> {
        self.shared.state.read().tree.as_ref().map(f)
    }

    pub fn path_cache(&self) -> &PathCache {
        &self.shared.cache
    }

    /// O(1) path lookup through the cache.
    pub fn find_node(&self, path: impl AsRef<Path>) -> Option<NodeId> {
        let path = path.as_ref();
        self.shared
            .cache
            .get(path)
            .or_else(|| self.shared.cache.get(&normalize(path)))
    }

    pub fn node(&self, id: NodeId, depth: usize) -> Option<NodeSnapshot> {
        self.with_tree(|t| t.snapshot(id, depth)).flatten()
    }

    /// Deletion queue entry for a node of the current tree.
    pub fn queued_node(&self, id: NodeId) -> Option<QueuedNode> {
        self.with_tree(|t| QueuedNode::from_tree(t, id)).flatten()
    }

    pub fn search(&self, query: &str, max_depth: Option<usize>) -> Vec<NodeSnapshot> {
        self.with_tree(|t| {
            t.search(query, max_depth)
                .into_iter()
                .filter_map(|id| t.snapshot(id, 0))
                .collect()
        })
        .unwrap_or_default()
    }

    pub fn sort_children(&self, id: NodeId, order: SortOrder) -> bool {
        let mut state = self.shared.state.write();
        if state.phase.is_scanning() {
            return false;
        }
        match state.tree.as_mut() {
            Some(tree) if tree.contains(id) => {
                tree.sort_children(id, order);
                true
            }
            _ => false,
        }
    }

    /// Prune nodes whose files are already gone from disk.
    ///
    /// Each node's subtree leaves the cache first, then the tree; every
    /// ancestor is then re-totalled bottom-up and its children re-sorted by
    /// size. Ids that are unknown (already pruned, or from an older tree)
    /// are ignored. Refused while a scan is running.
    pub fn update_tree_after_deletion(
        &self,
        deleted: &[NodeId],
    ) -> Result<ReconcileReport, ScanError> {
        let mut report = ReconcileReport::default();
        {
            let mut state = self.shared.state.write();
            if state.phase.is_scanning() {
                return Err(ScanError::Busy);
            }
            let Some(tree) = state.tree.as_mut() else {
                return Ok(report);
            };

            if deleted.contains(&tree.root_id()) {
                // Everything goes; the batch's other ids are inside the root.
                report.removed_nodes = tree.len();
                report.reclaimed_bytes = tree.root().size();
                self.shared.cache.clear();
                state.tree = None;
                state.phase = ScanPhase::Idle;
            } else {
                reconcile(&self.shared.cache, tree, deleted, &mut report);
            }
        }

        info!(
            removed = report.removed_nodes,
            reclaimed = report.reclaimed_bytes,
            "tree reconciled after deletion"
        );
        self.shared.emit(ScanEvent::TreeUpdated {
            removed_nodes: report.removed_nodes,
            reclaimed_bytes: report.reclaimed_bytes,
        });
        Ok(report)
    }
}

impl Drop for ScanEngine {
    fn drop(&mut self) {
        if let Some(token) = self.shared.state.read().cancel.as_ref() {
            token.cancel();
        }
    }
}

fn run_worker(
    shared: Arc<Shared>,
    scan_id: u64,
    generation: u64,
    requested: PathBuf,
    token: Arc<ScannerState>,
) {
    let started_at = SystemTime::now();
    let timer = Instant::now();

    let result = walk(&shared, scan_id, generation, &requested, &token);

    let mut state = shared.state.write();
    if !state.is_current(scan_id) {
        debug!(scan_id, "worker exiting after cancellation");
        return;
    }

    match result {
        Ok(tree) => {
            let counts = tree.counts(tree.root_id());
            let summary = ScanSummary {
                scan_id,
                root_path: tree.root().path().to_path_buf(),
                total_items: counts.items() + 1,
                total_files: counts.files,
                total_dirs: counts.dirs,
                total_size: tree.root().size(),
                started_at,
                finished_at: SystemTime::now(),
            };
            info!(
                scan_id,
                items = summary.total_items,
                bytes = summary.total_size,
                elapsed_ms = timer.elapsed().as_millis() as u64,
                "scan complete"
            );
            state.tree = Some(tree);
            state.summary = Some(summary.clone());
            state.phase = ScanPhase::Completed;
            state.cancel = None;
            drop(state);
            shared.emit(ScanEvent::PhaseChanged {
                scan_id,
                phase: ScanPhase::Completed,
            });
            shared.emit(ScanEvent::Completed { scan_id, summary });
        }
        Err(WalkFailure::Cancelled) => {
            // Token cancelled without cancel_scan: the engine is being dropped.
            warn!(scan_id, "scan interrupted");
            shared.cache.clear();
            state.tree = None;
            state.phase = ScanPhase::Idle;
            state.cancel = None;
        }
        Err(WalkFailure::Failed(err)) => fail_scan(&shared, state, scan_id, err),
    }
}

/// Record a failed scan and return to `Idle`. Takes the held write lock so
/// nothing can observe the scan between the failure and the reset.
fn fail_scan(
    shared: &Shared,
    mut state: RwLockWriteGuard<'_, EngineState>,
    scan_id: u64,
    err: ScanError,
) {
    error!(scan_id, %err, "scan failed");
    let message = err.to_string();
    shared.cache.clear();
    state.tree = None;
    state.phase = ScanPhase::Idle;
    state.cancel = None;
    state.last_error = Some(Arc::new(err));
    drop(state);
    shared.emit(ScanEvent::Failed {
        scan_id,
        error: message,
    });
    shared.emit(ScanEvent::PhaseChanged {
        scan_id,
        phase: ScanPhase::Idle,
    });
}

/// Prune each deleted subtree from the cache and the tree, then re-total and
/// re-sort every surviving ancestor. Unknown ids are skipped.
fn reconcile(
    cache: &PathCache,
    tree: &mut FileTree,
    deleted: &[NodeId],
    report: &mut ReconcileReport,
) {
    let mut touched: Vec<NodeId> = Vec::new();
    for &id in deleted {
        let Some(node) = tree.get(id) else {
            continue;
        };
        let parent = node.parent();
        let size = node.size();

        let paths: Vec<PathBuf> = tree
            .descendants(id)
            .iter()
            .filter_map(|d| tree.get(*d).map(|n| n.path().to_path_buf()))
            .collect();
        cache.remove_all(paths.iter().map(|p| p.as_path()));

        report.removed_nodes += tree.detach(id).len();
        report.reclaimed_bytes += size;
        touched.extend(parent);
    }

    for parent in touched {
        if !tree.contains(parent) {
            continue;
        }
        let mut chain = vec![parent];
        chain.extend(tree.ancestors(parent));
        for id in chain {
            tree.recompute_size(id);
            tree.sort_children(id, SortOrder::Size);
        }
    }
}

fn walk(
    shared: &Shared,
    scan_id: u64,
    generation: u64,
    requested: &Path,
    token: &ScannerState,
) -> Result<FileTree, WalkFailure> {
    let fs = shared.fs.as_ref();
    let (root, root_meta) = Scanner::resolve_root(fs, requested)?;
    let scanner = Scanner::new(fs, token, &shared.options, &root);

    let mut throttle = ProgressThrottle::new(shared.options.progress_interval, |p: &ScanProgress| {
        {
            let mut state = shared.state.write();
            if token.is_cancelled() || !state.is_current(scan_id) {
                return;
            }
            state.progress = p.clone();
        }
        shared.emit(ScanEvent::Progress {
            scan_id,
            progress: p.clone(),
        });
    });

    let total = scanner.count(&root, &mut throttle)?;
    debug!(scan_id, total, "count phase finished");

    {
        let mut state = shared.state.write();
        if token.is_cancelled() || !state.is_current(scan_id) {
            return Err(WalkFailure::Cancelled);
        }
        state.phase = ScanPhase::Sizing;
    }
    shared.emit(ScanEvent::PhaseChanged {
        scan_id,
        phase: ScanPhase::Sizing,
    });
    throttle.set_total(total);

    let tree = scanner.build(&root, &root_meta, &shared.cache, generation, &mut throttle)?;
    throttle.finish();
    Ok(tree)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemoryFs;

    fn project_engine() -> (Arc<MemoryFs>, ScanEngine) {
        let fs = Arc::new(MemoryFs::new());
        fs.add_file("/tmp/project/a.txt", 100)
            .add_file("/tmp/project/b/c.txt", 200);
        let engine = ScanEngine::new(fs.clone(), ScanOptions::default());
        (fs, engine)
    }

    #[test]
    fn test_complete_scan_publishes_tree_and_summary() {
        let (_, engine) = project_engine();
        let events = engine.subscribe();
        assert!(engine.start_scan("/tmp/project"));
        engine.wait();

        assert_eq!(engine.phase(), ScanPhase::Completed);
        let summary = engine.summary().unwrap();
        assert_eq!(summary.total_items, 4);
        assert_eq!(summary.total_size, 300);
        assert_eq!(summary.root_path, PathBuf::from("/tmp/project"));

        let snap = engine.snapshot(2);
        assert_eq!(snap.root.as_ref().map(|r| r.size), Some(300));
        assert_eq!(snap.progress.percentage(), 100.0);

        let received: Vec<ScanEvent> = events.try_iter().collect();
        assert!(received
            .iter()
            .any(|e| matches!(e, ScanEvent::Completed { .. })));
        let processed: Vec<u64> = received
            .iter()
            .filter_map(|e| match e {
                ScanEvent::Progress { progress, .. } => Some(progress.processed_items),
                _ => None,
            })
            .collect();
        assert!(processed.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(processed.last(), Some(&4));
    }

    #[test]
    fn test_missing_root_fails_and_engine_stays_usable() {
        let (_, engine) = project_engine();
        let events = engine.subscribe();
        assert!(engine.start_scan("/does/not/exist"));
        engine.wait();

        assert_eq!(engine.phase(), ScanPhase::Idle);
        assert!(matches!(
            engine.last_error().as_deref(),
            Some(ScanError::PathNotFound(_))
        ));
        assert!(!engine.has_tree());
        assert!(events
            .try_iter()
            .any(|e| matches!(e, ScanEvent::Failed { .. })));

        assert!(engine.start_scan("/tmp/project"));
        engine.wait();
        assert_eq!(engine.phase(), ScanPhase::Completed);
        assert!(engine.last_error().is_none());
    }

    #[test]
    fn test_clear_keeps_summary() {
        let (_, engine) = project_engine();
        engine.start_scan("/tmp/project");
        engine.wait();
        let first_root = engine.with_tree(|t| t.root_id()).unwrap();

        engine.clear_scan_result().unwrap();
        assert!(!engine.has_tree());
        assert!(engine.path_cache().is_empty());
        assert!(engine.summary().is_some());

        engine.start_scan("/tmp/project");
        engine.wait();
        let second_root = engine.with_tree(|t| t.root_id()).unwrap();
        assert_ne!(first_root, second_root);
        assert_eq!(engine.find_node("/tmp/project"), Some(second_root));
    }

    #[test]
    fn test_reconcile_without_tree_is_noop() {
        let (_, engine) = project_engine();
        assert_eq!(
            engine.update_tree_after_deletion(&[]).unwrap(),
            ReconcileReport::default()
        );
        assert!(!engine.cancel_scan());
    }

    #[test]
    fn test_reconcile_after_deletion() {
        let (_, engine) = project_engine();
        engine.start_scan("/tmp/project");
        engine.wait();

        let c = engine.find_node("/tmp/project/b/c.txt").unwrap();
        let report = engine.update_tree_after_deletion(&[c]).unwrap();
        assert_eq!(report.removed_nodes, 1);
        assert_eq!(report.reclaimed_bytes, 200);

        let b = engine.find_node("/tmp/project/b").unwrap();
        let b_node = engine.node(b, 1).unwrap();
        assert_eq!(b_node.size, 0);
        assert!(b_node.children.is_empty());
        assert_eq!(engine.snapshot(0).root.unwrap().size, 100);
        assert!(engine.find_node("/tmp/project/b/c.txt").is_none());
    }

    #[test]
    fn test_deleting_root_empties_everything() {
        let (_, engine) = project_engine();
        engine.start_scan("/tmp/project");
        engine.wait();
        let root = engine.find_node("/tmp/project").unwrap();
        let report = engine.update_tree_after_deletion(&[root]).unwrap();
        assert_eq!(report.removed_nodes, 4);
        assert!(!engine.has_tree());
        assert!(engine.path_cache().is_empty());
    }

    #[test]
    fn test_root_in_batch_reports_whole_tree() {
        let (_, engine) = project_engine();
        let events = engine.subscribe();
        engine.start_scan("/tmp/project");
        engine.wait();
        let c = engine.find_node("/tmp/project/b/c.txt").unwrap();
        let root = engine.find_node("/tmp/project").unwrap();

        let report = engine.update_tree_after_deletion(&[c, root]).unwrap();
        assert_eq!(
            report,
            ReconcileReport {
                removed_nodes: 4,
                reclaimed_bytes: 300,
            }
        );
        assert_eq!(engine.phase(), ScanPhase::Idle);
        assert!(events.try_iter().any(|e| e
            == ScanEvent::TreeUpdated {
                removed_nodes: 4,
                reclaimed_bytes: 300,
            }));
    }

    #[test]
    fn test_failure_before_walk_resets_and_notifies() {
        let (_, engine) = project_engine();
        let events = engine.subscribe();
        {
            let mut state = engine.shared.state.write();
            state.scan_id = 7;
            state.phase = ScanPhase::Counting;
            state.cancel = Some(Arc::new(ScannerState::new()));
        }

        fail_scan(
            &engine.shared,
            engine.shared.state.write(),
            7,
            ScanError::Unknown {
                path: PathBuf::new(),
                source: std::io::Error::new(std::io::ErrorKind::Other, "no threads left"),
            },
        );

        assert_eq!(engine.phase(), ScanPhase::Idle);
        assert!(matches!(
            engine.last_error().as_deref(),
            Some(ScanError::Unknown { .. })
        ));
        let received: Vec<ScanEvent> = events.try_iter().collect();
        assert!(matches!(received[0], ScanEvent::Failed { scan_id: 7, .. }));
        assert_eq!(
            received[1],
            ScanEvent::PhaseChanged {
                scan_id: 7,
                phase: ScanPhase::Idle,
            }
        );
        // a fresh start is accepted afterwards
        assert!(engine.start_scan("/tmp/project"));
        engine.wait();
        assert_eq!(engine.phase(), ScanPhase::Completed);
    }
}
