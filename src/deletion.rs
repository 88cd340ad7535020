//! Deletion queue and best-effort batch removal.
//!
//! Nodes are queued by identity, moved to the trash in a batch, and the
//! successful ones handed back to [`ScanEngine::update_tree_after_deletion`]
//! for pruning. Failures stay queued so the user can retry them.
//!
//! [`ScanEngine::update_tree_after_deletion`]: crate::engine::ScanEngine::update_tree_after_deletion

use crate::error::DeletionError;
use crate::fs::MemoryFs;
use crate::node::{FileTree, Node, NodeId, NodeSnapshot};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Recoverable removal primitive.
pub trait Trash: Send + Sync {
    fn trash(&self, path: &Path) -> Result<(), DeletionError>;
}

/// Move files to the platform trash (using safe trash crate, no shell
/// injection risk)
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTrash;

impl Trash for SystemTrash {
    fn trash(&self, path: &Path) -> Result<(), DeletionError> {
        if std::fs::symlink_metadata(path).is_err() {
            return Err(DeletionError::NotFound(path.to_path_buf()));
        }

        trash::delete(path).map_err(|e| DeletionError::Trash {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }
}

impl Trash for MemoryFs {
    fn trash(&self, path: &Path) -> Result<(), DeletionError> {
        self.remove(path)
            .map_err(|_| DeletionError::NotFound(path.to_path_buf()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueuedNode {
    pub id: NodeId,
    pub path: PathBuf,
    pub size: u64,
    pub is_dir: bool,
    /// Enclosing nodes, nearest first. Empty when the node was queued
    /// without its tree.
    pub ancestors: Vec<NodeId>,
}

impl QueuedNode {
    pub fn from_node(node: &Node) -> Self {
        Self {
            id: node.id(),
            path: node.path().to_path_buf(),
            size: node.size(),
            is_dir: node.is_dir(),
            ancestors: Vec::new(),
        }
    }

    /// Queue entry for `id` that knows its enclosing directories.
    pub fn from_tree(tree: &FileTree, id: NodeId) -> Option<Self> {
        let node = tree.get(id)?;
        Some(Self {
            ancestors: tree.ancestors(id),
            ..Self::from_node(node)
        })
    }

    pub fn from_snapshot(node: &NodeSnapshot) -> Self {
        Self {
            id: node.id,
            path: PathBuf::from(&node.path),
            size: node.size,
            is_dir: node.is_dir,
            ancestors: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DeletionOutcome {
    pub succeeded: Vec<QueuedNode>,
    pub failed: Vec<(QueuedNode, DeletionError)>,
}

impl DeletionOutcome {
    /// The batch error: the first failure encountered, if any.
    pub fn first_error(&self) -> Option<&DeletionError> {
        self.failed.first().map(|(_, err)| err)
    }

    pub fn deleted_ids(&self) -> Vec<NodeId> {
        self.succeeded.iter().map(|n| n.id).collect()
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct DeletionCoordinator {
    trash: Arc<dyn Trash>,
    queue: Mutex<Vec<QueuedNode>>,
}

impl DeletionCoordinator {
    pub fn new(trash: Arc<dyn Trash>) -> Self {
        Self {
            trash,
            queue: Mutex::new(Vec::new()),
        }
    }

    pub fn with_system_trash() -> Self {
        Self::new(Arc::new(SystemTrash))
    }

    /// Queue a node; `false` if that node is already queued.
    pub fn enqueue(&self, node: QueuedNode) -> bool {
        let mut queue = self.queue.lock();
        if queue.iter().any(|n| n.id == node.id) {
            return false;
        }
        queue.push(node);
        true
    }

    pub fn dequeue(&self, id: NodeId) -> bool {
        let mut queue = self.queue.lock();
        let before = queue.len();
        queue.retain(|n| n.id != id);
        queue.len() != before
    }

    pub fn clear_queue(&self) {
        self.queue.lock().clear();
    }

    pub fn queued(&self) -> Vec<QueuedNode> {
        self.queue.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn queued_bytes(&self) -> u64 {
        self.queue.lock().iter().map(|n| n.size).sum()
    }

    /// Trash every queued node. Runs on a snapshot of the queue, attempts
    /// every item even after failures, and leaves only the failures (plus
    /// anything queued meanwhile) in the queue.
    pub fn execute_deletion(&self) -> DeletionOutcome {
        let batch = self.queued();
        let mut outcome = DeletionOutcome::default();
        let mut trashed_dirs: HashSet<NodeId> = HashSet::new();

        for node in batch {
            // Gone together with a directory trashed earlier in this batch
            if node.ancestors.iter().any(|a| trashed_dirs.contains(a)) {
                outcome.succeeded.push(node);
                continue;
            }

            match self.trash.trash(&node.path) {
                Ok(()) => {
                    info!(path = %node.path.display(), size = node.size, "moved to trash");
                    if node.is_dir {
                        trashed_dirs.insert(node.id);
                    }
                    outcome.succeeded.push(node);
                }
                Err(err) => {
                    warn!(path = %node.path.display(), %err, "failed to move to trash");
                    outcome.failed.push((node, err));
                }
            }
        }

        let done: HashSet<NodeId> = outcome.succeeded.iter().map(|n| n.id).collect();
        self.queue.lock().retain(|n| !done.contains(&n.id));
        outcome
    }
}
