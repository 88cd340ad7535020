//! In-memory scan tree.
//!
//! Nodes live in a single arena owned by [`FileTree`] and refer to each
//! other through [`NodeId`] handles. A parent owns its children; the parent
//! link and every handle held outside the tree are lookup keys only.
//!
//! Every whole-tree query walks an explicit stack. Directory depth is
//! controlled by whoever created the files, so nothing here recurses over
//! the tree.

use serde::{Deserialize, Serialize};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;
use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-lifetime-unique node identity.
///
/// Two scans of the same path produce different ids, so handles from a
/// discarded tree never alias nodes of the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(u64);

impl NodeId {
    pub(crate) fn next() -> Self {
        NodeId(NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    id: NodeId,
    path: PathBuf,
    name: String,
    is_dir: bool,
    size: u64,
    modified: Option<SystemTime>,
    children: Vec<NodeId>,
    parent: Option<NodeId>,
    /// UI-only
    pub expanded: bool,
    /// UI-only
    pub selected: bool,
}

impl Node {
    /// `is_dir` comes from the stat taken at discovery and never changes.
    pub fn new(path: PathBuf, is_dir: bool, modified: Option<SystemTime>) -> Self {
        let name = display_name(&path);
        Self {
            id: NodeId::next(),
            path,
            name,
            is_dir,
            size: 0,
            modified,
            children: Vec::new(),
            parent: None,
            expanded: false,
            selected: false,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_dir(&self) -> bool {
        self.is_dir
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub(crate) fn set_size(&mut self, size: u64) {
        self.size = size;
    }

    pub fn modified(&self) -> Option<SystemTime> {
        self.modified
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string_lossy().to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    /// Largest first
    #[default]
    Size,
    /// Case- and accent-insensitive, ascending
    Name,
    /// Newest first; entries without a readable time go last
    Modified,
}

/// Collation key for display names: base letters first, so `éclair` sorts
/// with the `e`s, then accents, then case.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct NameKey {
    base: String,
    accented: String,
    exact: String,
}

impl NameKey {
    fn new(name: &str) -> Self {
        let accented: String = name.nfkd().flat_map(char::to_lowercase).collect();
        let base = accented.chars().filter(|c| !is_combining_mark(*c)).collect();
        Self {
            base,
            accented,
            exact: name.to_string(),
        }
    }
}

/// Files and directories below a node, the node itself excluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct NodeCounts {
    pub files: u64,
    pub dirs: u64,
}

impl NodeCounts {
    pub fn items(&self) -> u64 {
        self.files + self.dirs
    }
}

/// Arena-backed tree rooted at the scan root.
#[derive(Debug, Clone)]
pub struct FileTree {
    nodes: HashMap<NodeId, Node>,
    root: NodeId,
}

impl FileTree {
    pub fn new(root: Node) -> Self {
        let root_id = root.id;
        let mut nodes = HashMap::with_capacity(1024);
        nodes.insert(root_id, root);
        Self {
            nodes,
            root: root_id,
        }
    }

    pub fn root_id(&self) -> NodeId {
        self.root
    }

    pub fn root(&self) -> &Node {
        &self.nodes[&self.root]
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(&id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Number of nodes held, root included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Register a discovered node under `parent`. It is not listed among the
    /// parent's children until [`FileTree::set_children`] publishes the
    /// complete sequence.
    pub(crate) fn insert(&mut self, parent: NodeId, mut node: Node) -> NodeId {
        let id = node.id;
        node.parent = Some(parent);
        self.nodes.insert(id, node);
        id
    }

    /// Replace a node's child sequence in one step.
    pub(crate) fn set_children(&mut self, parent: NodeId, children: Vec<NodeId>) {
        for child in &children {
            if let Some(node) = self.nodes.get_mut(child) {
                node.parent = Some(parent);
            }
        }
        if let Some(node) = self.nodes.get_mut(&parent) {
            node.children = children;
        }
    }

    pub fn children(&self, id: NodeId) -> impl Iterator<Item = &Node> + '_ {
        self.nodes
            .get(&id)
            .map(|n| n.children.as_slice())
            .unwrap_or(&[])
            .iter()
            .filter_map(move |child| self.nodes.get(child))
    }

    pub fn sort_children(&mut self, id: NodeId, order: SortOrder) {
        let Some(mut children) = self.nodes.get_mut(&id).map(|n| std::mem::take(&mut n.children))
        else {
            return;
        };
        self.sort_ids(&mut children, order);
        if let Some(node) = self.nodes.get_mut(&id) {
            node.children = children;
        }
    }

    fn sort_ids(&self, ids: &mut [NodeId], order: SortOrder) {
        // sort_by is stable: equal keys keep insertion order
        let nodes = &self.nodes;
        match order {
            SortOrder::Size => ids.sort_by(|a, b| nodes[b].size.cmp(&nodes[a].size)),
            SortOrder::Name => {
                let mut keyed: Vec<(NameKey, NodeId)> = ids
                    .iter()
                    .map(|id| (NameKey::new(&nodes[id].name), *id))
                    .collect();
                keyed.sort_by(|a, b| a.0.cmp(&b.0));
                for (slot, (_, id)) in ids.iter_mut().zip(keyed) {
                    *slot = id;
                }
            }
            SortOrder::Modified => ids.sort_by(|a, b| {
                match (nodes[a].modified, nodes[b].modified) {
                    (Some(x), Some(y)) => y.cmp(&x),
                    (Some(_), None) => CmpOrdering::Less,
                    (None, Some(_)) => CmpOrdering::Greater,
                    (None, None) => CmpOrdering::Equal,
                }
            }),
        }
    }

    /// Set a directory's size to the sum of its children and return it.
    pub(crate) fn recompute_size(&mut self, id: NodeId) -> u64 {
        let total: u64 = self.children(id).map(|c| c.size).sum();
        if let Some(node) = self.nodes.get_mut(&id) {
            node.size = total;
        }
        total
    }

    /// Ancestors of `id`, nearest first.
    pub fn ancestors(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut current = self.nodes.get(&id).and_then(|n| n.parent);
        while let Some(parent) = current {
            out.push(parent);
            current = self.nodes.get(&parent).and_then(|n| n.parent);
        }
        out
    }

    /// Pre-order ids of every node reachable from `id`, `id` included.
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        if !self.nodes.contains_key(&id) {
            return out;
        }
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            out.push(current);
            if let Some(node) = self.nodes.get(&current) {
                stack.extend(node.children.iter().rev().copied());
            }
        }
        out
    }

    pub fn counts(&self, id: NodeId) -> NodeCounts {
        let mut counts = NodeCounts::default();
        let mut stack: Vec<NodeId> = match self.nodes.get(&id) {
            Some(node) => node.children.clone(),
            None => return counts,
        };
        while let Some(current) = stack.pop() {
            let Some(node) = self.nodes.get(&current) else {
                continue;
            };
            if node.is_dir {
                counts.dirs += 1;
                stack.extend_from_slice(&node.children);
            } else {
                counts.files += 1;
            }
        }
        counts
    }

    /// Every node in the tree, root included.
    pub fn total_items(&self) -> u64 {
        1 + self.counts(self.root).items()
    }

    /// Files below the root.
    pub fn file_count(&self) -> u64 {
        self.counts(self.root).files
    }

    /// Directories below the root.
    pub fn dir_count(&self) -> u64 {
        self.counts(self.root).dirs
    }

    /// Case-insensitive substring search over display names, in pre-order.
    /// The root sits at depth 0; `max_depth` bounds how far below it the
    /// search descends.
    pub fn search(&self, query: &str, max_depth: Option<usize>) -> Vec<NodeId> {
        let needle = query.to_lowercase();
        let mut hits = Vec::new();
        let mut stack = vec![(self.root, 0usize)];
        while let Some((id, depth)) = stack.pop() {
            let Some(node) = self.nodes.get(&id) else {
                continue;
            };
            if node.name.to_lowercase().contains(&needle) {
                hits.push(id);
            }
            if max_depth.is_some_and(|max| depth >= max) {
                continue;
            }
            stack.extend(node.children.iter().rev().map(|c| (*c, depth + 1)));
        }
        hits
    }

    /// Unlink `id` from its parent and drop it with its whole subtree.
    /// Returns the removed nodes, `id` first. The root cannot be detached.
    pub(crate) fn detach(&mut self, id: NodeId) -> Vec<Node> {
        if id == self.root {
            return Vec::new();
        }
        let Some(parent) = self.nodes.get(&id).and_then(|n| n.parent) else {
            return Vec::new();
        };
        if let Some(parent_node) = self.nodes.get_mut(&parent) {
            parent_node.children.retain(|c| *c != id);
        }
        self.descendants(id)
            .into_iter()
            .filter_map(|d| self.nodes.remove(&d))
            .collect()
    }

    /// Recompute every directory size from its children, bottom-up.
    pub fn aggregate_sizes(&mut self) {
        let mut stack = vec![(self.root, false)];
        while let Some((id, visited)) = stack.pop() {
            let Some(node) = self.nodes.get(&id) else {
                continue;
            };
            if !node.is_dir || node.children.is_empty() {
                continue;
            }
            if visited {
                self.recompute_size(id);
            } else {
                stack.push((id, true));
                stack.extend(node.children.iter().map(|c| (*c, false)));
            }
        }
    }

    /// Owned copy of the subtree at `id`, at most `max_depth` levels deep.
    pub fn snapshot(&self, id: NodeId, max_depth: usize) -> Option<NodeSnapshot> {
        let node = self.nodes.get(&id)?;
        let max_depth = max_depth.min(MAX_SNAPSHOT_DEPTH);
        Some(self.snapshot_node(node, max_depth))
    }

    // Depth is capped by MAX_SNAPSHOT_DEPTH, not by the tree.
    fn snapshot_node(&self, node: &Node, depth_left: usize) -> NodeSnapshot {
        let counts = if node.is_dir {
            self.counts(node.id)
        } else {
            NodeCounts::default()
        };
        let children = if depth_left == 0 {
            Vec::new()
        } else {
            self.children(node.id)
                .map(|c| self.snapshot_node(c, depth_left - 1))
                .collect()
        };
        NodeSnapshot {
            id: node.id,
            name: node.name.clone(),
            path: node.path.to_string_lossy().to_string(),
            size: node.size,
            is_dir: node.is_dir,
            file_count: counts.files,
            dir_count: counts.dirs,
            modified_at: node
                .modified
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs()),
            children,
        }
    }
}

const MAX_SNAPSHOT_DEPTH: usize = 25;

/// Serializable copy of a subtree, handed to presentation and advisory
/// collaborators. Never mutated back into the tree.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeSnapshot {
    pub id: NodeId,
    pub name: String,
    pub path: String,
    pub size: u64,
    pub is_dir: bool,
    pub file_count: u64,
    pub dir_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<u64>,
    pub children: Vec<NodeSnapshot>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn file(path: &str, size: u64) -> Node {
        let mut node = Node::new(PathBuf::from(path), false, None);
        node.set_size(size);
        node
    }

    fn dir(path: &str) -> Node {
        Node::new(PathBuf::from(path), true, None)
    }

    /// /p { a.txt(100), b/ { c.txt(200) } }
    fn sample() -> (FileTree, NodeId, NodeId, NodeId) {
        let mut tree = FileTree::new(dir("/p"));
        let root = tree.root_id();
        let a = tree.insert(root, file("/p/a.txt", 100));
        let b = tree.insert(root, dir("/p/b"));
        let c = tree.insert(b, file("/p/b/c.txt", 200));
        tree.set_children(b, vec![c]);
        tree.set_children(root, vec![a, b]);
        tree.aggregate_sizes();
        (tree, a, b, c)
    }

    #[test]
    fn test_ids_are_unique() {
        let x = Node::new(PathBuf::from("/same"), false, None);
        let y = Node::new(PathBuf::from("/same"), false, None);
        assert_ne!(x.id(), y.id());
        assert_eq!(x.name(), "same");
    }

    #[test]
    fn test_aggregate_and_counts() {
        let (tree, _, b, _) = sample();
        assert_eq!(tree.root().size(), 300);
        assert_eq!(tree.get(b).unwrap().size(), 200);
        assert_eq!(tree.file_count(), 2);
        assert_eq!(tree.dir_count(), 1);
        assert_eq!(tree.total_items(), 4);
    }

    #[test]
    fn test_sort_orders() {
        let mut tree = FileTree::new(dir("/r"));
        let root = tree.root_id();
        let now = SystemTime::now();
        let mut ids = Vec::new();
        for (name, size, age) in [
            ("beta", 10, Some(30)),
            ("Alpha", 30, None),
            ("gamma", 20, Some(10)),
            ("delta", 20, None),
        ] {
            let mut node = Node::new(
                PathBuf::from(format!("/r/{}", name)),
                false,
                age.map(|secs| now - Duration::from_secs(secs)),
            );
            node.set_size(size);
            ids.push(tree.insert(root, node));
        }
        tree.set_children(root, ids);

        let names = |tree: &FileTree| -> Vec<String> {
            tree.children(root).map(|n| n.name().to_string()).collect()
        };

        tree.sort_children(root, SortOrder::Size);
        assert_eq!(names(&tree), ["Alpha", "gamma", "delta", "beta"]);

        tree.sort_children(root, SortOrder::Name);
        assert_eq!(names(&tree), ["Alpha", "beta", "delta", "gamma"]);

        // undated entries keep their relative (name-sorted) order at the end
        tree.sort_children(root, SortOrder::Modified);
        assert_eq!(names(&tree), ["gamma", "beta", "Alpha", "delta"]);
    }

    #[test]
    fn test_name_sort_folds_accents() {
        let mut tree = FileTree::new(dir("/r"));
        let root = tree.root_id();
        let ids: Vec<NodeId> = ["zebra", "résumé", "éclair", "fig", "Ångström", "resume", "ecole"]
            .iter()
            .map(|name| tree.insert(root, Node::new(PathBuf::from(format!("/r/{}", name)), false, None)))
            .collect();
        tree.set_children(root, ids);

        tree.sort_children(root, SortOrder::Name);
        let names: Vec<String> = tree.children(root).map(|n| n.name().to_string()).collect();
        assert_eq!(
            names,
            ["Ångström", "éclair", "ecole", "fig", "resume", "résumé", "zebra"]
        );
    }

    #[test]
    fn test_search_is_case_insensitive_and_depth_bounded() {
        let (tree, a, _, c) = sample();
        assert_eq!(tree.search("TXT", None), vec![a, c]);
        assert_eq!(tree.search("txt", Some(1)), vec![a]);
        assert!(tree.search("zzz", None).is_empty());
    }

    #[test]
    fn test_deep_tree_does_not_overflow() {
        let mut tree = FileTree::new(dir("/deep"));
        let mut parent = tree.root_id();
        // paths are not nested here to keep memory flat; only links matter
        for i in 0..200_000 {
            let id = tree.insert(parent, dir(&format!("/deep/d{}", i)));
            tree.set_children(parent, vec![id]);
            parent = id;
        }
        let leaf = tree.insert(parent, file("/deep/leaf", 7));
        tree.set_children(parent, vec![leaf]);

        tree.aggregate_sizes();
        assert_eq!(tree.root().size(), 7);
        assert_eq!(tree.total_items(), 200_002);
        assert_eq!(tree.ancestors(leaf).len(), 200_001);
        assert_eq!(tree.search("leaf", None), vec![leaf]);
    }

    #[test]
    fn test_detach_removes_subtree() {
        let (mut tree, a, b, c) = sample();
        let removed = tree.detach(b);
        assert_eq!(removed.len(), 2);
        assert_eq!(removed[0].id(), b);
        assert!(!tree.contains(c));
        assert_eq!(tree.root().children(), &[a]);

        assert!(tree.detach(tree.root_id()).is_empty());
    }

    #[test]
    fn test_snapshot_depth() {
        let (tree, _, _, _) = sample();
        let snap = tree.snapshot(tree.root_id(), 1).unwrap();
        assert_eq!(snap.size, 300);
        assert_eq!(snap.file_count, 2);
        assert_eq!(snap.children.len(), 2);
        assert!(snap.children.iter().all(|c| c.children.is_empty()));
    }
}
