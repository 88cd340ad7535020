//! Path → node lookup shared between the scan worker and callers.
//!
//! A single `parking_lot::RwLock` guards the map: lookups share the lock,
//! mutations take it exclusively. parking_lot's lock is task-fair, so a
//! steady stream of readers cannot starve a pending writer.
//!
//! Every `clear` opens a new generation. The walker inserts with the
//! generation it was started under, so a worker that is still unwinding
//! after a cancel can never repopulate the cache.

use crate::node::NodeId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Default)]
struct CacheInner {
    generation: u64,
    map: HashMap<PathBuf, NodeId>,
}

#[derive(Debug, Default)]
pub struct PathCache {
    inner: RwLock<CacheInner>,
}

impl PathCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, path: PathBuf, node: NodeId) {
        self.inner.write().map.insert(path, node);
    }

    /// Insert only while the cache is still on `generation`.
    pub fn put_in_generation(&self, generation: u64, path: PathBuf, node: NodeId) -> bool {
        let mut inner = self.inner.write();
        if inner.generation != generation {
            return false;
        }
        inner.map.insert(path, node);
        true
    }

    pub fn get(&self, path: &Path) -> Option<NodeId> {
        self.inner.read().map.get(path).copied()
    }

    pub fn remove(&self, path: &Path) -> Option<NodeId> {
        self.inner.write().map.remove(path)
    }

    /// Remove several paths under one exclusive lock.
    pub fn remove_all<'a>(&self, paths: impl IntoIterator<Item = &'a Path>) -> usize {
        let mut inner = self.inner.write();
        paths
            .into_iter()
            .filter(|p| inner.map.remove(*p).is_some())
            .count()
    }

    /// Drop every entry and return the new generation.
    pub fn clear(&self) -> u64 {
        let mut inner = self.inner.write();
        inner.map.clear();
        inner.generation += 1;
        inner.generation
    }

    pub fn generation(&self) -> u64 {
        self.inner.read().generation
    }

    pub fn len(&self) -> usize {
        self.inner.read().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().map.is_empty()
    }

    /// Copy of all entries.
    pub fn entries(&self) -> Vec<(PathBuf, NodeId)> {
        self.inner
            .read()
            .map
            .iter()
            .map(|(p, id)| (p.clone(), *id))
            .collect()
    }
}
