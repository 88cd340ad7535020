//! Filesystem collaborator used by the walker.
//!
//! The scanner only ever talks to a [`FileSystem`]: directory enumeration,
//! symlink detection and the size attributes the resolver chains through.
//! [`OsFileSystem`] is the real implementation; [`MemoryFs`] is an in-memory
//! tree with exact sizes and injectable failures.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

/// Stat attributes of a single entry, gathered without following symlinks.
///
/// Each size attribute is optional because platforms expose different
/// subsets; the size resolver decides which one wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryMetadata {
    pub is_dir: bool,
    pub is_symlink: bool,
    /// Blocks actually consumed on disk (sparse-aware)
    pub total_allocated_size: Option<u64>,
    /// Logical length rounded up to whole allocation blocks
    pub allocated_size: Option<u64>,
    pub logical_size: Option<u64>,
    pub modified: Option<SystemTime>,
}

impl EntryMetadata {
    pub fn from_std(meta: &std::fs::Metadata) -> Self {
        let file_type = meta.file_type();
        let (total_allocated_size, allocated_size) = allocation_sizes(meta);
        Self {
            is_dir: file_type.is_dir(),
            is_symlink: file_type.is_symlink(),
            total_allocated_size,
            allocated_size,
            logical_size: Some(meta.len()),
            modified: meta.modified().ok(),
        }
    }
}

#[cfg(unix)]
fn allocation_sizes(meta: &std::fs::Metadata) -> (Option<u64>, Option<u64>) {
    use std::os::unix::fs::MetadataExt;

    // st_blocks is always in 512-byte units
    let total = meta.blocks().checked_mul(512);
    let block = meta.blksize();
    let allocated = if block == 0 {
        None
    } else {
        meta.len().div_ceil(block).checked_mul(block)
    };
    (total, allocated)
}

#[cfg(not(unix))]
fn allocation_sizes(_meta: &std::fs::Metadata) -> (Option<u64>, Option<u64>) {
    (None, None)
}

pub trait FileSystem: Send + Sync {
    /// Normalized form of `path` used as the cache key for the scan root.
    fn canonicalize(&self, path: &Path) -> io::Result<PathBuf>;

    /// Metadata of the entry itself; symlinks are reported, not followed.
    fn symlink_metadata(&self, path: &Path) -> io::Result<EntryMetadata>;

    /// Paths of the direct children of a directory.
    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>>;

    /// Legacy stat-based length, following symlinks.
    fn stat_size(&self, path: &Path) -> io::Result<u64>;

    /// Contents of a small text file such as `.spaceignore`.
    fn read_to_string(&self, _path: &Path) -> io::Result<String> {
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }
}

/// The host filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsFileSystem;

impl FileSystem for OsFileSystem {
    fn canonicalize(&self, path: &Path) -> io::Result<PathBuf> {
        std::fs::canonicalize(path)
    }

    fn symlink_metadata(&self, path: &Path) -> io::Result<EntryMetadata> {
        std::fs::symlink_metadata(path).map(|m| EntryMetadata::from_std(&m))
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        let mut children = Vec::new();
        for entry in std::fs::read_dir(path)? {
            match entry {
                Ok(entry) => children.push(entry.path()),
                Err(err) => tracing::debug!(dir = %path.display(), %err, "skipping unreadable entry"),
            }
        }
        Ok(children)
    }

    fn stat_size(&self, path: &Path) -> io::Result<u64> {
        std::fs::metadata(path).map(|m| m.len())
    }

    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        std::fs::read_to_string(path)
    }
}

/// Stat size reported for in-memory directories (one metadata block).
pub const MEMORY_DIR_STAT_SIZE: u64 = 4096;

#[derive(Debug, Clone)]
enum MemKind {
    File {
        size: u64,
        allocated: Option<u64>,
        contents: Option<String>,
    },
    Dir { denied: bool, stat_size: u64 },
    Symlink { target: PathBuf },
}

#[derive(Debug, Clone)]
struct MemEntry {
    kind: MemKind,
    modified: Option<SystemTime>,
}

/// In-memory filesystem with exact, caller-chosen sizes.
///
/// Paths are absolute and `/`-separated. Parents are created on demand.
#[derive(Debug)]
pub struct MemoryFs {
    entries: RwLock<BTreeMap<PathBuf, MemEntry>>,
}

impl Default for MemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFs {
    pub fn new() -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(PathBuf::from("/"), Self::dir_entry());
        Self {
            entries: RwLock::new(entries),
        }
    }

    fn dir_entry() -> MemEntry {
        MemEntry {
            kind: MemKind::Dir {
                denied: false,
                stat_size: MEMORY_DIR_STAT_SIZE,
            },
            modified: None,
        }
    }

    fn ensure_parents(entries: &mut BTreeMap<PathBuf, MemEntry>, path: &Path) {
        for ancestor in path.ancestors().skip(1) {
            entries
                .entry(ancestor.to_path_buf())
                .or_insert_with(Self::dir_entry);
        }
    }

    pub fn add_dir(&self, path: impl AsRef<Path>) -> &Self {
        let path = normalize(path.as_ref());
        let mut entries = self.entries.write();
        Self::ensure_parents(&mut entries, &path);
        entries.entry(path).or_insert_with(Self::dir_entry);
        self
    }

    pub fn add_file(&self, path: impl AsRef<Path>, size: u64) -> &Self {
        self.insert_file(path.as_ref(), size, None, None)
    }

    pub fn add_file_modified(
        &self,
        path: impl AsRef<Path>,
        size: u64,
        modified: SystemTime,
    ) -> &Self {
        self.insert_file(path.as_ref(), size, None, Some(modified))
    }

    /// A file whose on-disk footprint differs from its length.
    pub fn add_sparse_file(&self, path: impl AsRef<Path>, size: u64, allocated: u64) -> &Self {
        self.insert_file(path.as_ref(), size, Some(allocated), None)
    }

    /// A text file whose size is the length of `contents`.
    pub fn add_text_file(&self, path: impl AsRef<Path>, contents: &str) -> &Self {
        self.insert_file(path.as_ref(), contents.len() as u64, None, None);
        let path = normalize(path.as_ref());
        if let Some(MemEntry {
            kind: MemKind::File { contents: slot, .. },
            ..
        }) = self.entries.write().get_mut(&path)
        {
            *slot = Some(contents.to_string());
        }
        self
    }

    fn insert_file(
        &self,
        path: &Path,
        size: u64,
        allocated: Option<u64>,
        modified: Option<SystemTime>,
    ) -> &Self {
        let path = normalize(path);
        let mut entries = self.entries.write();
        Self::ensure_parents(&mut entries, &path);
        entries.insert(
            path,
            MemEntry {
                kind: MemKind::File {
                    size,
                    allocated,
                    contents: None,
                },
                modified,
            },
        );
        self
    }

    pub fn add_symlink(&self, path: impl AsRef<Path>, target: impl AsRef<Path>) -> &Self {
        let path = normalize(path.as_ref());
        let mut entries = self.entries.write();
        Self::ensure_parents(&mut entries, &path);
        entries.insert(
            path,
            MemEntry {
                kind: MemKind::Symlink {
                    target: target.as_ref().to_path_buf(),
                },
                modified: None,
            },
        );
        self
    }

    /// Make enumeration of a directory fail with `PermissionDenied`.
    pub fn deny(&self, path: impl AsRef<Path>) -> &Self {
        let path = normalize(path.as_ref());
        if let Some(MemEntry {
            kind: MemKind::Dir { denied, .. },
            ..
        }) = self.entries.write().get_mut(&path)
        {
            *denied = true;
        }
        self
    }

    /// Remove an entry and everything below it.
    pub fn remove(&self, path: impl AsRef<Path>) -> io::Result<()> {
        let path = normalize(path.as_ref());
        let mut entries = self.entries.write();
        if entries.remove(&path).is_none() {
            return Err(io::Error::from(io::ErrorKind::NotFound));
        }
        entries.retain(|p, _| !p.starts_with(&path));
        Ok(())
    }

    pub fn exists(&self, path: impl AsRef<Path>) -> bool {
        self.entries.read().contains_key(&normalize(path.as_ref()))
    }

    fn lookup(&self, path: &Path) -> io::Result<MemEntry> {
        self.entries
            .read()
            .get(&normalize(path))
            .cloned()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
    }
}

impl FileSystem for MemoryFs {
    fn canonicalize(&self, path: &Path) -> io::Result<PathBuf> {
        if !path.is_absolute() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "path must be absolute",
            ));
        }
        let normalized = normalize(path);
        self.lookup(&normalized)?;
        Ok(normalized)
    }

    fn symlink_metadata(&self, path: &Path) -> io::Result<EntryMetadata> {
        let entry = self.lookup(path)?;
        let meta = match entry.kind {
            MemKind::File {
                size, allocated, ..
            } => EntryMetadata {
                is_dir: false,
                is_symlink: false,
                total_allocated_size: Some(allocated.unwrap_or(size)),
                allocated_size: Some(size),
                logical_size: Some(size),
                modified: entry.modified,
            },
            MemKind::Dir { stat_size, .. } => EntryMetadata {
                is_dir: true,
                is_symlink: false,
                total_allocated_size: Some(stat_size),
                allocated_size: Some(stat_size),
                logical_size: Some(stat_size),
                modified: entry.modified,
            },
            MemKind::Symlink { ref target } => EntryMetadata {
                is_dir: false,
                is_symlink: true,
                logical_size: Some(target.as_os_str().len() as u64),
                ..EntryMetadata::default()
            },
        };
        Ok(meta)
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        let path = normalize(path);
        let entries = self.entries.read();
        match entries.get(&path).map(|e| &e.kind) {
            None => Err(io::Error::from(io::ErrorKind::NotFound)),
            Some(MemKind::Dir { denied: true, .. }) => {
                Err(io::Error::from(io::ErrorKind::PermissionDenied))
            }
            Some(MemKind::Dir { .. }) => Ok(entries
                .keys()
                .filter(|p| p.parent() == Some(path.as_path()))
                .cloned()
                .collect()),
            Some(_) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "not a directory",
            )),
        }
    }

    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        match self.lookup(path)?.kind {
            MemKind::File {
                contents: Some(text),
                ..
            } => Ok(text),
            MemKind::File { .. } => Err(io::Error::from(io::ErrorKind::InvalidData)),
            _ => Err(io::Error::new(io::ErrorKind::InvalidInput, "not a file")),
        }
    }

    fn stat_size(&self, path: &Path) -> io::Result<u64> {
        match self.lookup(path)?.kind {
            MemKind::File { size, .. } => Ok(size),
            MemKind::Dir { stat_size, .. } => Ok(stat_size),
            MemKind::Symlink { target } => self.stat_size(&target),
        }
    }
}

/// Lexical normalization: drops `.` and trailing separators, folds `..`.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() {
        out.push("/");
    }
    out
}
