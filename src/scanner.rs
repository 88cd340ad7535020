//! Two-phase directory walker.
//!
//! Phase 1 counts every entry below the root so progress has a
//! denominator. Phase 2 walks again, resolves sizes, builds the
//! [`FileTree`] and registers each node in the [`PathCache`] as it is
//! created. Both phases use an explicit stack and poll the cancellation
//! token before every directory and every entry, so a cancel lands within
//! one directory's width regardless of depth.
//!
//! Symlinks are skipped outright: never followed, counted or sized.
//! Entries that cannot be read are skipped; a directory that cannot be
//! enumerated keeps its own stat size instead of a child sum.

use crate::error::ScanError;
use crate::fs::{EntryMetadata, FileSystem};
use crate::node::{FileTree, Node, NodeId, SortOrder};
use crate::path_cache::PathCache;
use crate::progress::{ProgressThrottle, ScanProgress, DEFAULT_PROGRESS_INTERVAL};
use crate::size::resolve_size;
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Per-scan cancellation token.
pub struct ScannerState {
    is_cancelled: AtomicBool,
}

impl ScannerState {
    pub fn new() -> Self {
        Self { is_cancelled: AtomicBool::new(false) }
    }

    /// Cancel the scan - uses Release ordering to ensure visibility across threads
    pub fn cancel(&self) {
        self.is_cancelled.store(true, Ordering::Release);
    }

    /// Check if scan is cancelled - uses Acquire ordering to synchronize with cancel()
    pub fn is_cancelled(&self) -> bool {
        self.is_cancelled.load(Ordering::Acquire)
    }
}

impl Default for ScannerState {
    fn default() -> Self { Self::new() }
}

/// Raised at any check point once the token is cancelled. Not an error:
/// it only unwinds the walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interrupted;

#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Gitignore-style patterns; matches are skipped like symlinks
    pub ignore_patterns: Vec<String>,
    pub show_hidden_files: bool,
    pub progress_interval: Duration,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            ignore_patterns: Vec::new(),
            show_hidden_files: true,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }
}

/// Parse a .spaceignore file and return patterns.
/// Format is similar to .gitignore:
/// - One pattern per line
/// - Lines starting with # are comments
/// - Empty lines are ignored
fn parse_spaceignore(fs: &dyn FileSystem, root_path: &Path) -> Vec<String> {
    match fs.read_to_string(&root_path.join(".spaceignore")) {
        Ok(content) => content
            .lines()
            .map(|line| line.trim())
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(|line| line.to_string())
            .collect(),
        Err(_) => Vec::new(),
    }
}

fn build_ignore_matcher(root_path: &Path, patterns: &[String]) -> Option<Gitignore> {
    if patterns.is_empty() {
        return None;
    }

    let mut builder = GitignoreBuilder::new(root_path);
    for pattern in patterns {
        if let Err(err) = builder.add_line(None, pattern) {
            warn!(%pattern, %err, "invalid ignore pattern");
        }
    }

    builder.build().ok()
}

/// Decides which entries the walk pretends do not exist.
struct EntryFilter {
    root: PathBuf,
    matcher: Option<Gitignore>,
    show_hidden: bool,
}

impl EntryFilter {
    fn skips(&self, path: &Path, meta: &EntryMetadata) -> bool {
        if meta.is_symlink {
            return true;
        }
        if !self.show_hidden
            && path
                .file_name()
                .is_some_and(|n| n.to_string_lossy().starts_with('.'))
        {
            return true;
        }
        match &self.matcher {
            Some(matcher) => {
                let relative = path.strip_prefix(&self.root).unwrap_or(path);
                matcher.matched(relative, meta.is_dir).is_ignore()
            }
            None => false,
        }
    }
}

struct Frame {
    id: NodeId,
    entries: std::vec::IntoIter<PathBuf>,
    children: Vec<NodeId>,
}

pub struct Scanner<'a> {
    fs: &'a dyn FileSystem,
    token: &'a ScannerState,
    filter: EntryFilter,
}

impl<'a> Scanner<'a> {
    pub fn new(
        fs: &'a dyn FileSystem,
        token: &'a ScannerState,
        options: &ScanOptions,
        root: &Path,
    ) -> Self {
        let patterns: Vec<String> = options
            .ignore_patterns
            .iter()
            .cloned()
            .chain(parse_spaceignore(fs, root))
            .collect();
        if !patterns.is_empty() {
            debug!(count = patterns.len(), "using ignore patterns");
        }
        Self {
            fs,
            token,
            filter: EntryFilter {
                root: root.to_path_buf(),
                matcher: build_ignore_matcher(root, &patterns),
                show_hidden: options.show_hidden_files,
            },
        }
    }

    /// Canonicalize and validate the scan root. This is the only place a
    /// filesystem error fails the whole scan.
    pub fn resolve_root(
        fs: &dyn FileSystem,
        requested: &Path,
    ) -> Result<(PathBuf, EntryMetadata), ScanError> {
        if requested.as_os_str().is_empty() {
            return Err(ScanError::InvalidPath {
                path: requested.to_path_buf(),
                reason: "empty path".to_string(),
            });
        }
        let root = fs
            .canonicalize(requested)
            .map_err(|e| ScanError::from_io(requested, e))?;
        let meta = fs
            .symlink_metadata(&root)
            .map_err(|e| ScanError::from_io(&root, e))?;
        if !meta.is_dir {
            return Err(ScanError::InvalidPath {
                path: root,
                reason: "not a directory".to_string(),
            });
        }
        fs.read_dir(&root).map_err(|e| ScanError::from_io(&root, e))?;
        Ok((root, meta))
    }

    fn check(&self) -> Result<(), Interrupted> {
        if self.token.is_cancelled() {
            Err(Interrupted)
        } else {
            Ok(())
        }
    }

    /// Metadata of a child entry, or `None` if it should not be visited.
    fn visit(&self, path: &Path) -> Option<EntryMetadata> {
        match self.fs.symlink_metadata(path) {
            Ok(meta) if self.filter.skips(path, &meta) => None,
            Ok(meta) => Some(meta),
            Err(err) => {
                debug!(path = %path.display(), %err, "skipping unreadable entry");
                None
            }
        }
    }

    /// Phase 1: number of entries the build phase will visit, root included.
    pub fn count<F: FnMut(&ScanProgress)>(
        &self,
        root: &Path,
        throttle: &mut ProgressThrottle<F>,
    ) -> Result<u64, Interrupted> {
        let mut total = 1u64;
        let mut stack = vec![root.to_path_buf()];

        while let Some(dir) = stack.pop() {
            self.check()?;
            throttle.touch(&dir);
            let children = match self.fs.read_dir(&dir) {
                Ok(children) => children,
                Err(err) => {
                    debug!(dir = %dir.display(), %err, "cannot enumerate, not counting below");
                    continue;
                }
            };
            for child in children {
                self.check()?;
                let Some(meta) = self.visit(&child) else {
                    continue;
                };
                total += 1;
                if meta.is_dir {
                    stack.push(child);
                }
            }
        }

        Ok(total)
    }

    /// Phase 2: build the sized tree. Every node is inserted into `cache`
    /// under `generation` as soon as it exists.
    pub fn build<F: FnMut(&ScanProgress)>(
        &self,
        root: &Path,
        root_meta: &EntryMetadata,
        cache: &PathCache,
        generation: u64,
        throttle: &mut ProgressThrottle<F>,
    ) -> Result<FileTree, Interrupted> {
        self.check()?;
        let mut tree = FileTree::new(Node::new(root.to_path_buf(), true, root_meta.modified));
        let root_id = tree.root_id();
        cache.put_in_generation(generation, root.to_path_buf(), root_id);
        throttle.record(root);

        let mut stack: Vec<Frame> = Vec::new();
        match self.fs.read_dir(root) {
            Ok(entries) => stack.push(Frame {
                id: root_id,
                entries: entries.into_iter(),
                children: Vec::new(),
            }),
            Err(err) => {
                debug!(dir = %root.display(), %err, "root vanished after validation");
                let size = resolve_size(self.fs, root, root_meta);
                if let Some(node) = tree.get_mut(root_id) {
                    node.set_size(size);
                }
            }
        }

        loop {
            self.check()?;
            let Some(frame) = stack.last_mut() else {
                break;
            };

            let Some(path) = frame.entries.next() else {
                // Directory finished: publish its children in one step,
                // then total and order them.
                if let Some(done) = stack.pop() {
                    tree.set_children(done.id, done.children);
                    tree.recompute_size(done.id);
                    tree.sort_children(done.id, SortOrder::Size);
                }
                continue;
            };

            let Some(meta) = self.visit(&path) else {
                continue;
            };
            throttle.record(&path);

            let id = tree.insert(frame.id, Node::new(path.clone(), meta.is_dir, meta.modified));
            frame.children.push(id);
            cache.put_in_generation(generation, path.clone(), id);

            if meta.is_dir {
                match self.fs.read_dir(&path) {
                    Ok(entries) => {
                        stack.push(Frame {
                            id,
                            entries: entries.into_iter(),
                            children: Vec::new(),
                        });
                        continue;
                    }
                    Err(err) => {
                        debug!(dir = %path.display(), %err, "cannot enumerate, using own size");
                    }
                }
            }

            let size = resolve_size(self.fs, &path, &meta);
            if let Some(node) = tree.get_mut(id) {
                node.set_size(size);
            }
        }

        Ok(tree)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{MemoryFs, MEMORY_DIR_STAT_SIZE};

    fn scan(fs: &MemoryFs, root: &str, options: &ScanOptions) -> (u64, FileTree, PathCache) {
        let token = ScannerState::new();
        let cache = PathCache::new();
        let generation = cache.clear();
        let (root, meta) = Scanner::resolve_root(fs, Path::new(root)).unwrap();
        let scanner = Scanner::new(fs, &token, options, &root);
        let mut throttle = ProgressThrottle::new(Duration::ZERO, |_: &ScanProgress| {});
        let total = scanner.count(&root, &mut throttle).unwrap();
        let tree = scanner
            .build(&root, &meta, &cache, generation, &mut throttle)
            .unwrap();
        (total, tree, cache)
    }

    fn project() -> MemoryFs {
        let fs = MemoryFs::new();
        fs.add_file("/tmp/project/a.txt", 100)
            .add_file("/tmp/project/b/c.txt", 200);
        fs
    }

    #[test]
    fn test_scan_sizes_and_counts() {
        let fs = project();
        let (total, tree, cache) = scan(&fs, "/tmp/project", &ScanOptions::default());

        assert_eq!(total, 4);
        assert_eq!(tree.total_items(), 4);
        assert_eq!(tree.root().size(), 300);
        let b = cache.get(Path::new("/tmp/project/b")).unwrap();
        assert_eq!(tree.get(b).unwrap().size(), 200);
        assert_eq!(tree.file_count(), 2);
        assert_eq!(tree.dir_count(), 1);
        // largest first
        let names: Vec<_> = tree.children(tree.root_id()).map(|n| n.name().to_string()).collect();
        assert_eq!(names, ["b", "a.txt"]);
    }

    #[test]
    fn test_symlinks_are_skipped() {
        let fs = project();
        fs.add_symlink("/tmp/project/loop", "/tmp/project");
        let (total, tree, cache) = scan(&fs, "/tmp/project", &ScanOptions::default());
        assert_eq!(total, 4);
        assert_eq!(tree.root().size(), 300);
        assert!(cache.get(Path::new("/tmp/project/loop")).is_none());
    }

    #[test]
    fn test_denied_directory_falls_back_to_own_size() {
        let fs = project();
        fs.add_file("/tmp/project/locked/secret", 999).deny("/tmp/project/locked");
        let (total, tree, cache) = scan(&fs, "/tmp/project", &ScanOptions::default());

        // the locked directory is counted, its contents are not
        assert_eq!(total, 5);
        let locked = cache.get(Path::new("/tmp/project/locked")).unwrap();
        let node = tree.get(locked).unwrap();
        assert!(node.is_dir());
        assert!(node.children().is_empty());
        assert_eq!(node.size(), MEMORY_DIR_STAT_SIZE);
        assert_eq!(tree.root().size(), 300 + MEMORY_DIR_STAT_SIZE);
    }

    #[test]
    fn test_ignore_patterns_and_hidden() {
        let fs = project();
        fs.add_file("/tmp/project/node_modules/x.js", 5000)
            .add_file("/tmp/project/.cache", 70);
        let options = ScanOptions {
            ignore_patterns: vec!["node_modules".to_string()],
            show_hidden_files: false,
            ..ScanOptions::default()
        };
        let (total, tree, cache) = scan(&fs, "/tmp/project", &options);
        assert_eq!(total, 4);
        assert_eq!(tree.root().size(), 300);
        assert!(cache.get(Path::new("/tmp/project/node_modules")).is_none());
    }

    #[test]
    fn test_spaceignore_patterns() {
        let fs = project();
        fs.add_file("/tmp/project/skipme/big.bin", 50_000)
            .add_file("/tmp/project/b/build.log", 40)
            .add_text_file(
                "/tmp/project/.spaceignore",
                "# generated output\n\nskipme\n  *.log  \n",
            );
        let (total, tree, cache) = scan(&fs, "/tmp/project", &ScanOptions::default());

        // root, a.txt, b, c.txt and the .spaceignore file itself
        assert_eq!(total, 5);
        assert_eq!(tree.total_items(), 5);
        let ignore_len = fs
            .read_to_string(Path::new("/tmp/project/.spaceignore"))
            .unwrap()
            .len() as u64;
        assert_eq!(tree.root().size(), 300 + ignore_len);
        assert!(cache.get(Path::new("/tmp/project/skipme")).is_none());
        assert!(cache.get(Path::new("/tmp/project/skipme/big.bin")).is_none());
        assert!(cache.get(Path::new("/tmp/project/b/build.log")).is_none());
        assert!(cache.get(Path::new("/tmp/project/.spaceignore")).is_some());
    }

    #[test]
    fn test_spaceignore_comments_only() {
        let fs = project();
        fs.add_text_file("/tmp/project/.spaceignore", "# b\n\n   \n#a.txt\n");
        assert!(parse_spaceignore(&fs, Path::new("/tmp/project")).is_empty());
        let (total, _, cache) = scan(&fs, "/tmp/project", &ScanOptions::default());
        assert_eq!(total, 5);
        assert!(cache.get(Path::new("/tmp/project/b")).is_some());
    }

    #[test]
    fn test_spaceignore_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".spaceignore"), "# comment\n\nskipme\n").unwrap();
        std::fs::create_dir(dir.path().join("skipme")).unwrap();
        std::fs::write(dir.path().join("skipme/big.bin"), vec![0u8; 50_000]).unwrap();
        std::fs::write(dir.path().join("keep.txt"), b"keep").unwrap();

        let fs = crate::fs::OsFileSystem;
        let token = ScannerState::new();
        let cache = PathCache::new();
        let (root, meta) = Scanner::resolve_root(&fs, dir.path()).unwrap();
        assert_eq!(parse_spaceignore(&fs, &root), vec!["skipme".to_string()]);

        let scanner = Scanner::new(&fs, &token, &ScanOptions::default(), &root);
        let mut throttle = ProgressThrottle::new(Duration::ZERO, |_: &ScanProgress| {});
        // root, .spaceignore, keep.txt
        assert_eq!(scanner.count(&root, &mut throttle).unwrap(), 3);
        let tree = scanner.build(&root, &meta, &cache, 0, &mut throttle).unwrap();

        assert_eq!(tree.total_items(), 3);
        assert!(cache.get(&root.join("skipme")).is_none());
        assert!(cache.get(&root.join("keep.txt")).is_some());
        assert!(tree.root().size() < 50_000);
    }

    #[test]
    fn test_cache_matches_tree() {
        let fs = project();
        fs.add_file("/tmp/project/b/d/e.bin", 1).add_dir("/tmp/project/empty");
        let (_, tree, cache) = scan(&fs, "/tmp/project", &ScanOptions::default());

        let reachable = tree.descendants(tree.root_id());
        assert_eq!(reachable.len(), cache.len());
        for id in reachable {
            let node = tree.get(id).unwrap();
            assert_eq!(cache.get(node.path()), Some(id));
        }
    }

    #[test]
    fn test_cancelled_token_interrupts_both_phases() {
        let fs = project();
        let token = ScannerState::new();
        token.cancel();
        let cache = PathCache::new();
        let root = Path::new("/tmp/project");
        let meta = fs.symlink_metadata(root).unwrap();
        let scanner = Scanner::new(&fs, &token, &ScanOptions::default(), root);
        let mut throttle = ProgressThrottle::new(Duration::ZERO, |_: &ScanProgress| {});

        assert_eq!(scanner.count(root, &mut throttle), Err(Interrupted));
        assert!(scanner.build(root, &meta, &cache, 0, &mut throttle).is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_resolve_root_errors() {
        let fs = project();
        assert!(matches!(
            Scanner::resolve_root(&fs, Path::new("/nope")),
            Err(ScanError::PathNotFound(_))
        ));
        assert!(matches!(
            Scanner::resolve_root(&fs, Path::new("/tmp/project/a.txt")),
            Err(ScanError::InvalidPath { .. })
        ));
        fs.add_dir("/locked").deny("/locked");
        assert!(matches!(
            Scanner::resolve_root(&fs, Path::new("/locked")),
            Err(ScanError::PermissionDenied(_))
        ));
    }

    #[test]
    fn test_real_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("one.bin"), vec![1u8; 10_000]).unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/two.bin"), vec![2u8; 20_000]).unwrap();

        let fs = crate::fs::OsFileSystem;
        let token = ScannerState::new();
        let cache = PathCache::new();
        let (root, meta) = Scanner::resolve_root(&fs, dir.path()).unwrap();
        let scanner = Scanner::new(&fs, &token, &ScanOptions::default(), &root);
        let mut throttle = ProgressThrottle::new(Duration::ZERO, |_: &ScanProgress| {});
        assert_eq!(scanner.count(&root, &mut throttle).unwrap(), 4);
        let tree = scanner.build(&root, &meta, &cache, 0, &mut throttle).unwrap();

        assert_eq!(tree.total_items(), 4);
        let sub = cache.get(&root.join("sub")).unwrap();
        let children_sum: u64 = tree.children(tree.root_id()).map(|c| c.size()).sum();
        assert_eq!(tree.root().size(), children_sum);
        assert!(tree.get(sub).unwrap().size() > 0);
    }
}
