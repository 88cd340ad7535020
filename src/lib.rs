//! Disk usage scanning core.
//!
//! [`ScanEngine`] walks a directory in two phases on a worker thread,
//! keeps the resulting [`FileTree`] and a [`PathCache`] for O(1) path
//! lookups, and reconciles both after a [`DeletionCoordinator`] batch.

pub mod deletion;
pub mod engine;
pub mod error;
pub mod fs;
pub mod logging;
pub mod node;
pub mod path_cache;
pub mod progress;
pub mod scanner;
pub mod settings;
pub mod size;

pub use deletion::{DeletionCoordinator, DeletionOutcome, QueuedNode, SystemTrash, Trash};
pub use engine::{EngineSnapshot, ReconcileReport, ScanEngine, ScanEvent, ScanPhase, ScanSummary};
pub use error::{ConfigError, DeletionError, ScanError};
pub use fs::{EntryMetadata, FileSystem, MemoryFs, OsFileSystem};
pub use node::{FileTree, Node, NodeCounts, NodeId, NodeSnapshot, SortOrder};
pub use path_cache::PathCache;
pub use progress::ScanProgress;
pub use scanner::ScanOptions;
pub use settings::Settings;
pub use size::{format_size, resolve_size};
