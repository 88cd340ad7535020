use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Scan-level failures. Per-node problems never reach this type; they are
/// absorbed by the walker.
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Path does not exist: {}", .0.display())]
    PathNotFound(PathBuf),

    #[error("Permission denied: {}", .0.display())]
    PermissionDenied(PathBuf),

    #[error("Invalid path {}: {reason}", path.display())]
    InvalidPath { path: PathBuf, reason: String },

    #[error("Scan already in progress")]
    Busy,

    #[error("Failed to scan {}: {source}", path.display())]
    Unknown {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ScanError {
    /// Classify an I/O error raised against the scan root.
    pub fn from_io(path: &Path, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => ScanError::PathNotFound(path.to_path_buf()),
            io::ErrorKind::PermissionDenied => ScanError::PermissionDenied(path.to_path_buf()),
            io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => ScanError::InvalidPath {
                path: path.to_path_buf(),
                reason: err.to_string(),
            },
            _ => ScanError::Unknown {
                path: path.to_path_buf(),
                source: err,
            },
        }
    }
}

/// Per-item deletion failure. Batches report these next to the node they
/// belong to instead of aborting.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeletionError {
    #[error("Path does not exist: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Failed to move {} to trash: {message}", path.display())]
    Trash { path: PathBuf, message: String },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Could not determine data directory")]
    NoDataDir,

    #[error("Settings I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to parse settings: {0}")]
    Parse(#[from] serde_json::Error),
}
