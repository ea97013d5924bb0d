/// Error types for snapshot operations
///
/// Every failure a create/restore can hit maps to exactly one variant here.
/// The binary decides how to present them; the library never exits.

use std::path::PathBuf;
use thiserror::Error;

/// Hint shown whenever the daemon cannot be reached
pub const DAEMON_HINT: &str = "Ensure that the Docker daemon is up and running.";

/// A running container holding a read-write mount of the target volume
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockingContainer {
    pub name: String,
    pub short_id: String,
}

impl std::fmt::Display for BlockingContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.short_id)
    }
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Unable to resolve path: {}", .0.display())]
    PathResolution(PathBuf),

    #[error("Snapshot file not found: {}", .0.display())]
    SnapshotNotFound(PathBuf),

    #[error("Failed to create directory {}: {source}", .path.display())]
    DirectoryCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unable to reach the Docker daemon ({0}). {}", DAEMON_HINT)]
    EngineUnreachable(String),

    #[error("Volume '{0}' does not exist.")]
    VolumeNotFound(String),

    #[error("Failed to inspect volume '{volume}': {reason}")]
    VolumeInspect { volume: String, reason: String },

    #[error("Volume '{volume}' is in use by {} running container(s). Please stop them and try again.", .containers.len())]
    VolumeInUse {
        volume: String,
        containers: Vec<BlockingContainer>,
    },

    #[error("Invalid snapshot file format: {0}")]
    UnsupportedFormat(String),

    #[error("Failed to provision helper image: {0}")]
    ImageProvision(String),

    #[error("Container creation failed: {0}")]
    ContainerCreate(String),

    #[error("Failed to start container: {0}")]
    ContainerStart(String),

    #[error("Container execution error: {0}")]
    ContainerWait(String),

    #[error("Container exited with status code: {0}")]
    NonZeroExit(i64),
}

pub type SnapshotResult<T> = std::result::Result<T, SnapshotError>;
