pub mod archive;
pub mod docker;
pub mod error;
pub mod image;
pub mod snapshot;
pub mod volume;

pub use docker::{DockerEngine, Engine};
pub use error::{SnapshotError, SnapshotResult};
pub use snapshot::{SnapshotOptions, SnapshotReport, Snapshotter};
