/// Snapshot archive formats
///
/// The file extension decides both whether a name is accepted and which
/// compression flag tar gets inside the helper container.

use crate::core::error::{SnapshotError, SnapshotResult};

/// Mount point of the source side inside the helper container
pub const SOURCE_MOUNT: &str = "/source";
/// Mount point of the destination side inside the helper container
pub const DEST_MOUNT: &str = "/dest";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Tar,
    Gzip,
    Bzip2,
    Xz,
}

/// Accepted suffixes. Longer suffixes first so `.tar.gz` wins over `.tar`.
const SUFFIXES: &[(&str, ArchiveFormat)] = &[
    (".tar.gz", ArchiveFormat::Gzip),
    (".tar.bz2", ArchiveFormat::Bzip2),
    (".tar.xz", ArchiveFormat::Xz),
    (".tgz", ArchiveFormat::Gzip),
    (".tar", ArchiveFormat::Tar),
];

impl ArchiveFormat {
    /// Detect the format from a file name, ignoring case
    pub fn from_file_name(filename: &str) -> Option<Self> {
        let lower = filename.to_lowercase();
        SUFFIXES
            .iter()
            .find(|(suffix, _)| lower.ends_with(suffix))
            .map(|(_, format)| *format)
    }

    /// Short tar option selecting the compressor
    pub fn tar_flag(&self) -> &'static str {
        match self {
            ArchiveFormat::Tar => "",
            ArchiveFormat::Gzip => "z",
            ArchiveFormat::Bzip2 => "j",
            ArchiveFormat::Xz => "J",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ArchiveFormat::Tar => "tar",
            ArchiveFormat::Gzip => "tar+gzip",
            ArchiveFormat::Bzip2 => "tar+bzip2",
            ArchiveFormat::Xz => "tar+xz",
        }
    }

    /// tar invocation packing `/source` into `/dest/<filename>`
    pub fn pack_command(&self, filename: &str) -> Vec<String> {
        vec![
            "tar".to_string(),
            format!("-c{}vf", self.tar_flag()),
            format!("{}/{}", DEST_MOUNT, filename),
            "-C".to_string(),
            SOURCE_MOUNT.to_string(),
            ".".to_string(),
        ]
    }

    /// tar invocation unpacking `/source/<filename>` into `/dest`
    pub fn unpack_command(&self, filename: &str) -> Vec<String> {
        vec![
            "tar".to_string(),
            format!("-x{}vf", self.tar_flag()),
            format!("{}/{}", SOURCE_MOUNT, filename),
            "-C".to_string(),
            DEST_MOUNT.to_string(),
        ]
    }
}

impl std::fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accept the name if it carries one of the supported archive extensions
pub fn validate_archive_name(filename: &str) -> SnapshotResult<ArchiveFormat> {
    ArchiveFormat::from_file_name(filename)
        .ok_or_else(|| SnapshotError::UnsupportedFormat(filename.to_string()))
}
