/// Helper utilities for dvs

use std::path::{Component, Path, PathBuf};

use crate::core::error::{SnapshotError, SnapshotResult};

/// Make `path` absolute against the working directory and clean it lexically
pub fn absolute_path(path: &Path) -> SnapshotResult<PathBuf> {
    if path.as_os_str().is_empty() {
        return Err(SnapshotError::PathResolution(path.to_path_buf()));
    }

    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|_| SnapshotError::PathResolution(path.to_path_buf()))?
            .join(path)
    };

    let mut clean = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                clean.pop();
            }
            other => clean.push(other.as_os_str()),
        }
    }

    Ok(clean)
}

/// Absolute directory that holds (or will hold) the file at `path`
pub fn resolve_output_dir(path: &Path) -> SnapshotResult<PathBuf> {
    let absolute = absolute_path(path)?;
    absolute
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| SnapshotError::PathResolution(path.to_path_buf()))
}

/// Base file name of `path`; fails for paths like `..` or `/`
pub fn archive_file_name(path: &Path) -> SnapshotResult<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| SnapshotError::PathResolution(path.to_path_buf()))
}

/// Create `dir` and any missing parents with mode 0755
pub fn ensure_dir(dir: &Path) -> SnapshotResult<()> {
    if dir.is_dir() {
        return Ok(());
    }

    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o755);
    }

    builder.create(dir).map_err(|source| SnapshotError::DirectoryCreate {
        path: dir.to_path_buf(),
        source,
    })
}

/// Format bytes to human-readable size
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}

/// Format elapsed seconds to human-readable string
pub fn format_duration(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;

    if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}
