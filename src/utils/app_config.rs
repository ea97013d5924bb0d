/// Application configuration management
/// Reads user preferences from ~/.config/dvs/config.toml
///
/// Example:
/// ```toml
/// helper_repo = "busybox"
/// allow_pull = false
/// wait_timeout = "2h"
/// ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::image::ImageOptions;
use crate::utils::{APP_NAME, CONFIG_FILE, DEFAULT_HELPER_REPO};

#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    /// Repository of the helper image (tagged per architecture)
    pub helper_repo: Option<String>,
    /// Allow pulling `<helper_repo>:latest` when no local or bundled image matches
    pub allow_pull: Option<bool>,
    /// Upper bound on the helper container run, humantime syntax ("30m", "2h")
    pub wait_timeout: Option<String>,
}

impl AppConfig {
    /// Get config file path
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Could not determine the user config directory")?;

        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        Self::load_from(&path)
    }

    /// Load configuration from `path`; a missing file yields defaults
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        // Surface a bad duration at load time rather than mid-operation
        config.wait_timeout()?;

        Ok(config)
    }

    /// Helper image settings, with defaults applied
    pub fn image_options(&self) -> ImageOptions {
        ImageOptions {
            repo: self
                .helper_repo
                .clone()
                .unwrap_or_else(|| DEFAULT_HELPER_REPO.to_string()),
            allow_pull: self.allow_pull.unwrap_or(true),
        }
    }

    /// Parsed wait timeout; `None` waits indefinitely
    pub fn wait_timeout(&self) -> Result<Option<Duration>> {
        self.wait_timeout
            .as_deref()
            .map(|raw| {
                humantime::parse_duration(raw)
                    .with_context(|| format!("Invalid wait_timeout '{}'", raw))
            })
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load_from(&dir.path().join("config.toml")).unwrap();

        assert_eq!(config, AppConfig::default());
        assert_eq!(config.image_options(), ImageOptions::default());
        assert_eq!(config.wait_timeout().unwrap(), None);
    }

    #[test]
    fn test_load_config_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "helper_repo = \"alpine\"").unwrap();
        writeln!(file, "allow_pull = false").unwrap();
        writeln!(file, "wait_timeout = \"90s\"").unwrap();

        let config = AppConfig::load_from(file.path()).unwrap();
        let image = config.image_options();

        assert_eq!(image.repo, "alpine");
        assert!(!image.allow_pull);
        assert_eq!(config.wait_timeout().unwrap(), Some(Duration::from_secs(90)));
    }

    #[test]
    fn test_bad_timeout_is_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "wait_timeout = \"soon\"").unwrap();

        assert!(AppConfig::load_from(file.path()).is_err());
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "helper_image = \"busybox\"").unwrap();

        assert!(AppConfig::load_from(file.path()).is_err());
    }
}
