/// Constants shared across dvs

/// Application directory name under the user's config dir
pub const APP_NAME: &str = "dvs";

/// Config file name inside the application directory
pub const CONFIG_FILE: &str = "config.toml";

/// Repository of the helper image when none is configured
pub const DEFAULT_HELPER_REPO: &str = "busybox";
