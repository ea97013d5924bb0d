/// Helper image provisioning
///
/// The helper container runs a minimal userland image tagged `<repo>:<arch>`.
/// Lookup order: local image, then the archive bundled into this binary,
/// then a registry pull of `<repo>:latest` (the only step needing network).

use bytes::Bytes;
use rust_embed::RustEmbed;
use tracing::{info, warn};

use crate::core::docker::{Engine, EngineError};
use crate::core::error::{SnapshotError, SnapshotResult};

/// Image archives produced by `docker save`, named `<repo>_<arch>.tar`
#[derive(RustEmbed)]
#[folder = "images/"]
struct BundledImages;

/// Tag used when falling back to the registry
const PULL_TAG: &str = "latest";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageOptions {
    /// Repository of the helper image, e.g. `busybox`
    pub repo: String,
    /// Fall back to a registry pull when nothing local matches
    pub allow_pull: bool,
}

impl Default for ImageOptions {
    fn default() -> Self {
        Self {
            repo: crate::utils::DEFAULT_HELPER_REPO.to_string(),
            allow_pull: true,
        }
    }
}

/// Map a Rust target architecture name onto the engine's platform naming
pub fn normalize_arch(arch: &str) -> Option<&'static str> {
    match arch {
        "x86_64" => Some("amd64"),
        "aarch64" => Some("arm64"),
        "arm" => Some("arm"),
        "x86" => Some("386"),
        "powerpc64" => Some("ppc64le"),
        "s390x" => Some("s390x"),
        "riscv64" => Some("riscv64"),
        _ => None,
    }
}

/// Architecture of the machine this binary was built for, in engine naming
pub fn host_arch() -> SnapshotResult<&'static str> {
    let arch = std::env::consts::ARCH;
    normalize_arch(arch)
        .ok_or_else(|| SnapshotError::ImageProvision(format!("Unsupported architecture: {}", arch)))
}

/// Bundled image archive for `repo` on `arch`, if this build carries one
pub fn load_embedded_image(repo: &str, arch: &str) -> Option<Bytes> {
    let name = format!("{}_{}.tar", repo, arch);
    BundledImages::get(&name).map(|file| Bytes::from(file.data.into_owned()))
}

/// Make sure a helper image is present and return the reference to run
pub async fn ensure_helper_image<E: Engine + ?Sized>(
    engine: &E,
    options: &ImageOptions,
    arch: &str,
) -> SnapshotResult<String> {
    provision(engine, options, arch, || load_embedded_image(&options.repo, arch)).await
}

async fn provision<E, F>(
    engine: &E,
    options: &ImageOptions,
    arch: &str,
    bundled: F,
) -> SnapshotResult<String>
where
    E: Engine + ?Sized,
    F: FnOnce() -> Option<Bytes>,
{
    let reference = format!("{}:{}", options.repo, arch);

    match engine.inspect_image(&reference).await {
        Ok(()) => {
            info!("using local helper image {}", reference);
            return Ok(reference);
        }
        Err(EngineError::Unreachable(reason)) => {
            return Err(SnapshotError::EngineUnreachable(reason));
        }
        Err(EngineError::NotFound(_)) => {
            info!("helper image {} not present locally", reference);
        }
        Err(EngineError::Api(reason)) => {
            warn!("inspecting {} failed, trying to provision it: {}", reference, reason);
        }
    }

    if let Some(archive) = bundled() {
        info!("loading bundled helper image {} ({} bytes)", reference, archive.len());
        match engine.load_image(archive).await {
            // The archive may carry a different tag, so confirm before trusting it
            Ok(()) => match engine.inspect_image(&reference).await {
                Ok(()) => return Ok(reference),
                Err(e) => warn!("bundled archive did not provide {}: {}", reference, e),
            },
            Err(e) => warn!("failed to load bundled helper image: {}", e),
        }
    }

    if !options.allow_pull {
        return Err(SnapshotError::ImageProvision(format!(
            "{} is not available locally or bundled, and registry pulls are disabled",
            reference
        )));
    }

    let fallback = format!("{}:{}", options.repo, PULL_TAG);
    info!("pulling {} from the registry", fallback);
    engine
        .pull_image(&fallback)
        .await
        .map_err(|e| SnapshotError::ImageProvision(format!("Failed to pull {}: {}", fallback, e)))?;

    Ok(fallback)
}
