/// Volume existence and in-use checks
///
/// The in-use check is a point-in-time read. Nothing stops a container from
/// mounting the volume between this check and the helper container starting,
/// so callers get a best-effort guard, not a lock.

use std::collections::HashSet;
use tracing::{debug, info};

use crate::core::docker::{ContainerRef, Engine, EngineError, MountKind};
use crate::core::error::{BlockingContainer, SnapshotError, SnapshotResult};

/// Display length of a container id, matching `docker ps`
const SHORT_ID_LEN: usize = 12;

/// Confirm the volume exists and return the engine's canonical name
pub async fn check_volume<E: Engine + ?Sized>(engine: &E, name: &str) -> SnapshotResult<String> {
    match engine.inspect_volume(name).await {
        Ok(volume) => {
            debug!("volume '{}' resolved to '{}'", name, volume.name);
            Ok(volume.name)
        }
        Err(EngineError::NotFound(_)) => Err(SnapshotError::VolumeNotFound(name.to_string())),
        Err(EngineError::Unreachable(reason)) => Err(SnapshotError::EngineUnreachable(reason)),
        Err(EngineError::Api(reason)) => Err(SnapshotError::VolumeInspect {
            volume: name.to_string(),
            reason,
        }),
    }
}

/// Running containers that mount `name` read-write, one entry per container
pub async fn list_active_writers<E: Engine + ?Sized>(
    engine: &E,
    name: &str,
) -> SnapshotResult<Vec<BlockingContainer>> {
    let containers = engine
        .list_running_with_volume(name)
        .await
        .map_err(|e| match e {
            EngineError::Unreachable(reason) => SnapshotError::EngineUnreachable(reason),
            other => SnapshotError::VolumeInspect {
                volume: name.to_string(),
                reason: format!("failed to list containers using it: {}", other),
            },
        })?;

    let mut seen = HashSet::new();
    let writers = containers
        .iter()
        .filter(|c| writes_to(c, name))
        .filter(|c| seen.insert(c.id.clone()))
        .map(|c| BlockingContainer {
            name: display_name(c),
            short_id: short_id(&c.id),
        })
        .collect();

    Ok(writers)
}

/// Full pre-flight: the volume must exist and have no active writers
pub async fn guard_volume<E: Engine + ?Sized>(engine: &E, name: &str) -> SnapshotResult<String> {
    let volume = check_volume(engine, name).await?;

    let writers = list_active_writers(engine, &volume).await?;
    if !writers.is_empty() {
        return Err(SnapshotError::VolumeInUse {
            volume,
            containers: writers,
        });
    }

    info!("volume '{}' has no active writers", volume);
    Ok(volume)
}

fn writes_to(container: &ContainerRef, volume: &str) -> bool {
    container
        .mounts
        .iter()
        .any(|m| m.kind == MountKind::Volume && m.rw && m.name.as_deref() == Some(volume))
}

fn short_id(id: &str) -> String {
    id.chars().take(SHORT_ID_LEN).collect()
}

fn display_name(container: &ContainerRef) -> String {
    container
        .names
        .first()
        .map(|n| n.trim_start_matches('/').to_string())
        .unwrap_or_default()
}
