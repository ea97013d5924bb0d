/// Snapshot creation and restore
///
/// Both operations run one auto-removing helper container with two mounts
/// (source and destination) and a tar command, then check its exit status.
/// Nothing is retried and nothing is rolled back: if start fails after a
/// successful create, the engine's auto-remove is left to clean up.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::core::archive::{validate_archive_name, ArchiveFormat, DEST_MOUNT, SOURCE_MOUNT};
use crate::core::docker::{Engine, EngineError, LaunchSpec, MountSpec, WaitOutcome};
use crate::core::error::{SnapshotError, SnapshotResult};
use crate::core::image::{ensure_helper_image, ImageOptions};
use crate::core::volume::guard_volume;
use crate::utils::{archive_file_name, absolute_path, ensure_dir, resolve_output_dir};

/// Lifecycle of one helper container run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunState {
    Idle,
    ImageReady(String),
    ContainerCreated(String),
    ContainerRunning(String),
    Exited(i64),
    Failed(String),
}

#[derive(Debug, Clone, Default)]
pub struct SnapshotOptions {
    pub image: ImageOptions,
    /// Upper bound on the helper container run; `None` waits indefinitely
    pub timeout: Option<Duration>,
}

/// Drives a single helper container from image provisioning to exit
pub struct SnapshotRunner<'a, E: Engine + ?Sized> {
    engine: &'a E,
    options: &'a SnapshotOptions,
    arch: &'a str,
    state: RunState,
}

impl<'a, E: Engine + ?Sized> SnapshotRunner<'a, E> {
    pub fn new(engine: &'a E, options: &'a SnapshotOptions, arch: &'a str) -> Self {
        Self {
            engine,
            options,
            arch,
            state: RunState::Idle,
        }
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    fn transition(&mut self, next: RunState) {
        debug!("helper container: {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    fn fail(&mut self, err: SnapshotError) -> SnapshotError {
        self.transition(RunState::Failed(err.to_string()));
        err
    }

    /// Run `cmd` with `mounts` to completion and return the image used
    pub async fn run(&mut self, cmd: Vec<String>, mounts: Vec<MountSpec>) -> SnapshotResult<String> {
        let engine = self.engine;
        let options = self.options;

        let image = match ensure_helper_image(engine, &options.image, self.arch).await {
            Ok(image) => image,
            Err(e) => return Err(self.fail(e)),
        };
        self.transition(RunState::ImageReady(image.clone()));

        let spec = LaunchSpec {
            image: image.clone(),
            cmd,
            mounts,
            auto_remove: true,
        };
        debug!("launch spec: {:?}", spec);

        let id = match engine.create_container(spec).await {
            Ok(id) => id,
            Err(EngineError::Unreachable(reason)) => {
                return Err(self.fail(SnapshotError::EngineUnreachable(reason)))
            }
            Err(e) => return Err(self.fail(SnapshotError::ContainerCreate(e.to_string()))),
        };
        self.transition(RunState::ContainerCreated(id.clone()));

        // Registered before start so a fast exit followed by auto-remove is not missed
        let mut watch = match engine.watch_container(&id).await {
            Ok(watch) => watch,
            Err(EngineError::Unreachable(reason)) => {
                return Err(self.fail(SnapshotError::EngineUnreachable(reason)))
            }
            Err(e) => return Err(self.fail(SnapshotError::ContainerWait(e.to_string()))),
        };

        match engine.start_container(&id).await {
            Ok(()) => {}
            Err(EngineError::Unreachable(reason)) => {
                return Err(self.fail(SnapshotError::EngineUnreachable(reason)))
            }
            Err(e) => return Err(self.fail(SnapshotError::ContainerStart(e.to_string()))),
        }
        self.transition(RunState::ContainerRunning(id.clone()));

        let outcome = match options.timeout {
            Some(limit) => tokio::time::timeout(limit, watch.outcome())
                .await
                .unwrap_or_else(|_| {
                    WaitOutcome::WaitFailed(format!(
                        "timed out after {}",
                        humantime::format_duration(limit)
                    ))
                }),
            None => watch.outcome().await,
        };

        match outcome {
            WaitOutcome::Stopped(0) => {
                self.transition(RunState::Exited(0));
                Ok(image)
            }
            WaitOutcome::Stopped(code) => {
                self.transition(RunState::Exited(code));
                Err(self.fail(SnapshotError::NonZeroExit(code)))
            }
            WaitOutcome::WaitFailed(reason) => Err(self.fail(SnapshotError::ContainerWait(reason))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Create,
    Restore,
}

/// Outcome of a successful create or restore
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotReport {
    pub mode: Mode,
    pub volume: String,
    pub archive: PathBuf,
    pub format: ArchiveFormat,
    pub image: String,
    pub elapsed: Duration,
}

/// Entry point for both snapshot operations
pub struct Snapshotter<'a, E: Engine + ?Sized> {
    engine: &'a E,
    options: SnapshotOptions,
    arch: String,
}

impl<'a, E: Engine + ?Sized> Snapshotter<'a, E> {
    pub fn new(engine: &'a E, options: SnapshotOptions, arch: impl Into<String>) -> Self {
        Self {
            engine,
            options,
            arch: arch.into(),
        }
    }

    /// Pack the contents of `volume` into the archive at `archive_path`
    pub async fn create_snapshot(&self, volume: &str, archive_path: &Path) -> SnapshotResult<SnapshotReport> {
        let started = Instant::now();

        let filename = archive_file_name(archive_path)?;
        let format = validate_archive_name(&filename)?;
        let output_dir = resolve_output_dir(archive_path)?;
        ensure_dir(&output_dir)?;

        let volume = guard_volume(self.engine, volume).await?;
        info!("Creating snapshot of volume: {}", volume);

        let mounts = vec![
            MountSpec::volume(volume.as_str(), SOURCE_MOUNT).read_only(),
            MountSpec::bind(output_dir.to_string_lossy(), DEST_MOUNT),
        ];

        let mut runner = SnapshotRunner::new(self.engine, &self.options, &self.arch);
        let image = runner.run(format.pack_command(&filename), mounts).await?;

        Ok(SnapshotReport {
            mode: Mode::Create,
            volume,
            archive: output_dir.join(&filename),
            format,
            image,
            elapsed: started.elapsed(),
        })
    }

    /// Unpack the archive at `archive_path` into `volume`
    pub async fn restore_snapshot(&self, archive_path: &Path, volume: &str) -> SnapshotResult<SnapshotReport> {
        let started = Instant::now();

        let filename = archive_file_name(archive_path)?;
        let format = validate_archive_name(&filename)?;
        let archive = absolute_path(archive_path)?;
        if !archive.is_file() {
            return Err(SnapshotError::SnapshotNotFound(archive));
        }
        let input_dir = resolve_output_dir(archive_path)?;

        let volume = guard_volume(self.engine, volume).await?;
        info!("Restoring snapshot from: {}", archive.display());

        let mounts = vec![
            MountSpec::bind(input_dir.to_string_lossy(), SOURCE_MOUNT).read_only(),
            MountSpec::volume(volume.as_str(), DEST_MOUNT),
        ];

        let mut runner = SnapshotRunner::new(self.engine, &self.options, &self.arch);
        let image = runner.run(format.unpack_command(&filename), mounts).await?;

        Ok(SnapshotReport {
            mode: Mode::Restore,
            volume,
            archive,
            format,
            image,
            elapsed: started.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::docker::{
        ContainerRef, EngineResult, ExitWatch, MockEngine, MountKind, MountRef, VolumeInfo,
    };
    use crate::core::error::DAEMON_HINT;
    use async_trait::async_trait;
    use bytes::Bytes;
    use mockall::{predicate, Sequence};
    use tempfile::TempDir;

    fn exited(code: i64) -> ExitWatch {
        ExitWatch::spawn(async move { WaitOutcome::Stopped(code) })
    }

    fn existing_volume(engine: &mut MockEngine, name: &'static str) {
        engine
            .expect_inspect_volume()
            .returning(move |_| Ok(VolumeInfo { name: name.to_string() }));
    }

    fn unused_volume(engine: &mut MockEngine, name: &'static str) {
        existing_volume(engine, name);
        engine.expect_list_running_with_volume().returning(|_| Ok(vec![]));
        engine.expect_inspect_image().returning(|_| Ok(()));
    }

    #[tokio::test]
    async fn test_create_packs_volume_into_output_dir() {
        let tmp = TempDir::new().unwrap();
        let archive = tmp.path().join("out").join("vol1.tar.gz");
        let out_dir = tmp.path().join("out");
        let expected_source = out_dir.to_string_lossy().to_string();

        let mut engine = MockEngine::new();
        unused_volume(&mut engine, "vol1");
        engine
            .expect_create_container()
            .withf(move |spec| {
                spec.image == "busybox:amd64"
                    && spec.auto_remove
                    && spec.cmd == vec!["tar", "-czvf", "/dest/vol1.tar.gz", "-C", "/source", "."]
                    && spec.mounts
                        == vec![
                            MountSpec::volume("vol1", "/source").read_only(),
                            MountSpec::bind(expected_source.clone(), "/dest"),
                        ]
            })
            .times(1)
            .returning(|_| Ok("c0ffee".to_string()));
        engine
            .expect_watch_container()
            .times(1)
            .returning(|_| Ok(exited(0)));
        engine.expect_start_container().times(1).returning(|_| Ok(()));

        let snapshotter = Snapshotter::new(&engine, SnapshotOptions::default(), "amd64");
        let report = snapshotter.create_snapshot("vol1", &archive).await.unwrap();

        assert!(out_dir.is_dir());
        assert_eq!(report.mode, Mode::Create);
        assert_eq!(report.volume, "vol1");
        assert_eq!(report.archive, archive);
        assert_eq!(report.format, ArchiveFormat::Gzip);
        assert_eq!(report.image, "busybox:amd64");
    }

    #[tokio::test]
    async fn test_create_aborts_when_volume_in_use() {
        let tmp = TempDir::new().unwrap();
        let mut engine = MockEngine::new();
        existing_volume(&mut engine, "vol1");
        engine.expect_list_running_with_volume().returning(|_| {
            Ok(vec![ContainerRef {
                id: "0123456789abcdef".to_string(),
                names: vec!["/app1".to_string()],
                mounts: vec![MountRef {
                    kind: MountKind::Volume,
                    name: Some("vol1".to_string()),
                    rw: true,
                }],
            }])
        });
        engine.expect_create_container().never();

        let snapshotter = Snapshotter::new(&engine, SnapshotOptions::default(), "amd64");
        let err = snapshotter
            .create_snapshot("vol1", &tmp.path().join("out/vol1.tar.gz"))
            .await
            .unwrap_err();

        match err {
            SnapshotError::VolumeInUse { containers, .. } => {
                assert_eq!(containers[0].name, "app1");
                assert_eq!(containers[0].short_id, "0123456789ab");
            }
            other => panic!("expected VolumeInUse, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_restore_into_missing_volume() {
        let tmp = TempDir::new().unwrap();
        let archive = tmp.path().join("snap.tar.gz");
        std::fs::write(&archive, b"not really gzip").unwrap();

        let mut engine = MockEngine::new();
        engine
            .expect_inspect_volume()
            .returning(|_| Err(EngineError::NotFound("no such volume".to_string())));
        engine.expect_create_container().never();

        let snapshotter = Snapshotter::new(&engine, SnapshotOptions::default(), "amd64");
        let err = snapshotter.restore_snapshot(&archive, "missing").await.unwrap_err();

        assert_eq!(err.to_string(), "Volume 'missing' does not exist.");
    }

    #[tokio::test]
    async fn test_unsupported_format_never_touches_engine() {
        let tmp = TempDir::new().unwrap();
        let mut engine = MockEngine::new();
        engine.expect_inspect_volume().never();
        engine.expect_create_container().never();

        let snapshotter = Snapshotter::new(&engine, SnapshotOptions::default(), "amd64");
        let err = snapshotter
            .create_snapshot("vol1", &tmp.path().join("snap.zip"))
            .await
            .unwrap_err();

        assert!(matches!(err, SnapshotError::UnsupportedFormat(ref name) if name == "snap.zip"));
    }

    #[tokio::test]
    async fn test_restore_reports_non_zero_exit() {
        let tmp = TempDir::new().unwrap();
        let archive = tmp.path().join("snap.tar.xz");
        std::fs::write(&archive, b"corrupt").unwrap();

        let mut engine = MockEngine::new();
        unused_volume(&mut engine, "vol1");
        engine
            .expect_create_container()
            .withf(|spec| {
                spec.cmd == vec!["tar", "-xJvf", "/source/snap.tar.xz", "-C", "/dest"]
                    && spec.mounts[1] == MountSpec::volume("vol1", "/dest")
            })
            .returning(|_| Ok("c0ffee".to_string()));
        engine.expect_watch_container().returning(|_| Ok(exited(2)));
        engine.expect_start_container().times(1).returning(|_| Ok(()));

        let snapshotter = Snapshotter::new(&engine, SnapshotOptions::default(), "amd64");
        let err = snapshotter.restore_snapshot(&archive, "vol1").await.unwrap_err();

        assert!(matches!(err, SnapshotError::NonZeroExit(2)));
        assert_eq!(err.to_string(), "Container exited with status code: 2");
    }

    #[tokio::test]
    async fn test_restore_requires_existing_archive() {
        let tmp = TempDir::new().unwrap();
        let mut engine = MockEngine::new();
        engine.expect_inspect_volume().never();

        let snapshotter = Snapshotter::new(&engine, SnapshotOptions::default(), "amd64");
        let err = snapshotter
            .restore_snapshot(&tmp.path().join("absent.tar"), "vol1")
            .await
            .unwrap_err();

        assert!(matches!(err, SnapshotError::SnapshotNotFound(_)));
    }

    #[tokio::test]
    async fn test_runner_states() {
        let mut engine = MockEngine::new();
        engine.expect_inspect_image().returning(|_| Ok(()));
        engine
            .expect_create_container()
            .returning(|_| Err(EngineError::Api("invalid mount config".to_string())));
        engine.expect_start_container().never();

        let options = SnapshotOptions::default();
        let mut runner = SnapshotRunner::new(&engine, &options, "amd64");
        assert_eq!(runner.state(), &RunState::Idle);

        let err = runner.run(vec!["true".to_string()], vec![]).await.unwrap_err();
        assert!(matches!(err, SnapshotError::ContainerCreate(_)));
        assert!(matches!(runner.state(), RunState::Failed(_)));
    }

    #[tokio::test]
    async fn test_start_failure_is_fatal() {
        let mut engine = MockEngine::new();
        engine.expect_inspect_image().returning(|_| Ok(()));
        engine
            .expect_create_container()
            .returning(|_| Ok("c0ffee".to_string()));
        engine
            .expect_watch_container()
            .returning(|_| Ok(ExitWatch::spawn(std::future::pending())));
        engine
            .expect_start_container()
            .returning(|_| Err(EngineError::Api("port is already allocated".to_string())));

        let options = SnapshotOptions::default();
        let mut runner = SnapshotRunner::new(&engine, &options, "amd64");
        let err = runner.run(vec!["true".to_string()], vec![]).await.unwrap_err();

        assert!(matches!(err, SnapshotError::ContainerStart(_)));
    }

    #[tokio::test]
    async fn test_daemon_lost_before_start() {
        let mut engine = MockEngine::new();
        engine.expect_inspect_image().returning(|_| Ok(()));
        engine
            .expect_create_container()
            .returning(|_| Ok("c0ffee".to_string()));
        engine
            .expect_watch_container()
            .returning(|_| Ok(ExitWatch::spawn(std::future::pending())));
        engine
            .expect_start_container()
            .returning(|_| Err(EngineError::Unreachable("connection refused".to_string())));

        let options = SnapshotOptions::default();
        let mut runner = SnapshotRunner::new(&engine, &options, "amd64");
        let err = runner.run(vec!["true".to_string()], vec![]).await.unwrap_err();

        assert!(matches!(err, SnapshotError::EngineUnreachable(_)));
        assert!(err.to_string().contains(DAEMON_HINT));
    }

    #[tokio::test]
    async fn test_wait_registered_before_start() {
        let mut seq = Sequence::new();
        let mut engine = MockEngine::new();
        engine.expect_inspect_image().returning(|_| Ok(()));
        engine
            .expect_create_container()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok("c0ffee".to_string()));
        // The helper exits and is removed before start even returns
        engine
            .expect_watch_container()
            .with(predicate::eq("c0ffee"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(exited(0)));
        engine
            .expect_start_container()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let options = SnapshotOptions::default();
        let mut runner = SnapshotRunner::new(&engine, &options, "amd64");
        let image = runner.run(vec!["true".to_string()], vec![]).await.unwrap();

        assert_eq!(image, "busybox:amd64");
        assert_eq!(runner.state(), &RunState::Exited(0));
    }

    #[tokio::test]
    async fn test_wait_failure_is_reported() {
        let mut engine = MockEngine::new();
        engine.expect_inspect_image().returning(|_| Ok(()));
        engine
            .expect_create_container()
            .returning(|_| Ok("c0ffee".to_string()));
        engine.expect_watch_container().returning(|_| {
            Ok(ExitWatch::spawn(async {
                WaitOutcome::WaitFailed("connection reset".to_string())
            }))
        });
        engine.expect_start_container().returning(|_| Ok(()));

        let options = SnapshotOptions::default();
        let mut runner = SnapshotRunner::new(&engine, &options, "amd64");
        let err = runner.run(vec!["true".to_string()], vec![]).await.unwrap_err();

        assert!(matches!(err, SnapshotError::ContainerWait(ref r) if r == "connection reset"));
    }

    /// Engine whose helper container never stops
    struct StalledEngine;

    #[async_trait]
    impl Engine for StalledEngine {
        async fn inspect_volume(&self, name: &str) -> EngineResult<VolumeInfo> {
            Ok(VolumeInfo { name: name.to_string() })
        }

        async fn list_running_with_volume(&self, _name: &str) -> EngineResult<Vec<ContainerRef>> {
            Ok(vec![])
        }

        async fn inspect_image(&self, _reference: &str) -> EngineResult<()> {
            Ok(())
        }

        async fn load_image(&self, _archive: Bytes) -> EngineResult<()> {
            Ok(())
        }

        async fn pull_image(&self, _reference: &str) -> EngineResult<()> {
            Ok(())
        }

        async fn create_container(&self, _spec: LaunchSpec) -> EngineResult<String> {
            Ok("stalled".to_string())
        }

        async fn watch_container(&self, _id: &str) -> EngineResult<ExitWatch> {
            Ok(ExitWatch::spawn(std::future::pending()))
        }

        async fn start_container(&self, _id: &str) -> EngineResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_wait_timeout() {
        let options = SnapshotOptions {
            timeout: Some(Duration::from_millis(50)),
            ..Default::default()
        };
        let mut runner = SnapshotRunner::new(&StalledEngine, &options, "amd64");
        let err = runner.run(vec!["true".to_string()], vec![]).await.unwrap_err();

        match err {
            SnapshotError::ContainerWait(reason) => assert!(reason.starts_with("timed out after")),
            other => panic!("expected ContainerWait, got {:?}", other),
        }
    }
}
