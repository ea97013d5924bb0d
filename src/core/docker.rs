/// Docker Engine integration
///
/// `Engine` is the narrow surface the snapshot flow needs from the daemon.
/// `DockerEngine` implements it over bollard; tests substitute a mock.

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, StartContainerOptions,
    WaitContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::{CreateImageOptions, ImportImageOptions};
use bollard::models::{ContainerSummary, HostConfig, Mount, MountPointTypeEnum, MountTypeEnum};
use bollard::Docker;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::HashMap;
use std::future::Future;
use thiserror::Error;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::debug;

/// Engine failures, classified by what the caller can do about them
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(String),

    /// Transport-level failure: socket missing, daemon down, connection reset
    #[error("{0}")]
    Unreachable(String),

    #[error("{0}")]
    Api(String),
}

impl From<BollardError> for EngineError {
    fn from(err: BollardError) -> Self {
        match err {
            BollardError::DockerResponseServerError {
                status_code: 404,
                message,
            } => EngineError::NotFound(message),
            BollardError::DockerResponseServerError {
                status_code,
                message,
            } => EngineError::Api(format!("{} ({})", message, status_code)),
            e @ (BollardError::JsonDataError { .. }
            | BollardError::JsonSerdeError { .. }
            | BollardError::DockerStreamError { .. }
            | BollardError::DockerContainerWaitError { .. }) => EngineError::Api(e.to_string()),
            other => EngineError::Unreachable(other.to_string()),
        }
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountKind {
    /// Host path exposed inside the container
    Bind,
    /// Engine-managed named volume
    Volume,
    Other,
}

/// Mount entry as reported on a running container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRef {
    pub kind: MountKind,
    pub name: Option<String>,
    pub rw: bool,
}

/// Running container as reported by the list endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRef {
    pub id: String,
    pub names: Vec<String>,
    pub mounts: Vec<MountRef>,
}

impl From<ContainerSummary> for ContainerRef {
    fn from(summary: ContainerSummary) -> Self {
        let mounts = summary
            .mounts
            .unwrap_or_default()
            .into_iter()
            .map(|m| MountRef {
                kind: match m.typ {
                    Some(MountPointTypeEnum::VOLUME) => MountKind::Volume,
                    Some(MountPointTypeEnum::BIND) => MountKind::Bind,
                    _ => MountKind::Other,
                },
                name: m.name,
                rw: m.rw.unwrap_or(false),
            })
            .collect();

        Self {
            id: summary.id.unwrap_or_default(),
            names: summary.names.unwrap_or_default(),
            mounts,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeInfo {
    pub name: String,
}

/// One mount of the helper container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    pub kind: MountKind,
    pub source: String,
    pub target: String,
    pub read_only: bool,
}

impl MountSpec {
    pub fn bind(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            kind: MountKind::Bind,
            source: source.into(),
            target: target.into(),
            read_only: false,
        }
    }

    pub fn volume(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            kind: MountKind::Volume,
            source: name.into(),
            target: target.into(),
            read_only: false,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}

/// Everything needed to create the helper container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub image: String,
    pub cmd: Vec<String>,
    pub mounts: Vec<MountSpec>,
    pub auto_remove: bool,
}

/// How a wait on the helper container ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    Stopped(i64),
    WaitFailed(String),
}

/// Pending wait on a container's next exit, registered before it starts
///
/// Dropping the watch cancels the wait.
#[derive(Debug)]
pub struct ExitWatch {
    handle: JoinHandle<WaitOutcome>,
}

impl ExitWatch {
    /// Drive `wait` on the runtime so it progresses while the caller starts the container
    pub fn spawn<F>(wait: F) -> Self
    where
        F: Future<Output = WaitOutcome> + Send + 'static,
    {
        Self {
            handle: tokio::spawn(wait),
        }
    }

    /// Resolve once the container has exited
    pub async fn outcome(&mut self) -> WaitOutcome {
        match (&mut self.handle).await {
            Ok(outcome) => outcome,
            Err(e) => WaitOutcome::WaitFailed(format!("wait task ended: {}", e)),
        }
    }
}

impl Drop for ExitWatch {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Engine: Send + Sync {
    async fn inspect_volume(&self, name: &str) -> EngineResult<VolumeInfo>;

    /// Running containers that mount the named volume in any mode
    async fn list_running_with_volume(&self, name: &str) -> EngineResult<Vec<ContainerRef>>;

    async fn inspect_image(&self, reference: &str) -> EngineResult<()>;

    /// Load an image archive (`docker save` format) held in memory
    async fn load_image(&self, archive: Bytes) -> EngineResult<()>;

    /// Pull from the registry, returning once the progress stream is drained
    async fn pull_image(&self, reference: &str) -> EngineResult<()>;

    /// Create the container and return its id
    async fn create_container(&self, spec: LaunchSpec) -> EngineResult<String>;

    /// Register a wait on the container's next exit. Called before
    /// `start_container`, so an auto-removed container that exits at once
    /// still reports its status.
    async fn watch_container(&self, id: &str) -> EngineResult<ExitWatch>;

    async fn start_container(&self, id: &str) -> EngineResult<()>;
}

pub struct DockerEngine {
    docker: Docker,
    negotiated: OnceCell<Docker>,
}

impl DockerEngine {
    /// Build a client from DOCKER_HOST (or the local socket). No I/O happens
    /// until the first call, which also negotiates the API version.
    pub fn connect() -> EngineResult<Self> {
        let docker = Docker::connect_with_defaults()
            .map_err(|e| EngineError::Unreachable(e.to_string()))?;

        Ok(Self {
            docker,
            negotiated: OnceCell::new(),
        })
    }

    async fn client(&self) -> EngineResult<&Docker> {
        self.negotiated
            .get_or_try_init(|| async {
                let docker = self
                    .docker
                    .clone()
                    .negotiate_version()
                    .await
                    .map_err(|e| EngineError::Unreachable(e.to_string()))?;
                debug!("connected to Docker daemon");
                Ok::<_, EngineError>(docker)
            })
            .await
    }
}

#[async_trait]
impl Engine for DockerEngine {
    async fn inspect_volume(&self, name: &str) -> EngineResult<VolumeInfo> {
        let volume = self.client().await?.inspect_volume(name).await?;
        Ok(VolumeInfo { name: volume.name })
    }

    async fn list_running_with_volume(&self, name: &str) -> EngineResult<Vec<ContainerRef>> {
        let mut filters = HashMap::new();
        filters.insert("volume".to_string(), vec![name.to_string()]);
        filters.insert("status".to_string(), vec!["running".to_string()]);

        let options = Some(ListContainersOptions {
            filters,
            ..Default::default()
        });

        let containers = self.client().await?.list_containers(options).await?;
        Ok(containers.into_iter().map(ContainerRef::from).collect())
    }

    async fn inspect_image(&self, reference: &str) -> EngineResult<()> {
        self.client().await?.inspect_image(reference).await?;
        Ok(())
    }

    async fn load_image(&self, archive: Bytes) -> EngineResult<()> {
        let mut stream = self
            .client()
            .await?
            .import_image(ImportImageOptions { quiet: true }, archive, None);

        while let Some(result) = stream.next().await {
            let info = result?;
            if let Some(status) = info.stream.or(info.status) {
                debug!("load: {}", status.trim());
            }
        }

        Ok(())
    }

    async fn pull_image(&self, reference: &str) -> EngineResult<()> {
        let options = Some(CreateImageOptions {
            from_image: reference.to_string(),
            ..Default::default()
        });

        let mut stream = self.client().await?.create_image(options, None, None);

        while let Some(result) = stream.next().await {
            let info = result?;
            if let Some(status) = info.status {
                debug!("pull: {}", status);
            }
        }

        Ok(())
    }

    async fn create_container(&self, spec: LaunchSpec) -> EngineResult<String> {
        let mounts = spec
            .mounts
            .into_iter()
            .map(|m| Mount {
                typ: Some(match m.kind {
                    MountKind::Bind => MountTypeEnum::BIND,
                    _ => MountTypeEnum::VOLUME,
                }),
                source: Some(m.source),
                target: Some(m.target),
                read_only: Some(m.read_only),
                ..Default::default()
            })
            .collect();

        let config = Config {
            image: Some(spec.image),
            cmd: Some(spec.cmd),
            host_config: Some(HostConfig {
                mounts: Some(mounts),
                auto_remove: Some(spec.auto_remove),
                ..Default::default()
            }),
            ..Default::default()
        };

        let response = self
            .client()
            .await?
            .create_container(None::<CreateContainerOptions<String>>, config)
            .await?;

        for warning in &response.warnings {
            debug!("create warning: {}", warning);
        }

        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> EngineResult<()> {
        self.client()
            .await?
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn watch_container(&self, id: &str) -> EngineResult<ExitWatch> {
        let docker = self.client().await?.clone();
        let id = id.to_string();

        Ok(ExitWatch::spawn(async move {
            let mut stream = docker.wait_container(
                &id,
                Some(WaitContainerOptions {
                    condition: "next-exit",
                }),
            );

            match stream.next().await {
                Some(Ok(response)) => WaitOutcome::Stopped(response.status_code),
                // bollard reports a non-zero exit as an error carrying the code
                Some(Err(BollardError::DockerContainerWaitError { error, code })) => {
                    if code != 0 {
                        WaitOutcome::Stopped(code)
                    } else {
                        WaitOutcome::WaitFailed(error)
                    }
                }
                Some(Err(e)) => WaitOutcome::WaitFailed(e.to_string()),
                None => WaitOutcome::WaitFailed("wait stream closed without a status".to_string()),
            }
        }))
    }
}
