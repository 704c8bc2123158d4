//! Docker implementation of [`ContainerRuntime`] using bollard.
//!
//! Connects with the default method for the platform (Unix socket on
//! Linux/macOS, named pipe on Windows). Daemon responses are classified
//! by HTTP status: 404 becomes [`RuntimeError::NotFound`] and 304 (no
//! state change) becomes [`RuntimeError::AlreadyInState`].

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::Docker;
use bollard::errors::Error as DockerError;
use bollard::models::{ContainerCreateBody, ContainerStateStatusEnum, HostConfig, PortBinding};
use bollard::query_parameters::{
    BuildImageOptions, BuildImageOptionsBuilder, CreateContainerOptions,
    CreateContainerOptionsBuilder, InspectContainerOptions, InspectContainerOptionsBuilder,
    ListContainersOptions, ListContainersOptionsBuilder, LogsOptions, LogsOptionsBuilder,
    RemoveContainerOptions, RemoveContainerOptionsBuilder, StartContainerOptions,
    StartContainerOptionsBuilder, StatsOptions, StatsOptionsBuilder, StopContainerOptions,
    StopContainerOptionsBuilder,
};
use futures_util::StreamExt;

use super::{
    BuildRequest, ContainerRuntime, ContainerSpec, ContainerState, ContainerStats, PROJECT_LABEL,
    RunError, RuntimeError, context, logs,
};
use crate::project::{DEFAULT_INTERNAL_PORT, ProjectId};

/// Seconds the daemon waits for a graceful stop before killing.
const STOP_GRACE_SECONDS: i32 = 10;
const LOG_TAIL: &str = "100";

pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn connect() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }
}

/// Maps daemon status codes onto typed errors.
fn classify(id: &str, state: &'static str, err: DockerError) -> RuntimeError {
    match err {
        DockerError::DockerResponseServerError {
            status_code: 404, ..
        } => RuntimeError::NotFound(id.to_string()),
        DockerError::DockerResponseServerError {
            status_code: 304, ..
        } => RuntimeError::AlreadyInState {
            id: id.to_string(),
            state,
        },
        e => RuntimeError::DockerApi(e),
    }
}

impl From<ContainerStateStatusEnum> for ContainerState {
    fn from(status: ContainerStateStatusEnum) -> Self {
        match status {
            ContainerStateStatusEnum::EMPTY => Self::Empty,
            ContainerStateStatusEnum::CREATED => Self::Created,
            ContainerStateStatusEnum::RUNNING => Self::Running,
            ContainerStateStatusEnum::PAUSED => Self::Paused,
            ContainerStateStatusEnum::RESTARTING => Self::Restarting,
            ContainerStateStatusEnum::REMOVING => Self::Removing,
            ContainerStateStatusEnum::EXITED => Self::Exited,
            ContainerStateStatusEnum::DEAD => Self::Dead,
        }
    }
}

impl DockerRuntime {
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let internal_port = spec.internal_port.unwrap_or(DEFAULT_INTERNAL_PORT);
        let container_port = format!("{internal_port}/tcp");

        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        port_bindings.insert(
            container_port.clone(),
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some(spec.external_port.to_string()),
            }]),
        );

        let host_config = HostConfig {
            binds: if spec.binds.is_empty() {
                None
            } else {
                Some(spec.binds.clone())
            },
            port_bindings: Some(port_bindings),
            ..Default::default()
        };

        let config = ContainerCreateBody {
            image: Some(spec.image.clone()),
            env: if spec.env.is_empty() {
                None
            } else {
                Some(spec.env.clone())
            },
            exposed_ports: Some(vec![container_port]),
            labels: Some(spec.labels.clone()),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options: CreateContainerOptions =
            CreateContainerOptionsBuilder::new().name(&spec.name).build();

        let response = self.docker.create_container(Some(options), config).await?;
        log::info!("Container {} created as {}", spec.name, response.id);
        Ok(response.id)
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn build_image(
        &self,
        request: &BuildRequest,
        on_line: &mut (dyn for<'l> FnMut(&'l str) + Send),
    ) -> Result<String, RuntimeError> {
        log::info!(
            "Building image {} from {:?} with {}",
            request.tag,
            request.context_dir,
            request.recipe_file
        );
        let archive = context::archive_context(&request.context_dir).await?;

        let options: BuildImageOptions = BuildImageOptionsBuilder::new()
            .dockerfile(&request.recipe_file)
            .t(&request.tag)
            .rm(true)
            .forcerm(true)
            .buildargs(&request.build_args)
            .build();

        let mut stream = self
            .docker
            .build_image(options, None, Some(bollard::body_full(archive)));

        let mut transcript = String::new();
        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(line) = info.stream.filter(|s| !s.is_empty()) {
                        on_line(&line);
                        transcript.push_str(&line);
                    }
                    if let Some(message) = info.error_detail.and_then(|d| d.message) {
                        log::error!("Build of {} failed: {}", request.tag, message);
                        return Err(RuntimeError::BuildFailed {
                            message,
                            log: transcript,
                        });
                    }
                }
                Err(DockerError::DockerStreamError { error }) => {
                    log::error!("Build of {} failed: {}", request.tag, error);
                    return Err(RuntimeError::BuildFailed {
                        message: error,
                        log: transcript,
                    });
                }
                Err(e) => {
                    log::error!("Build stream for {} broke: {}", request.tag, e);
                    return Err(RuntimeError::BuildFailed {
                        message: e.to_string(),
                        log: transcript,
                    });
                }
            }
        }

        log::info!("Image {} built successfully", request.tag);
        Ok(transcript)
    }

    async fn run_container(&self, spec: &ContainerSpec) -> Result<String, RunError> {
        let id = self
            .create_container(spec)
            .await
            .inspect_err(|e| log::error!("Failed to create container {}: {}", spec.name, e))
            .map_err(|source| RunError {
                container_id: None,
                source,
            })?;

        let options: StartContainerOptions = StartContainerOptionsBuilder::new().build();
        match self.docker.start_container(&id, Some(options)).await {
            Ok(_) => {
                log::info!("Container {} started successfully", spec.name);
                Ok(id)
            }
            Err(e) => {
                log::error!("Failed to start container {}: {}", spec.name, e);
                Err(RunError {
                    source: classify(&id, "started", e),
                    container_id: Some(id),
                })
            }
        }
    }

    async fn stop_container(&self, id: &str) -> Result<(), RuntimeError> {
        log::info!("Stopping container: {id}");
        let options: StopContainerOptions = StopContainerOptionsBuilder::new()
            .t(STOP_GRACE_SECONDS)
            .build();

        self.docker
            .stop_container(id, Some(options))
            .await
            .map_err(|e| classify(id, "stopped", e))
            .inspect(|_| log::info!("Container {id} stopped successfully"))
            .inspect_err(|e| log::warn!("Failed to stop container {id}: {e}"))
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        log::info!("Starting container: {id}");
        let options: StartContainerOptions = StartContainerOptionsBuilder::new().build();

        self.docker
            .start_container(id, Some(options))
            .await
            .map_err(|e| classify(id, "started", e))
            .inspect(|_| log::info!("Container {id} started successfully"))
            .inspect_err(|e| log::warn!("Failed to start container {id}: {e}"))
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        log::info!("Removing container: {id}");
        let options: RemoveContainerOptions =
            RemoveContainerOptionsBuilder::new().force(true).build();

        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(|e| classify(id, "removed", e))
            .inspect(|_| log::info!("Container {id} removed successfully"))
            .inspect_err(|e| log::warn!("Failed to remove container {id}: {e}"))
    }

    async fn container_state(&self, id: &str) -> Result<ContainerState, RuntimeError> {
        let options: InspectContainerOptions = InspectContainerOptionsBuilder::new().build();
        let info = self
            .docker
            .inspect_container(id, Some(options))
            .await
            .map_err(|e| classify(id, "inspected", e))?;

        Ok(info
            .state
            .and_then(|state| state.status)
            .map(ContainerState::from)
            .unwrap_or(ContainerState::Unknown))
    }

    async fn container_stats(&self, id: &str) -> Result<ContainerStats, RuntimeError> {
        let options: StatsOptions = StatsOptionsBuilder::new()
            .stream(false)
            .one_shot(true)
            .build();
        let mut stream = self.docker.stats(id, Some(options));

        let Some(sample) = stream.next().await else {
            return Ok(ContainerStats::default());
        };
        let sample = sample.map_err(|e| classify(id, "sampled", e))?;

        let memory_bytes = sample
            .memory_stats
            .and_then(|m| m.usage)
            .unwrap_or_default();
        let cpu_total_usage = sample
            .cpu_stats
            .and_then(|c| c.cpu_usage)
            .and_then(|u| u.total_usage)
            .unwrap_or_default();

        Ok(ContainerStats {
            memory_bytes,
            cpu_total_usage,
        })
    }

    async fn container_logs(&self, id: &str) -> Result<String, RuntimeError> {
        let options: LogsOptions = LogsOptionsBuilder::new()
            .stdout(true)
            .stderr(true)
            .follow(false)
            .tail(LOG_TAIL)
            .build();
        let mut stream = self.docker.logs(id, Some(options));

        let mut raw = Vec::new();
        while let Some(chunk) = stream.next().await {
            raw.extend(logs::reframe(chunk.map_err(|e| classify(id, "logged", e))?));
        }
        Ok(logs::demultiplex(&raw))
    }

    async fn project_containers(&self, project_id: ProjectId) -> Result<Vec<String>, RuntimeError> {
        let options: ListContainersOptions = ListContainersOptionsBuilder::new().all(true).build();
        let containers = self.docker.list_containers(Some(options)).await?;
        let project = project_id.to_string();

        Ok(containers
            .into_iter()
            .filter(|c| {
                c.labels
                    .as_ref()
                    .and_then(|labels| labels.get(PROJECT_LABEL))
                    .is_some_and(|value| *value == project)
            })
            .filter_map(|c| c.id)
            .collect())
    }
}
