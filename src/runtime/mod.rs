//! Container runtime client.
//!
//! [`ContainerRuntime`] is the seam between the pipeline and the container
//! daemon. [`docker::DockerRuntime`] implements it on top of bollard. Errors
//! are classified here, once, so callers match on [`RuntimeError`] variants
//! instead of daemon wording.

pub mod context;
pub mod docker;
#[cfg(test)]
pub mod fake;
pub mod logs;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::project::ProjectId;

/// Label carrying the owning project id on every container we create.
pub const PROJECT_LABEL: &str = "orchestro.project";
/// Label carrying the deployment id on every container we create.
pub const DEPLOYMENT_LABEL: &str = "orchestro.deployment";

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("no such container: {0}")]
    NotFound(String),
    #[error("container {id} is already {state}")]
    AlreadyInState { id: String, state: &'static str },
    #[error("image build failed: {message}")]
    BuildFailed {
        message: String,
        /// Transcript collected before the failure.
        log: String,
    },
    #[error("build context error: {0}")]
    Context(#[from] std::io::Error),
    #[error("Docker API error: {0}")]
    DockerApi(#[from] bollard::errors::Error),
    #[error("daemon call timed out after {0:?}")]
    Timeout(Duration),
}

/// A failed create/start. `container_id` is set when the container was
/// created but could not be started, so the caller can clean it up.
#[derive(Debug, thiserror::Error)]
#[error("{source}")]
pub struct RunError {
    pub container_id: Option<String>,
    #[source]
    pub source: RuntimeError,
}

#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub context_dir: PathBuf,
    pub tag: String,
    pub recipe_file: String,
    pub build_args: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub image: String,
    pub name: String,
    pub external_port: u16,
    /// Port inside the container. Defaults to 80.
    pub internal_port: Option<u16>,
    pub env: Vec<String>,
    pub binds: Vec<String>,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    Empty,
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    Unknown,
}

impl AsRef<str> for ContainerState {
    fn as_ref(&self) -> &str {
        match self {
            Self::Empty => "empty",
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Restarting => "restarting",
            Self::Removing => "removing",
            Self::Exited => "exited",
            Self::Dead => "dead",
            Self::Unknown => "unknown",
        }
    }
}

/// Single resource usage sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ContainerStats {
    pub memory_bytes: u64,
    pub cpu_total_usage: u64,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Builds `request.tag` from the context directory. Every progress line
    /// is passed to `on_line` as it arrives; the full transcript is
    /// returned on success and carried by [`RuntimeError::BuildFailed`]
    /// on failure.
    async fn build_image(
        &self,
        request: &BuildRequest,
        on_line: &mut (dyn for<'l> FnMut(&'l str) + Send),
    ) -> Result<String, RuntimeError>;

    /// Creates and starts a container, returning its id.
    async fn run_container(&self, spec: &ContainerSpec) -> Result<String, RunError>;

    async fn stop_container(&self, id: &str) -> Result<(), RuntimeError>;

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError>;

    /// Force removes the container.
    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError>;

    async fn container_state(&self, id: &str) -> Result<ContainerState, RuntimeError>;

    async fn container_stats(&self, id: &str) -> Result<ContainerStats, RuntimeError>;

    /// Last 100 lines of combined stdout/stderr as plain text.
    async fn container_logs(&self, id: &str) -> Result<String, RuntimeError>;

    /// Ids of every container labelled for the project, stopped ones
    /// included.
    async fn project_containers(&self, project_id: ProjectId) -> Result<Vec<String>, RuntimeError>;
}
