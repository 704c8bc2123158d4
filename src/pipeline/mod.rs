//! Deployment pipeline.
//!
//! One run takes a project from source to a running container:
//!
//! 1. create a `Building` deployment
//! 2. clone or update the checkout
//! 3. resolve the build context and its recipe
//! 4. build the image, streaming every line to the hub
//! 5. retire every previously live container of the project
//! 6. launch the new container
//! 7. mark the deployment `Ready`
//!
//! Retirement happens before launch, so there is a short window without a
//! running instance. Runs, pauses and resumes of one project never overlap.

pub mod queue;
pub mod recipe;
pub mod source;

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::deployment::{Deployment, DeploymentId, DeploymentStatus};
use crate::hub::HubHandle;
use crate::project::{ProjectConfig, ProjectId};
use crate::runtime::{
    BuildRequest, ContainerRuntime, ContainerSpec, DEPLOYMENT_LABEL, PROJECT_LABEL, RunError,
    RuntimeError,
};
use crate::store::{DeploymentStore, StoreError};
use queue::{Enqueued, ProjectQueue};
use recipe::{RECIPE_FILE, RecipeError, RecipeSource};
use source::{SourceError, SourceSync};

const ABORTED: &str = "Deployment aborted unexpectedly";

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("source sync failed: {0}")]
    SourceSyncFailed(#[source] SourceError),
    #[error("failed to prepare build context: {0}")]
    BuildContextFailed(#[source] RecipeError),
    #[error("build failed: {0}")]
    BuildFailed(String),
    #[error("failed to retire container {container_id}: {source}")]
    RetireFailed {
        container_id: String,
        #[source]
        source: RuntimeError,
    },
    #[error("failed to run container: {0}")]
    LaunchFailed(String),
    #[error("container {container_id} of deployment {deployment_id} no longer exists")]
    ContainerGone {
        deployment_id: DeploymentId,
        container_id: String,
    },
    #[error("container daemon error: {0}")]
    TransientDaemonError(#[source] RuntimeError),
    #[error("no deployment with a container for project {0}")]
    NoLiveDeployment(ProjectId),
    #[error("project {0} is not configured")]
    UnknownProject(ProjectId),
    #[error("deployment store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Root for per-project checkouts (`<data_dir>/projects/<id>`).
    pub data_dir: PathBuf,
    pub daemon_timeout: Duration,
    pub build_timeout: Duration,
}

#[derive(Debug)]
pub enum TriggerOutcome {
    /// A supervised run was spawned. The handle resolves once it is done.
    Scheduled(JoinHandle<()>),
    /// Merged into a run that is already waiting for the project.
    Coalesced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Toggle {
    Pause,
    Resume,
}

pub struct Pipeline {
    runtime: Arc<dyn ContainerRuntime>,
    source: Arc<dyn SourceSync>,
    store: Arc<dyn DeploymentStore>,
    hub: HubHandle,
    settings: PipelineSettings,
    queue: ProjectQueue,
}

impl Pipeline {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        source: Arc<dyn SourceSync>,
        store: Arc<dyn DeploymentStore>,
        hub: HubHandle,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            runtime,
            source,
            store,
            hub,
            settings,
            queue: ProjectQueue::new(),
        }
    }

    pub fn checkout_dir(&self, project_id: ProjectId) -> PathBuf {
        self.settings
            .data_dir
            .join("projects")
            .join(project_id.to_string())
    }

    /// Queues a deployment run in the background.
    ///
    /// The run is supervised: a panic is logged, the deployment it had
    /// started is marked failed and observers see a failed status.
    pub fn trigger(self: &Arc<Self>, project: ProjectConfig) -> TriggerOutcome {
        let project_id = project.id;
        if self.queue.enqueue(project) == Enqueued::Coalesced {
            log::info!("Deployment for project {project_id} already queued, coalescing trigger");
            return TriggerOutcome::Coalesced;
        }

        let started = Arc::new(OnceLock::new());
        let pipeline = Arc::clone(self);
        let run_started = Arc::clone(&started);
        let run = tokio::spawn(async move {
            let _guard = pipeline.queue.acquire(project_id).await;
            let Some(project) = pipeline.queue.take_pending(project_id) else {
                return;
            };
            let result = match pipeline.begin(&project).await {
                Ok(deployment) => {
                    let _ = run_started.set(deployment.id);
                    pipeline.run(&project, deployment).await
                }
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                log::error!("Deployment of project {project_id} ended with: {e}");
            }
        });

        let pipeline = Arc::clone(self);
        TriggerOutcome::Scheduled(tokio::spawn(async move {
            if let Err(e) = run.await {
                log::error!("Deployment task for project {project_id} aborted: {e}");
                if let Some(deployment_id) = started.get() {
                    pipeline.record_abort(*deployment_id).await;
                }
                pipeline
                    .hub
                    .broadcast_log(project_id, format!("{ABORTED}\n"));
                pipeline
                    .hub
                    .broadcast_status(project_id, DeploymentStatus::Failed, 0);
            }
        }))
    }

    /// Runs one deployment to completion, waiting for any other work on
    /// the same project first.
    pub async fn deploy(&self, project: &ProjectConfig) -> Result<Deployment, PipelineError> {
        let _guard = self.queue.acquire(project.id).await;
        self.deploy_locked(project).await
    }

    pub async fn pause(&self, project_id: ProjectId) -> Result<Deployment, PipelineError> {
        self.toggle(project_id, Toggle::Pause).await
    }

    pub async fn resume(&self, project_id: ProjectId) -> Result<Deployment, PipelineError> {
        self.toggle(project_id, Toggle::Resume).await
    }

    async fn deploy_locked(&self, project: &ProjectConfig) -> Result<Deployment, PipelineError> {
        let deployment = self.begin(project).await?;
        self.run(project, deployment).await
    }

    /// Creates the `Building` record for a new run.
    async fn begin(&self, project: &ProjectConfig) -> Result<Deployment, PipelineError> {
        let deployment = self.store.create(project.id).await?;
        log::info!(
            "Deployment {} of project {} ({}) started",
            deployment.id,
            project.id,
            project.name
        );
        self.hub
            .broadcast_status(project.id, DeploymentStatus::Building, 0);
        Ok(deployment)
    }

    /// Drives a started deployment to `Ready`. Any error marks it `Failed`.
    async fn run(
        &self,
        project: &ProjectConfig,
        mut deployment: Deployment,
    ) -> Result<Deployment, PipelineError> {
        if let Err(e) = self.run_stages(project, &mut deployment).await {
            return Err(self.fail(&mut deployment, e).await);
        }
        log::info!(
            "Project {} deployed successfully on port {}",
            project.id,
            deployment.port
        );
        Ok(deployment)
    }

    async fn run_stages(
        &self,
        project: &ProjectConfig,
        deployment: &mut Deployment,
    ) -> Result<(), PipelineError> {
        let checkout = self.checkout_dir(project.id);
        self.sync_source(project, &checkout)
            .await
            .map_err(PipelineError::SourceSyncFailed)?;

        let work_dir = match project.root_directory() {
            Some(sub) => checkout.join(sub),
            None => checkout,
        };
        match recipe::prepare(project, &work_dir)
            .await
            .map_err(PipelineError::BuildContextFailed)?
        {
            RecipeSource::Synthesized => {
                log::info!("Generated build recipe for project {}", project.id);
                self.hub
                    .broadcast_log(project.id, "Generated build pipeline\n");
            }
            source => log::debug!("Using {source:?} recipe for project {}", project.id),
        }

        match self.build(project, work_dir).await {
            Ok(transcript) => {
                deployment.logs = transcript;
                self.store.save(deployment).await?;
            }
            Err(RuntimeError::BuildFailed { message, log }) => {
                deployment.logs = log;
                return Err(PipelineError::BuildFailed(message));
            }
            Err(e) => return Err(PipelineError::BuildFailed(e.to_string())),
        }

        self.retire_previous(project.id, deployment).await?;

        let container_id = self.launch(project, deployment).await?;
        deployment.container_id = Some(container_id);
        deployment.port = project.external_port().unwrap_or_default();
        deployment.status = DeploymentStatus::Ready;
        deployment.append_log("Deployment successful");
        self.store.save(deployment).await?;
        self.hub
            .broadcast_status(project.id, DeploymentStatus::Ready, deployment.port);
        Ok(())
    }

    async fn sync_source(
        &self,
        project: &ProjectConfig,
        checkout: &std::path::Path,
    ) -> Result<(), SourceError> {
        if tokio::fs::try_exists(checkout.join(".git")).await? {
            self.hub
                .broadcast_log(project.id, "Updating repository...\n");
            self.source.update(&project.branch, checkout).await
        } else {
            self.hub.broadcast_log(project.id, "Cloning repository...\n");
            self.source
                .clone_fresh(&project.repo_url, &project.branch, checkout)
                .await
        }
    }

    /// Builds the project image. Lines are forwarded to the hub as they
    /// arrive; on timeout the lines seen so far become the failure log.
    async fn build(&self, project: &ProjectConfig, work_dir: PathBuf) -> Result<String, RuntimeError> {
        let request = BuildRequest {
            context_dir: work_dir,
            tag: project.image_tag(),
            recipe_file: RECIPE_FILE.to_string(),
            build_args: project
                .env
                .iter()
                .map(|e| (e.key.clone(), e.value.clone()))
                .collect(),
        };

        let hub = self.hub.clone();
        let project_id = project.id;
        let mut streamed = String::new();
        let mut on_line = |line: &str| {
            hub.broadcast_log(project_id, line);
            streamed.push_str(line);
        };

        let limit = self.settings.build_timeout;
        let outcome =
            tokio::time::timeout(limit, self.runtime.build_image(&request, &mut on_line)).await;
        match outcome {
            Ok(result) => result,
            Err(_) => Err(RuntimeError::BuildFailed {
                message: format!("build timed out after {limit:?}"),
                log: streamed,
            }),
        }
    }

    /// Applies the daemon deadline to a runtime call.
    pub async fn deadline<T>(
        &self,
        call: impl Future<Output = Result<T, RuntimeError>>,
    ) -> Result<T, RuntimeError> {
        let limit = self.settings.daemon_timeout;
        tokio::time::timeout(limit, call)
            .await
            .unwrap_or(Err(RuntimeError::Timeout(limit)))
    }

    /// Stops and removes every container still attached to an older
    /// deployment of the project, plus any labelled leftovers the store
    /// does not know about. Failures are logged and recorded on `current`
    /// but never abort the run.
    async fn retire_previous(
        &self,
        project_id: ProjectId,
        current: &mut Deployment,
    ) -> Result<(), PipelineError> {
        let previous = self.store.list_for_project(project_id).await?;
        let current_id = current.id;
        let mut retired = HashSet::new();

        for mut old in previous.into_iter().filter(|d| d.id != current_id) {
            let Some(container_id) = old.container_id.clone() else {
                continue;
            };
            log::info!("Stopping old container {container_id} for project {project_id}");
            if let Err(e) = self.retire_container(&container_id).await {
                log::warn!("{e}");
                current.append_log(&e.to_string());
            }
            old.retire();
            self.store.save(&old).await?;
            retired.insert(container_id);
        }

        match self.deadline(self.runtime.project_containers(project_id)).await {
            Ok(leftovers) => {
                for container_id in leftovers.into_iter().filter(|id| !retired.contains(id)) {
                    log::info!("Removing untracked container {container_id} for project {project_id}");
                    if let Err(e) = self.retire_container(&container_id).await {
                        log::warn!("{e}");
                        current.append_log(&e.to_string());
                    }
                }
            }
            Err(e) => log::warn!("Unable to list containers of project {project_id}: {e}"),
        }
        Ok(())
    }

    async fn retire_container(&self, container_id: &str) -> Result<(), PipelineError> {
        match self.deadline(self.runtime.stop_container(container_id)).await {
            Ok(()) | Err(RuntimeError::AlreadyInState { .. }) | Err(RuntimeError::NotFound(_)) => {}
            // Removal is forced, so a failed stop is not final
            Err(e) => log::warn!("Failed to stop {container_id}: {e}"),
        }
        match self.deadline(self.runtime.remove_container(container_id)).await {
            Ok(()) | Err(RuntimeError::NotFound(_)) => Ok(()),
            Err(source) => Err(PipelineError::RetireFailed {
                container_id: container_id.to_string(),
                source,
            }),
        }
    }

    async fn launch(
        &self,
        project: &ProjectConfig,
        deployment: &Deployment,
    ) -> Result<String, PipelineError> {
        let port = project.external_port().ok_or_else(|| {
            PipelineError::LaunchFailed(format!(
                "no valid external port for project {}",
                project.id
            ))
        })?;

        let labels = HashMap::from([
            (PROJECT_LABEL.to_string(), project.id.to_string()),
            (DEPLOYMENT_LABEL.to_string(), deployment.id.to_string()),
        ]);
        let spec = ContainerSpec {
            image: project.image_tag(),
            name: project.container_name(deployment.id),
            external_port: port,
            internal_port: Some(project.internal_port()),
            env: project.env_pairs(),
            binds: project.binds(),
            labels,
        };

        log::info!("Starting container {}", spec.name);
        self.hub.broadcast_log(project.id, "Starting container...\n");

        let limit = self.settings.daemon_timeout;
        match tokio::time::timeout(limit, self.runtime.run_container(&spec)).await {
            Ok(Ok(container_id)) => Ok(container_id),
            Ok(Err(RunError {
                container_id,
                source,
            })) => {
                if let Some(container_id) = container_id {
                    self.discard(&container_id).await;
                }
                Err(PipelineError::LaunchFailed(source.to_string()))
            }
            Err(_) => {
                // The container may exist without us knowing its id; at this
                // point every labelled container of the project is ours.
                if let Ok(ids) = self.deadline(self.runtime.project_containers(project.id)).await {
                    for container_id in ids {
                        self.discard(&container_id).await;
                    }
                }
                Err(PipelineError::LaunchFailed(
                    RuntimeError::Timeout(limit).to_string(),
                ))
            }
        }
    }

    async fn discard(&self, container_id: &str) {
        if let Err(e) = self.deadline(self.runtime.remove_container(container_id)).await {
            log::warn!("Failed to remove half created container {container_id}: {e}");
        }
    }

    /// Marks the record of a run whose task died as failed.
    async fn record_abort(&self, deployment_id: DeploymentId) {
        let mut deployment = match self.store.find(deployment_id).await {
            Ok(Some(deployment)) => deployment,
            Ok(None) => return,
            Err(e) => {
                log::error!("Unable to load aborted deployment {deployment_id}: {e}");
                return;
            }
        };
        deployment.status = DeploymentStatus::Failed;
        deployment.append_log(ABORTED);
        if let Err(e) = self.store.save(&deployment).await {
            log::error!("Unable to record abort of deployment {deployment_id}: {e}");
        }
    }

    /// Marks the deployment failed, records the error and tells observers.
    async fn fail(&self, deployment: &mut Deployment, error: PipelineError) -> PipelineError {
        log::error!(
            "Deployment {} of project {} failed: {}",
            deployment.id,
            deployment.project_id,
            error
        );
        deployment.status = DeploymentStatus::Failed;
        deployment.append_log(&error.to_string());
        if let Err(e) = self.store.save(deployment).await {
            log::error!("Unable to record failure of deployment {}: {e}", deployment.id);
        }
        self.hub
            .broadcast_status(deployment.project_id, DeploymentStatus::Failed, 0);
        error
    }

    async fn toggle(
        &self,
        project_id: ProjectId,
        toggle: Toggle,
    ) -> Result<Deployment, PipelineError> {
        let _guard = self.queue.acquire(project_id).await;

        let mut deployment = self
            .store
            .latest_with_container(project_id)
            .await?
            .ok_or(PipelineError::NoLiveDeployment(project_id))?;
        let Some(container_id) = deployment.container_id.clone() else {
            return Err(PipelineError::NoLiveDeployment(project_id));
        };

        log::info!("{toggle:?} container {container_id} for project {project_id}");
        let result = match toggle {
            Toggle::Pause => self.deadline(self.runtime.stop_container(&container_id)).await,
            Toggle::Resume => {
                self.deadline(self.runtime.start_container(&container_id))
                    .await
            }
        };

        match result {
            Ok(()) | Err(RuntimeError::AlreadyInState { .. }) => {
                let (status, paused) = match toggle {
                    Toggle::Pause => (DeploymentStatus::Paused, true),
                    Toggle::Resume => (DeploymentStatus::Ready, false),
                };
                deployment.status = status;
                deployment.is_paused = paused;
                self.store.save(&deployment).await?;
                self.hub
                    .broadcast_status(project_id, status, deployment.port);
                Ok(deployment)
            }
            Err(RuntimeError::NotFound(_)) => {
                log::warn!(
                    "Container {container_id} of deployment {} was removed out of band",
                    deployment.id
                );
                deployment.status = DeploymentStatus::Failed;
                deployment.container_id = None;
                let error = PipelineError::ContainerGone {
                    deployment_id: deployment.id,
                    container_id,
                };
                deployment.append_log(&error.to_string());
                self.store.save(&deployment).await?;
                self.hub
                    .broadcast_status(project_id, DeploymentStatus::Failed, 0);
                Err(error)
            }
            Err(e) => Err(PipelineError::TransientDaemonError(e)),
        }
    }
}
