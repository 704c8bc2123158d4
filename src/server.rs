//! HTTP control surface.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;

use crate::config::ProjectRegistry;
use crate::deployment::{Deployment, DeploymentStatus};
use crate::hub::{self, HubError, HubHandle};
use crate::pipeline::{Pipeline, PipelineError, TriggerOutcome};
use crate::project::{ProjectConfig, ProjectId};
use crate::runtime::{ContainerRuntime, ContainerState, RuntimeError};
use crate::store::{DeploymentStore, StoreError};

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub store: Arc<dyn DeploymentStore>,
    pub hub: HubHandle,
    pub registry: ProjectRegistry,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Hub(#[from] HubError),
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Pipeline(PipelineError::UnknownProject(_)) => StatusCode::NOT_FOUND,
            Self::Pipeline(
                PipelineError::NoLiveDeployment(_) | PipelineError::ContainerGone { .. },
            ) => StatusCode::BAD_REQUEST,
            Self::Runtime(RuntimeError::NotFound(_)) => StatusCode::NOT_FOUND,
            Self::Hub(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            log::error!("Request failed: {self}");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Public view of a project. Env values stay out of responses.
#[derive(Debug, Serialize)]
struct ProjectView {
    id: ProjectId,
    name: String,
    repo_url: String,
    branch: String,
    port: Option<u16>,
    env_keys: Vec<String>,
    status: Option<DeploymentStatus>,
    container_state: Option<ContainerState>,
}

impl AppState {
    fn project(&self, id: ProjectId) -> Result<ProjectConfig, PipelineError> {
        self.registry
            .get(id)
            .ok_or(PipelineError::UnknownProject(id))
    }

    async fn container_state(&self, deployment: Option<&Deployment>) -> Option<ContainerState> {
        let container_id = deployment?.container_id.as_deref()?;
        match self
            .pipeline
            .deadline(self.runtime.container_state(container_id))
            .await
        {
            Ok(state) => Some(state),
            Err(e) => {
                log::debug!("Unable to inspect {container_id}: {e}");
                None
            }
        }
    }

    async fn view(&self, project: ProjectConfig) -> ApiResult<ProjectView> {
        let live = self.store.latest_with_container(project.id).await?;
        let container_state = self.container_state(live.as_ref()).await;
        Ok(ProjectView {
            id: project.id,
            port: project.external_port(),
            env_keys: project.env.iter().map(|e| e.key.clone()).collect(),
            status: live.map(|d| d.status),
            container_state,
            name: project.name,
            repo_url: project.repo_url,
            branch: project.branch,
        })
    }
}

async fn health(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let observers = state.hub.observer_count().await?;
    Ok(Json(json!({ "status": "ok", "observers": observers })))
}

#[derive(Debug, Deserialize)]
struct ObserveParams {
    project_id: Option<ProjectId>,
}

async fn observe(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<ObserveParams>,
) -> Response {
    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| hub::ws::observe(socket, hub, params.project_id))
}

async fn list_projects(State(state): State<AppState>) -> ApiResult<Json<Vec<ProjectView>>> {
    let mut views = Vec::new();
    for project in state.registry.list() {
        views.push(state.view(project).await?);
    }
    Ok(Json(views))
}

async fn get_project(
    State(state): State<AppState>,
    Path(id): Path<ProjectId>,
) -> ApiResult<Json<serde_json::Value>> {
    let project = state.project(id)?;
    let deployments = state.store.list_for_project(id).await?;
    let live = deployments.iter().find(|d| d.is_live());

    let memory_bytes = match live.and_then(|d| d.container_id.as_deref()) {
        Some(container_id) => state
            .pipeline
            .deadline(state.runtime.container_stats(container_id))
            .await
            .ok()
            .map(|stats| stats.memory_bytes),
        None => None,
    };

    let view = state.view(project).await?;
    Ok(Json(json!({
        "project": view,
        "deployments": deployments,
        "memory_bytes": memory_bytes,
    })))
}

async fn runtime_logs(
    State(state): State<AppState>,
    Path(id): Path<ProjectId>,
) -> ApiResult<String> {
    let container_id = state
        .store
        .latest_with_container(id)
        .await?
        .and_then(|d| d.container_id)
        .ok_or(PipelineError::NoLiveDeployment(id))?;
    Ok(state
        .pipeline
        .deadline(state.runtime.container_logs(&container_id))
        .await?)
}

async fn deploy_project(
    State(state): State<AppState>,
    Path(id): Path<ProjectId>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let project = state.project(id)?;
    let queued = match state.pipeline.trigger(project) {
        TriggerOutcome::Scheduled(_) => "scheduled",
        TriggerOutcome::Coalesced => "coalesced",
    };
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "project_id": id, "queued": queued })),
    ))
}

async fn pause_project(
    State(state): State<AppState>,
    Path(id): Path<ProjectId>,
) -> ApiResult<Json<serde_json::Value>> {
    let deployment = state.pipeline.pause(id).await?;
    Ok(Json(json!({ "message": "Project paused", "deployment": deployment })))
}

async fn resume_project(
    State(state): State<AppState>,
    Path(id): Path<ProjectId>,
) -> ApiResult<Json<serde_json::Value>> {
    let deployment = state.pipeline.resume(id).await?;
    Ok(Json(json!({ "message": "Project resumed", "deployment": deployment })))
}

async fn stats(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let deployments = state.store.all().await?;
    let active_containers = deployments
        .iter()
        .filter(|d| d.status == DeploymentStatus::Ready && d.container_id.is_some())
        .count();
    Ok(Json(json!({
        "total_projects": state.registry.list().len(),
        "total_deployments": deployments.len(),
        "active_containers": active_containers,
    })))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(observe))
        .route("/api/v1/projects", get(list_projects))
        .route("/api/v1/projects/{id}", get(get_project))
        .route("/api/v1/projects/{id}/logs/runtime", get(runtime_logs))
        .route("/api/v1/projects/{id}/deploy", post(deploy_project))
        .route("/api/v1/projects/{id}/pause", post(pause_project))
        .route("/api/v1/projects/{id}/resume", post(resume_project))
        .route("/api/v1/stats", get(stats))
        .with_state(state)
}

/// Binds `addr` and serves until `shutdown` resolves.
pub async fn serve(
    addr: SocketAddr,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    log::info!("Listening on {}", listener.local_addr()?);
    let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}
