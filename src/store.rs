//! Deployment record store.
//!
//! The pipeline only needs create/save/find plus "newest first" listings
//! per project. [`InMemoryDeploymentStore`] is what the binary ships with.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use thiserror::Error;

use crate::deployment::{Deployment, DeploymentId};
use crate::project::ProjectId;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("deployment {0} not found")]
    NotFound(DeploymentId),
    #[error("deployment store lock poisoned")]
    Poisoned,
}

#[async_trait]
pub trait DeploymentStore: Send + Sync {
    /// Inserts a fresh `Building` deployment for the project.
    async fn create(&self, project_id: ProjectId) -> StoreResult<Deployment>;

    /// Overwrites an existing deployment.
    async fn save(&self, deployment: &Deployment) -> StoreResult<()>;

    async fn find(&self, id: DeploymentId) -> StoreResult<Option<Deployment>>;

    /// All deployments of a project, newest first.
    async fn list_for_project(&self, project_id: ProjectId) -> StoreResult<Vec<Deployment>>;

    async fn all(&self) -> StoreResult<Vec<Deployment>>;

    /// Most recent deployment of the project that still references a
    /// container.
    async fn latest_with_container(
        &self,
        project_id: ProjectId,
    ) -> StoreResult<Option<Deployment>> {
        Ok(self
            .list_for_project(project_id)
            .await?
            .into_iter()
            .find(|d| d.container_id.is_some()))
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryDeploymentStore {
    state: Arc<RwLock<InMemoryState>>,
}

#[derive(Debug, Default)]
struct InMemoryState {
    next_id: DeploymentId,
    deployments: HashMap<DeploymentId, Deployment>,
}

impl InMemoryDeploymentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn newest_first(mut deployments: Vec<Deployment>) -> Vec<Deployment> {
    // Ids are handed out monotonically, so they order by creation.
    deployments.sort_by(|a, b| b.id.cmp(&a.id));
    deployments
}

#[async_trait]
impl DeploymentStore for InMemoryDeploymentStore {
    async fn create(&self, project_id: ProjectId) -> StoreResult<Deployment> {
        let mut state = self.state.write().map_err(|_| StoreError::Poisoned)?;
        state.next_id += 1;
        let deployment = Deployment::new(state.next_id, project_id);
        state.deployments.insert(deployment.id, deployment.clone());
        Ok(deployment)
    }

    async fn save(&self, deployment: &Deployment) -> StoreResult<()> {
        let mut state = self.state.write().map_err(|_| StoreError::Poisoned)?;
        match state.deployments.get_mut(&deployment.id) {
            Some(existing) => {
                *existing = deployment.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(deployment.id)),
        }
    }

    async fn find(&self, id: DeploymentId) -> StoreResult<Option<Deployment>> {
        let state = self.state.read().map_err(|_| StoreError::Poisoned)?;
        Ok(state.deployments.get(&id).cloned())
    }

    async fn list_for_project(&self, project_id: ProjectId) -> StoreResult<Vec<Deployment>> {
        let state = self.state.read().map_err(|_| StoreError::Poisoned)?;
        let deployments = state
            .deployments
            .values()
            .filter(|d| d.project_id == project_id)
            .cloned()
            .collect();
        Ok(newest_first(deployments))
    }

    async fn all(&self) -> StoreResult<Vec<Deployment>> {
        let state = self.state.read().map_err(|_| StoreError::Poisoned)?;
        Ok(newest_first(state.deployments.values().cloned().collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployment::DeploymentStatus;

    #[tokio::test]
    async fn test_create_assigns_increasing_ids() {
        let store = InMemoryDeploymentStore::new();
        let first = store.create(1).await.expect("create");
        let second = store.create(1).await.expect("create");
        assert!(second.id > first.id);
        assert_eq!(first.status, DeploymentStatus::Building);
    }

    #[tokio::test]
    async fn test_list_is_newest_first_and_scoped() {
        let store = InMemoryDeploymentStore::new();
        let a = store.create(1).await.expect("create");
        store.create(2).await.expect("create");
        let c = store.create(1).await.expect("create");

        let ids: Vec<_> = store
            .list_for_project(1)
            .await
            .expect("list")
            .iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(ids, vec![c.id, a.id]);
    }

    #[tokio::test]
    async fn test_latest_with_container() {
        let store = InMemoryDeploymentStore::new();
        let mut old = store.create(1).await.expect("create");
        old.container_id = Some("old".to_string());
        store.save(&old).await.expect("save");
        // Newer deployment without a container must be skipped
        store.create(1).await.expect("create");

        let latest = store
            .latest_with_container(1)
            .await
            .expect("query")
            .expect("a deployment with a container");
        assert_eq!(latest.id, old.id);
    }

    #[tokio::test]
    async fn test_save_unknown_deployment() {
        let store = InMemoryDeploymentStore::new();
        let ghost = Deployment::new(42, 1);
        assert!(matches!(
            store.save(&ghost).await,
            Err(StoreError::NotFound(42))
        ));
    }
}
