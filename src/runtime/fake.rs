//! In-process runtime used by tests. Containers are plain records.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::Semaphore;

use super::{
    BuildRequest, ContainerRuntime, ContainerSpec, ContainerState, ContainerStats,
    PROJECT_LABEL, RunError, RuntimeError, logs,
};
use crate::project::ProjectId;

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub name: String,
    pub running: bool,
    pub labels: HashMap<String, String>,
}

#[derive(Default)]
pub struct FakeState {
    pub containers: HashMap<String, FakeContainer>,
    pub next_id: u64,
    /// Lines every build emits before finishing.
    pub build_lines: Vec<String>,
    /// Fails every build with this message.
    pub build_error: Option<String>,
    /// Fails the next create.
    pub fail_create: bool,
    /// Creates the next container but fails to start it.
    pub fail_start: bool,
    pub fail_next_stop: Option<RuntimeError>,
    pub fail_next_remove: Option<RuntimeError>,
    pub panic_in_build: bool,
    /// When set, each build waits for one permit.
    pub build_gate: Option<Arc<Semaphore>>,
    /// Recipe text seen by each build, in order.
    pub recipes: Vec<String>,
    pub run_specs: Vec<ContainerSpec>,
}

#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<FakeState>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    /// Inserts a running container as if created by an earlier process.
    pub fn insert_container(&self, id: &str, project_id: ProjectId) {
        self.state().containers.insert(
            id.to_string(),
            FakeContainer {
                name: id.to_string(),
                running: true,
                labels: HashMap::from([(PROJECT_LABEL.to_string(), project_id.to_string())]),
            },
        );
    }

    pub fn running_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self
            .state()
            .containers
            .iter()
            .filter(|(_, c)| c.running)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn build_image(
        &self,
        request: &BuildRequest,
        on_line: &mut (dyn for<'l> FnMut(&'l str) + Send),
    ) -> Result<String, RuntimeError> {
        let gate = self.state().build_gate.clone();
        if let Some(gate) = gate {
            gate.acquire().await.unwrap().forget();
        }

        let recipe = tokio::fs::read_to_string(request.context_dir.join(&request.recipe_file)).await?;
        let (lines, error) = {
            let mut state = self.state();
            if std::mem::take(&mut state.panic_in_build) {
                drop(state);
                panic!("builder crashed");
            }
            state.recipes.push(recipe);
            (state.build_lines.clone(), state.build_error.clone())
        };

        let mut transcript = String::new();
        for line in &lines {
            on_line(line);
            transcript.push_str(line);
        }
        match error {
            Some(message) => Err(RuntimeError::BuildFailed {
                message,
                log: transcript,
            }),
            None => Ok(transcript),
        }
    }

    async fn run_container(&self, spec: &ContainerSpec) -> Result<String, RunError> {
        let mut state = self.state();
        state.run_specs.push(spec.clone());
        if std::mem::take(&mut state.fail_create) {
            return Err(RunError {
                container_id: None,
                source: RuntimeError::Context(std::io::Error::other("port is already allocated")),
            });
        }
        state.next_id += 1;
        let id = format!("fake-{}", state.next_id);
        let started = !std::mem::take(&mut state.fail_start);
        state.containers.insert(
            id.clone(),
            FakeContainer {
                name: spec.name.clone(),
                running: started,
                labels: spec.labels.clone(),
            },
        );
        if started {
            Ok(id)
        } else {
            Err(RunError {
                container_id: Some(id),
                source: RuntimeError::Context(std::io::Error::other("exec format error")),
            })
        }
    }

    async fn stop_container(&self, id: &str) -> Result<(), RuntimeError> {
        let mut state = self.state();
        if let Some(e) = state.fail_next_stop.take() {
            return Err(e);
        }
        match state.containers.get_mut(id) {
            None => Err(RuntimeError::NotFound(id.to_string())),
            Some(c) if !c.running => Err(RuntimeError::AlreadyInState {
                id: id.to_string(),
                state: "stopped",
            }),
            Some(c) => {
                c.running = false;
                Ok(())
            }
        }
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        let mut state = self.state();
        match state.containers.get_mut(id) {
            None => Err(RuntimeError::NotFound(id.to_string())),
            Some(c) if c.running => Err(RuntimeError::AlreadyInState {
                id: id.to_string(),
                state: "started",
            }),
            Some(c) => {
                c.running = true;
                Ok(())
            }
        }
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        let mut state = self.state();
        if let Some(e) = state.fail_next_remove.take() {
            return Err(e);
        }
        match state.containers.remove(id) {
            Some(_) => Ok(()),
            None => Err(RuntimeError::NotFound(id.to_string())),
        }
    }

    async fn container_state(&self, id: &str) -> Result<ContainerState, RuntimeError> {
        match self.state().containers.get(id) {
            Some(c) if c.running => Ok(ContainerState::Running),
            Some(_) => Ok(ContainerState::Exited),
            None => Err(RuntimeError::NotFound(id.to_string())),
        }
    }

    async fn container_stats(&self, id: &str) -> Result<ContainerStats, RuntimeError> {
        if !self.state().containers.contains_key(id) {
            return Err(RuntimeError::NotFound(id.to_string()));
        }
        Ok(ContainerStats {
            memory_bytes: 64 * 1024 * 1024,
            cpu_total_usage: 1_000,
        })
    }

    async fn container_logs(&self, id: &str) -> Result<String, RuntimeError> {
        if !self.state().containers.contains_key(id) {
            return Err(RuntimeError::NotFound(id.to_string()));
        }
        Ok(logs::demultiplex(&logs::frame(
            1,
            format!("hello from {id}\n").as_bytes(),
        )))
    }

    async fn project_containers(&self, project_id: ProjectId) -> Result<Vec<String>, RuntimeError> {
        let wanted = project_id.to_string();
        let mut ids: Vec<_> = self
            .state()
            .containers
            .iter()
            .filter(|(_, c)| c.labels.get(PROJECT_LABEL) == Some(&wanted))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }
}
