//! Per-project serialization of pipeline work.
//!
//! Each project gets one async mutex. Deploy, pause and resume all run
//! while holding it. Deploy triggers additionally go through a single
//! pending slot: one run may execute while one waits, and any trigger that
//! arrives while a run is already waiting only refreshes the waiting run's
//! configuration.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;

use crate::project::{ProjectConfig, ProjectId};

#[derive(Default)]
struct Slot {
    run_lock: Arc<tokio::sync::Mutex<()>>,
    pending: Mutex<Option<ProjectConfig>>,
}

#[derive(Default)]
pub struct ProjectQueue {
    slots: Mutex<HashMap<ProjectId, Arc<Slot>>>,
}

/// Result of queuing a deploy trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// A new run must be spawned for this trigger.
    New,
    /// Folded into a run that is already waiting.
    Coalesced,
}

impl ProjectQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, project_id: ProjectId) -> Arc<Slot> {
        let mut slots = self
            .slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(slots.entry(project_id).or_default())
    }

    /// Waits until no other work for the project is running.
    pub async fn acquire(&self, project_id: ProjectId) -> OwnedMutexGuard<()> {
        let slot = self.slot(project_id);
        Arc::clone(&slot.run_lock).lock_owned().await
    }

    /// Records `project` as the configuration for the next run.
    pub fn enqueue(&self, project: ProjectConfig) -> Enqueued {
        let slot = self.slot(project.id);
        let mut pending = slot
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let outcome = if pending.is_some() {
            Enqueued::Coalesced
        } else {
            Enqueued::New
        };
        *pending = Some(project);
        outcome
    }

    /// Takes the newest queued configuration. Call while holding the
    /// project's lock.
    pub fn take_pending(&self, project_id: ProjectId) -> Option<ProjectConfig> {
        let slot = self.slot(project_id);
        let mut pending = slot
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        pending.take()
    }
}
