use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::project::ProjectId;

pub type DeploymentId = u64;

/// Lifecycle of a single deployment attempt.
///
/// `Retired` marks a deployment whose container was replaced by a newer
/// run. It never holds a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    #[default]
    Pending,
    Building,
    Ready,
    Failed,
    Paused,
    Cancelled,
    Retired,
}

impl AsRef<str> for DeploymentStatus {
    fn as_ref(&self) -> &str {
        match self {
            Self::Pending => "pending",
            Self::Building => "building",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::Paused => "paused",
            Self::Cancelled => "cancelled",
            Self::Retired => "retired",
        }
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_ref())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Deployment {
    pub id: DeploymentId,
    pub project_id: ProjectId,
    pub created_at: DateTime<Utc>,
    pub status: DeploymentStatus,
    pub logs: String,
    pub container_id: Option<String>,
    pub port: u16,
    pub is_paused: bool,
}

impl Deployment {
    pub fn new(id: DeploymentId, project_id: ProjectId) -> Self {
        Self {
            id,
            project_id,
            created_at: Utc::now(),
            status: DeploymentStatus::Building,
            logs: String::new(),
            container_id: None,
            port: 0,
            is_paused: false,
        }
    }

    /// Holds a container and is serving (or paused).
    pub fn is_live(&self) -> bool {
        self.container_id.is_some()
            && matches!(
                self.status,
                DeploymentStatus::Ready | DeploymentStatus::Paused
            )
    }

    pub fn append_log(&mut self, text: &str) {
        if !self.logs.is_empty() && !self.logs.ends_with('\n') {
            self.logs.push('\n');
        }
        self.logs.push_str(text);
    }

    pub fn retire(&mut self) {
        self.container_id = None;
        self.is_paused = false;
        self.status = DeploymentStatus::Retired;
    }
}
