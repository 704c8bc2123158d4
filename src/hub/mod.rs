//! Realtime event hub.
//!
//! A single coordinating task owns the observer set and serves three kinds
//! of commands: connect, disconnect and publish. Publishing never waits on
//! an observer: each observer has a bounded queue and an observer whose
//! queue is full (or whose receiver is gone) is dropped from the set.
//!
//! Observers receive every event unless they asked for a single project
//! when connecting, so clients that connect without a filter must filter
//! by `project_id` themselves.

pub mod ws;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::deployment::DeploymentStatus;
use crate::project::ProjectId;

/// Events queued per observer before it is considered too slow.
pub const OBSERVER_QUEUE: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BuildEvent {
    Status {
        project_id: ProjectId,
        status: DeploymentStatus,
        port: u16,
    },
    Log {
        project_id: ProjectId,
        log: String,
    },
}

impl BuildEvent {
    pub fn project_id(&self) -> ProjectId {
        match self {
            Self::Status { project_id, .. } | Self::Log { project_id, .. } => *project_id,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("event hub is not running")]
    Closed,
}

pub type ObserverId = Uuid;

/// Receiving end handed to a connected observer.
#[derive(Debug)]
pub struct Observer {
    pub id: ObserverId,
    events: mpsc::Receiver<BuildEvent>,
}

impl Observer {
    /// Next event, or `None` once the hub dropped this observer.
    pub async fn recv(&mut self) -> Option<BuildEvent> {
        self.events.recv().await
    }
}

enum HubCommand {
    Connect {
        filter: Option<ProjectId>,
        reply: oneshot::Sender<Observer>,
    },
    Disconnect(ObserverId),
    Publish(BuildEvent),
    Count(oneshot::Sender<usize>),
}

struct ObserverSlot {
    tx: mpsc::Sender<BuildEvent>,
    filter: Option<ProjectId>,
}

impl ObserverSlot {
    fn wants(&self, event: &BuildEvent) -> bool {
        self.filter.is_none_or(|project| project == event.project_id())
    }
}

pub struct EventHub {
    rx: mpsc::UnboundedReceiver<HubCommand>,
    observers: HashMap<ObserverId, ObserverSlot>,
}

/// Cheap handle used to talk to the hub task.
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::UnboundedSender<HubCommand>,
}

impl EventHub {
    pub fn new() -> (Self, HubHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let hub = Self {
            rx,
            observers: HashMap::new(),
        };
        (hub, HubHandle { tx })
    }

    /// Runs until every [`HubHandle`] is dropped.
    pub async fn run(mut self) {
        log::info!("Event hub started");
        while let Some(command) = self.rx.recv().await {
            match command {
                HubCommand::Connect { filter, reply } => {
                    let id = Uuid::now_v7();
                    let (tx, events) = mpsc::channel(OBSERVER_QUEUE);
                    self.observers.insert(id, ObserverSlot { tx, filter });
                    log::debug!("Observer {id} connected (filter: {filter:?})");
                    if reply.send(Observer { id, events }).is_err() {
                        self.observers.remove(&id);
                    }
                }
                HubCommand::Disconnect(id) => {
                    if self.observers.remove(&id).is_some() {
                        log::debug!("Observer {id} disconnected");
                    }
                }
                HubCommand::Publish(event) => self.fan_out(&event),
                HubCommand::Count(reply) => {
                    let _ = reply.send(self.observers.len());
                }
            }
        }
        log::info!("Event hub stopped");
    }

    fn fan_out(&mut self, event: &BuildEvent) {
        self.observers.retain(|id, slot| {
            if !slot.wants(event) {
                return true;
            }
            match slot.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    log::warn!("Observer {id} is not keeping up, dropping it");
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }
}

impl HubHandle {
    pub async fn connect(&self, filter: Option<ProjectId>) -> Result<Observer, HubError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(HubCommand::Connect { filter, reply })
            .map_err(|_| HubError::Closed)?;
        rx.await.map_err(|_| HubError::Closed)
    }

    pub fn disconnect(&self, id: ObserverId) {
        let _ = self.tx.send(HubCommand::Disconnect(id));
    }

    pub fn publish(&self, event: BuildEvent) {
        if self.tx.send(HubCommand::Publish(event)).is_err() {
            log::error!("Failed to publish event: hub is not running");
        }
    }

    pub fn broadcast_status(&self, project_id: ProjectId, status: DeploymentStatus, port: u16) {
        self.publish(BuildEvent::Status {
            project_id,
            status,
            port,
        });
    }

    pub fn broadcast_log(&self, project_id: ProjectId, line: impl Into<String>) {
        self.publish(BuildEvent::Log {
            project_id,
            log: line.into(),
        });
    }

    pub async fn observer_count(&self) -> Result<usize, HubError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(HubCommand::Count(reply))
            .map_err(|_| HubError::Closed)?;
        rx.await.map_err(|_| HubError::Closed)
    }
}

/// Spawns the hub loop on the current runtime.
pub fn spawn() -> HubHandle {
    let (hub, handle) = EventHub::new();
    tokio::spawn(hub.run());
    handle
}
