use regatta_model::instance::{Instance, InstanceId};
use serde::Serialize;
use tokio::sync::broadcast;

/// Instance lifecycle notifications, published by the tracker after every
/// committed state change. Consumers (kill service, step runners, the API
/// layer) subscribe and tolerate lag: anything missed can be re-read from
/// the tracker's view.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum InstanceEvent {
    /// The instance's state changed; carries the post-change snapshot.
    InstanceChanged { instance: Instance },
    /// The instance was expunged from the tracker.
    InstanceExpunged { instance: Instance },
    /// A terminal status arrived for a task the tracker does not know.
    UnknownInstanceTerminated { instance_id: InstanceId },
}

impl InstanceEvent {
    pub fn instance_id(&self) -> &InstanceId {
        match self {
            InstanceEvent::InstanceChanged { instance }
            | InstanceEvent::InstanceExpunged { instance } => &instance.instance_id,
            InstanceEvent::UnknownInstanceTerminated { instance_id } => instance_id,
        }
    }
}

/// Deployment lifecycle notifications for observers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DeploymentEvent {
    Success { id: String },
    Failed { id: String, reason: String },
}

/// Fan-out bus for core events, one broadcast channel per event family.
#[derive(Clone)]
pub struct EventBus {
    instance_tx: broadcast::Sender<InstanceEvent>,
    deployment_tx: broadcast::Sender<DeploymentEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (instance_tx, _) = broadcast::channel(capacity);
        let (deployment_tx, _) = broadcast::channel(capacity);
        EventBus {
            instance_tx,
            deployment_tx,
        }
    }

    pub fn publish_instance(&self, event: InstanceEvent) {
        // no subscribers is fine
        let _ = self.instance_tx.send(event);
    }

    pub fn subscribe_instances(&self) -> broadcast::Receiver<InstanceEvent> {
        self.instance_tx.subscribe()
    }

    pub fn publish_deployment(&self, event: DeploymentEvent) {
        let _ = self.deployment_tx.send(event);
    }

    pub fn subscribe_deployments(&self) -> broadcast::Receiver<DeploymentEvent> {
        self.deployment_tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new(1024)
    }
}
