use std::{fmt, sync::Arc};

use tracing::{info, warn};

use crate::{
    broker::BrokerHandle,
    dispatch::{ClusterAction, ClusterCapacity, Dispatcher},
    notify::{
        ClusterEvent, STATUS_LAUNCHED, STATUS_PENDING, STATUS_TERMINATED, STATUS_TERMINATING,
    },
    registry::{ClusterDescriptor, ClusterRegistry},
    state::{ClusterPhase, ClusterState, ClusterStateHandle, ClusterStateTracker},
};

#[derive(Debug)]
pub enum ControlError {
    UnknownCluster { name: String },
    DispatchFailure { cluster: String, action: ClusterAction },
    MalformedConfirmation { reason: String },
    Upstream { cluster: String, message: String },
}

impl fmt::Display for ControlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownCluster { name } => write!(f, "unknown cluster: {name}"),
            Self::DispatchFailure { cluster, action } => {
                write!(f, "{} of cluster {cluster} failed", action.as_str())
            }
            Self::MalformedConfirmation { reason } => write!(f, "malformed confirmation: {reason}"),
            Self::Upstream { cluster, message } => {
                write!(f, "control plane error for cluster {cluster}: {message}")
            }
        }
    }
}

impl std::error::Error for ControlError {}

/// Authoritative state reported by external automation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Launched,
    Terminated,
}

impl Confirmation {
    pub fn phase(self) -> ClusterPhase {
        match self {
            Self::Launched => ClusterPhase::Launched,
            Self::Terminated => ClusterPhase::Terminated,
        }
    }

    pub fn event_status(self) -> &'static str {
        match self {
            Self::Launched => STATUS_LAUNCHED,
            Self::Terminated => STATUS_TERMINATED,
        }
    }
}

fn action_event_status(action: ClusterAction) -> &'static str {
    match action {
        ClusterAction::Launch => STATUS_PENDING,
        ClusterAction::Terminate => STATUS_TERMINATING,
    }
}

/// Operator and confirmation entry points over the registry, the state
/// tracker, the dispatcher and the broker.
#[derive(Clone)]
pub struct ControlPlane {
    registry: Arc<ClusterRegistry>,
    tracker: Arc<ClusterStateTracker>,
    dispatcher: Dispatcher,
    broker: BrokerHandle,
}

impl ControlPlane {
    pub fn new(registry: ClusterRegistry, dispatcher: Dispatcher, broker: BrokerHandle) -> Self {
        let tracker = ClusterStateTracker::new(&registry);
        Self {
            registry: Arc::new(registry),
            tracker: Arc::new(tracker),
            dispatcher,
            broker,
        }
    }

    pub fn broker(&self) -> &BrokerHandle {
        &self.broker
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn cluster_names(&self) -> Vec<String> {
        self.registry.names()
    }

    fn lookup(&self, name: &str) -> Result<(&ClusterDescriptor, ClusterStateHandle), ControlError> {
        let unknown = || ControlError::UnknownCluster {
            name: name.to_string(),
        };
        let descriptor = self.registry.get(name).ok_or_else(unknown)?;
        let state = self.tracker.get(name).ok_or_else(unknown)?;
        Ok((descriptor, state))
    }

    pub async fn status(&self, name: &str) -> Result<ClusterState, ControlError> {
        let (_, state) = self.lookup(name)?;
        Ok(state.get().await)
    }

    pub async fn launch(&self, name: &str) -> Result<ClusterPhase, ControlError> {
        self.act(name, ClusterAction::Launch).await
    }

    pub async fn terminate(&self, name: &str) -> Result<ClusterPhase, ControlError> {
        self.act(name, ClusterAction::Terminate).await
    }

    async fn act(&self, name: &str, action: ClusterAction) -> Result<ClusterPhase, ControlError> {
        let (descriptor, state) = self.lookup(name)?;
        let _transition = state.lock_actions().await;
        let phase = self.dispatcher.perform(descriptor, action, &state).await?;
        self.broker
            .publish(ClusterEvent::new(&descriptor.name, action_event_status(action)))
            .await;
        Ok(phase)
    }

    /// Settles the cluster owning `resource_id` and broadcasts the change.
    pub async fn confirm(
        &self,
        resource_id: &str,
        confirmation: Confirmation,
    ) -> Result<ClusterEvent, ControlError> {
        let descriptor = self
            .registry
            .find_by_resource_id(resource_id)
            .ok_or_else(|| ControlError::MalformedConfirmation {
                reason: format!("resource id {resource_id:?} is not registered"),
            })?;
        let (_, state) = self.lookup(&descriptor.name)?;

        let _transition = state.lock_actions().await;
        state.settle(confirmation.phase()).await;
        info!(
            cluster = %descriptor.name,
            resource_id,
            phase = confirmation.phase().as_str(),
            "cluster state confirmed"
        );

        let event = ClusterEvent::new(&descriptor.name, confirmation.event_status());
        self.broker.publish(event.clone()).await;
        Ok(event)
    }

    pub async fn capacity(&self, name: &str) -> Result<ClusterCapacity, ControlError> {
        let (descriptor, _) = self.lookup(name)?;
        self.dispatcher.capacity(descriptor).await.inspect_err(|err| {
            warn!(cluster = %descriptor.name, error = %err, "capacity check failed");
        })
    }

    pub async fn publish_ping(&self) -> ClusterEvent {
        let event = ClusterEvent::ping();
        self.broker.publish(event.clone()).await;
        event
    }
}
