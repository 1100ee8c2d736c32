use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    config::DispatchMode,
    control::ControlError,
    registry::ClusterDescriptor,
    state::{ClusterPhase, ClusterStateHandle},
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterAction {
    Launch,
    Terminate,
}

impl ClusterAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Launch => "launch",
            Self::Terminate => "terminate",
        }
    }

    /// Phase recorded as soon as the control plane accepts the action.
    pub fn optimistic_phase(self) -> ClusterPhase {
        match self {
            Self::Launch => ClusterPhase::Pending,
            Self::Terminate => ClusterPhase::Terminating,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCapacity {
    pub instance_count: i64,
    pub status: String,
}

/// The external cloud control plane. Only [`ActionExecutor::Live`] calls it.
pub trait ClusterControl: Send + Sync + 'static {
    fn start_cluster<'a>(&'a self, resource_id: &'a str) -> BoxFuture<'a, bool>;

    fn stop_cluster<'a>(&'a self, resource_id: &'a str) -> BoxFuture<'a, bool>;

    fn check_cluster_status<'a>(
        &'a self,
        resource_id: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<ClusterCapacity>>;
}

#[derive(Clone)]
pub enum ActionExecutor {
    Simulated,
    Live(Arc<dyn ClusterControl>),
}

impl ActionExecutor {
    pub fn mode(&self) -> DispatchMode {
        match self {
            Self::Simulated => DispatchMode::DryRun,
            Self::Live(_) => DispatchMode::Production,
        }
    }

    async fn execute(&self, action: ClusterAction, resource_id: &str) -> bool {
        match self {
            Self::Simulated => {
                info!(
                    action = action.as_str(),
                    resource_id, "simulating cluster action"
                );
                true
            }
            Self::Live(control) => match action {
                ClusterAction::Launch => control.start_cluster(resource_id).await,
                ClusterAction::Terminate => control.stop_cluster(resource_id).await,
            },
        }
    }

    async fn check_status(&self, resource_id: &str) -> anyhow::Result<ClusterCapacity> {
        match self {
            Self::Simulated => Ok(ClusterCapacity {
                instance_count: 0,
                status: "simulated".to_string(),
            }),
            Self::Live(control) => control.check_cluster_status(resource_id).await,
        }
    }
}

/// Single policy point for mutating clusters: nothing else calls the
/// control plane directly.
#[derive(Clone)]
pub struct Dispatcher {
    executor: ActionExecutor,
}

impl Dispatcher {
    pub fn new(executor: ActionExecutor) -> Self {
        Self { executor }
    }

    pub fn mode(&self) -> DispatchMode {
        self.executor.mode()
    }

    pub async fn perform(
        &self,
        cluster: &ClusterDescriptor,
        action: ClusterAction,
        state: &ClusterStateHandle,
    ) -> Result<ClusterPhase, ControlError> {
        info!(
            cluster = %cluster.name,
            resource_id = %cluster.resource_id,
            action = action.as_str(),
            mode = self.mode().as_str(),
            "dispatching cluster action"
        );

        if !self.executor.execute(action, &cluster.resource_id).await {
            warn!(
                cluster = %cluster.name,
                action = action.as_str(),
                "cluster action rejected by control plane"
            );
            return Err(ControlError::DispatchFailure {
                cluster: cluster.name.clone(),
                action,
            });
        }

        let phase = action.optimistic_phase();
        state.settle(phase).await;
        Ok(phase)
    }

    pub async fn capacity(
        &self,
        cluster: &ClusterDescriptor,
    ) -> Result<ClusterCapacity, ControlError> {
        self.executor
            .check_status(&cluster.resource_id)
            .await
            .map_err(|e| ControlError::Upstream {
                cluster: cluster.name.clone(),
                message: format!("{e:#}"),
            })
    }
}

/// Talks JSON to a control-plane service fronting the auto-scaling API.
pub struct HttpClusterControl {
    base: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl HttpClusterControl {
    pub fn new(base: impl Into<String>, token: Option<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(format!("gslauncher/{}", crate::version::VERSION))
            .timeout(Duration::from_secs(15))
            .build()
            .context("build control plane http client")?;
        Ok(Self {
            base: base.into(),
            token: token.filter(|t| !t.trim().is_empty()),
            client,
        })
    }

    fn url(&self, resource_id: &str, op: &str) -> String {
        format!(
            "{}/clusters/{resource_id}/{op}",
            self.base.trim_end_matches('/')
        )
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn post_action(&self, resource_id: &str, op: &str) -> bool {
        let req = self.authed(self.client.post(self.url(resource_id, op)));
        match req.send().await {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                warn!(
                    resource_id,
                    op,
                    status = %resp.status(),
                    "control plane refused action"
                );
                false
            }
            Err(err) => {
                warn!(resource_id, op, error = %err, "control plane unreachable");
                false
            }
        }
    }

    async fn get_status(&self, resource_id: &str) -> anyhow::Result<ClusterCapacity> {
        let req = self.authed(self.client.get(self.url(resource_id, "status")));
        let capacity = req
            .send()
            .await?
            .error_for_status()?
            .json::<ClusterCapacity>()
            .await?;
        Ok(capacity)
    }
}

impl ClusterControl for HttpClusterControl {
    fn start_cluster<'a>(&'a self, resource_id: &'a str) -> BoxFuture<'a, bool> {
        Box::pin(self.post_action(resource_id, "start"))
    }

    fn stop_cluster<'a>(&'a self, resource_id: &'a str) -> BoxFuture<'a, bool> {
        Box::pin(self.post_action(resource_id, "stop"))
    }

    fn check_cluster_status<'a>(
        &'a self,
        resource_id: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<ClusterCapacity>> {
        Box::pin(self.get_status(resource_id))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    use std::sync::Mutex;

    use pretty_assertions::assert_eq;

    use crate::{registry::ClusterRegistry, state::ClusterStateTracker};

    /// Records every call and answers with a fixed verdict.
    pub(crate) struct RecordingControl {
        pub succeed: bool,
        pub calls: Mutex<Vec<(String, String)>>,
    }

    impl RecordingControl {
        pub(crate) fn new(succeed: bool) -> Arc<Self> {
            Arc::new(Self {
                succeed,
                calls: Mutex::new(Vec::new()),
            })
        }

        pub(crate) fn calls(&self) -> Vec<(String, String)> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, op: &str, resource_id: &str) {
            self.calls
                .lock()
                .unwrap()
                .push((op.to_string(), resource_id.to_string()));
        }
    }

    impl ClusterControl for RecordingControl {
        fn start_cluster<'a>(&'a self, resource_id: &'a str) -> BoxFuture<'a, bool> {
            self.record("start", resource_id);
            Box::pin(async move { self.succeed })
        }

        fn stop_cluster<'a>(&'a self, resource_id: &'a str) -> BoxFuture<'a, bool> {
            self.record("stop", resource_id);
            Box::pin(async move { self.succeed })
        }

        fn check_cluster_status<'a>(
            &'a self,
            resource_id: &'a str,
        ) -> BoxFuture<'a, anyhow::Result<ClusterCapacity>> {
            self.record("status", resource_id);
            Box::pin(async move {
                if self.succeed {
                    Ok(ClusterCapacity {
                        instance_count: 2,
                        status: "InService".to_string(),
                    })
                } else {
                    Err(anyhow::anyhow!("describe failed"))
                }
            })
        }
    }

    fn fixture() -> (ClusterDescriptor, ClusterStateHandle) {
        let descriptor = ClusterDescriptor::new("arma", "asg-arma");
        let registry = ClusterRegistry::new([descriptor.clone()]).unwrap();
        let tracker = ClusterStateTracker::new(&registry);
        (descriptor, tracker.get("arma").unwrap())
    }

    #[tokio::test]
    async fn simulated_launch_succeeds_and_marks_pending() {
        let (cluster, state) = fixture();
        let dispatcher = Dispatcher::new(ActionExecutor::Simulated);

        let phase = dispatcher
            .perform(&cluster, ClusterAction::Launch, &state)
            .await
            .unwrap();
        assert_eq!(phase, ClusterPhase::Pending);

        let snapshot = state.get().await;
        assert_eq!(snapshot.status, "Pending");
        assert!(!snapshot.is_launched);
        assert!(!snapshot.is_terminated);
    }

    #[tokio::test]
    async fn live_dispatch_calls_control_plane_with_resource_id() {
        let (cluster, state) = fixture();
        let control = RecordingControl::new(true);
        let dispatcher = Dispatcher::new(ActionExecutor::Live(control.clone()));
        assert_eq!(dispatcher.mode(), DispatchMode::Production);

        dispatcher
            .perform(&cluster, ClusterAction::Terminate, &state)
            .await
            .unwrap();
        assert_eq!(
            control.calls(),
            vec![("stop".to_string(), "asg-arma".to_string())]
        );
        assert_eq!(state.get().await.phase(), ClusterPhase::Terminating);
    }

    #[tokio::test]
    async fn live_failure_leaves_state_untouched() {
        let (cluster, state) = fixture();
        let before = state.get().await;
        let dispatcher = Dispatcher::new(ActionExecutor::Live(RecordingControl::new(false)));

        let err = dispatcher
            .perform(&cluster, ClusterAction::Launch, &state)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ControlError::DispatchFailure {
                action: ClusterAction::Launch,
                ..
            }
        ));
        assert_eq!(state.get().await, before);
    }

    #[tokio::test]
    async fn capacity_maps_control_plane_errors_to_upstream() {
        let (cluster, _) = fixture();

        let simulated = Dispatcher::new(ActionExecutor::Simulated);
        assert_eq!(simulated.capacity(&cluster).await.unwrap().status, "simulated");

        let failing = Dispatcher::new(ActionExecutor::Live(RecordingControl::new(false)));
        let err = failing.capacity(&cluster).await.unwrap_err();
        assert!(err.to_string().contains("describe failed"));
    }
}
