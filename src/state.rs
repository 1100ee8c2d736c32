use std::{collections::BTreeMap, sync::Arc};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::registry::ClusterRegistry;

pub const LABEL_UNKNOWN: &str = "N/A";
pub const LABEL_PENDING: &str = "Pending";
pub const LABEL_TERMINATING: &str = "Terminating";
pub const LABEL_OK: &str = "Ok";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterPhase {
    Unknown,
    Pending,
    Launched,
    Terminating,
    Terminated,
}

impl ClusterPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Pending => "pending",
            Self::Launched => "launched",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Unknown => LABEL_UNKNOWN,
            Self::Pending => LABEL_PENDING,
            Self::Terminating => LABEL_TERMINATING,
            Self::Launched | Self::Terminated => LABEL_OK,
        }
    }

    /// `(is_launched, is_terminated)` written when settling into this phase.
    pub fn flags(self) -> (bool, bool) {
        match self {
            Self::Launched => (true, false),
            Self::Terminated => (false, true),
            Self::Unknown | Self::Pending | Self::Terminating => (false, false),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterState {
    pub status: String,
    pub is_launched: bool,
    pub is_terminated: bool,
    pub observed_at: DateTime<Utc>,
}

impl ClusterState {
    /// Clusters are assumed stopped until something says otherwise.
    fn initial() -> Self {
        Self {
            status: LABEL_UNKNOWN.to_string(),
            is_launched: false,
            is_terminated: true,
            observed_at: Utc::now(),
        }
    }

    /// Flag pairs that no phase produces (both set, or both clear under a
    /// label other than Pending/Terminating) read as `Unknown`.
    pub fn phase(&self) -> ClusterPhase {
        match (self.is_launched, self.is_terminated) {
            (true, false) => ClusterPhase::Launched,
            (false, true) => ClusterPhase::Terminated,
            (false, false) if self.status == LABEL_PENDING => ClusterPhase::Pending,
            (false, false) if self.status == LABEL_TERMINATING => ClusterPhase::Terminating,
            _ => ClusterPhase::Unknown,
        }
    }
}

#[derive(Clone)]
pub struct ClusterStateHandle {
    inner: Arc<RwLock<ClusterState>>,
    actions: Arc<Mutex<()>>,
}

impl ClusterStateHandle {
    fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(ClusterState::initial())),
            actions: Arc::new(Mutex::new(())),
        }
    }

    /// Serializes state transitions of this cluster together with their
    /// broadcasts. Independent of the state lock, so readers are never
    /// blocked while an action waits on the control plane.
    pub async fn lock_actions(&self) -> OwnedMutexGuard<()> {
        self.actions.clone().lock_owned().await
    }

    pub async fn get(&self) -> ClusterState {
        self.inner.read().await.clone()
    }

    /// Last writer wins.
    pub async fn apply(&self, status: impl Into<String>, is_launched: bool, is_terminated: bool) {
        let mut state = self.inner.write().await;
        state.status = status.into();
        state.is_launched = is_launched;
        state.is_terminated = is_terminated;
        state.observed_at = Utc::now();
    }

    pub async fn settle(&self, phase: ClusterPhase) {
        let (is_launched, is_terminated) = phase.flags();
        self.apply(phase.label(), is_launched, is_terminated).await;
    }
}

/// One independently locked state per registered cluster. The set of
/// clusters is fixed at construction.
pub struct ClusterStateTracker {
    states: BTreeMap<String, ClusterStateHandle>,
}

impl ClusterStateTracker {
    pub fn new(registry: &ClusterRegistry) -> Self {
        let states = registry
            .iter()
            .map(|descriptor| (descriptor.name.clone(), ClusterStateHandle::new()))
            .collect();
        Self { states }
    }

    pub fn get(&self, name: &str) -> Option<ClusterStateHandle> {
        self.states.get(name).cloned()
    }
}
