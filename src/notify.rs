use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

pub const STATUS_LAUNCHED: &str = "launched";
pub const STATUS_TERMINATED: &str = "terminated";
pub const STATUS_PENDING: &str = "pending";
pub const STATUS_TERMINATING: &str = "terminating";

/// Context used by the diagnostic ping published from `POST /event`.
pub const PING_CONTEXT: &str = "x";

/// A fact pushed to every `/listen` subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterEvent {
    pub status: String,
    pub context: String,
}

impl ClusterEvent {
    pub fn new(context: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            context: context.into(),
        }
    }

    pub fn ping() -> Self {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        Self::new(PING_CONTEXT, format!("the time is {now}"))
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
