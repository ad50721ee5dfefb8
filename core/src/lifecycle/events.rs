use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::lifecycle::policy::AgentKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentLifecycleState {
    Spawned,
    Ready,
    Failed,
}

/// Timestamped record of one lifecycle transition, broadcast to
/// telemetry/UI subscribers. Append-only from the coordinator's point of
/// view; `reason` is populated only for [`AgentLifecycleState::Failed`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentLifecycleEvent {
    pub resource_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_name: Option<String>,
    pub agent: AgentKind,
    pub state: AgentLifecycleState,
    pub occurred_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}
