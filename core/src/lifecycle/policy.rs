use std::collections::HashSet;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(30);
const EXTENDED_START_TIMEOUT: Duration = Duration::from_secs(120); // slow-to-ready agents

/// Kind of agent attached to a terminal pairing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    /// Plain terminal with no agent attached; there is nothing to spawn.
    None,
    Claude,
    Codex,
    Gemini,
    Opencode,
    /// Agent kinds this build does not recognize; they get default
    /// timeout handling.
    #[serde(untagged)]
    Other(String),
}

impl AgentKind {
    pub fn is_plain_terminal(&self) -> bool {
        matches!(self, AgentKind::None)
    }
}

/// Maps an agent kind to the duration a start is allowed before it is
/// abandoned. A small set of kinds is known to be slow to reach a ready
/// state and gets the extended duration; everything else, including
/// unrecognized kinds, gets the default.
#[derive(Debug, Clone)]
pub struct TimeoutPolicy {
    default: Duration,
    extended: Duration,
    slow_kinds: HashSet<AgentKind>,
}

impl TimeoutPolicy {
    pub fn new(default: Duration, extended: Duration, slow_kinds: HashSet<AgentKind>) -> Self {
        Self {
            default,
            extended,
            slow_kinds,
        }
    }

    pub fn start_timeout(&self, agent: &AgentKind) -> Duration {
        if self.slow_kinds.contains(agent) {
            self.extended
        } else {
            self.default
        }
    }
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            default: DEFAULT_START_TIMEOUT,
            extended: EXTENDED_START_TIMEOUT,
            slow_kinds: HashSet::from([AgentKind::Codex, AgentKind::Gemini]),
        }
    }
}
