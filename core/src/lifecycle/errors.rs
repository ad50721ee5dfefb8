use std::sync::Arc;

use thiserror::Error;

/// Fixed, stable message surfaced for a start timeout. UI layers
/// pattern-match this string to offer a retry affordance; do not reword.
pub const AGENT_START_TIMEOUT_MESSAGE: &str =
    "agent start timed out before the agent was ready";

/// Failure modes of a pairing start. `Clone` so single-flight joiners all
/// receive the same failure.
///
/// Duplicate starts and queue overflow are not represented here: both are
/// recoverable conditions handled locally and never raised as errors.
#[derive(Debug, Clone, Error)]
pub enum StartPairingError {
    /// The start operation did not signal readiness in time. The
    /// underlying operation is abandoned, not terminated; its late result
    /// is observed and discarded.
    #[error("{AGENT_START_TIMEOUT_MESSAGE}")]
    Timeout,
    /// The external spawn/attach operation itself failed. The original
    /// error is carried unmodified (behind an `Arc` for clonability).
    #[error("{0}")]
    Start(Arc<anyhow::Error>),
}

impl StartPairingError {
    pub(crate) fn start(error: anyhow::Error) -> Self {
        Self::Start(Arc::new(error))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}
