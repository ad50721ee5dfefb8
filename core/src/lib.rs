//! Concurrency and resource-management core for a desktop agent
//! orchestrator.
//!
//! The surrounding product drives many long-lived agent processes
//! attached to pseudo-terminals; this crate owns the coordination policy
//! that keeps it responsive: single-flight deduplication of starts, the
//! agent lifecycle coordinator (claims, timeout escalation, telemetry,
//! rollback), a watermark-bounded output queue and a terminal geometry
//! resolver. Process spawning, PTY transport and rendering stay with
//! external collaborators behind the [`AgentStarter`] and
//! [`ViewportSource`] seams.

mod background_start;
mod backpressure;
mod geometry;
mod lifecycle;
mod single_flight;

pub use background_start::BackgroundStartRegistry;
pub use backpressure::OutputQueue;
pub use backpressure::QueueConfig;
pub use geometry::MeasuredSize;
pub use geometry::SECONDARY_PANE_SUFFIX;
pub use geometry::SpawnSize;
pub use geometry::SpawnSizeRequest;
pub use geometry::TerminalGeometryResolver;
pub use geometry::ViewportSize;
pub use geometry::ViewportSource;
pub use lifecycle::AGENT_START_TIMEOUT_MESSAGE;
pub use lifecycle::AgentKind;
pub use lifecycle::AgentLifecycleCoordinator;
pub use lifecycle::AgentLifecycleEvent;
pub use lifecycle::AgentLifecycleState;
pub use lifecycle::AgentStarter;
pub use lifecycle::StartContext;
pub use lifecycle::StartOutcome;
pub use lifecycle::StartPairingError;
pub use lifecycle::TimeoutPolicy;
pub use lifecycle::start_timeout_total;
pub use single_flight::SingleFlight;
