use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use tokio::sync::broadcast;
use tokio::time::Duration;
use tokio::time::sleep;
use tracing::debug;
use tracing::warn;

use crate::background_start::BackgroundStartRegistry;
use crate::geometry::MeasuredSize;
use crate::geometry::SpawnSize;
use crate::geometry::SpawnSizeRequest;
use crate::geometry::TerminalGeometryResolver;
use crate::single_flight::SingleFlight;

mod errors;
mod events;
mod policy;

pub use errors::AGENT_START_TIMEOUT_MESSAGE;
pub use errors::StartPairingError;
pub use events::AgentLifecycleEvent;
pub use events::AgentLifecycleState;
pub use policy::AgentKind;
pub use policy::TimeoutPolicy;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Process-wide count of starts abandoned on timeout, for diagnostics
/// surfaces.
static START_TIMEOUTS: AtomicU64 = AtomicU64::new(0);

pub fn start_timeout_total() -> u64 {
    START_TIMEOUTS.load(Ordering::Relaxed)
}

/// External collaborator that actually spawns the process and attaches
/// the PTY. The coordinator treats it as opaque: it only imposes a
/// timeout around the call and reacts to its result.
#[async_trait]
pub trait AgentStarter: Send + Sync {
    async fn start(
        &self,
        key: &str,
        size: SpawnSize,
        ctx: &StartContext,
    ) -> anyhow::Result<()>;
}

/// Caller-supplied context for one pairing start.
#[derive(Debug, Clone)]
pub struct StartContext {
    pub agent: AgentKind,
    pub session_name: Option<String>,
    /// Live measurement from an already-mounted surface, if one exists.
    pub measured: Option<MeasuredSize>,
    /// Sibling terminal whose cached size can seed this pairing.
    pub related_key: Option<String>,
}

impl StartContext {
    pub fn for_agent(agent: AgentKind) -> Self {
        Self {
            agent,
            session_name: None,
            measured: None,
            related_key: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A start ran to completion and the pairing is ready.
    Started,
    /// Another caller already claimed this key; nothing was started and
    /// nothing failed.
    AlreadyClaimed,
    /// The context named a plain terminal; there is no agent to spawn.
    NothingToSpawn,
}

/// Starts an agent/terminal pairing at most once per resource key.
///
/// The coordinator composes the background-start claim, geometry
/// resolution, the per-kind timeout policy and single-flight
/// deduplication, and is the sole writer of lifecycle state for the
/// duration of one invocation: per key, subscribers see exactly one
/// `Spawned` followed by exactly one of `Ready`/`Failed`.
pub struct AgentLifecycleCoordinator {
    registry: BackgroundStartRegistry,
    geometry: Arc<TerminalGeometryResolver>,
    policy: TimeoutPolicy,
    starts: SingleFlight<Result<(), StartPairingError>>,
    events: broadcast::Sender<AgentLifecycleEvent>,
}

impl AgentLifecycleCoordinator {
    pub fn new(
        registry: BackgroundStartRegistry,
        geometry: Arc<TerminalGeometryResolver>,
        policy: TimeoutPolicy,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            registry,
            geometry,
            policy,
            starts: SingleFlight::new(),
            events,
        }
    }

    /// Subscribe to lifecycle events. Delivery is fire-and-forget: a slow
    /// subscriber lags, it never blocks the coordinator.
    pub fn subscribe(&self) -> broadcast::Receiver<AgentLifecycleEvent> {
        self.events.subscribe()
    }

    pub fn registry(&self) -> &BackgroundStartRegistry {
        &self.registry
    }

    pub fn geometry(&self) -> &TerminalGeometryResolver {
        &self.geometry
    }

    /// Start the pairing for `key` at most once.
    ///
    /// A plain terminal short-circuits (nothing to spawn, no claim, no
    /// events). A key already claimed by an earlier start returns
    /// [`StartOutcome::AlreadyClaimed`] without error. Otherwise the key
    /// is claimed, geometry resolved, and the starter run under the
    /// per-kind timeout through single flight. On any failure, including
    /// timeout, the claim is rolled back so a later retry is never
    /// permanently blocked, and the original error is returned.
    pub async fn start_pairing(
        &self,
        key: &str,
        ctx: StartContext,
        starter: Arc<dyn AgentStarter>,
    ) -> Result<StartOutcome, StartPairingError> {
        if ctx.agent.is_plain_terminal() {
            return Ok(StartOutcome::NothingToSpawn);
        }
        if !self.registry.claim(key) {
            debug!(key, "pairing already claimed; skipping duplicate start");
            return Ok(StartOutcome::AlreadyClaimed);
        }

        let size = self.geometry.compute_spawn_size(SpawnSizeRequest {
            key,
            measured: ctx.measured,
            related_key: ctx.related_key.as_deref(),
        });
        let timeout = self.policy.start_timeout(&ctx.agent);

        self.emit(key, &ctx, AgentLifecycleState::Spawned, None);

        let result = self
            .starts
            .run(key, || {
                let key = key.to_string();
                let ctx = ctx.clone();
                let starter = starter.clone();
                run_start_with_timeout(key, size, ctx, starter, timeout).boxed()
            })
            .await;

        match result {
            Ok(()) => {
                self.emit(key, &ctx, AgentLifecycleState::Ready, None);
                Ok(StartOutcome::Started)
            }
            Err(err) => {
                self.emit(key, &ctx, AgentLifecycleState::Failed, Some(err.to_string()));
                // Best-effort rollback: the claim must not outlive a
                // failed start, and nothing here may mask `err`.
                if !self.registry.release(key) {
                    warn!(key, "background-start mark was already gone during rollback");
                }
                Err(err)
            }
        }
    }

    fn emit(
        &self,
        key: &str,
        ctx: &StartContext,
        state: AgentLifecycleState,
        reason: Option<String>,
    ) {
        let event = AgentLifecycleEvent {
            resource_key: key.to_string(),
            session_name: ctx.session_name.clone(),
            agent: ctx.agent.clone(),
            state,
            occurred_at: Utc::now(),
            reason,
        };
        // Zero subscribers is not an error.
        let _ = self.events.send(event);
    }
}

/// Race the starter against the timeout. The starter runs on its own
/// task; if the timer wins, the task keeps running but its eventual
/// result is observed by a detached watcher and discarded, so it can
/// never settle the caller a second time or emit further lifecycle
/// events.
async fn run_start_with_timeout(
    key: String,
    size: SpawnSize,
    ctx: StartContext,
    starter: Arc<dyn AgentStarter>,
    timeout: Duration,
) -> Result<(), StartPairingError> {
    let mut start_task = tokio::spawn({
        let key = key.clone();
        async move { starter.start(&key, size, &ctx).await }
    });

    tokio::select! {
        joined = &mut start_task => match joined {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(StartPairingError::start(err)),
            Err(join_err) => Err(StartPairingError::start(
                anyhow::Error::new(join_err).context("agent start task aborted"),
            )),
        },
        () = sleep(timeout) => {
            START_TIMEOUTS.fetch_add(1, Ordering::Relaxed);
            tokio::spawn(async move {
                match start_task.await {
                    Ok(Ok(())) => {
                        debug!(key = %key, "agent start completed after timeout; result discarded");
                    }
                    Ok(Err(err)) => {
                        debug!(key = %key, error = %err, "agent start failed after timeout; result discarded");
                    }
                    Err(join_err) => {
                        debug!(key = %key, error = %join_err, "abandoned agent start task did not finish");
                    }
                }
            });
            Err(StartPairingError::Timeout)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use tokio::sync::broadcast::error::TryRecvError;

    use super::*;

    enum StarterBehavior {
        Succeed,
        Fail(&'static str),
        Hang(Duration),
    }

    struct ScriptedStarter {
        behavior: StarterBehavior,
        calls: AtomicUsize,
    }

    impl ScriptedStarter {
        fn new(behavior: StarterBehavior) -> Arc<Self> {
            Arc::new(Self {
                behavior,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AgentStarter for ScriptedStarter {
        async fn start(
            &self,
            _key: &str,
            _size: SpawnSize,
            _ctx: &StartContext,
        ) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.behavior {
                StarterBehavior::Succeed => Ok(()),
                StarterBehavior::Fail(message) => Err(anyhow::anyhow!(*message)),
                StarterBehavior::Hang(duration) => {
                    sleep(*duration).await;
                    Ok(())
                }
            }
        }
    }

    fn coordinator() -> AgentLifecycleCoordinator {
        AgentLifecycleCoordinator::new(
            BackgroundStartRegistry::new(),
            Arc::new(TerminalGeometryResolver::new()),
            TimeoutPolicy::default(),
        )
    }

    fn drain(
        rx: &mut broadcast::Receiver<AgentLifecycleEvent>,
    ) -> Vec<(AgentLifecycleState, Option<String>)> {
        let mut states = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(event) => states.push((event.state, event.reason)),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
                Err(err) => panic!("event stream broken: {err}"),
            }
        }
        states
    }

    #[tokio::test]
    async fn plain_terminal_short_circuits() {
        let coordinator = coordinator();
        let mut rx = coordinator.subscribe();
        let starter = ScriptedStarter::new(StarterBehavior::Succeed);

        let outcome = coordinator
            .start_pairing(
                "session:a:top",
                StartContext::for_agent(AgentKind::None),
                starter.clone(),
            )
            .await;

        assert_matches!(outcome, Ok(StartOutcome::NothingToSpawn));
        assert_eq!(starter.calls(), 0);
        assert!(drain(&mut rx).is_empty());
        assert!(!coordinator.registry().has("session:a:top"));
    }

    #[tokio::test]
    async fn successful_start_emits_spawned_then_ready() {
        let coordinator = coordinator();
        let mut rx = coordinator.subscribe();
        let starter = ScriptedStarter::new(StarterBehavior::Succeed);

        let outcome = coordinator
            .start_pairing(
                "session:a:top",
                StartContext::for_agent(AgentKind::Claude),
                starter.clone(),
            )
            .await;

        assert_matches!(outcome, Ok(StartOutcome::Started));
        assert_eq!(starter.calls(), 1);
        assert_eq!(
            drain(&mut rx),
            vec![
                (AgentLifecycleState::Spawned, None),
                (AgentLifecycleState::Ready, None),
            ]
        );
        // The claim stays until the owning surface acknowledges it.
        assert!(coordinator.registry().has("session:a:top"));
    }

    #[tokio::test]
    async fn second_start_is_skipped_while_claimed() {
        let coordinator = coordinator();
        let mut rx = coordinator.subscribe();
        let starter = ScriptedStarter::new(StarterBehavior::Succeed);

        let first = coordinator
            .start_pairing(
                "session:a:top",
                StartContext::for_agent(AgentKind::Claude),
                starter.clone(),
            )
            .await;
        let second = coordinator
            .start_pairing(
                "session:a:top",
                StartContext::for_agent(AgentKind::Claude),
                starter.clone(),
            )
            .await;

        assert_matches!(first, Ok(StartOutcome::Started));
        assert_matches!(second, Ok(StartOutcome::AlreadyClaimed));
        assert_eq!(starter.calls(), 1);
        assert_eq!(drain(&mut rx).len(), 2);
    }

    #[tokio::test]
    async fn failed_start_rolls_back_the_claim() {
        let coordinator = coordinator();
        let mut rx = coordinator.subscribe();
        let starter = ScriptedStarter::new(StarterBehavior::Fail("spawn refused"));

        let result = coordinator
            .start_pairing(
                "session:a:top",
                StartContext::for_agent(AgentKind::Claude),
                starter.clone(),
            )
            .await;

        let err = match result {
            Err(err) => err,
            Ok(outcome) => panic!("expected failure, got {outcome:?}"),
        };
        assert_eq!(err.to_string(), "spawn refused");
        assert_eq!(
            drain(&mut rx),
            vec![
                (AgentLifecycleState::Spawned, None),
                (AgentLifecycleState::Failed, Some("spawn refused".to_string())),
            ]
        );
        assert!(coordinator.registry().marked_keys().is_empty());

        // The key is free again: a retry runs a fresh cycle.
        let retry_starter = ScriptedStarter::new(StarterBehavior::Succeed);
        let retry = coordinator
            .start_pairing(
                "session:a:top",
                StartContext::for_agent(AgentKind::Claude),
                retry_starter.clone(),
            )
            .await;
        assert_matches!(retry, Ok(StartOutcome::Started));
        assert_eq!(retry_starter.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_start_fails_with_the_fixed_message() {
        let coordinator = coordinator();
        let mut rx = coordinator.subscribe();
        // Hangs well past the default 30s timeout for Claude.
        let starter = ScriptedStarter::new(StarterBehavior::Hang(Duration::from_secs(3600)));
        let timeouts_before = start_timeout_total();

        let result = coordinator
            .start_pairing(
                "session:a:top",
                StartContext::for_agent(AgentKind::Claude),
                starter,
            )
            .await;

        let err = match result {
            Err(err) => err,
            Ok(outcome) => panic!("expected timeout, got {outcome:?}"),
        };
        assert!(err.is_timeout());
        assert_eq!(err.to_string(), AGENT_START_TIMEOUT_MESSAGE);
        assert!(start_timeout_total() > timeouts_before);
        assert!(coordinator.registry().marked_keys().is_empty());

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].0, AgentLifecycleState::Spawned);
        assert_eq!(events[1].0, AgentLifecycleState::Failed);
        assert_eq!(events[1].1.as_deref(), Some(AGENT_START_TIMEOUT_MESSAGE));

        // Let the abandoned start finish; its late result is discarded
        // and must not produce further events.
        tokio::time::advance(Duration::from_secs(3600)).await;
        tokio::task::yield_now().await;
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_agent_kind_survives_past_the_default_timeout() {
        let coordinator = coordinator();
        // Ready after 60s: beyond the 30s default, within the extended
        // 120s that Codex gets.
        let starter = ScriptedStarter::new(StarterBehavior::Hang(Duration::from_secs(60)));

        let outcome = coordinator
            .start_pairing(
                "session:b:top",
                StartContext::for_agent(AgentKind::Codex),
                starter.clone(),
            )
            .await;

        assert_matches!(outcome, Ok(StartOutcome::Started));
        assert_eq!(starter.calls(), 1);
    }

    #[tokio::test]
    async fn measured_size_reaches_the_starter() {
        use std::sync::Mutex;

        struct SizeProbe {
            seen: Mutex<Option<SpawnSize>>,
        }

        #[async_trait]
        impl AgentStarter for SizeProbe {
            async fn start(
                &self,
                _key: &str,
                size: SpawnSize,
                _ctx: &StartContext,
            ) -> anyhow::Result<()> {
                if let Ok(mut seen) = self.seen.lock() {
                    *seen = Some(size);
                }
                Ok(())
            }
        }

        let coordinator = coordinator();
        let probe = Arc::new(SizeProbe {
            seen: Mutex::new(None),
        });
        let ctx = StartContext {
            agent: AgentKind::Claude,
            session_name: None,
            measured: Some(MeasuredSize { cols: 140, rows: 50 }),
            related_key: None,
        };

        let outcome = coordinator
            .start_pairing("session:c:top", ctx, probe.clone())
            .await;
        assert_matches!(outcome, Ok(StartOutcome::Started));

        let seen = match probe.seen.lock() {
            Ok(seen) => *seen,
            Err(err) => panic!("probe poisoned: {err}"),
        };
        assert_eq!(seen, Some(SpawnSize::new(138, 50)));
    }
}
