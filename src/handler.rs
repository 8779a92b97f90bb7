//! Turn-driven rendezvous state machine.
//!
//! [`MatchHandler`] is a thin handle around a background driver task. The
//! driver owns the whole session: it waits for the local player's turn,
//! checks that the payload advanced by exactly one state, lets the [`Role`]
//! handle the turn, submits the next turn, and then either re-arms the wait
//! or winds down. Every asynchronous result (turn notifications, submission
//! completions, probe results, timers) reaches the driver as a typed event on
//! one channel, tagged with the generation it was issued under; results from
//! an older generation are dropped.
//!
//! # Example
//!
//! ```rust,ignore
//! let service: Arc<dyn MatchService> = connect_somehow();
//! let m = service.create_match(MatchConfig::invite("friend")).await?;
//!
//! let (tx, mut events) = tokio::sync::mpsc::unbounded_channel();
//! let mut handler = MatchHandler::new(Role::host(invite), service, HandlerConfig::default());
//! handler.start(m, tx);
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         RendezvousEvent::Complete { .. } => { /* wait for the peer to connect */ }
//!         RendezvousEvent::MatchRemoved { .. } => break,
//!         _ => break,
//!     }
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use crate::error::{RendezvousError, Result};
use crate::event::{dispatch, MatchCallback, RendezvousEvent};
use crate::operation::{DeliveryGate, Operation, OperationSet};
use crate::payload::MatchPayload;
use crate::protocol::{Match, MatchId};
use crate::role::{NextWait, Role, RoleSignal, TurnOutcome};
use crate::service::{MatchService, TurnUpdates};
use crate::turn_wait::{self, MatchEnd, TurnWaitOutcome};

/// Default wait for the very first turn.
const DEFAULT_FIRST_TURN_WAIT: Duration = Duration::from_secs(60);

/// Default wait for every later turn.
const DEFAULT_TURN_WAIT: Duration = Duration::from_secs(10);

/// Default maximum jitter applied to re-armed waits.
const DEFAULT_JITTER_MAX: Duration = Duration::from_secs(2);

/// Default time an auto-matched peer has to answer the reachability probe.
const DEFAULT_P2P_TEST_TIMEOUT: Duration = Duration::from_secs(10);

// ── Configuration ───────────────────────────────────────────────────

/// Timing knobs of a [`MatchHandler`].
///
/// Zero wait durations mean "wait indefinitely".
///
/// # Example
///
/// ```
/// use match_rendezvous::HandlerConfig;
/// use std::time::Duration;
///
/// let config = HandlerConfig::default()
///     .with_first_turn_wait(Duration::from_secs(30))
///     .with_jitter_max(Duration::ZERO);
/// assert_eq!(config.default_turn_wait, Duration::from_secs(10));
/// ```
///
/// Durations serialize as milliseconds, so a config can be loaded from a
/// file:
///
/// ```
/// use match_rendezvous::HandlerConfig;
///
/// let config: HandlerConfig =
///     serde_json::from_str(r#"{ "first_turn_wait_ms": 5000, "dismiss_on_finish": true }"#).unwrap();
/// assert_eq!(config.first_turn_wait.as_millis(), 5000);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandlerConfig {
    /// How long to wait for the first turn after `start`.
    #[serde(rename = "first_turn_wait_ms", with = "duration_ms")]
    pub first_turn_wait: Duration,
    /// Regular wait between turns, used by roles that keep polling.
    #[serde(rename = "default_turn_wait_ms", with = "duration_ms")]
    pub default_turn_wait: Duration,
    /// Maximum random shift applied to re-armed waits, so two peers polling
    /// the same match drift apart instead of resubmitting in lockstep.
    #[serde(rename = "jitter_max_ms", with = "duration_ms")]
    pub jitter_max: Duration,
    /// How long the auto-match client waits for its reachability probe.
    #[serde(rename = "p2p_test_timeout_ms", with = "duration_ms")]
    pub p2p_test_timeout: Duration,
    /// Dismiss the match once the role is done. `None` uses the role default
    /// (clients dismiss, hosts keep monitoring).
    pub dismiss_on_finish: Option<bool>,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            first_turn_wait: DEFAULT_FIRST_TURN_WAIT,
            default_turn_wait: DEFAULT_TURN_WAIT,
            jitter_max: DEFAULT_JITTER_MAX,
            p2p_test_timeout: DEFAULT_P2P_TEST_TIMEOUT,
            dismiss_on_finish: None,
        }
    }
}

impl HandlerConfig {
    #[must_use]
    pub fn with_first_turn_wait(mut self, wait: Duration) -> Self {
        self.first_turn_wait = wait;
        self
    }

    #[must_use]
    pub fn with_default_turn_wait(mut self, wait: Duration) -> Self {
        self.default_turn_wait = wait;
        self
    }

    #[must_use]
    pub fn with_jitter_max(mut self, jitter_max: Duration) -> Self {
        self.jitter_max = jitter_max;
        self
    }

    #[must_use]
    pub fn with_p2p_test_timeout(mut self, timeout: Duration) -> Self {
        self.p2p_test_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_dismiss_on_finish(mut self, dismiss: bool) -> Self {
        self.dismiss_on_finish = Some(dismiss);
        self
    }
}

pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Shifts `base` by a uniform random amount in `[-jitter_max, +jitter_max]`.
///
/// A shift that would make the wait negative is dropped, so the result is
/// always within `[max(0, base - jitter_max), base + jitter_max]`. A result
/// equal to `base` is fine: jitter only spreads the polling cadence.
pub fn jittered(base: Duration, jitter_max: Duration, rng: &mut impl Rng) -> Duration {
    if jitter_max.is_zero() {
        return base;
    }
    let max = i128::try_from(jitter_max.as_nanos()).unwrap_or(i128::MAX);
    let base_nanos = i128::try_from(base.as_nanos()).unwrap_or(i128::MAX);
    let shifted = base_nanos.saturating_add(rng.gen_range(-max..=max));
    if shifted < 0 {
        return base;
    }
    let secs = u64::try_from(shifted / 1_000_000_000).unwrap_or(u64::MAX);
    let nanos = u32::try_from(shifted % 1_000_000_000).unwrap_or(0);
    Duration::new(secs, nanos)
}

// ── Phase ───────────────────────────────────────────────────────────

/// Where a handler is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerPhase {
    /// Constructed, not started.
    Idle,
    /// Waiting for the local player's turn.
    WaitingForTurn,
    /// Handling a turn, including its submission.
    ProcessingTurn,
    /// Auto-match client probing its peer.
    Verifying,
    /// Done with turns, watching for the match going away.
    Monitoring,
    /// Detached; no further callbacks.
    Finished,
}

// ── Handle ──────────────────────────────────────────────────────────

/// Drives one remote match through the rendezvous protocol.
///
/// Created with [`MatchHandler::new`], driven by [`MatchHandler::start`].
/// The handler runs on the tokio runtime until a terminal outcome, then
/// detaches itself. Dropping the handle detaches it as well.
pub struct MatchHandler {
    role: Option<Role>,
    service: Arc<dyn MatchService>,
    config: HandlerConfig,
    match_id: Option<MatchId>,
    gate: Arc<DeliveryGate>,
    cmd_tx: Option<mpsc::UnboundedSender<DriverEvent>>,
    phase: watch::Receiver<HandlerPhase>,
    phase_tx: Option<watch::Sender<HandlerPhase>>,
}

impl MatchHandler {
    pub fn new(role: Role, service: Arc<dyn MatchService>, config: HandlerConfig) -> Self {
        let (phase_tx, phase) = watch::channel(HandlerPhase::Idle);
        Self {
            role: Some(role),
            service,
            config,
            match_id: None,
            gate: Arc::new(DeliveryGate::new()),
            cmd_tx: None,
            phase,
            phase_tx: Some(phase_tx),
        }
    }

    /// Starts driving `current` and reporting outcomes to `callback`.
    ///
    /// Returns `false` without doing anything if the service has no usable
    /// session or the handler was already started.
    ///
    /// # Panics
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&mut self, current: Match, callback: impl MatchCallback) -> bool {
        if !self.service.is_signed_in() {
            warn!(match_id = %current.id, "cannot start handler: not signed in");
            return false;
        }
        let (Some(role), Some(phase_tx)) = (self.role.take(), self.phase_tx.take()) else {
            warn!(match_id = %current.id, "handler already started");
            return false;
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let dismiss_on_finish = self
            .config
            .dismiss_on_finish
            .unwrap_or_else(|| role.dismisses_by_default());

        info!(match_id = %current.id, role = role.name(), "starting match handler");
        // Registered before returning, so updates pushed right after `start`
        // are seen.
        let updates = self.service.subscribe_turn_updates();
        self.match_id = Some(current.id.clone());
        self.cmd_tx = Some(events_tx.clone());

        let driver = Driver {
            match_id: current.id.clone(),
            role,
            service: Arc::clone(&self.service),
            config: self.config.clone(),
            dismiss_on_finish,
            old_data: None,
            generation: 0,
            pending: None,
            verified_invite: None,
            submission: None,
            ops: OperationSet::new(),
            callback: Box::new(callback),
            gate: Arc::clone(&self.gate),
            events_tx,
            phase: phase_tx,
        };
        tokio::spawn(driver.run(current, updates, events_rx));
        true
    }

    /// Detaches, then asks the service to cancel and dismiss the match.
    ///
    /// Service failures here are logged, not reported: the caller already
    /// gave up on the match.
    pub async fn stop(&mut self) {
        self.detach();
        let Some(match_id) = self.match_id.take() else {
            return;
        };
        debug!(match_id = %match_id, "stopping match handler");
        if let Err(e) = self.service.cancel_match(&match_id).await {
            warn!(match_id = %match_id, "cancel_match failed: {e}");
        }
        if let Err(e) = self.service.dismiss_match(&match_id).await {
            warn!(match_id = %match_id, "dismiss_match failed: {e}");
        }
    }

    /// Stops reporting and releases local resources without contacting the
    /// service. No callback fires after this returns.
    pub fn detach(&mut self) {
        self.gate.close();
        if let Some(tx) = self.cmd_tx.take() {
            // The driver may already be gone.
            let _ = tx.send(DriverEvent::Detach);
        }
    }

    /// The match this handler was started on.
    pub fn match_id(&self) -> Option<&MatchId> {
        self.match_id.as_ref()
    }

    pub fn phase(&self) -> HandlerPhase {
        *self.phase.borrow()
    }

    pub fn is_finished(&self) -> bool {
        self.phase() == HandlerPhase::Finished
    }

    /// Waits until the handler reaches `phase` or finishes.
    pub async fn wait_for_phase(&mut self, phase: HandlerPhase) -> HandlerPhase {
        let reached = self
            .phase
            .wait_for(|p| *p == phase || *p == HandlerPhase::Finished)
            .await
            .map(|p| *p);
        // A dropped sender means the driver exited.
        reached.unwrap_or(HandlerPhase::Finished)
    }
}

impl std::fmt::Debug for MatchHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatchHandler")
            .field("match_id", &self.match_id)
            .field("phase", &self.phase())
            .field("config", &self.config)
            .finish()
    }
}

impl Drop for MatchHandler {
    fn drop(&mut self) {
        self.detach();
    }
}

// ── Driver ──────────────────────────────────────────────────────────

#[derive(Debug)]
enum DriverEvent {
    Turn {
        generation: u64,
        outcome: TurnWaitOutcome,
    },
    Submitted {
        generation: u64,
        result: Result<Match>,
    },
    ProbeFinished {
        generation: u64,
        reachable: bool,
    },
    ProbeTimedOut {
        generation: u64,
    },
    MatchEnded {
        generation: u64,
        end: MatchEnd,
    },
    Detach,
}

impl DriverEvent {
    fn generation(&self) -> Option<u64> {
        match self {
            Self::Turn { generation, .. }
            | Self::Submitted { generation, .. }
            | Self::ProbeFinished { generation, .. }
            | Self::ProbeTimedOut { generation }
            | Self::MatchEnded { generation, .. } => Some(*generation),
            Self::Detach => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// A turn whose submission is in flight.
struct PendingTurn {
    outcome: TurnOutcome,
    /// Registered before the submission so the peer's answer cannot slip by.
    updates: TurnUpdates,
}

struct Driver {
    match_id: MatchId,
    role: Role,
    service: Arc<dyn MatchService>,
    config: HandlerConfig,
    dismiss_on_finish: bool,
    old_data: Option<MatchPayload>,
    generation: u64,
    pending: Option<PendingTurn>,
    verified_invite: Option<String>,
    /// Abandoned, not cancelled, on teardown: the remote call completes
    /// silently.
    submission: Option<Operation>,
    ops: OperationSet,
    callback: Box<dyn MatchCallback>,
    gate: Arc<DeliveryGate>,
    events_tx: mpsc::UnboundedSender<DriverEvent>,
    phase: watch::Sender<HandlerPhase>,
}

impl Driver {
    async fn run(
        mut self,
        current: Match,
        updates: TurnUpdates,
        mut events: mpsc::UnboundedReceiver<DriverEvent>,
    ) {
        debug!(match_id = %self.match_id, "driver started");

        let mut flow = self.begin(current, updates);
        while flow == Flow::Continue {
            let Some(event) = events.recv().await else {
                break;
            };
            flow = self.handle(event);
        }

        self.teardown();
        debug!(match_id = %self.match_id, "driver exited");
    }

    fn begin(&mut self, current: Match, updates: TurnUpdates) -> Flow {
        if !current.status.is_live() {
            return self.finish(RendezvousEvent::MatchRemoved {
                match_id: self.match_id.clone(),
            });
        }
        if current.is_my_turn() {
            return self.process_turn(current, updates);
        }
        let first_wait = non_zero(self.config.first_turn_wait);
        self.arm_wait(updates, first_wait);
        Flow::Continue
    }

    fn handle(&mut self, event: DriverEvent) -> Flow {
        if let Some(generation) = event.generation() {
            if generation != self.generation {
                trace!(
                    match_id = %self.match_id,
                    generation,
                    current = self.generation,
                    "dropping stale driver event"
                );
                return Flow::Continue;
            }
        }

        match event {
            DriverEvent::Detach => {
                debug!(match_id = %self.match_id, "detach requested");
                Flow::Stop
            }
            DriverEvent::Turn { outcome, .. } => self.on_turn(outcome),
            DriverEvent::Submitted { result, .. } => {
                self.submission = None;
                match result {
                    Ok(updated) => self.on_submitted(&updated),
                    Err(error) => {
                        warn!(match_id = %self.match_id, "turn submission failed: {error}");
                        self.finish(RendezvousEvent::FatalError {
                            match_id: self.match_id.clone(),
                            error,
                        })
                    }
                }
            }
            DriverEvent::ProbeFinished { reachable, .. } => self.on_probe(reachable),
            DriverEvent::ProbeTimedOut { .. } => {
                info!(match_id = %self.match_id, "peer probe timed out");
                self.invalid()
            }
            DriverEvent::MatchEnded { end, .. } => self.on_match_end(end),
        }
    }

    fn on_turn(&mut self, outcome: TurnWaitOutcome) -> Flow {
        let match_id = self.match_id.clone();
        match outcome {
            TurnWaitOutcome::MyTurn(current) => {
                let updates = self.service.subscribe_turn_updates();
                self.process_turn(current, updates)
            }
            TurnWaitOutcome::TimedOut => {
                info!(match_id = %match_id, "timed out waiting for turn");
                self.finish(RendezvousEvent::Timeout { match_id })
            }
            TurnWaitOutcome::Removed => {
                info!(match_id = %match_id, "match removed while waiting for turn");
                self.finish(RendezvousEvent::MatchRemoved { match_id })
            }
            TurnWaitOutcome::ServiceClosed => self.finish(RendezvousEvent::FatalError {
                match_id,
                error: RendezvousError::ServiceClosed,
            }),
        }
    }

    fn process_turn(&mut self, current: Match, updates: TurnUpdates) -> Flow {
        self.set_phase(HandlerPhase::ProcessingTurn);

        let decoded = MatchPayload::decode(current.data());
        let previous = self.old_data.as_ref().map(MatchPayload::state);
        if !decoded.state().is_successor_of(previous) {
            warn!(
                match_id = %self.match_id,
                state = ?decoded.state(),
                ?previous,
                "match state out of sequence"
            );
            return self.invalid();
        }

        let mut data = decoded.clone();
        let outcome = self.role.my_turn(
            &current,
            &mut data,
            self.old_data.as_ref(),
            self.config.default_turn_wait,
        );
        self.old_data = Some(decoded);
        debug!(
            match_id = %self.match_id,
            role = self.role.name(),
            state = ?data.state(),
            next_wait = ?outcome.next_wait,
            "turn handled"
        );

        if outcome.signal == Some(RoleSignal::MatchInvalid) {
            return self.invalid();
        }

        let next = current.other_participant().cloned();
        let generation = self.next_generation();
        let service = Arc::clone(&self.service);
        let match_id = self.match_id.clone();
        let bytes = data.encode();
        let tx = self.events_tx.clone();

        self.pending = Some(PendingTurn { outcome, updates });
        self.submission = Some(Operation::spawn(
            async move { service.take_turn(&match_id, bytes, next).await },
            move |result| {
                let _ = tx.send(DriverEvent::Submitted { generation, result });
            },
        ));
        Flow::Continue
    }

    fn on_submitted(&mut self, updated: &Match) -> Flow {
        let Some(PendingTurn { outcome, updates }) = self.pending.take() else {
            return Flow::Continue;
        };
        debug!(match_id = %self.match_id, version = updated.version, "turn submitted");

        match outcome.signal {
            Some(RoleSignal::VerifyPeer { invite_data }) => {
                return self.start_verification(invite_data);
            }
            Some(RoleSignal::Complete { invite_data }) => {
                if outcome.next_wait.is_finished() && self.dismiss_on_finish {
                    self.dismiss();
                    return self.finish(RendezvousEvent::Complete {
                        match_id: self.match_id.clone(),
                        invite_data,
                    });
                }
                self.report(RendezvousEvent::Complete {
                    match_id: self.match_id.clone(),
                    invite_data,
                });
            }
            Some(RoleSignal::MatchInvalid) | None => {}
        }

        match outcome.next_wait {
            NextWait::Indefinite => self.arm_wait(updates, None),
            NextWait::After(base) => {
                let wait = jittered(base, self.config.jitter_max, &mut rand::thread_rng());
                self.arm_wait(updates, Some(wait));
            }
            NextWait::Finished if self.dismiss_on_finish => {
                self.dismiss();
                return self.stop_quietly();
            }
            NextWait::Finished => self.arm_monitor(updates),
        }
        Flow::Continue
    }

    fn start_verification(&mut self, invite_data: String) -> Flow {
        let Role::AutoMatchClient(auto) = &self.role else {
            // Only the auto-match client asks for verification.
            return self.finish(RendezvousEvent::Complete {
                match_id: self.match_id.clone(),
                invite_data: Some(invite_data),
            });
        };
        let probe = Arc::clone(auto.probe());
        let local_id = auto.local_id().to_owned();

        self.set_phase(HandlerPhase::Verifying);
        let generation = self.next_generation();
        info!(match_id = %self.match_id, "probing auto-matched peer");

        let probed = invite_data.clone();
        let match_id = self.match_id.clone();
        let tx = self.events_tx.clone();
        let probe_op = Operation::spawn(
            async move {
                match probe.probe(&probed, &local_id).await {
                    Ok(reachable) => reachable,
                    Err(e) => {
                        warn!(match_id = %match_id, "peer probe failed: {e}");
                        false
                    }
                }
            },
            move |reachable| {
                let _ = tx.send(DriverEvent::ProbeFinished {
                    generation,
                    reachable,
                });
            },
        );

        let tx = self.events_tx.clone();
        let timer = Operation::delay(self.config.p2p_test_timeout, move || {
            let _ = tx.send(DriverEvent::ProbeTimedOut { generation });
        });

        self.verified_invite = Some(invite_data);
        self.ops.push(probe_op);
        self.ops.push(timer);
        Flow::Continue
    }

    fn on_probe(&mut self, reachable: bool) -> Flow {
        self.ops.cancel_all();
        let invite_data = self.verified_invite.take();
        if !reachable {
            info!(match_id = %self.match_id, "auto-matched peer is unreachable");
            return self.invalid();
        }
        info!(match_id = %self.match_id, "auto-matched peer is reachable");
        if self.dismiss_on_finish {
            self.dismiss();
        }
        self.finish(RendezvousEvent::Complete {
            match_id: self.match_id.clone(),
            invite_data,
        })
    }

    fn on_match_end(&mut self, end: MatchEnd) -> Flow {
        let match_id = self.match_id.clone();
        match end {
            MatchEnd::Removed | MatchEnd::Ended(_) => {
                info!(match_id = %match_id, ?end, "finished match went away");
                self.finish(RendezvousEvent::MatchRemoved { match_id })
            }
            MatchEnd::ServiceClosed => self.finish(RendezvousEvent::FatalError {
                match_id,
                error: RendezvousError::ServiceClosed,
            }),
        }
    }

    // ── Arming ──────────────────────────────────────────────────────

    fn arm_wait(&mut self, updates: TurnUpdates, timeout: Option<Duration>) {
        self.set_phase(HandlerPhase::WaitingForTurn);
        let generation = self.next_generation();
        let tx = self.events_tx.clone();
        let op = turn_wait::wait_for_turn(updates, self.match_id.clone(), timeout, move |outcome| {
            let _ = tx.send(DriverEvent::Turn {
                generation,
                outcome,
            });
        });
        self.ops.push(op);
    }

    fn arm_monitor(&mut self, updates: TurnUpdates) {
        self.set_phase(HandlerPhase::Monitoring);
        let generation = self.next_generation();
        let tx = self.events_tx.clone();
        let op = turn_wait::monitor_match_end(updates, self.match_id.clone(), move |end| {
            let _ = tx.send(DriverEvent::MatchEnded { generation, end });
        });
        self.ops.push(op);
    }

    /// Fire-and-forget dismissal; it outlives the driver.
    fn dismiss(&self) {
        let service = Arc::clone(&self.service);
        let match_id = self.match_id.clone();
        debug!(match_id = %match_id, "dismissing match");
        tokio::spawn(async move {
            if let Err(e) = service.dismiss_match(&match_id).await {
                warn!(match_id = %match_id, "dismiss_match failed: {e}");
            }
        });
    }

    // ── Outcomes ────────────────────────────────────────────────────

    fn invalid(&mut self) -> Flow {
        self.finish(RendezvousEvent::MatchInvalid {
            match_id: self.match_id.clone(),
        })
    }

    /// Reports a non-terminal outcome.
    fn report(&mut self, event: RendezvousEvent) {
        let callback = &mut self.callback;
        if self.gate.deliver(|| dispatch(callback.as_mut(), event)).is_none() {
            debug!(match_id = %self.match_id, "outcome suppressed, handler detached");
        }
    }

    /// Detaches, then reports a terminal outcome.
    ///
    /// The gate is closed before the callback runs, so the callback may drop
    /// or detach its own handler and start another one.
    fn finish(&mut self, event: RendezvousEvent) -> Flow {
        self.release();
        let callback = &mut self.callback;
        if self
            .gate
            .deliver_final(|| dispatch(callback.as_mut(), event))
            .is_none()
        {
            debug!(match_id = %self.match_id, "outcome suppressed, handler detached");
        }
        Flow::Stop
    }

    fn stop_quietly(&mut self) -> Flow {
        self.release();
        self.gate.close();
        Flow::Stop
    }

    fn release(&mut self) {
        self.ops.cancel_all();
        if let Some(submission) = self.submission.take() {
            submission.abandon();
        }
        self.pending = None;
        self.verified_invite = None;
        self.old_data = None;
        self.set_phase(HandlerPhase::Finished);
    }

    fn teardown(&mut self) {
        self.release();
        self.gate.close();
    }

    fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    fn set_phase(&self, phase: HandlerPhase) {
        self.phase.send_replace(phase);
    }
}

fn non_zero(wait: Duration) -> Option<Duration> {
    (!wait.is_zero()).then_some(wait)
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn config_defaults() {
        let config = HandlerConfig::default();
        assert_eq!(config.first_turn_wait, Duration::from_secs(60));
        assert_eq!(config.default_turn_wait, Duration::from_secs(10));
        assert_eq!(config.jitter_max, Duration::from_secs(2));
        assert_eq!(config.p2p_test_timeout, Duration::from_secs(10));
        assert!(config.dismiss_on_finish.is_none());
    }

    #[test]
    fn config_builder_methods() {
        let config = HandlerConfig::default()
            .with_first_turn_wait(Duration::from_secs(5))
            .with_default_turn_wait(Duration::from_secs(1))
            .with_jitter_max(Duration::from_millis(100))
            .with_p2p_test_timeout(Duration::from_secs(3))
            .with_dismiss_on_finish(false);
        assert_eq!(config.first_turn_wait, Duration::from_secs(5));
        assert_eq!(config.default_turn_wait, Duration::from_secs(1));
        assert_eq!(config.jitter_max, Duration::from_millis(100));
        assert_eq!(config.p2p_test_timeout, Duration::from_secs(3));
        assert_eq!(config.dismiss_on_finish, Some(false));
    }

    #[test]
    fn config_serializes_milliseconds() {
        let config = HandlerConfig::default().with_jitter_max(Duration::from_millis(250));
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["jitter_max_ms"], 250);
        assert_eq!(json["first_turn_wait_ms"], 60_000);
        let back: HandlerConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn missing_config_fields_use_defaults() {
        let config: HandlerConfig = serde_json::from_str(r#"{ "jitter_max_ms": 0 }"#).unwrap();
        assert_eq!(config.jitter_max, Duration::ZERO);
        assert_eq!(config.default_turn_wait, DEFAULT_TURN_WAIT);
    }

    #[test]
    fn zero_jitter_keeps_base() {
        let mut rng = StdRng::seed_from_u64(7);
        let base = Duration::from_secs(10);
        assert_eq!(jittered(base, Duration::ZERO, &mut rng), base);
    }

    #[test]
    fn negative_shift_is_dropped() {
        // With base far below the jitter, many draws would go negative.
        let mut rng = StdRng::seed_from_u64(1);
        let base = Duration::from_millis(1);
        for _ in 0..200 {
            let wait = jittered(base, Duration::from_secs(5), &mut rng);
            assert!(wait <= Duration::from_secs(5) + base);
        }
    }

    #[test]
    fn zero_wait_means_indefinite() {
        assert_eq!(non_zero(Duration::ZERO), None);
        assert_eq!(non_zero(Duration::from_secs(1)), Some(Duration::from_secs(1)));
    }

    proptest! {
        #[test]
        fn jitter_stays_in_bounds(base_ms in 0u64..120_000, jitter_ms in 0u64..30_000, seed in any::<u64>()) {
            let mut rng = StdRng::seed_from_u64(seed);
            let base = Duration::from_millis(base_ms);
            let jitter = Duration::from_millis(jitter_ms);
            let wait = jittered(base, jitter, &mut rng);
            prop_assert!(wait >= base.saturating_sub(jitter));
            prop_assert!(wait <= base + jitter);
        }
    }
}
