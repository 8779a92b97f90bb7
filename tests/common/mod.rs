#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing,
    dead_code
)]
//! Shared test utilities for match rendezvous integration tests.
//!
//! Provides a scripted [`ScriptedService`] whose turn updates are pushed by
//! the test, a [`ScriptedProbe`], and helpers for building match snapshots
//! and awaiting handler events.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use match_rendezvous::protocol::{
    Match, MatchConfig, MatchId, MatchStatus, ParticipantId, TurnStatus, TurnUpdate,
};
use match_rendezvous::{
    MatchPayload, MatchService, ReachabilityProbe, RendezvousError, RendezvousEvent,
    ServiceErrorCode, TurnUpdates,
};
use tokio::sync::{broadcast, mpsc, Notify};

pub const LOCAL: &str = "me";
pub const PEER: &str = "peer";

// ── Snapshots ───────────────────────────────────────────────────────

/// A two-player match seen by [`LOCAL`].
pub fn snapshot(id: &str, turn_status: TurnStatus, payload: Option<&MatchPayload>) -> Match {
    Match {
        id: MatchId::new(id),
        status: MatchStatus::Active,
        turn_status,
        participants: vec![ParticipantId::from(LOCAL), ParticipantId::from(PEER)],
        creator: ParticipantId::from(PEER),
        local: ParticipantId::from(LOCAL),
        data: payload.map(MatchPayload::encode),
        version: 0,
    }
}

/// A match where the auto-match slot is still open.
pub fn solo_snapshot(id: &str, payload: Option<&MatchPayload>) -> Match {
    Match {
        participants: vec![ParticipantId::from(LOCAL)],
        creator: ParticipantId::from(LOCAL),
        status: MatchStatus::AutoMatching,
        ..snapshot(id, TurnStatus::MyTurn, payload)
    }
}

pub fn my_turn(id: &str, payload: Option<&MatchPayload>) -> Match {
    snapshot(id, TurnStatus::MyTurn, payload)
}

pub fn their_turn(id: &str, payload: Option<&MatchPayload>) -> Match {
    snapshot(id, TurnStatus::TheirTurn, payload)
}

// ── ScriptedService ─────────────────────────────────────────────────

/// A turn submitted through [`ScriptedService::take_turn`].
#[derive(Debug, Clone)]
pub struct SubmittedTurn {
    pub match_id: MatchId,
    pub payload: MatchPayload,
    pub next: Option<ParticipantId>,
}

/// A match service driven by the test.
///
/// Turn updates are pushed with [`push`](Self::push); submitted turns,
/// cancellations and dismissals are recorded for assertions.
pub struct ScriptedService {
    signed_in: AtomicBool,
    updates: broadcast::Sender<TurnUpdate>,
    subscriptions: AtomicUsize,
    turns: StdMutex<Vec<SubmittedTurn>>,
    cancelled: StdMutex<Vec<MatchId>>,
    dismissed: StdMutex<Vec<MatchId>>,
    created: StdMutex<VecDeque<Match>>,
    fail_turns_with: StdMutex<Option<ServiceErrorCode>>,
    hold_turns: AtomicBool,
    release: Notify,
}

impl ScriptedService {
    pub fn new() -> Arc<Self> {
        let (updates, _) = broadcast::channel(64);
        Arc::new(Self {
            signed_in: AtomicBool::new(true),
            updates,
            subscriptions: AtomicUsize::new(0),
            turns: StdMutex::new(Vec::new()),
            cancelled: StdMutex::new(Vec::new()),
            dismissed: StdMutex::new(Vec::new()),
            created: StdMutex::new(VecDeque::new()),
            fail_turns_with: StdMutex::new(None),
            hold_turns: AtomicBool::new(false),
            release: Notify::new(),
        })
    }

    pub fn set_signed_in(&self, signed_in: bool) {
        self.signed_in.store(signed_in, Ordering::SeqCst);
    }

    /// Makes every subsequent `take_turn` fail with `code`.
    ///
    /// `SignInRequired` also signs the player out.
    pub fn fail_turns_with(&self, code: ServiceErrorCode) {
        *self.fail_turns_with.lock().unwrap() = Some(code);
    }

    /// Makes `take_turn` block until [`release_turns`](Self::release_turns).
    pub fn hold_turns(&self) {
        self.hold_turns.store(true, Ordering::SeqCst);
    }

    pub fn release_turns(&self) {
        self.hold_turns.store(false, Ordering::SeqCst);
        self.release.notify_waiters();
    }

    /// Queues the rooms returned by `create_match`, in order.
    pub fn script_rooms(&self, rooms: impl IntoIterator<Item = Match>) {
        self.created.lock().unwrap().extend(rooms);
    }

    pub fn push(&self, update: TurnUpdate) {
        let _ = self.updates.send(update);
    }

    pub fn push_match(&self, m: Match) {
        self.push(TurnUpdate::MatchReceived(m));
    }

    pub fn turns(&self) -> Vec<SubmittedTurn> {
        self.turns.lock().unwrap().clone()
    }

    pub fn cancelled(&self) -> Vec<MatchId> {
        self.cancelled.lock().unwrap().clone()
    }

    pub fn dismissed(&self) -> Vec<MatchId> {
        self.dismissed.lock().unwrap().clone()
    }

    pub fn subscriptions(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }

    /// Waits until `n` turns were submitted.
    pub async fn wait_for_turns(&self, n: usize) -> Vec<SubmittedTurn> {
        settle_until(|| self.turns.lock().unwrap().len() >= n).await;
        self.turns()
    }

    pub async fn wait_for_dismissals(&self, n: usize) -> Vec<MatchId> {
        settle_until(|| self.dismissed.lock().unwrap().len() >= n).await;
        self.dismissed()
    }
}

#[async_trait]
impl MatchService for ScriptedService {
    fn is_signed_in(&self) -> bool {
        self.signed_in.load(Ordering::SeqCst)
    }

    async fn create_match(&self, _config: MatchConfig) -> match_rendezvous::Result<Match> {
        self.created
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| RendezvousError::service(ServiceErrorCode::ServiceUnavailable, "no room scripted"))
    }

    async fn take_turn(
        &self,
        match_id: &MatchId,
        data: Vec<u8>,
        next: Option<ParticipantId>,
    ) -> match_rendezvous::Result<Match> {
        if self.hold_turns.load(Ordering::SeqCst) {
            self.release.notified().await;
        }
        let failure = *self.fail_turns_with.lock().unwrap();
        if let Some(code) = failure {
            if code == ServiceErrorCode::SignInRequired {
                self.set_signed_in(false);
            }
            return Err(RendezvousError::service(code, "scripted failure"));
        }
        let payload = MatchPayload::decode(Some(data.as_slice()));
        self.turns.lock().unwrap().push(SubmittedTurn {
            match_id: match_id.clone(),
            payload: payload.clone(),
            next: next.clone(),
        });
        let mut updated = their_turn(match_id.as_str(), Some(&payload));
        updated.version = self.turns.lock().unwrap().len() as u64;
        Ok(updated)
    }

    async fn cancel_match(&self, match_id: &MatchId) -> match_rendezvous::Result<()> {
        self.cancelled.lock().unwrap().push(match_id.clone());
        Ok(())
    }

    async fn dismiss_match(&self, match_id: &MatchId) -> match_rendezvous::Result<()> {
        self.dismissed.lock().unwrap().push(match_id.clone());
        Ok(())
    }

    fn subscribe_turn_updates(&self) -> TurnUpdates {
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        TurnUpdates::new(self.updates.subscribe())
    }
}

// ── ScriptedProbe ───────────────────────────────────────────────────

/// A reachability probe with a fixed answer after a fixed delay.
pub struct ScriptedProbe {
    answer: bool,
    delay: Duration,
    calls: StdMutex<Vec<(String, String)>>,
    finished: AtomicUsize,
}

impl ScriptedProbe {
    pub fn answering(answer: bool, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            answer,
            delay,
            calls: StdMutex::new(Vec::new()),
            finished: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }

    /// Probes that ran to completion (were not aborted).
    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReachabilityProbe for ScriptedProbe {
    async fn probe(&self, invite_data: &str, local_id: &str) -> match_rendezvous::Result<bool> {
        self.calls
            .lock()
            .unwrap()
            .push((invite_data.to_owned(), local_id.to_owned()));
        tokio::time::sleep(self.delay).await;
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(self.answer)
    }
}

// ── Event helpers ───────────────────────────────────────────────────

/// Receives the next handler event, failing the test after a long (virtual)
/// wait.
pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<RendezvousEvent>) -> RendezvousEvent {
    tokio::time::timeout(Duration::from_secs(600), rx.recv())
        .await
        .expect("timed out waiting for a handler event")
        .expect("event channel closed")
}

/// Asserts that no event arrives within `within`.
pub async fn assert_no_event(rx: &mut mpsc::UnboundedReceiver<RendezvousEvent>, within: Duration) {
    if let Ok(Some(event)) = tokio::time::timeout(within, rx.recv()).await {
        panic!("unexpected event: {event:?}");
    }
}

/// Yields to the runtime until `done` holds.
pub async fn settle_until(mut done: impl FnMut() -> bool) {
    for _ in 0..1_000 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition never held");
}

/// Installs a test subscriber honoring `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
