#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! Integration tests for [`MatchHandler`] driven by a scripted match service.
//!
//! Time is paused in every test, so turn waits and probe timeouts elapse
//! instantly once the runtime is idle.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{
    assert_no_event, init_tracing, my_turn, next_event, their_turn, ScriptedProbe,
    ScriptedService, LOCAL, PEER,
};
use match_rendezvous::protocol::{MatchId, MatchStatus, ParticipantId, TurnUpdate};
use match_rendezvous::{
    HandlerConfig, HandlerPhase, MatchCallback, MatchHandler, MatchPayload, MatchService,
    RendezvousError, RendezvousEvent, Role, ServiceErrorCode,
};
use tokio::sync::mpsc;
use tokio::time::Instant;

fn handler(role: Role, service: &Arc<ScriptedService>, config: HandlerConfig) -> MatchHandler {
    let service: Arc<dyn MatchService> = Arc::clone(service) as Arc<dyn MatchService>;
    MatchHandler::new(role, service, config)
}

fn no_jitter() -> HandlerConfig {
    HandlerConfig::default().with_jitter_max(Duration::ZERO)
}

/// Paused time advances in whole timer ticks.
fn assert_close(actual: Duration, expected: Duration) {
    assert!(
        actual >= expected && actual < expected + Duration::from_millis(10),
        "waited {actual:?}, expected {expected:?}"
    );
}

// ── Host ────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn host_publishes_invite_then_monitors_until_removed() {
    init_tracing();
    let service = ScriptedService::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut host = handler(Role::host("abc"), &service, HandlerConfig::default());

    assert!(host.start(my_turn("m1", None), tx));

    match next_event(&mut rx).await {
        RendezvousEvent::Complete {
            match_id,
            invite_data,
        } => {
            assert_eq!(match_id, MatchId::new("m1"));
            assert_eq!(invite_data, None);
        }
        other => panic!("expected Complete, got {other:?}"),
    }
    let turns = service.turns();
    assert_eq!(turns.len(), 1);
    assert_eq!(turns[0].payload, MatchPayload::with_invite("abc"));
    assert_eq!(turns[0].next, Some(ParticipantId::from(PEER)));

    assert_eq!(
        host.wait_for_phase(HandlerPhase::Monitoring).await,
        HandlerPhase::Monitoring
    );

    // The peer answering with a turn is not the end of the match.
    service.push_match(my_turn("m1", Some(&MatchPayload::with_invite("abc"))));
    assert_no_event(&mut rx, Duration::from_secs(300)).await;

    service.push(TurnUpdate::MatchRemoved(MatchId::new("m1")));
    assert!(matches!(
        next_event(&mut rx).await,
        RendezvousEvent::MatchRemoved { .. }
    ));
    assert!(host.is_finished());
    assert!(service.dismissed().is_empty());
    assert_eq!(service.turns().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn host_rejects_room_that_already_has_data() {
    let service = ScriptedService::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut host = handler(Role::host("abc"), &service, HandlerConfig::default());

    host.start(my_turn("m1", Some(&MatchPayload::uninitialized())), tx);

    assert!(matches!(
        next_event(&mut rx).await,
        RendezvousEvent::MatchInvalid { .. }
    ));
    assert_no_event(&mut rx, Duration::from_secs(60)).await;
    assert!(service.turns().is_empty());
    assert!(host.is_finished());
}

#[tokio::test(start_paused = true)]
async fn host_monitor_reports_cancellation() {
    let service = ScriptedService::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut host = handler(Role::host("abc"), &service, HandlerConfig::default());
    host.start(my_turn("m1", None), tx);
    let _complete = next_event(&mut rx).await;

    let mut cancelled = their_turn("m1", Some(&MatchPayload::with_invite("abc")));
    cancelled.status = MatchStatus::Cancelled;
    service.push_match(cancelled);

    assert!(matches!(
        next_event(&mut rx).await,
        RendezvousEvent::MatchRemoved { .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn host_can_opt_into_dismissal() {
    let service = ScriptedService::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut host = handler(
        Role::host("abc"),
        &service,
        HandlerConfig::default().with_dismiss_on_finish(true),
    );
    host.start(my_turn("m1", None), tx);

    assert!(matches!(
        next_event(&mut rx).await,
        RendezvousEvent::Complete { .. }
    ));
    assert_eq!(service.wait_for_dismissals(1).await, vec![MatchId::new("m1")]);
    assert!(host.is_finished());
}

// ── Client ──────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn client_reports_invite_and_dismisses() {
    let service = ScriptedService::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut client = handler(Role::client(), &service, HandlerConfig::default());

    client.start(my_turn("m1", Some(&MatchPayload::with_invite("xyz"))), tx);

    match next_event(&mut rx).await {
        RendezvousEvent::Complete { invite_data, .. } => {
            assert_eq!(invite_data.as_deref(), Some("xyz"));
        }
        other => panic!("expected Complete, got {other:?}"),
    }
    let turns = service.turns();
    assert_eq!(turns.len(), 1);
    assert_eq!(turns[0].payload, MatchPayload::with_invite("xyz"));
    assert_eq!(service.wait_for_dismissals(1).await, vec![MatchId::new("m1")]);
    assert!(client.is_finished());
    assert_no_event(&mut rx, Duration::from_secs(60)).await;
}

#[tokio::test(start_paused = true)]
async fn client_waits_for_the_host_turn() {
    let service = ScriptedService::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut client = handler(Role::client(), &service, HandlerConfig::default());

    client.start(their_turn("m1", None), tx);
    assert_eq!(
        client.wait_for_phase(HandlerPhase::WaitingForTurn).await,
        HandlerPhase::WaitingForTurn
    );

    service.push_match(their_turn("other", None));
    service.push_match(my_turn("m1", Some(&MatchPayload::with_invite("xyz"))));

    assert!(matches!(
        next_event(&mut rx).await,
        RendezvousEvent::Complete { invite_data: Some(ref d), .. } if d == "xyz"
    ));
}

#[tokio::test(start_paused = true)]
async fn client_keeps_polling_an_uninitialized_match() {
    let service = ScriptedService::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut client = handler(Role::client(), &service, no_jitter());

    client.start(my_turn("m1", None), tx);
    let turns = service.wait_for_turns(1).await;
    assert_eq!(turns[0].payload, MatchPayload::uninitialized());
    assert_eq!(turns[0].next, Some(ParticipantId::from(PEER)));
    assert_eq!(
        client.wait_for_phase(HandlerPhase::WaitingForTurn).await,
        HandlerPhase::WaitingForTurn
    );

    service.push_match(my_turn("m1", Some(&MatchPayload::with_invite("xyz"))));
    assert!(matches!(
        next_event(&mut rx).await,
        RendezvousEvent::Complete { .. }
    ));
    assert_eq!(service.wait_for_turns(2).await.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn client_rejects_repeated_state() {
    let service = ScriptedService::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut client = handler(Role::client(), &service, no_jitter());

    client.start(my_turn("m1", Some(&MatchPayload::uninitialized())), tx);
    service.wait_for_turns(1).await;
    client.wait_for_phase(HandlerPhase::WaitingForTurn).await;

    service.push_match(my_turn("m1", Some(&MatchPayload::uninitialized())));

    assert!(matches!(
        next_event(&mut rx).await,
        RendezvousEvent::MatchInvalid { .. }
    ));
    assert_eq!(service.turns().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn state_sequence_must_advance_by_exactly_one() {
    // (second state, expected to be accepted)
    let cases = [
        (MatchPayload::uninitialized(), false),
        (MatchPayload::invalid(), false),
        (MatchPayload::with_invite("xyz"), true),
    ];
    for (second, accepted) in cases {
        let service = ScriptedService::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut client = handler(Role::client(), &service, no_jitter());

        client.start(my_turn("m1", Some(&MatchPayload::uninitialized())), tx);
        service.wait_for_turns(1).await;
        client.wait_for_phase(HandlerPhase::WaitingForTurn).await;
        service.push_match(my_turn("m1", Some(&second)));

        let event = next_event(&mut rx).await;
        if accepted {
            assert!(matches!(event, RendezvousEvent::Complete { .. }), "{event:?}");
        } else {
            assert!(matches!(event, RendezvousEvent::MatchInvalid { .. }), "{event:?}");
        }
    }
}

#[tokio::test(start_paused = true)]
async fn garbage_payload_is_invalid() {
    let service = ScriptedService::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut client = handler(Role::client(), &service, HandlerConfig::default());

    let mut m = my_turn("m1", None);
    m.data = Some(b"definitely not a payload".to_vec());
    client.start(m, tx);

    assert!(matches!(
        next_event(&mut rx).await,
        RendezvousEvent::MatchInvalid { .. }
    ));
    assert!(service.turns().is_empty());
}

// ── Waiting ─────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn first_wait_times_out() {
    let service = ScriptedService::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let config = HandlerConfig::default().with_first_turn_wait(Duration::from_secs(30));
    let mut client = handler(Role::client(), &service, config);

    let started = Instant::now();
    client.start(their_turn("m1", None), tx);

    assert!(matches!(
        next_event(&mut rx).await,
        RendezvousEvent::Timeout { .. }
    ));
    assert_close(started.elapsed(), Duration::from_secs(30));
    assert!(client.is_finished());
}

#[tokio::test(start_paused = true)]
async fn zero_first_wait_waits_indefinitely() {
    let service = ScriptedService::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let config = HandlerConfig::default().with_first_turn_wait(Duration::ZERO);
    let mut client = handler(Role::client(), &service, config);

    client.start(their_turn("m1", None), tx);
    assert_no_event(&mut rx, Duration::from_secs(24 * 3600)).await;

    service.push_match(my_turn("m1", Some(&MatchPayload::with_invite("xyz"))));
    assert!(matches!(
        next_event(&mut rx).await,
        RendezvousEvent::Complete { .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn rearmed_wait_is_jittered_within_bounds() {
    let service = ScriptedService::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let config = HandlerConfig::default()
        .with_default_turn_wait(Duration::from_secs(10))
        .with_jitter_max(Duration::from_secs(2));
    let mut client = handler(Role::client(), &service, config);

    let started = Instant::now();
    client.start(my_turn("m1", None), tx);

    assert!(matches!(
        next_event(&mut rx).await,
        RendezvousEvent::Timeout { .. }
    ));
    let waited = started.elapsed();
    assert!(waited >= Duration::from_secs(8), "{waited:?}");
    assert!(waited <= Duration::from_secs(12), "{waited:?}");
}

#[tokio::test(start_paused = true)]
async fn removal_while_waiting_is_reported() {
    let service = ScriptedService::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut client = handler(Role::client(), &service, HandlerConfig::default());

    client.start(their_turn("m1", None), tx);
    service.push(TurnUpdate::MatchRemoved(MatchId::new("m2")));
    service.push(TurnUpdate::MatchRemoved(MatchId::new("m1")));

    assert!(matches!(
        next_event(&mut rx).await,
        RendezvousEvent::MatchRemoved { .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn expired_match_is_reported_as_removed() {
    let service = ScriptedService::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut client = handler(Role::client(), &service, HandlerConfig::default());

    client.start(their_turn("m1", None), tx);
    let mut expired = my_turn("m1", None);
    expired.status = MatchStatus::Expired;
    service.push_match(expired);

    assert!(matches!(
        next_event(&mut rx).await,
        RendezvousEvent::MatchRemoved { .. }
    ));
    assert!(service.turns().is_empty());
}

#[tokio::test(start_paused = true)]
async fn starting_on_a_dead_match_reports_removal() {
    let service = ScriptedService::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut client = handler(Role::client(), &service, HandlerConfig::default());

    let mut cancelled = my_turn("m1", None);
    cancelled.status = MatchStatus::Cancelled;
    client.start(cancelled, tx);

    assert!(matches!(
        next_event(&mut rx).await,
        RendezvousEvent::MatchRemoved { .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn subscription_is_taken_before_submission() {
    // The peer reacts to our turn before take_turn even returns.
    let service = ScriptedService::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut client = handler(Role::client(), &service, no_jitter());
    service.hold_turns();

    client.start(my_turn("m1", None), tx);
    assert_eq!(service.subscriptions(), 1);
    common::settle_until(|| client.phase() == HandlerPhase::ProcessingTurn).await;
    service.push_match(my_turn("m1", Some(&MatchPayload::with_invite("xyz"))));
    service.release_turns();

    assert!(matches!(
        next_event(&mut rx).await,
        RendezvousEvent::Complete { .. }
    ));
}

// ── Failures ────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn failed_submission_is_fatal() {
    let service = ScriptedService::new();
    service.fail_turns_with(ServiceErrorCode::NotYourTurn);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut host = handler(Role::host("abc"), &service, HandlerConfig::default());

    host.start(my_turn("m1", None), tx);

    match next_event(&mut rx).await {
        RendezvousEvent::FatalError { error, .. } => {
            assert_eq!(error.code(), Some(ServiceErrorCode::NotYourTurn));
        }
        other => panic!("expected FatalError, got {other:?}"),
    }
    assert_no_event(&mut rx, Duration::from_secs(60)).await;
}

#[tokio::test(start_paused = true)]
async fn start_refuses_without_session_or_twice() {
    let service = ScriptedService::new();
    let (tx, _rx) = mpsc::unbounded_channel();

    service.set_signed_in(false);
    let mut client = handler(Role::client(), &service, HandlerConfig::default());
    assert!(!client.start(their_turn("m1", None), tx.clone()));
    assert_eq!(client.phase(), HandlerPhase::Idle);

    service.set_signed_in(true);
    assert!(client.start(their_turn("m1", None), tx.clone()));
    assert!(!client.start(their_turn("m1", None), tx));
    assert_eq!(client.match_id(), Some(&MatchId::new("m1")));
}

// ── Auto-match client ───────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn auto_match_client_completes_after_successful_probe() {
    let service = ScriptedService::new();
    let probe = ScriptedProbe::answering(true, Duration::from_secs(1));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut client = handler(
        Role::auto_match_client(probe.clone(), LOCAL),
        &service,
        HandlerConfig::default(),
    );

    client.start(my_turn("m1", Some(&MatchPayload::with_invite("xyz"))), tx);
    assert_eq!(
        client.wait_for_phase(HandlerPhase::Verifying).await,
        HandlerPhase::Verifying
    );

    assert!(matches!(
        next_event(&mut rx).await,
        RendezvousEvent::Complete { invite_data: Some(ref d), .. } if d == "xyz"
    ));
    assert_eq!(probe.calls(), vec![("xyz".to_owned(), LOCAL.to_owned())]);
    assert_eq!(service.turns().len(), 1);
    assert_eq!(service.wait_for_dismissals(1).await, vec![MatchId::new("m1")]);
}

#[tokio::test(start_paused = true)]
async fn auto_match_client_rejects_unreachable_peer() {
    let service = ScriptedService::new();
    let probe = ScriptedProbe::answering(false, Duration::from_millis(100));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut client = handler(
        Role::auto_match_client(probe, LOCAL),
        &service,
        HandlerConfig::default(),
    );

    client.start(my_turn("m1", Some(&MatchPayload::with_invite("xyz"))), tx);
    assert!(matches!(
        next_event(&mut rx).await,
        RendezvousEvent::MatchInvalid { .. }
    ));
    assert!(service.dismissed().is_empty());
}

#[tokio::test(start_paused = true)]
async fn slow_probe_times_out_once_and_late_result_is_dropped() {
    let service = ScriptedService::new();
    let probe = ScriptedProbe::answering(true, Duration::from_secs(60));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let config = HandlerConfig::default().with_p2p_test_timeout(Duration::from_secs(10));
    let mut client = handler(Role::auto_match_client(probe.clone(), LOCAL), &service, config);

    let started = Instant::now();
    client.start(my_turn("m1", Some(&MatchPayload::with_invite("xyz"))), tx);

    assert!(matches!(
        next_event(&mut rx).await,
        RendezvousEvent::MatchInvalid { .. }
    ));
    assert_close(started.elapsed(), Duration::from_secs(10));

    // Well past the moment the probe would have answered.
    assert_no_event(&mut rx, Duration::from_secs(120)).await;
    assert_eq!(probe.calls().len(), 1);
    assert_eq!(probe.finished(), 0);
}

// ── Cancellation ────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn detach_during_submission_suppresses_outcome() {
    let service = ScriptedService::new();
    service.hold_turns();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut client = handler(Role::client(), &service, HandlerConfig::default());

    client.start(my_turn("m1", Some(&MatchPayload::with_invite("xyz"))), tx);
    common::settle_until(|| client.phase() == HandlerPhase::ProcessingTurn).await;

    client.detach();
    client.detach();
    service.release_turns();

    // The in-flight submission still lands, silently.
    assert_eq!(service.wait_for_turns(1).await.len(), 1);
    assert_no_event(&mut rx, Duration::from_secs(60)).await;
    assert!(client.is_finished());
    assert!(service.dismissed().is_empty());
}

#[tokio::test(start_paused = true)]
async fn stop_cancels_and_dismisses_the_match() {
    let service = ScriptedService::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut host = handler(Role::host("abc"), &service, HandlerConfig::default());
    host.start(my_turn("m1", None), tx);
    let _complete = next_event(&mut rx).await;

    host.stop().await;
    host.stop().await;

    assert_eq!(service.cancelled(), vec![MatchId::new("m1")]);
    assert_eq!(service.dismissed(), vec![MatchId::new("m1")]);
    service.push(TurnUpdate::MatchRemoved(MatchId::new("m1")));
    assert_no_event(&mut rx, Duration::from_secs(60)).await;
}

#[tokio::test(start_paused = true)]
async fn dropping_the_handler_detaches_it() {
    let service = ScriptedService::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut client = handler(Role::client(), &service, HandlerConfig::default());
    client.start(their_turn("m1", None), tx);
    drop(client);

    service.push_match(my_turn("m1", Some(&MatchPayload::with_invite("xyz"))));
    assert_no_event(&mut rx, Duration::from_secs(120)).await;
}

// ── Callbacks ───────────────────────────────────────────────────────

#[derive(Clone, Default)]
struct Recorder {
    calls: Arc<Mutex<Vec<String>>>,
}

impl MatchCallback for Recorder {
    fn on_complete(&mut self, match_id: &MatchId, invite_data: Option<&str>) {
        self.calls
            .lock()
            .unwrap()
            .push(format!("complete {match_id} {invite_data:?}"));
    }

    fn on_match_invalid(&mut self, match_id: &MatchId) {
        self.calls.lock().unwrap().push(format!("invalid {match_id}"));
    }

    fn on_fatal_error(&mut self, match_id: &MatchId, error: RendezvousError) {
        self.calls
            .lock()
            .unwrap()
            .push(format!("fatal {match_id} {error}"));
    }

    fn on_timeout(&mut self, match_id: &MatchId) {
        self.calls.lock().unwrap().push(format!("timeout {match_id}"));
    }

    fn on_match_removed(&mut self, match_id: &MatchId) {
        self.calls.lock().unwrap().push(format!("removed {match_id}"));
    }
}

#[tokio::test(start_paused = true)]
async fn custom_callback_receives_each_outcome_once() {
    let service = ScriptedService::new();
    let recorder = Recorder::default();
    let mut client = handler(Role::client(), &service, HandlerConfig::default());

    client.start(my_turn("m1", Some(&MatchPayload::with_invite("xyz"))), recorder.clone());
    common::settle_until(|| !recorder.calls.lock().unwrap().is_empty()).await;
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(
        *recorder.calls.lock().unwrap(),
        vec![r#"complete m1 Some("xyz")"#.to_owned()]
    );
}

#[tokio::test(start_paused = true)]
async fn bounded_channel_callback_works() {
    let service = ScriptedService::new();
    let (tx, mut rx) = mpsc::channel(4);
    let mut client = handler(Role::client(), &service, HandlerConfig::default());

    client.start(their_turn("m1", None), tx);
    service.push(TurnUpdate::MatchRemoved(MatchId::new("m1")));

    let event = tokio::time::timeout(Duration::from_secs(60), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(event, RendezvousEvent::MatchRemoved { .. }));
}

// ── Re-entrant callbacks ────────────────────────────────────────────

type Slot = Arc<Mutex<Option<MatchHandler>>>;

/// A callback that lets go of its own handler from inside the callback, the
/// way an owner keeping the handler in a shared slot would.
struct ReleasingCallback {
    slot: Slot,
    service: Arc<ScriptedService>,
    events: mpsc::UnboundedSender<RendezvousEvent>,
}

impl ReleasingCallback {
    fn record(&self, event: RendezvousEvent) {
        let _ = self.events.send(event);
    }
}

impl MatchCallback for ReleasingCallback {
    fn on_complete(&mut self, match_id: &MatchId, invite_data: Option<&str>) {
        if let Some(own) = self.slot.lock().unwrap().as_mut() {
            own.detach();
        }
        self.record(RendezvousEvent::Complete {
            match_id: match_id.clone(),
            invite_data: invite_data.map(str::to_owned),
        });
    }

    fn on_match_invalid(&mut self, match_id: &MatchId) {
        self.record(RendezvousEvent::MatchInvalid {
            match_id: match_id.clone(),
        });
    }

    fn on_fatal_error(&mut self, match_id: &MatchId, error: RendezvousError) {
        self.record(RendezvousEvent::FatalError {
            match_id: match_id.clone(),
            error,
        });
    }

    fn on_timeout(&mut self, match_id: &MatchId) {
        drop(self.slot.lock().unwrap().take());

        let mut next = handler(
            Role::client(),
            &self.service,
            HandlerConfig::default().with_first_turn_wait(Duration::ZERO),
        );
        assert!(next.start(their_turn("m2", None), self.events.clone()));
        *self.slot.lock().unwrap() = Some(next);

        self.record(RendezvousEvent::Timeout {
            match_id: match_id.clone(),
        });
    }

    fn on_match_removed(&mut self, match_id: &MatchId) {
        self.record(RendezvousEvent::MatchRemoved {
            match_id: match_id.clone(),
        });
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn timeout_callback_can_replace_its_own_handler() {
    let service = ScriptedService::new();
    let slot: Slot = Arc::default();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let callback = ReleasingCallback {
        slot: Arc::clone(&slot),
        service: Arc::clone(&service),
        events: tx,
    };

    let mut first = handler(
        Role::client(),
        &service,
        HandlerConfig::default().with_first_turn_wait(Duration::from_millis(50)),
    );
    assert!(first.start(their_turn("m1", None), callback));
    *slot.lock().unwrap() = Some(first);

    let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timeout callback never returned")
        .unwrap();
    assert!(matches!(event, RendezvousEvent::Timeout { ref match_id } if *match_id == MatchId::new("m1")));

    let mut replacement = slot.lock().unwrap().take().unwrap();
    assert_eq!(replacement.match_id(), Some(&MatchId::new("m2")));
    assert_eq!(
        replacement.wait_for_phase(HandlerPhase::WaitingForTurn).await,
        HandlerPhase::WaitingForTurn
    );

    // The replacement is fully alive.
    service.push_match(my_turn("m2", Some(&MatchPayload::with_invite("xyz"))));
    let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        event,
        RendezvousEvent::Complete { ref match_id, invite_data: Some(ref d) }
            if *match_id == MatchId::new("m2") && d == "xyz"
    ));
}

#[tokio::test(start_paused = true)]
async fn host_can_detach_itself_from_its_complete_callback() {
    let service = ScriptedService::new();
    let slot: Slot = Arc::default();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let callback = ReleasingCallback {
        slot: Arc::clone(&slot),
        service: Arc::clone(&service),
        events: tx,
    };

    let mut host = handler(Role::host("abc"), &service, HandlerConfig::default());
    assert!(host.start(my_turn("m1", None), callback));
    *slot.lock().unwrap() = Some(host);

    assert!(matches!(
        next_event(&mut rx).await,
        RendezvousEvent::Complete { invite_data: None, .. }
    ));
    let mut host = slot.lock().unwrap().take().unwrap();
    assert_eq!(
        host.wait_for_phase(HandlerPhase::Finished).await,
        HandlerPhase::Finished
    );

    // Detached mid-delivery: the monitor never reports.
    let mut cancelled = their_turn("m1", Some(&MatchPayload::with_invite("abc")));
    cancelled.status = MatchStatus::Cancelled;
    service.push_match(cancelled);
    assert_no_event(&mut rx, Duration::from_secs(120)).await;
    assert!(service.cancelled().is_empty());
}
