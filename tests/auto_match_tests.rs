#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! Integration tests for the auto-match retry policy.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{my_turn, settle_until, their_turn, ScriptedProbe, ScriptedService, LOCAL};
use match_rendezvous::protocol::{MatchId, MatchStatus, TurnUpdate};
use match_rendezvous::{
    AutoMatchConfig, AutoMatchSession, AutoMatchSide, HandlerConfig, MatchPayload, MatchService,
    RendezvousError, RendezvousEvent, ServiceErrorCode,
};

fn session(
    service: &Arc<ScriptedService>,
    side: AutoMatchSide,
    config: AutoMatchConfig,
) -> AutoMatchSession {
    let service: Arc<dyn MatchService> = Arc::clone(service) as Arc<dyn MatchService>;
    AutoMatchSession::new(service, side, config)
}

fn client_side(probe: &Arc<ScriptedProbe>) -> AutoMatchSide {
    AutoMatchSide::Client {
        probe: Arc::clone(probe) as Arc<dyn match_rendezvous::ReachabilityProbe>,
        local_id: LOCAL.to_owned(),
    }
}

fn host_side() -> AutoMatchSide {
    AutoMatchSide::Host {
        invite_data: "abc".to_owned(),
    }
}

fn invite(data: &str) -> MatchPayload {
    MatchPayload::with_invite(data)
}

#[tokio::test(start_paused = true)]
async fn client_rejoins_after_invalid_room() {
    let service = ScriptedService::new();
    service.script_rooms([
        my_turn("r1", Some(&MatchPayload::invalid())),
        my_turn("r2", Some(&invite("xyz"))),
    ]);
    let probe = ScriptedProbe::answering(true, Duration::from_millis(200));

    let rendezvous = session(&service, client_side(&probe), AutoMatchConfig::default())
        .run()
        .await
        .unwrap();

    assert_eq!(rendezvous.match_id, MatchId::new("r2"));
    assert_eq!(rendezvous.invite_data.as_deref(), Some("xyz"));
    assert_eq!(rendezvous.attempts, 2);
    assert!(rendezvous.hosted.is_none());
    assert_eq!(service.cancelled(), vec![MatchId::new("r1")]);
    assert!(service.dismissed().contains(&MatchId::new("r1")));
}

#[tokio::test(start_paused = true)]
async fn client_rejoins_after_timeout() {
    let service = ScriptedService::new();
    service.script_rooms([their_turn("r1", None), my_turn("r2", Some(&invite("xyz")))]);
    let probe = ScriptedProbe::answering(true, Duration::ZERO);
    let config = AutoMatchConfig::default()
        .with_handler(HandlerConfig::default().with_first_turn_wait(Duration::from_secs(5)));

    let rendezvous = session(&service, client_side(&probe), config).run().await.unwrap();

    assert_eq!(rendezvous.match_id, MatchId::new("r2"));
    assert_eq!(rendezvous.attempts, 2);
    assert_eq!(service.cancelled(), vec![MatchId::new("r1")]);
}

#[tokio::test(start_paused = true)]
async fn client_rejoins_after_room_removal() {
    let service = ScriptedService::new();
    service.script_rooms([their_turn("r1", None), my_turn("r2", Some(&invite("xyz")))]);
    let probe = ScriptedProbe::answering(true, Duration::ZERO);
    let session = session(&service, client_side(&probe), AutoMatchConfig::default());

    let run = tokio::spawn(async move { session.run().await });
    settle_until(|| service.subscriptions() >= 1).await;
    service.push(TurnUpdate::MatchRemoved(MatchId::new("r1")));

    let rendezvous = run.await.unwrap().unwrap();
    assert_eq!(rendezvous.match_id, MatchId::new("r2"));
    assert_eq!(rendezvous.attempts, 2);
}

#[tokio::test(start_paused = true)]
async fn unreachable_peers_exhaust_attempts() {
    let service = ScriptedService::new();
    service.script_rooms([
        my_turn("r1", Some(&invite("a"))),
        my_turn("r2", Some(&invite("b"))),
        my_turn("r3", Some(&invite("c"))),
    ]);
    let probe = ScriptedProbe::answering(false, Duration::from_millis(10));
    let config = AutoMatchConfig::default().with_max_attempts(Some(2));

    let err = session(&service, client_side(&probe), config)
        .run()
        .await
        .unwrap_err();

    match err {
        RendezvousError::AttemptsExhausted {
            attempts: 2,
            last_error: Some(last),
        } => assert!(matches!(*last, RendezvousError::ProtocolViolation(_))),
        other => panic!("expected exhausted attempts, got {other:?}"),
    }
    let probed: Vec<String> = probe.calls().into_iter().map(|(data, _)| data).collect();
    assert_eq!(probed, vec!["a".to_owned(), "b".to_owned()]);
    assert_eq!(service.cancelled().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn fatal_errors_are_retried_while_signed_in() {
    let service = ScriptedService::new();
    service.fail_turns_with(ServiceErrorCode::NetworkError);
    service.script_rooms([my_turn("r1", None), my_turn("r2", None), my_turn("r3", None)]);
    let config = AutoMatchConfig::default().with_max_attempts(Some(3));

    let err = session(&service, host_side(), config).run().await.unwrap_err();

    match err {
        RendezvousError::AttemptsExhausted {
            attempts: 3,
            last_error: Some(last),
        } => assert_eq!(last.code(), Some(ServiceErrorCode::NetworkError)),
        other => panic!("expected exhausted attempts, got {other:?}"),
    }
    assert_eq!(
        service.cancelled(),
        vec![MatchId::new("r1"), MatchId::new("r2"), MatchId::new("r3")]
    );
}

#[tokio::test(start_paused = true)]
async fn fatal_error_after_sign_out_is_surfaced() {
    let service = ScriptedService::new();
    service.fail_turns_with(ServiceErrorCode::SignInRequired);
    service.script_rooms([my_turn("r1", None), my_turn("r2", None)]);

    let err = session(&service, host_side(), AutoMatchConfig::default())
        .run()
        .await
        .unwrap_err();

    assert_eq!(err.code(), Some(ServiceErrorCode::SignInRequired));
    assert!(service.cancelled().is_empty());
}

#[tokio::test(start_paused = true)]
async fn signed_out_player_cannot_start() {
    let service = ScriptedService::new();
    service.set_signed_in(false);

    let err = session(&service, host_side(), AutoMatchConfig::default())
        .run()
        .await
        .unwrap_err();
    assert!(matches!(err, RendezvousError::NotSignedIn));
}

#[tokio::test(start_paused = true)]
async fn failed_joins_count_as_attempts() {
    // Nothing scripted: every create_match fails with a transient error.
    let service = ScriptedService::new();
    let config = AutoMatchConfig::default().with_max_attempts(Some(2));

    let err = session(&service, host_side(), config).run().await.unwrap_err();
    match err {
        RendezvousError::AttemptsExhausted {
            attempts: 2,
            last_error: Some(last),
        } => assert_eq!(last.code(), Some(ServiceErrorCode::ServiceUnavailable)),
        other => panic!("expected exhausted attempts, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn host_keeps_monitoring_its_room() {
    let service = ScriptedService::new();
    service.script_rooms([my_turn("r1", None)]);

    let rendezvous = session(&service, host_side(), AutoMatchConfig::default())
        .run()
        .await
        .unwrap();
    assert_eq!(rendezvous.invite_data, None);
    assert_eq!(rendezvous.attempts, 1);
    assert_eq!(service.turns()[0].payload, invite("abc"));

    let mut hosted = rendezvous.hosted.unwrap();
    assert_eq!(hosted.match_id(), &MatchId::new("r1"));

    let mut cancelled = their_turn("r1", Some(&invite("abc")));
    cancelled.status = MatchStatus::Cancelled;
    service.push_match(cancelled);

    let closed = tokio::time::timeout(Duration::from_secs(60), hosted.closed())
        .await
        .unwrap();
    assert!(matches!(closed, RendezvousEvent::MatchRemoved { .. }));
}

#[tokio::test(start_paused = true)]
async fn closing_a_hosted_room_cancels_it() {
    let service = ScriptedService::new();
    service.script_rooms([my_turn("r1", None)]);

    let rendezvous = session(&service, host_side(), AutoMatchConfig::default())
        .run()
        .await
        .unwrap();
    rendezvous.hosted.unwrap().close().await;

    assert_eq!(service.cancelled(), vec![MatchId::new("r1")]);
    assert_eq!(service.dismissed(), vec![MatchId::new("r1")]);
}

#[tokio::test(start_paused = true)]
async fn exhausted_budget_reports_why_the_last_room_failed() {
    let service = ScriptedService::new();
    service.script_rooms([their_turn("r1", None)]);
    let probe = ScriptedProbe::answering(true, Duration::ZERO);
    let config = AutoMatchConfig::default()
        .with_max_attempts(Some(1))
        .with_handler(HandlerConfig::default().with_first_turn_wait(Duration::from_secs(5)));

    let err = session(&service, client_side(&probe), config)
        .run()
        .await
        .unwrap_err();

    match err {
        RendezvousError::AttemptsExhausted {
            attempts: 1,
            last_error: Some(last),
        } => assert!(matches!(*last, RendezvousError::Timeout)),
        other => panic!("expected exhausted attempts, got {other:?}"),
    }
    assert!(std::error::Error::source(&RendezvousError::AttemptsExhausted {
        attempts: 1,
        last_error: Some(Box::new(RendezvousError::MatchRemoved)),
    })
    .is_some());
}
