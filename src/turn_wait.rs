//! Single-shot, cancellable turn waits on top of a turn update subscription.
//!
//! [`wait_for_turn`] resolves once: when the match becomes the local player's
//! turn, when it leaves the live states, when it is removed, or when the
//! timeout elapses. [`monitor_match_end`] is the passive variant used after
//! the last turn, which only cares about the match going away.
//!
//! Both take an already registered [`TurnUpdates`] so the caller can
//! subscribe *before* the action that provokes the update (a turn
//! submission), and neither can miss it.

use std::time::Duration;

use tracing::{debug, trace};

use crate::operation::Operation;
use crate::protocol::{Match, MatchId, MatchStatus, TurnUpdate};
use crate::service::TurnUpdates;

/// How a turn wait resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnWaitOutcome {
    /// It is the local player's turn; carries the fresh snapshot.
    MyTurn(Match),
    /// No turn arrived within the timeout.
    TimedOut,
    /// The match was removed, or cancelled/completed/expired.
    Removed,
    /// The service dropped the update stream.
    ServiceClosed,
}

/// How a finished match went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchEnd {
    /// Removed from the local view (dismissed or deleted).
    Removed,
    /// Still visible, but cancelled, completed or expired.
    Ended(MatchStatus),
    /// The service dropped the update stream.
    ServiceClosed,
}

/// Waits for the local player's turn on `match_id`.
///
/// `timeout == None` waits indefinitely. The outcome is handed to `deliver`
/// unless the returned operation is cancelled first.
pub fn wait_for_turn<D>(
    updates: TurnUpdates,
    match_id: MatchId,
    timeout: Option<Duration>,
    deliver: D,
) -> Operation
where
    D: FnOnce(TurnWaitOutcome) + Send + 'static,
{
    debug!(match_id = %match_id, ?timeout, "waiting for turn");
    Operation::spawn(next_turn(updates, match_id, timeout), deliver)
}

/// Watches `match_id` until it is removed or leaves the live states.
pub fn monitor_match_end<D>(updates: TurnUpdates, match_id: MatchId, deliver: D) -> Operation
where
    D: FnOnce(MatchEnd) + Send + 'static,
{
    debug!(match_id = %match_id, "monitoring match for removal");
    Operation::spawn(match_end(updates, match_id), deliver)
}

async fn next_turn(
    mut updates: TurnUpdates,
    match_id: MatchId,
    timeout: Option<Duration>,
) -> TurnWaitOutcome {
    let wait = async {
        loop {
            match updates.recv().await {
                None => return TurnWaitOutcome::ServiceClosed,
                Some(TurnUpdate::MatchRemoved(id)) if id == match_id => {
                    return TurnWaitOutcome::Removed;
                }
                Some(TurnUpdate::MatchReceived(m)) if m.id == match_id => {
                    if !m.status.is_live() {
                        return TurnWaitOutcome::Removed;
                    }
                    if m.is_my_turn() {
                        return TurnWaitOutcome::MyTurn(m);
                    }
                    trace!(match_id = %match_id, version = m.version, "not our turn yet");
                }
                Some(_) => {}
            }
        }
    };

    match timeout {
        None => wait.await,
        Some(timeout) => tokio::time::timeout(timeout, wait)
            .await
            .unwrap_or(TurnWaitOutcome::TimedOut),
    }
}

async fn match_end(mut updates: TurnUpdates, match_id: MatchId) -> MatchEnd {
    loop {
        match updates.recv().await {
            None => return MatchEnd::ServiceClosed,
            Some(TurnUpdate::MatchRemoved(id)) if id == match_id => return MatchEnd::Removed,
            Some(TurnUpdate::MatchReceived(m)) if m.id == match_id && !m.status.is_live() => {
                return MatchEnd::Ended(m.status);
            }
            Some(_) => {}
        }
    }
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
    use crate::protocol::{ParticipantId, TurnStatus};
    use tokio::sync::{broadcast, oneshot};
    use tokio_test::{assert_pending, assert_ready_eq, task};

    fn snapshot(id: &str, turn_status: TurnStatus, status: MatchStatus) -> Match {
        Match {
            id: MatchId::new(id),
            status,
            turn_status,
            participants: vec![ParticipantId::from("a"), ParticipantId::from("b")],
            creator: ParticipantId::from("a"),
            local: ParticipantId::from("a"),
            data: None,
            version: 1,
        }
    }

    fn channel() -> (broadcast::Sender<TurnUpdate>, TurnUpdates) {
        let (tx, rx) = broadcast::channel(16);
        (tx, TurnUpdates::new(rx))
    }

    async fn wait(
        updates: TurnUpdates,
        id: &str,
        timeout: Option<Duration>,
    ) -> oneshot::Receiver<TurnWaitOutcome> {
        let (tx, rx) = oneshot::channel();
        let _op = wait_for_turn(updates, MatchId::new(id), timeout, move |outcome| {
            let _ = tx.send(outcome);
        });
        rx
    }

    #[tokio::test]
    async fn resolves_on_my_turn_for_the_right_match() {
        let (tx, updates) = channel();
        let rx = wait(updates, "m1", None).await;

        tx.send(TurnUpdate::MatchReceived(snapshot(
            "other",
            TurnStatus::MyTurn,
            MatchStatus::Active,
        )))
        .unwrap();
        tx.send(TurnUpdate::MatchReceived(snapshot(
            "m1",
            TurnStatus::TheirTurn,
            MatchStatus::Active,
        )))
        .unwrap();
        let mine = snapshot("m1", TurnStatus::MyTurn, MatchStatus::Active);
        tx.send(TurnUpdate::MatchReceived(mine.clone())).unwrap();

        assert_eq!(rx.await.unwrap(), TurnWaitOutcome::MyTurn(mine));
    }

    #[tokio::test]
    async fn cancelled_match_counts_as_removed() {
        let (tx, updates) = channel();
        let rx = wait(updates, "m1", None).await;
        tx.send(TurnUpdate::MatchReceived(snapshot(
            "m1",
            TurnStatus::MyTurn,
            MatchStatus::Cancelled,
        )))
        .unwrap();
        assert_eq!(rx.await.unwrap(), TurnWaitOutcome::Removed);
    }

    #[tokio::test]
    async fn removal_resolves_wait() {
        let (tx, updates) = channel();
        let rx = wait(updates, "m1", None).await;
        tx.send(TurnUpdate::MatchRemoved(MatchId::new("m2"))).unwrap();
        tx.send(TurnUpdate::MatchRemoved(MatchId::new("m1"))).unwrap();
        assert_eq!(rx.await.unwrap(), TurnWaitOutcome::Removed);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out() {
        let (_tx, updates) = channel();
        let rx = wait(updates, "m1", Some(Duration::from_secs(3))).await;
        assert_eq!(rx.await.unwrap(), TurnWaitOutcome::TimedOut);
    }

    #[tokio::test]
    async fn closed_stream_is_reported() {
        let (tx, updates) = channel();
        let rx = wait(updates, "m1", None).await;
        drop(tx);
        assert_eq!(rx.await.unwrap(), TurnWaitOutcome::ServiceClosed);
    }

    #[tokio::test]
    async fn monitor_ignores_turns_and_reports_end() {
        let (tx, updates) = channel();
        let (done_tx, done_rx) = oneshot::channel();
        let _op = monitor_match_end(updates, MatchId::new("m1"), move |end| {
            let _ = done_tx.send(end);
        });
        tx.send(TurnUpdate::MatchReceived(snapshot(
            "m1",
            TurnStatus::MyTurn,
            MatchStatus::Active,
        )))
        .unwrap();
        tx.send(TurnUpdate::MatchReceived(snapshot(
            "m1",
            TurnStatus::TheirTurn,
            MatchStatus::Expired,
        )))
        .unwrap();
        assert_eq!(
            done_rx.await.unwrap(),
            MatchEnd::Ended(MatchStatus::Expired)
        );
    }

    #[test]
    fn other_players_turns_keep_the_wait_pending() {
        let (tx, updates) = channel();
        let mut wait = task::spawn(next_turn(updates, MatchId::new("m1"), None));
        assert_pending!(wait.poll());

        tx.send(TurnUpdate::MatchReceived(snapshot(
            "m1",
            TurnStatus::TheirTurn,
            MatchStatus::Active,
        )))
        .unwrap();
        assert!(wait.is_woken());
        assert_pending!(wait.poll());

        tx.send(TurnUpdate::MatchRemoved(MatchId::new("m1"))).unwrap();
        assert_ready_eq!(wait.poll(), TurnWaitOutcome::Removed);
    }
}
