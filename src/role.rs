//! Role-specific turn behavior.
//!
//! A [`Role`] decides what to do with one accepted turn: it may rewrite the
//! payload that will be submitted, and it tells the driver how long to wait
//! for the next turn and what to report. The driver in
//! [`handler`](crate::handler) owns everything else (waiting, sequencing,
//! submission, teardown).

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::payload::{MatchPayload, MatchState};
use crate::protocol::Match;
use crate::service::ReachabilityProbe;

/// When the driver should expect the next turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextWait {
    /// No more turns are expected from this role.
    Finished,
    /// Wait for the next turn without a deadline.
    Indefinite,
    /// Wait at most this long (before jitter).
    After(Duration),
}

impl NextWait {
    /// Maps the millisecond convention: negative is finished, zero waits
    /// forever, positive is a timeout.
    pub fn from_millis(ms: i64) -> Self {
        match ms {
            ms if ms < 0 => Self::Finished,
            0 => Self::Indefinite,
            ms => Self::After(Duration::from_millis(ms.unsigned_abs())),
        }
    }

    pub fn is_finished(self) -> bool {
        self == Self::Finished
    }
}

/// What a role wants reported for the turn it just handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoleSignal {
    /// Report success once the turn is submitted.
    Complete { invite_data: Option<String> },
    /// The turn breaks the protocol; stop without submitting.
    MatchInvalid,
    /// Probe the peer behind `invite_data` before reporting success.
    VerifyPeer { invite_data: String },
}

/// Result of [`Role::my_turn`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnOutcome {
    pub next_wait: NextWait,
    pub signal: Option<RoleSignal>,
}

impl TurnOutcome {
    fn wait(next_wait: NextWait) -> Self {
        Self {
            next_wait,
            signal: None,
        }
    }

    fn finished(signal: RoleSignal) -> Self {
        Self {
            next_wait: NextWait::Finished,
            signal: Some(signal),
        }
    }

    fn invalid() -> Self {
        Self::finished(RoleSignal::MatchInvalid)
    }
}

// ── Host ────────────────────────────────────────────────────────────

/// Publishes the invite data once, then stops driving turns.
#[derive(Debug, Clone)]
pub struct HostRole {
    invite_data: String,
}

impl HostRole {
    pub fn new(invite_data: impl Into<String>) -> Self {
        Self {
            invite_data: invite_data.into(),
        }
    }

    pub fn invite_data(&self) -> &str {
        &self.invite_data
    }

    fn my_turn(
        &self,
        m: &Match,
        data: &mut MatchPayload,
        old_data: Option<&MatchPayload>,
    ) -> TurnOutcome {
        // The service only lets the creator of a room hand its first turn
        // over. Data already present on our first turn means the peer created
        // this room, and our publication would never reach it.
        if old_data.is_none() && m.data.is_some() {
            return TurnOutcome::invalid();
        }
        if data.state() != MatchState::Uninitialized {
            return TurnOutcome::invalid();
        }

        data.set_invite(self.invite_data.as_str());
        if data.state() != MatchState::HasInviteData {
            return TurnOutcome::invalid();
        }
        TurnOutcome::finished(RoleSignal::Complete { invite_data: None })
    }
}

// ── Client ──────────────────────────────────────────────────────────

/// Waits for the host's invite data and reports it.
#[derive(Debug, Clone, Default)]
pub struct ClientRole {
    invite_data: Option<String>,
}

impl ClientRole {
    pub fn new() -> Self {
        Self::default()
    }

    /// The invite data retrieved so far.
    pub fn invite_data(&self) -> Option<&str> {
        self.invite_data.as_deref()
    }

    fn my_turn(&mut self, data: &MatchPayload, default_wait: Duration, verify: bool) -> TurnOutcome {
        match data.state() {
            MatchState::Uninitialized => TurnOutcome::wait(NextWait::After(default_wait)),
            MatchState::HasInviteData => {
                let Some(invite_data) = data.invite_data() else {
                    return TurnOutcome::invalid();
                };
                self.invite_data = Some(invite_data.to_owned());
                let invite_data = invite_data.to_owned();
                if verify {
                    TurnOutcome::finished(RoleSignal::VerifyPeer { invite_data })
                } else {
                    TurnOutcome::finished(RoleSignal::Complete {
                        invite_data: Some(invite_data),
                    })
                }
            }
            MatchState::Invalid => TurnOutcome::invalid(),
        }
    }
}

// ── Auto-match client ───────────────────────────────────────────────

/// A client that joined a room through auto-matching and therefore probes
/// the peer before accepting its invite.
#[derive(Clone)]
pub struct AutoMatchClientRole {
    client: ClientRole,
    probe: Arc<dyn ReachabilityProbe>,
    local_id: String,
}

impl AutoMatchClientRole {
    pub fn new(probe: Arc<dyn ReachabilityProbe>, local_id: impl Into<String>) -> Self {
        Self {
            client: ClientRole::new(),
            probe,
            local_id: local_id.into(),
        }
    }

    pub fn invite_data(&self) -> Option<&str> {
        self.client.invite_data()
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn probe(&self) -> &Arc<dyn ReachabilityProbe> {
        &self.probe
    }
}

impl fmt::Debug for AutoMatchClientRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AutoMatchClientRole")
            .field("client", &self.client)
            .field("local_id", &self.local_id)
            .finish_non_exhaustive()
    }
}

// ── Role ────────────────────────────────────────────────────────────

/// The closed set of rendezvous roles.
#[derive(Debug, Clone)]
pub enum Role {
    Host(HostRole),
    Client(ClientRole),
    AutoMatchClient(AutoMatchClientRole),
}

impl Role {
    pub fn host(invite_data: impl Into<String>) -> Self {
        Self::Host(HostRole::new(invite_data))
    }

    pub fn client() -> Self {
        Self::Client(ClientRole::new())
    }

    pub fn auto_match_client(probe: Arc<dyn ReachabilityProbe>, local_id: impl Into<String>) -> Self {
        Self::AutoMatchClient(AutoMatchClientRole::new(probe, local_id))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Host(_) => "host",
            Self::Client(_) => "client",
            Self::AutoMatchClient(_) => "auto-match client",
        }
    }

    /// Whether the handler dismisses the match once this role is done.
    ///
    /// Clients have no use for the match after retrieving the invite. Hosts
    /// keep it so they notice when the peer tears it down.
    pub fn dismisses_by_default(&self) -> bool {
        !matches!(self, Self::Host(_))
    }

    /// Handles an accepted turn.
    ///
    /// `data` is the decoded payload and becomes the submitted payload after
    /// this returns. `default_wait` is the handler's regular turn timeout.
    pub fn my_turn(
        &mut self,
        m: &Match,
        data: &mut MatchPayload,
        old_data: Option<&MatchPayload>,
        default_wait: Duration,
    ) -> TurnOutcome {
        match self {
            Self::Host(host) => host.my_turn(m, data, old_data),
            Self::Client(client) => client.my_turn(data, default_wait, false),
            Self::AutoMatchClient(auto) => auto.client.my_turn(data, default_wait, true),
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
    use crate::protocol::{MatchId, MatchStatus, ParticipantId, TurnStatus};
    use async_trait::async_trait;

    const WAIT: Duration = Duration::from_secs(10);

    struct NeverProbe;

    #[async_trait]
    impl ReachabilityProbe for NeverProbe {
        async fn probe(&self, _invite_data: &str, _local_id: &str) -> crate::Result<bool> {
            Ok(false)
        }
    }

    fn snapshot(data: Option<Vec<u8>>) -> Match {
        Match {
            id: MatchId::new("m1"),
            status: MatchStatus::Active,
            turn_status: TurnStatus::MyTurn,
            participants: vec![ParticipantId::from("host"), ParticipantId::from("client")],
            creator: ParticipantId::from("host"),
            local: ParticipantId::from("host"),
            data,
            version: 0,
        }
    }

    #[test]
    fn next_wait_from_millis() {
        assert_eq!(NextWait::from_millis(-1), NextWait::Finished);
        assert_eq!(NextWait::from_millis(0), NextWait::Indefinite);
        assert_eq!(
            NextWait::from_millis(1500),
            NextWait::After(Duration::from_millis(1500))
        );
    }

    #[test]
    fn host_publishes_invite_on_fresh_match() {
        let mut role = Role::host("abc");
        let mut data = MatchPayload::uninitialized();
        let outcome = role.my_turn(&snapshot(None), &mut data, None, WAIT);
        assert_eq!(data, MatchPayload::with_invite("abc"));
        assert_eq!(outcome.next_wait, NextWait::Finished);
        assert_eq!(
            outcome.signal,
            Some(RoleSignal::Complete { invite_data: None })
        );
    }

    #[test]
    fn host_rejects_room_with_data_on_first_turn() {
        let mut role = Role::host("abc");
        let existing = MatchPayload::uninitialized().encode();
        let mut data = MatchPayload::uninitialized();
        let outcome = role.my_turn(&snapshot(Some(existing)), &mut data, None, WAIT);
        assert_eq!(outcome.signal, Some(RoleSignal::MatchInvalid));
        assert_eq!(data, MatchPayload::uninitialized());
    }

    #[test]
    fn host_rejects_already_published_match() {
        let mut role = Role::host("abc");
        let mut data = MatchPayload::with_invite("other");
        let old = MatchPayload::uninitialized();
        let outcome = role.my_turn(&snapshot(None), &mut data, Some(&old), WAIT);
        assert_eq!(outcome.signal, Some(RoleSignal::MatchInvalid));
    }

    #[test]
    fn host_with_empty_invite_is_invalid() {
        let mut role = Role::host("");
        let mut data = MatchPayload::uninitialized();
        let outcome = role.my_turn(&snapshot(None), &mut data, None, WAIT);
        assert_eq!(outcome.signal, Some(RoleSignal::MatchInvalid));
    }

    #[test]
    fn client_keeps_waiting_on_uninitialized() {
        let mut role = Role::client();
        let mut data = MatchPayload::uninitialized();
        let outcome = role.my_turn(&snapshot(None), &mut data, None, WAIT);
        assert_eq!(outcome.next_wait, NextWait::After(WAIT));
        assert_eq!(outcome.signal, None);
    }

    #[test]
    fn client_reports_invite() {
        let mut role = Role::client();
        let mut data = MatchPayload::with_invite("xyz");
        let outcome = role.my_turn(&snapshot(None), &mut data, None, WAIT);
        assert_eq!(outcome.next_wait, NextWait::Finished);
        assert_eq!(
            outcome.signal,
            Some(RoleSignal::Complete {
                invite_data: Some("xyz".into())
            })
        );
        match role {
            Role::Client(client) => assert_eq!(client.invite_data(), Some("xyz")),
            other => unreachable!("unexpected role {other:?}"),
        }
    }

    #[test]
    fn client_rejects_invalid_payload() {
        let mut role = Role::client();
        let mut data = MatchPayload::invalid();
        let outcome = role.my_turn(&snapshot(None), &mut data, None, WAIT);
        assert_eq!(outcome.signal, Some(RoleSignal::MatchInvalid));
    }

    #[test]
    fn auto_match_client_asks_for_verification() {
        let mut role = Role::auto_match_client(Arc::new(NeverProbe), "me");
        let mut data = MatchPayload::with_invite("xyz");
        let outcome = role.my_turn(&snapshot(None), &mut data, None, WAIT);
        assert_eq!(
            outcome.signal,
            Some(RoleSignal::VerifyPeer {
                invite_data: "xyz".into()
            })
        );
    }

    #[test]
    fn only_host_keeps_the_match() {
        assert!(!Role::host("a").dismisses_by_default());
        assert!(Role::client().dismisses_by_default());
        assert!(Role::auto_match_client(Arc::new(NeverProbe), "me").dismisses_by_default());
    }
}
