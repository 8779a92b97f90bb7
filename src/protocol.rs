//! Data model of the turn-based match service as seen by the rendezvous core.
//!
//! [`Match`] is always a snapshot taken from the point of view of one
//! participant (`local`): the same remote match has `TurnStatus::MyTurn` for
//! one viewer and `TurnStatus::TheirTurn` for the other.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

// ── Identifiers ─────────────────────────────────────────────────────

/// Identifier of a remote match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MatchId(String);

impl MatchId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A fresh random identifier.
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MatchId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Identifier of a participant in a match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ParticipantId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

// ── Enums ───────────────────────────────────────────────────────────

/// Whose turn it is, relative to the viewing participant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    MyTurn,
    TheirTurn,
}

/// Lifecycle status of a match.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    /// Waiting for the service to pair an auto-match slot.
    AutoMatching,
    #[default]
    Active,
    Cancelled,
    Completed,
    Expired,
}

impl MatchStatus {
    /// Returns `true` while turns can still be taken.
    pub fn is_live(self) -> bool {
        matches!(self, Self::AutoMatching | Self::Active)
    }
}

// ── Structs ─────────────────────────────────────────────────────────

/// Snapshot of a remote match from the local participant's point of view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Match {
    pub id: MatchId,
    pub status: MatchStatus,
    pub turn_status: TurnStatus,
    /// Participants that have joined. An open auto-match slot is not listed.
    pub participants: Vec<ParticipantId>,
    pub creator: ParticipantId,
    /// The participant this snapshot was taken for.
    pub local: ParticipantId,
    /// Opaque match data; `None` until someone takes a turn.
    #[serde(default, with = "serde_bytes")]
    pub data: Option<Vec<u8>>,
    /// Incremented by the service on every turn.
    #[serde(default)]
    pub version: u64,
}

impl Match {
    /// Returns `true` if the local participant may take a turn now.
    pub fn is_my_turn(&self) -> bool {
        self.status.is_live() && self.turn_status == TurnStatus::MyTurn
    }

    /// The participant the next turn should go to.
    ///
    /// `None` when the local participant is alone, which hands the turn to
    /// whoever the service auto-matches into the open slot.
    pub fn other_participant(&self) -> Option<&ParticipantId> {
        self.participants.iter().find(|p| **p != self.local)
    }

    pub fn data(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }
}

/// Parameters for creating (or auto-joining) a match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchConfig {
    /// Participants invited by identity.
    #[serde(default)]
    pub invitees: Vec<ParticipantId>,
    /// Fill the remaining slot through auto-matching.
    #[serde(default)]
    pub auto_match: bool,
}

impl MatchConfig {
    /// A match paired with any other auto-matching player.
    pub fn auto_match() -> Self {
        Self {
            invitees: Vec::new(),
            auto_match: true,
        }
    }

    /// A match with one explicitly invited participant.
    pub fn invite(participant: impl Into<ParticipantId>) -> Self {
        Self {
            invitees: vec![participant.into()],
            auto_match: false,
        }
    }
}

/// Update pushed by the service to registered turn listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnUpdate {
    /// A fresh snapshot of a match the listener takes part in.
    MatchReceived(Match),
    /// The match is gone from the listener's view.
    MatchRemoved(MatchId),
}

impl TurnUpdate {
    pub fn match_id(&self) -> &MatchId {
        match self {
            Self::MatchReceived(m) => &m.id,
            Self::MatchRemoved(id) => id,
        }
    }
}

/// Connection metadata a host publishes as its invite data.
///
/// The rendezvous core treats invite data as an opaque string; this is the
/// format the bundled probe and demo use.
///
/// ```
/// use match_rendezvous::protocol::InviteInfo;
///
/// let info = InviteInfo::new("192.168.49.1", 7777).with_player_id("host-1");
/// let text = info.to_invite_string().unwrap();
/// assert_eq!(InviteInfo::parse(&text).unwrap(), info);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InviteInfo {
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player_id: Option<String>,
}

impl InviteInfo {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            player_id: None,
        }
    }

    #[must_use]
    pub fn with_player_id(mut self, player_id: impl Into<String>) -> Self {
        self.player_id = Some(player_id.into());
        self
    }

    /// `host:port`, suitable for a socket connect.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Serializes to the invite string stored in the match payload.
    ///
    /// # Errors
    ///
    /// Returns [`RendezvousError::Serialization`](crate::RendezvousError::Serialization)
    /// if serialization fails.
    pub fn to_invite_string(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses an invite string produced by [`to_invite_string`](Self::to_invite_string).
    ///
    /// # Errors
    ///
    /// Returns [`RendezvousError::Serialization`](crate::RendezvousError::Serialization)
    /// if the string is not a valid invite.
    pub fn parse(invite_data: &str) -> Result<Self> {
        Ok(serde_json::from_str(invite_data)?)
    }
}
