//! Binary encoding of the shared match payload.
//!
//! The turn-based service stores one opaque byte blob per match. Both peers
//! read and rewrite it on every turn:
//!
//! ```text
//! MAGIC (5 bytes) | state (i32, big-endian) | [ INVITE_MAGIC | UTF-8 invite data ]
//! ```
//!
//! The trailer is only present for [`MatchState::HasInviteData`]. Anything
//! that does not parse collapses to [`MatchState::Invalid`] instead of
//! failing, because the handler treats an unreadable payload as a protocol
//! violation rather than an error.

/// Leading bytes identifying a rendezvous payload.
pub const MAGIC: [u8; 5] = *b"NRZV\x01";

/// Prefix of the invite trailer.
pub const INVITE_MAGIC: &str = "INV:";

const STATE_LEN: usize = 4;
const HEADER_LEN: usize = MAGIC.len() + STATE_LEN;

/// Protocol state carried by the match payload.
///
/// States advance by exactly one step per accepted turn; see
/// [`MatchState::is_successor_of`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MatchState {
    /// No host has published anything yet.
    #[default]
    Uninitialized,
    /// The host has published its invite data.
    HasInviteData,
    /// The payload could not be understood.
    Invalid,
}

impl MatchState {
    /// Wire tag of this state.
    pub fn tag(self) -> i32 {
        match self {
            Self::Uninitialized => 0,
            Self::HasInviteData => 1,
            Self::Invalid => -1,
        }
    }

    /// Parses a wire tag. Unknown tags map to [`Invalid`](Self::Invalid).
    pub fn from_tag(tag: i32) -> Self {
        match tag {
            0 => Self::Uninitialized,
            1 => Self::HasInviteData,
            _ => Self::Invalid,
        }
    }

    /// Returns `true` if `self` directly follows `previous`.
    ///
    /// With no previous state every valid state is accepted. `Invalid` never
    /// follows anything.
    pub fn is_successor_of(self, previous: Option<MatchState>) -> bool {
        if self == Self::Invalid {
            return false;
        }
        match previous {
            None => true,
            Some(Self::Invalid) => false,
            Some(prev) => i64::from(self.tag()) == i64::from(prev.tag()) + 1,
        }
    }
}

/// Decoded match payload.
///
/// `invite_data` is `Some` exactly when `state` is
/// [`MatchState::HasInviteData`]. Use the constructors to keep that pairing.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MatchPayload {
    state: MatchState,
    invite_data: Option<String>,
}

impl MatchPayload {
    /// Payload of a match nobody has written to yet.
    pub fn uninitialized() -> Self {
        Self::default()
    }

    /// Payload carrying the host's invite data.
    ///
    /// An empty string cannot be represented on the wire and yields an
    /// [`invalid`](Self::invalid) payload.
    pub fn with_invite(invite_data: impl Into<String>) -> Self {
        let invite_data = invite_data.into();
        if invite_data.is_empty() {
            return Self::invalid();
        }
        Self {
            state: MatchState::HasInviteData,
            invite_data: Some(invite_data),
        }
    }

    /// Payload that failed to decode.
    pub fn invalid() -> Self {
        Self {
            state: MatchState::Invalid,
            invite_data: None,
        }
    }

    pub fn state(&self) -> MatchState {
        self.state
    }

    pub fn invite_data(&self) -> Option<&str> {
        self.invite_data.as_deref()
    }

    /// Replaces this payload with one carrying `invite_data`.
    pub fn set_invite(&mut self, invite_data: impl Into<String>) {
        *self = Self::with_invite(invite_data);
    }

    /// Encodes the payload into the bytes stored on the match.
    pub fn encode(&self) -> Vec<u8> {
        let trailer = match (&self.state, &self.invite_data) {
            (MatchState::HasInviteData, Some(data)) => INVITE_MAGIC.len() + data.len(),
            _ => 0,
        };
        let mut out = Vec::with_capacity(HEADER_LEN + trailer);
        out.extend_from_slice(&MAGIC);
        out.extend_from_slice(&self.state.tag().to_be_bytes());
        if let (MatchState::HasInviteData, Some(data)) = (&self.state, &self.invite_data) {
            out.extend_from_slice(INVITE_MAGIC.as_bytes());
            out.extend_from_slice(data.as_bytes());
        }
        out
    }

    /// Decodes the match data as returned by the service.
    ///
    /// `None` (no data stored yet) is an [`uninitialized`](Self::uninitialized)
    /// payload. Malformed bytes decode to an [`invalid`](Self::invalid) one.
    pub fn decode(bytes: Option<&[u8]>) -> Self {
        match bytes {
            None => Self::uninitialized(),
            Some(bytes) => Self::decode_bytes(bytes),
        }
    }

    fn decode_bytes(bytes: &[u8]) -> Self {
        let Some((magic, rest)) = bytes.split_first_chunk::<5>() else {
            return Self::invalid();
        };
        if *magic != MAGIC {
            return Self::invalid();
        }
        let Some((tag, trailer)) = rest.split_first_chunk::<STATE_LEN>() else {
            return Self::invalid();
        };

        match MatchState::from_tag(i32::from_be_bytes(*tag)) {
            MatchState::HasInviteData => {
                let Some(data) = trailer.strip_prefix(INVITE_MAGIC.as_bytes()) else {
                    return Self::invalid();
                };
                match std::str::from_utf8(data) {
                    Ok(data) => Self::with_invite(data),
                    Err(_) => Self::invalid(),
                }
            }
            MatchState::Uninitialized => Self::uninitialized(),
            MatchState::Invalid => Self::invalid(),
        }
    }
}
