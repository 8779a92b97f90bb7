//! Status codes reported by the turn-based match service.
//!
//! A [`MatchService`](crate::service::MatchService) implementation attaches one
//! of these to [`RendezvousError::Service`](crate::RendezvousError::Service)
//! when it can classify a failure. Codes serialize as `SCREAMING_SNAKE_CASE`
//! (e.g. `"NOT_YOUR_TURN"`) so they can be carried through logs and configs
//! unchanged.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Structured failure codes of the turn-based match service.
///
/// Use [`description()`](ServiceErrorCode::description) for a human-readable
/// explanation and [`is_transient()`](ServiceErrorCode::is_transient) to decide
/// whether retrying with a fresh match makes sense.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceErrorCode {
    // Session errors
    SignInRequired,
    NetworkError,

    // Match errors
    NotYourTurn,
    InactiveMatch,
    MatchNotFound,
    InvalidParticipant,
    InvalidMatchData,

    // Service errors
    ServiceUnavailable,
    InternalError,
}

impl ServiceErrorCode {
    /// Returns a human-readable description of this code.
    pub fn description(&self) -> &'static str {
        match self {
            Self::SignInRequired => {
                "The local player is not signed in to the match service. Sign in before starting a match."
            }
            Self::NetworkError => {
                "The match service could not be reached. Check connectivity and try again."
            }
            Self::NotYourTurn => {
                "A turn was submitted for a match on which it is not the local player's turn."
            }
            Self::InactiveMatch => {
                "The match is no longer active. It was cancelled, completed, or expired."
            }
            Self::MatchNotFound => {
                "The match could not be found. It may have been dismissed or never existed."
            }
            Self::InvalidParticipant => {
                "The targeted participant is not part of the match."
            }
            Self::InvalidMatchData => {
                "The submitted match data was rejected by the service."
            }
            Self::ServiceUnavailable => {
                "The match service is temporarily unavailable. Please try again in a few moments."
            }
            Self::InternalError => {
                "The match service reported an internal error. Please try again later."
            }
        }
    }

    /// Returns `true` if the failure is tied to one match or a passing
    /// condition, so that starting over with a new match may succeed.
    ///
    /// [`SignInRequired`](Self::SignInRequired) is never transient: nothing
    /// succeeds until the player signs in again.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::SignInRequired)
    }
}

impl fmt::Display for ServiceErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}
