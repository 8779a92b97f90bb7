//! Error types for the rendezvous handlers.

use thiserror::Error;

use crate::error_codes::ServiceErrorCode;

/// Errors that can occur while rendezvousing over a turn-based match.
#[derive(Debug, Error)]
pub enum RendezvousError {
    /// The shared match payload broke the turn protocol (bad encoding,
    /// non-monotonic state, missing invite data), or the auto-matched peer
    /// could not be verified.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// A call to the match service failed.
    #[error("match service error: {message}")]
    Service {
        /// Human-readable error message from the service.
        message: String,
        /// Structured error code, if the service classified the failure.
        code: Option<ServiceErrorCode>,
    },

    /// The local player is not signed in to the match service.
    #[error("not signed in to the match service")]
    NotSignedIn,

    /// The turn update stream of the match service ended.
    #[error("match service closed its turn update stream")]
    ServiceClosed,

    /// No turn was observed within the wait window.
    #[error("timed out waiting for a turn")]
    Timeout,

    /// The match was cancelled, completed, expired or dismissed remotely.
    #[error("match was removed")]
    MatchRemoved,

    /// The auto-match retry budget was spent without a rendezvous.
    #[error("no rendezvous after {attempts} auto-match attempts")]
    AttemptsExhausted {
        /// Number of rooms that were tried.
        attempts: u32,
        /// Why the last room was given up, if one was joined at all.
        #[source]
        last_error: Option<Box<RendezvousError>>,
    },

    /// Failed to serialize or deserialize invite metadata.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RendezvousError {
    /// Shorthand for a [`Service`](Self::Service) error with a code.
    pub fn service(code: ServiceErrorCode, message: impl Into<String>) -> Self {
        Self::Service {
            message: message.into(),
            code: Some(code),
        }
    }

    /// Structured service code, if any.
    pub fn code(&self) -> Option<ServiceErrorCode> {
        match self {
            Self::Service { code, .. } => *code,
            Self::NotSignedIn => Some(ServiceErrorCode::SignInRequired),
            _ => None,
        }
    }

    /// Returns `true` if starting over with a new match may get past this error.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Service { code: Some(code), .. } => code.is_transient(),
            Self::Service { code: None, .. } => true,
            Self::NotSignedIn | Self::ServiceClosed | Self::AttemptsExhausted { .. } => false,
            Self::ProtocolViolation(_) | Self::Timeout | Self::MatchRemoved => true,
            Self::Serialization(_) => false,
            Self::Io(_) => true,
        }
    }
}

/// A specialized [`Result`] type for rendezvous operations.
pub type Result<T> = std::result::Result<T, RendezvousError>;
