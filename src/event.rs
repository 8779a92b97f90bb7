//! Outcomes reported by a [`MatchHandler`](crate::MatchHandler).
//!
//! Handlers report to a [`MatchCallback`]. The trait is implemented for tokio
//! mpsc senders of [`RendezvousEvent`], so the usual way to consume outcomes
//! is a channel:
//!
//! ```rust,ignore
//! let (tx, mut events) = tokio::sync::mpsc::unbounded_channel();
//! handler.start(current_match, tx);
//! while let Some(event) = events.recv().await {
//!     match event {
//!         RendezvousEvent::Complete { invite_data, .. } => { /* connect */ }
//!         RendezvousEvent::MatchInvalid { .. } => break,
//!         _ => {}
//!     }
//! }
//! ```

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{RendezvousError, Result};
use crate::protocol::MatchId;

/// A terminal (or, for a host's `Complete`, milestone) outcome of a handler.
#[derive(Debug)]
pub enum RendezvousEvent {
    /// The rendezvous succeeded. Hosts report `invite_data: None`; clients
    /// report the invite they retrieved.
    Complete {
        match_id: MatchId,
        invite_data: Option<String>,
    },
    /// The match payload broke the turn protocol, or the auto-matched peer
    /// was unreachable.
    MatchInvalid { match_id: MatchId },
    /// A service call failed.
    FatalError {
        match_id: MatchId,
        error: RendezvousError,
    },
    /// No turn arrived within the wait window.
    Timeout { match_id: MatchId },
    /// The match was cancelled, completed, expired or removed remotely.
    MatchRemoved { match_id: MatchId },
}

impl RendezvousEvent {
    pub fn match_id(&self) -> &MatchId {
        match self {
            Self::Complete { match_id, .. }
            | Self::MatchInvalid { match_id }
            | Self::FatalError { match_id, .. }
            | Self::Timeout { match_id }
            | Self::MatchRemoved { match_id } => match_id,
        }
    }

    /// Converts the outcome into a session result.
    ///
    /// `Complete` yields the retrieved invite data (`None` for a host);
    /// every other outcome becomes the matching [`RendezvousError`].
    ///
    /// # Errors
    ///
    /// [`RendezvousError::ProtocolViolation`] for `MatchInvalid`,
    /// [`RendezvousError::Timeout`], [`RendezvousError::MatchRemoved`], or
    /// the service error carried by `FatalError`.
    pub fn into_result(self) -> Result<Option<String>> {
        match self {
            Self::Complete { invite_data, .. } => Ok(invite_data),
            Self::MatchInvalid { match_id } => Err(RendezvousError::ProtocolViolation(format!(
                "match {match_id} broke the rendezvous protocol"
            ))),
            Self::FatalError { error, .. } => Err(error),
            Self::Timeout { .. } => Err(RendezvousError::Timeout),
            Self::MatchRemoved { .. } => Err(RendezvousError::MatchRemoved),
        }
    }
}

/// Receiver of handler outcomes.
///
/// Every method is called at most once per handler for a terminal outcome.
/// The handler has already detached itself when a terminal method runs, so
/// an implementation may start a new handler right away.
pub trait MatchCallback: Send + 'static {
    fn on_complete(&mut self, match_id: &MatchId, invite_data: Option<&str>);
    fn on_match_invalid(&mut self, match_id: &MatchId);
    fn on_fatal_error(&mut self, match_id: &MatchId, error: RendezvousError);
    fn on_timeout(&mut self, match_id: &MatchId);
    fn on_match_removed(&mut self, match_id: &MatchId);
}

/// Forwards an event into a [`MatchCallback`].
pub(crate) fn dispatch(callback: &mut dyn MatchCallback, event: RendezvousEvent) {
    match event {
        RendezvousEvent::Complete {
            match_id,
            invite_data,
        } => callback.on_complete(&match_id, invite_data.as_deref()),
        RendezvousEvent::MatchInvalid { match_id } => callback.on_match_invalid(&match_id),
        RendezvousEvent::FatalError { match_id, error } => {
            callback.on_fatal_error(&match_id, error);
        }
        RendezvousEvent::Timeout { match_id } => callback.on_timeout(&match_id),
        RendezvousEvent::MatchRemoved { match_id } => callback.on_match_removed(&match_id),
    }
}

impl MatchCallback for mpsc::UnboundedSender<RendezvousEvent> {
    fn on_complete(&mut self, match_id: &MatchId, invite_data: Option<&str>) {
        forward_unbounded(
            self,
            RendezvousEvent::Complete {
                match_id: match_id.clone(),
                invite_data: invite_data.map(str::to_owned),
            },
        );
    }

    fn on_match_invalid(&mut self, match_id: &MatchId) {
        forward_unbounded(
            self,
            RendezvousEvent::MatchInvalid {
                match_id: match_id.clone(),
            },
        );
    }

    fn on_fatal_error(&mut self, match_id: &MatchId, error: RendezvousError) {
        forward_unbounded(
            self,
            RendezvousEvent::FatalError {
                match_id: match_id.clone(),
                error,
            },
        );
    }

    fn on_timeout(&mut self, match_id: &MatchId) {
        forward_unbounded(
            self,
            RendezvousEvent::Timeout {
                match_id: match_id.clone(),
            },
        );
    }

    fn on_match_removed(&mut self, match_id: &MatchId) {
        forward_unbounded(
            self,
            RendezvousEvent::MatchRemoved {
                match_id: match_id.clone(),
            },
        );
    }
}

fn forward_unbounded(tx: &mpsc::UnboundedSender<RendezvousEvent>, event: RendezvousEvent) {
    if tx.send(event).is_err() {
        debug!("event channel closed, receiver dropped");
    }
}

/// Bounded senders never block the handler: when the channel is full the
/// event is dropped with a warning.
impl MatchCallback for mpsc::Sender<RendezvousEvent> {
    fn on_complete(&mut self, match_id: &MatchId, invite_data: Option<&str>) {
        forward_bounded(
            self,
            RendezvousEvent::Complete {
                match_id: match_id.clone(),
                invite_data: invite_data.map(str::to_owned),
            },
        );
    }

    fn on_match_invalid(&mut self, match_id: &MatchId) {
        forward_bounded(
            self,
            RendezvousEvent::MatchInvalid {
                match_id: match_id.clone(),
            },
        );
    }

    fn on_fatal_error(&mut self, match_id: &MatchId, error: RendezvousError) {
        forward_bounded(
            self,
            RendezvousEvent::FatalError {
                match_id: match_id.clone(),
                error,
            },
        );
    }

    fn on_timeout(&mut self, match_id: &MatchId) {
        forward_bounded(
            self,
            RendezvousEvent::Timeout {
                match_id: match_id.clone(),
            },
        );
    }

    fn on_match_removed(&mut self, match_id: &MatchId) {
        forward_bounded(
            self,
            RendezvousEvent::MatchRemoved {
                match_id: match_id.clone(),
            },
        );
    }
}

fn forward_bounded(tx: &mpsc::Sender<RendezvousEvent>, event: RendezvousEvent) {
    match tx.try_send(event) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(dropped)) => {
            warn!(
                "event channel full, dropping event: {:?}",
                std::mem::discriminant(&dropped)
            );
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!("event channel closed, receiver dropped");
        }
    }
}
