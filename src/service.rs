//! Seams to the external collaborators of the rendezvous core.
//!
//! [`MatchService`] is the asynchronous turn-based match service used as the
//! signaling channel. [`ReachabilityProbe`] checks whether the peer named by
//! an invite can actually be reached before an auto-matched client commits to
//! it.
//!
//! # Implementing a Match Service
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use match_rendezvous::error::Result;
//! use match_rendezvous::protocol::{Match, MatchConfig, MatchId, ParticipantId};
//! use match_rendezvous::service::{MatchService, TurnUpdates};
//!
//! struct MyService { /* ... */ }
//!
//! #[async_trait]
//! impl MatchService for MyService {
//!     fn is_signed_in(&self) -> bool {
//!         // Report whether the platform session is usable
//!         true
//!     }
//!
//!     async fn create_match(&self, config: MatchConfig) -> Result<Match> {
//!         // Create a room, or join an open auto-match slot
//!         unimplemented!()
//!     }
//!
//!     async fn take_turn(
//!         &self,
//!         match_id: &MatchId,
//!         data: Vec<u8>,
//!         next: Option<ParticipantId>,
//!     ) -> Result<Match> {
//!         // Store `data` and hand the turn to `next` (or the auto-match slot)
//!         unimplemented!()
//!     }
//!
//!     async fn cancel_match(&self, match_id: &MatchId) -> Result<()> {
//!         unimplemented!()
//!     }
//!
//!     async fn dismiss_match(&self, match_id: &MatchId) -> Result<()> {
//!         unimplemented!()
//!     }
//!
//!     fn subscribe_turn_updates(&self) -> TurnUpdates {
//!         // Register a turn listener; dropping the subscription unregisters it
//!         unimplemented!()
//!     }
//! }
//! ```

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::warn;

use crate::error::Result;
use crate::protocol::{Match, MatchConfig, MatchId, ParticipantId, TurnUpdate};

/// The asynchronous turn-based match service.
///
/// All methods may be called concurrently from different handlers. The trait
/// is object-safe; handlers hold it as `Arc<dyn MatchService>`.
#[async_trait]
pub trait MatchService: Send + Sync + 'static {
    /// Returns `false` while the local player has no usable session.
    fn is_signed_in(&self) -> bool;

    /// Creates a match, or joins an open auto-match slot.
    ///
    /// # Errors
    ///
    /// Returns [`RendezvousError::Service`](crate::RendezvousError::Service)
    /// if the service rejects the request.
    async fn create_match(&self, config: MatchConfig) -> Result<Match>;

    /// Stores `data` on the match and hands the turn to `next`.
    ///
    /// `next == None` hands the turn to the open auto-match slot. Returns the
    /// updated snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`RendezvousError::Service`](crate::RendezvousError::Service),
    /// e.g. with [`NotYourTurn`](crate::ServiceErrorCode::NotYourTurn).
    async fn take_turn(
        &self,
        match_id: &MatchId,
        data: Vec<u8>,
        next: Option<ParticipantId>,
    ) -> Result<Match>;

    /// Cancels the match for every participant.
    ///
    /// # Errors
    ///
    /// Returns [`RendezvousError::Service`](crate::RendezvousError::Service)
    /// if the service rejects the request.
    async fn cancel_match(&self, match_id: &MatchId) -> Result<()>;

    /// Removes the match from the local player's view.
    ///
    /// # Errors
    ///
    /// Returns [`RendezvousError::Service`](crate::RendezvousError::Service)
    /// if the service rejects the request.
    async fn dismiss_match(&self, match_id: &MatchId) -> Result<()>;

    /// Registers a turn listener. Dropping the returned subscription
    /// unregisters it.
    ///
    /// Updates published after this call returns are delivered in order.
    fn subscribe_turn_updates(&self) -> TurnUpdates;
}

/// A registered turn listener.
#[derive(Debug)]
pub struct TurnUpdates {
    rx: broadcast::Receiver<TurnUpdate>,
}

impl TurnUpdates {
    pub fn new(rx: broadcast::Receiver<TurnUpdate>) -> Self {
        Self { rx }
    }

    /// Waits for the next update. Returns `None` once the service dropped
    /// its sender.
    ///
    /// Cancel-safe: dropping the future loses no update.
    pub async fn recv(&mut self) -> Option<TurnUpdate> {
        loop {
            match self.rx.recv().await {
                Ok(update) => return Some(update),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "turn listener lagged, updates dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Checks that the peer advertised by an invite is reachable.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync + 'static {
    /// Probes the peer described by `invite_data` on behalf of `local_id`.
    ///
    /// Returns `Ok(false)` for a peer that answered negatively and an error
    /// when the probe itself failed; the handler treats both as unreachable.
    async fn probe(&self, invite_data: &str, local_id: &str) -> Result<bool>;
}
