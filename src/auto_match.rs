//! Auto-match retry policy.
//!
//! An auto-matched room can go wrong in ways an invited one cannot: the
//! peer may have created the room itself, may never show up, or may turn out
//! to be unreachable. [`AutoMatchSession`] hides that by abandoning the room
//! and joining a fresh one until a rendezvous succeeds, the retry budget is
//! spent, or the player is signed out.
//!
//! # Example
//!
//! ```rust,ignore
//! let session = AutoMatchSession::new(
//!     service,
//!     AutoMatchSide::Client { probe, local_id: "me".into() },
//!     AutoMatchConfig::default(),
//! );
//! let rendezvous = session.run().await?;
//! connect_to(rendezvous.invite_data.as_deref());
//! ```

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{RendezvousError, Result};
use crate::event::RendezvousEvent;
use crate::handler::{HandlerConfig, MatchHandler};
use crate::protocol::{Match, MatchConfig, MatchId};
use crate::role::Role;
use crate::service::{MatchService, ReachabilityProbe};

/// Default number of rooms tried before giving up.
const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Which end of the rendezvous this session plays.
#[derive(Clone)]
pub enum AutoMatchSide {
    /// Publishes `invite_data` into the room.
    Host { invite_data: String },
    /// Retrieves the host's invite data and probes it before accepting.
    Client {
        probe: Arc<dyn ReachabilityProbe>,
        local_id: String,
    },
}

impl AutoMatchSide {
    fn role(&self) -> Role {
        match self {
            Self::Host { invite_data } => Role::host(invite_data.as_str()),
            Self::Client { probe, local_id } => {
                Role::auto_match_client(Arc::clone(probe), local_id.as_str())
            }
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Host { .. } => "host",
            Self::Client { .. } => "client",
        }
    }
}

impl fmt::Debug for AutoMatchSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host { invite_data } => f
                .debug_struct("Host")
                .field("invite_data", invite_data)
                .finish(),
            Self::Client { local_id, .. } => f
                .debug_struct("Client")
                .field("local_id", local_id)
                .finish_non_exhaustive(),
        }
    }
}

/// Configuration of an [`AutoMatchSession`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoMatchConfig {
    /// Timing of each per-room handler.
    pub handler: HandlerConfig,
    /// Rooms to try before giving up. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for AutoMatchConfig {
    fn default() -> Self {
        Self {
            handler: HandlerConfig::default(),
            max_attempts: Some(DEFAULT_MAX_ATTEMPTS),
        }
    }
}

impl AutoMatchConfig {
    #[must_use]
    pub fn with_handler(mut self, handler: HandlerConfig) -> Self {
        self.handler = handler;
        self
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

/// A successful rendezvous.
#[derive(Debug)]
pub struct Rendezvous {
    pub match_id: MatchId,
    /// The peer's invite data. `None` on the host side.
    pub invite_data: Option<String>,
    /// Rooms tried, including the successful one.
    pub attempts: u32,
    /// On the host side, the room that is still being monitored.
    pub hosted: Option<HostedRoom>,
}

/// A host's published room, still watched for the client going away.
///
/// Dropping it detaches the monitor without touching the room.
#[derive(Debug)]
pub struct HostedRoom {
    match_id: MatchId,
    handler: MatchHandler,
    events: mpsc::UnboundedReceiver<RendezvousEvent>,
}

impl HostedRoom {
    pub fn match_id(&self) -> &MatchId {
        &self.match_id
    }

    /// Resolves once the room is gone: cancelled, expired or removed by the
    /// peer, or lost with the service connection.
    pub async fn closed(&mut self) -> RendezvousEvent {
        loop {
            match self.events.recv().await {
                Some(RendezvousEvent::Complete { .. }) => {}
                Some(event) => return event,
                None => {
                    return RendezvousEvent::FatalError {
                        match_id: self.match_id.clone(),
                        error: RendezvousError::ServiceClosed,
                    };
                }
            }
        }
    }

    /// Cancels and dismisses the room.
    pub async fn close(mut self) {
        self.handler.stop().await;
    }
}

enum Attempt {
    Joined {
        match_id: MatchId,
        invite_data: Option<String>,
        hosted: Option<HostedRoom>,
    },
    Retry(RendezvousError),
    Failed(RendezvousError),
}

/// Joins auto-matched rooms until one of them yields a rendezvous.
pub struct AutoMatchSession {
    service: Arc<dyn MatchService>,
    side: AutoMatchSide,
    config: AutoMatchConfig,
}

impl AutoMatchSession {
    pub fn new(service: Arc<dyn MatchService>, side: AutoMatchSide, config: AutoMatchConfig) -> Self {
        Self {
            service,
            side,
            config,
        }
    }

    pub fn side(&self) -> &AutoMatchSide {
        &self.side
    }

    pub fn config(&self) -> &AutoMatchConfig {
        &self.config
    }

    /// Runs the retry loop.
    ///
    /// # Errors
    ///
    /// - [`RendezvousError::NotSignedIn`] once the player has no session.
    /// - [`RendezvousError::AttemptsExhausted`] when `max_attempts` rooms
    ///   failed.
    /// - A service error that starting over cannot fix.
    pub async fn run(&self) -> Result<Rendezvous> {
        let mut attempts = 0u32;
        let mut last_error = None;
        loop {
            if self.config.max_attempts.is_some_and(|max| attempts >= max) {
                warn!(attempts, side = self.side.name(), "auto-match attempts exhausted");
                return Err(RendezvousError::AttemptsExhausted {
                    attempts,
                    last_error: last_error.map(Box::new),
                });
            }
            if !self.service.is_signed_in() {
                return Err(RendezvousError::NotSignedIn);
            }
            attempts += 1;
            info!(attempt = attempts, side = self.side.name(), "joining auto-match room");

            let room = match self.service.create_match(MatchConfig::auto_match()).await {
                Ok(room) => room,
                Err(e) if e.is_transient() => {
                    warn!(attempt = attempts, "failed to join auto-match room: {e}");
                    last_error = Some(e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            match self.attempt(room).await {
                Attempt::Joined {
                    match_id,
                    invite_data,
                    hosted,
                } => {
                    info!(match_id = %match_id, attempts, "rendezvous complete");
                    return Ok(Rendezvous {
                        match_id,
                        invite_data,
                        attempts,
                        hosted,
                    });
                }
                Attempt::Retry(e) => last_error = Some(e),
                Attempt::Failed(e) => return Err(e),
            }
        }
    }

    async fn attempt(&self, room: Match) -> Attempt {
        let match_id = room.id.clone();
        let (tx, mut events) = mpsc::unbounded_channel();
        let mut handler = MatchHandler::new(
            self.side.role(),
            Arc::clone(&self.service),
            self.config.handler.clone(),
        );
        if !handler.start(room, tx) {
            return Attempt::Failed(RendezvousError::NotSignedIn);
        }

        let Some(event) = events.recv().await else {
            return Attempt::Failed(RendezvousError::ServiceClosed);
        };

        let error = match event.into_result() {
            Ok(invite_data) => {
                let hosted = match self.side {
                    AutoMatchSide::Host { .. } => Some(HostedRoom {
                        match_id: match_id.clone(),
                        handler,
                        events,
                    }),
                    AutoMatchSide::Client { .. } => None,
                };
                return Attempt::Joined {
                    match_id,
                    invite_data,
                    hosted,
                };
            }
            Err(
                e @ (RendezvousError::ProtocolViolation(_)
                | RendezvousError::Timeout
                | RendezvousError::MatchRemoved),
            ) => e,
            Err(e) if !self.service.is_signed_in() => {
                warn!(match_id = %match_id, "signed out during auto-match: {e}");
                return Attempt::Failed(e);
            }
            Err(e) => e,
        };

        info!(match_id = %match_id, "abandoning auto-match room: {error}");
        handler.stop().await;
        debug!(match_id = %match_id, "room abandoned, re-joining");
        Attempt::Retry(error)
    }
}

impl fmt::Debug for AutoMatchSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AutoMatchSession")
            .field("side", &self.side)
            .field("config", &self.config)
            .finish_non_exhaustive()
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
    use std::time::Duration;

    #[test]
    fn default_config_bounds_attempts() {
        let config = AutoMatchConfig::default();
        assert_eq!(config.max_attempts, Some(5));
        assert_eq!(config.handler, HandlerConfig::default());
    }

    #[test]
    fn config_builders() {
        let config = AutoMatchConfig::default()
            .with_max_attempts(None)
            .with_handler(HandlerConfig::default().with_jitter_max(Duration::ZERO));
        assert_eq!(config.max_attempts, None);
        assert_eq!(config.handler.jitter_max, Duration::ZERO);
    }

    #[test]
    fn config_deserializes_partial_input() {
        let config: AutoMatchConfig =
            serde_json::from_str(r#"{ "max_attempts": 2, "handler": { "p2p_test_timeout_ms": 500 } }"#)
                .unwrap();
        assert_eq!(config.max_attempts, Some(2));
        assert_eq!(config.handler.p2p_test_timeout, Duration::from_millis(500));
        assert_eq!(config.handler.first_turn_wait, Duration::from_secs(60));
    }

    #[test]
    fn host_side_builds_host_role() {
        let side = AutoMatchSide::Host {
            invite_data: "abc".into(),
        };
        assert_eq!(side.role().name(), "host");
        assert_eq!(side.name(), "host");
        assert!(format!("{side:?}").contains("abc"));
    }
}
