//! # Match Rendezvous
//!
//! Peer-to-peer rendezvous over an asynchronous turn-based match service.
//!
//! Two peers without a relay server use a turn-based match as a signaling
//! channel: the host publishes its connection metadata into the shared match
//! payload, the client reads it back, and both switch to a direct transport
//! outside this crate.
//!
//! ## Features
//!
//! - **Service-agnostic**: implement [`MatchService`] for any turn-based
//!   match backend; an in-memory one ships in [`services`]
//! - **Single driver**: each [`MatchHandler`] runs one task fed by typed
//!   events, with stale results discarded by generation
//! - **Race-free cancellation**: nothing is reported after
//!   [`MatchHandler::detach`] returns
//! - **Auto-match retries**: [`AutoMatchSession`] re-joins fresh rooms until
//!   a reachable peer is found
//!
//! ## Quick Start
//!
//! ```rust
//! # async fn example() -> match_rendezvous::Result<()> {
//! use std::sync::Arc;
//! use match_rendezvous::protocol::MatchConfig;
//! use match_rendezvous::services::MemoryMatchHub;
//! use match_rendezvous::{HandlerConfig, MatchHandler, MatchService, RendezvousEvent, Role};
//!
//! let hub = MemoryMatchHub::new();
//! let host: Arc<dyn MatchService> = Arc::new(hub.service("host"));
//! let room = host.create_match(MatchConfig::invite("client")).await?;
//!
//! let (tx, mut events) = tokio::sync::mpsc::unbounded_channel();
//! let mut handler = MatchHandler::new(Role::host("10.0.0.2:7777"), host, HandlerConfig::default());
//! handler.start(room, tx);
//!
//! if let Some(RendezvousEvent::Complete { .. }) = events.recv().await {
//!     // The invite is published; wait for the client on the direct transport.
//! }
//! # Ok(())
//! # }
//! ```

pub mod auto_match;
pub mod error;
pub mod error_codes;
pub mod event;
pub mod handler;
pub mod operation;
pub mod payload;
pub mod protocol;
pub mod role;
pub mod service;
pub mod services;
pub mod turn_wait;

// Re-export primary types for ergonomic imports.
pub use auto_match::{AutoMatchConfig, AutoMatchSession, AutoMatchSide, HostedRoom, Rendezvous};
pub use error::{RendezvousError, Result};
pub use error_codes::ServiceErrorCode;
pub use event::{MatchCallback, RendezvousEvent};
pub use handler::{HandlerConfig, HandlerPhase, MatchHandler};
pub use operation::{DeliveryGate, Operation, OperationSet};
pub use payload::{MatchPayload, MatchState};
pub use protocol::{Match, MatchId, ParticipantId};
pub use role::Role;
pub use service::{MatchService, ReachabilityProbe, TurnUpdates};
