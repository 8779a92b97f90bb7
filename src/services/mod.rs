//! Implementations of the collaborator seams in [`service`](crate::service).
//!
//! | Feature     | Implementation            |
//! |-------------|---------------------------|
//! | (always)    | [`MemoryMatchHub`], [`MemoryMatchService`] |
//! | `tcp-probe` | [`TcpReachabilityProbe`]  |
//!
//! # Example
//!
//! ```rust
//! # async fn example() -> match_rendezvous::Result<()> {
//! use match_rendezvous::protocol::MatchConfig;
//! use match_rendezvous::services::MemoryMatchHub;
//! use match_rendezvous::MatchService;
//!
//! let hub = MemoryMatchHub::new();
//! let alice = hub.service("alice");
//! let room = alice.create_match(MatchConfig::invite("bob")).await?;
//! assert!(room.is_my_turn());
//! # Ok(())
//! # }
//! ```

pub mod memory;

#[cfg(feature = "tcp-probe")]
pub mod tcp_probe;

pub use memory::{MemoryMatchHub, MemoryMatchService};

#[cfg(feature = "tcp-probe")]
pub use tcp_probe::TcpReachabilityProbe;
