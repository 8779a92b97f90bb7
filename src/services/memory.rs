//! In-process turn-based match service.
//!
//! [`MemoryMatchHub`] holds every room; each player talks to it through its
//! own [`MemoryMatchService`]. The hub behaves like a hosted turn-based
//! service as far as the rendezvous core can tell:
//!
//! - only the participant holding the turn may take one, others get
//!   [`NotYourTurn`](ServiceErrorCode::NotYourTurn);
//! - auto-match rooms keep an open slot until another auto-matching player
//!   joins; a turn handed to the open slot goes to whoever joins;
//! - every change is pushed to the participants' turn listeners as a
//!   viewer-relative snapshot;
//! - dismissing only removes the room from the dismissing player's view.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::error::{RendezvousError, Result};
use crate::error_codes::ServiceErrorCode;
use crate::protocol::{Match, MatchConfig, MatchId, MatchStatus, ParticipantId, TurnStatus, TurnUpdate};
use crate::service::{MatchService, TurnUpdates};

/// Per-player turn update buffer.
const UPDATE_CAPACITY: usize = 64;

#[derive(Debug)]
struct Room {
    status: MatchStatus,
    participants: Vec<ParticipantId>,
    creator: ParticipantId,
    /// `None` while the turn sits with the open auto-match slot, or after
    /// the room ended.
    turn_holder: Option<ParticipantId>,
    open_slot: bool,
    data: Option<Vec<u8>>,
    version: u64,
    dismissed: HashSet<ParticipantId>,
}

impl Room {
    fn snapshot(&self, id: &MatchId, viewer: &ParticipantId) -> Match {
        let turn_status = if self.turn_holder.as_ref() == Some(viewer) {
            TurnStatus::MyTurn
        } else {
            TurnStatus::TheirTurn
        };
        Match {
            id: id.clone(),
            status: self.status,
            turn_status,
            participants: self.participants.clone(),
            creator: self.creator.clone(),
            local: viewer.clone(),
            data: self.data.clone(),
            version: self.version,
        }
    }

    fn has(&self, player: &ParticipantId) -> bool {
        self.participants.contains(player)
    }

    fn visible_to(&self, player: &ParticipantId) -> bool {
        self.has(player) && !self.dismissed.contains(player)
    }
}

#[derive(Debug, Default)]
struct HubState {
    rooms: HashMap<MatchId, Room>,
    /// Auto-match rooms with an open slot, oldest first.
    open: VecDeque<MatchId>,
    listeners: HashMap<ParticipantId, broadcast::Sender<TurnUpdate>>,
}

impl HubState {
    fn subscribe(&mut self, player: &ParticipantId) -> broadcast::Receiver<TurnUpdate> {
        self.listeners
            .entry(player.clone())
            .or_insert_with(|| broadcast::channel(UPDATE_CAPACITY).0)
            .subscribe()
    }

    fn send(&self, player: &ParticipantId, update: TurnUpdate) {
        if let Some(tx) = self.listeners.get(player) {
            // No live receivers is fine.
            let _ = tx.send(update);
        }
    }

    /// Pushes a fresh snapshot of `id` to every participant still viewing it.
    fn notify(&self, id: &MatchId) {
        let Some(room) = self.rooms.get(id) else {
            return;
        };
        for player in room.participants.iter().filter(|p| room.visible_to(p)) {
            self.send(player, TurnUpdate::MatchReceived(room.snapshot(id, player)));
        }
    }

    fn room(&self, player: &ParticipantId, id: &MatchId) -> Result<&Room> {
        match self.rooms.get(id) {
            Some(room) if room.visible_to(player) => Ok(room),
            Some(_) | None => Err(not_found(id)),
        }
    }

    fn room_mut(&mut self, player: &ParticipantId, id: &MatchId) -> Result<&mut Room> {
        match self.rooms.get_mut(id) {
            Some(room) if room.visible_to(player) => Ok(room),
            Some(_) | None => Err(not_found(id)),
        }
    }

    fn create(&mut self, player: &ParticipantId, config: MatchConfig) -> Result<Match> {
        if config.auto_match && config.invitees.is_empty() {
            if let Some(joined) = self.join_open(player) {
                return Ok(joined);
            }
        }
        if !config.auto_match && config.invitees.is_empty() {
            return Err(RendezvousError::service(
                ServiceErrorCode::InvalidParticipant,
                "a match needs an invitee or an auto-match slot",
            ));
        }
        if config.invitees.contains(player) {
            return Err(RendezvousError::service(
                ServiceErrorCode::InvalidParticipant,
                "cannot invite yourself",
            ));
        }

        let id = MatchId::random();
        let mut participants = vec![player.clone()];
        for invitee in config.invitees {
            if !participants.contains(&invitee) {
                participants.push(invitee);
            }
        }
        let status = if config.auto_match {
            self.open.push_back(id.clone());
            MatchStatus::AutoMatching
        } else {
            MatchStatus::Active
        };
        self.rooms.insert(
            id.clone(),
            Room {
                status,
                participants,
                creator: player.clone(),
                turn_holder: Some(player.clone()),
                open_slot: config.auto_match,
                data: None,
                version: 0,
                dismissed: HashSet::new(),
            },
        );
        debug!(match_id = %id, player = %player, auto_match = config.auto_match, "room created");
        self.notify(&id);
        self.room(player, &id).map(|room| room.snapshot(&id, player))
    }

    fn join_open(&mut self, player: &ParticipantId) -> Option<Match> {
        let rooms = &self.rooms;
        self.open
            .retain(|id| rooms.get(id).is_some_and(|r| r.open_slot && r.status.is_live()));
        let position = self
            .open
            .iter()
            .position(|id| rooms.get(id).is_some_and(|r| !r.has(player)))?;
        let id = self.open.remove(position)?;

        let room = self.rooms.get_mut(&id)?;
        room.participants.push(player.clone());
        room.open_slot = false;
        room.status = MatchStatus::Active;
        if room.turn_holder.is_none() {
            room.turn_holder = Some(player.clone());
        }
        let joined = room.snapshot(&id, player);
        debug!(match_id = %id, player = %player, "joined auto-match room");
        self.notify(&id);
        Some(joined)
    }

    fn take_turn(
        &mut self,
        player: &ParticipantId,
        id: &MatchId,
        data: Vec<u8>,
        next: Option<ParticipantId>,
    ) -> Result<Match> {
        let room = self.room_mut(player, id)?;
        if !room.status.is_live() {
            return Err(inactive(id));
        }
        if room.turn_holder.as_ref() != Some(player) {
            return Err(RendezvousError::service(
                ServiceErrorCode::NotYourTurn,
                format!("{player} does not hold the turn on {id}"),
            ));
        }
        match &next {
            Some(next) if next == player || !room.has(next) => {
                return Err(RendezvousError::service(
                    ServiceErrorCode::InvalidParticipant,
                    format!("{next} cannot take the next turn on {id}"),
                ));
            }
            None if !room.open_slot => {
                return Err(RendezvousError::service(
                    ServiceErrorCode::InvalidParticipant,
                    format!("{id} has no open auto-match slot"),
                ));
            }
            _ => {}
        }

        room.data = Some(data);
        room.version += 1;
        room.turn_holder = next;
        let updated = room.snapshot(id, player);
        trace!(match_id = %id, player = %player, version = updated.version, "turn taken");
        self.notify(id);
        Ok(updated)
    }

    fn cancel(&mut self, player: &ParticipantId, id: &MatchId) -> Result<()> {
        let room = self.room_mut(player, id)?;
        if !room.status.is_live() {
            return Err(inactive(id));
        }
        room.status = MatchStatus::Cancelled;
        room.turn_holder = None;
        room.open_slot = false;
        self.open.retain(|open| open != id);
        debug!(match_id = %id, player = %player, "room cancelled");
        self.notify(id);
        Ok(())
    }

    fn dismiss(&mut self, player: &ParticipantId, id: &MatchId) -> Result<()> {
        let room = self.room_mut(player, id)?;
        room.dismissed.insert(player.clone());
        let everyone_left = room.participants.iter().all(|p| room.dismissed.contains(p));
        self.send(player, TurnUpdate::MatchRemoved(id.clone()));
        if everyone_left {
            self.rooms.remove(id);
            self.open.retain(|open| open != id);
            debug!(match_id = %id, "room dropped, every participant dismissed it");
        }
        Ok(())
    }

    fn end(&mut self, id: &MatchId, status: MatchStatus) -> Result<()> {
        let room = self.rooms.get_mut(id).ok_or_else(|| not_found(id))?;
        room.status = status;
        room.turn_holder = None;
        room.open_slot = false;
        self.open.retain(|open| open != id);
        self.notify(id);
        Ok(())
    }

    fn remove(&mut self, id: &MatchId) -> Result<()> {
        let room = self.rooms.remove(id).ok_or_else(|| not_found(id))?;
        self.open.retain(|open| open != id);
        for player in room.participants.iter().filter(|p| room.visible_to(p)) {
            self.send(player, TurnUpdate::MatchRemoved(id.clone()));
        }
        Ok(())
    }
}

fn not_found(id: &MatchId) -> RendezvousError {
    RendezvousError::service(ServiceErrorCode::MatchNotFound, format!("no match {id}"))
}

fn inactive(id: &MatchId) -> RendezvousError {
    RendezvousError::service(ServiceErrorCode::InactiveMatch, format!("match {id} is over"))
}

// ── Hub ─────────────────────────────────────────────────────────────

/// Shared room registry. Cloning the hub shares the same rooms.
#[derive(Debug, Clone, Default)]
pub struct MemoryMatchHub {
    state: Arc<Mutex<HubState>>,
}

impl MemoryMatchHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// A signed-in service handle for `player`.
    pub fn service(&self, player: impl Into<ParticipantId>) -> MemoryMatchService {
        MemoryMatchService {
            hub: self.clone(),
            player: player.into(),
            signed_in: Arc::new(AtomicBool::new(true)),
        }
    }

    /// The match as `viewer` would see it.
    pub fn snapshot(&self, id: &MatchId, viewer: &ParticipantId) -> Option<Match> {
        let state = self.lock();
        state
            .room(viewer, id)
            .ok()
            .map(|room| room.snapshot(id, viewer))
    }

    /// Expires a match, as the service does when turns stop coming.
    ///
    /// # Errors
    ///
    /// [`MatchNotFound`](ServiceErrorCode::MatchNotFound) for unknown ids.
    pub fn expire(&self, id: &MatchId) -> Result<()> {
        self.lock().end(id, MatchStatus::Expired)
    }

    /// Deletes a match for every participant.
    ///
    /// # Errors
    ///
    /// [`MatchNotFound`](ServiceErrorCode::MatchNotFound) for unknown ids.
    pub fn remove(&self, id: &MatchId) -> Result<()> {
        self.lock().remove(id)
    }

    /// Number of auto-match rooms waiting for a second player.
    pub fn open_rooms(&self) -> usize {
        let state = self.lock();
        state
            .open
            .iter()
            .filter(|id| state.rooms.get(*id).is_some_and(|r| r.open_slot && r.status.is_live()))
            .count()
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ── Service ─────────────────────────────────────────────────────────

/// One player's view of a [`MemoryMatchHub`].
#[derive(Debug, Clone)]
pub struct MemoryMatchService {
    hub: MemoryMatchHub,
    player: ParticipantId,
    signed_in: Arc<AtomicBool>,
}

impl MemoryMatchService {
    pub fn player(&self) -> &ParticipantId {
        &self.player
    }

    pub fn hub(&self) -> &MemoryMatchHub {
        &self.hub
    }

    /// Simulates signing in or out. Shared by clones of this handle.
    pub fn set_signed_in(&self, signed_in: bool) {
        self.signed_in.store(signed_in, Ordering::SeqCst);
    }

    /// Loads the current snapshot of a match.
    ///
    /// # Errors
    ///
    /// [`MatchNotFound`](ServiceErrorCode::MatchNotFound) if the match is
    /// unknown or was dismissed by this player.
    pub fn fetch_match(&self, id: &MatchId) -> Result<Match> {
        self.ensure_signed_in()?;
        let state = self.hub.lock();
        state.room(&self.player, id).map(|room| room.snapshot(id, &self.player))
    }

    fn ensure_signed_in(&self) -> Result<()> {
        if self.is_signed_in() {
            Ok(())
        } else {
            Err(RendezvousError::NotSignedIn)
        }
    }
}

#[async_trait]
impl MatchService for MemoryMatchService {
    fn is_signed_in(&self) -> bool {
        self.signed_in.load(Ordering::SeqCst)
    }

    async fn create_match(&self, config: MatchConfig) -> Result<Match> {
        self.ensure_signed_in()?;
        self.hub.lock().create(&self.player, config)
    }

    async fn take_turn(
        &self,
        match_id: &MatchId,
        data: Vec<u8>,
        next: Option<ParticipantId>,
    ) -> Result<Match> {
        self.ensure_signed_in()?;
        self.hub.lock().take_turn(&self.player, match_id, data, next)
    }

    async fn cancel_match(&self, match_id: &MatchId) -> Result<()> {
        self.ensure_signed_in()?;
        self.hub.lock().cancel(&self.player, match_id)
    }

    async fn dismiss_match(&self, match_id: &MatchId) -> Result<()> {
        self.ensure_signed_in()?;
        self.hub.lock().dismiss(&self.player, match_id)
    }

    fn subscribe_turn_updates(&self) -> TurnUpdates {
        TurnUpdates::new(self.hub.lock().subscribe(&self.player))
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

    fn code(err: RendezvousError) -> Option<ServiceErrorCode> {
        err.code()
    }

    #[tokio::test]
    async fn invite_match_starts_with_creator_turn() {
        let hub = MemoryMatchHub::new();
        let alice = hub.service("alice");
        let bob = hub.service("bob");
        let mut bob_updates = bob.subscribe_turn_updates();

        let m = alice.create_match(MatchConfig::invite("bob")).await.unwrap();
        assert!(m.is_my_turn());
        assert_eq!(m.other_participant(), Some(&ParticipantId::from("bob")));

        let Some(TurnUpdate::MatchReceived(seen)) = bob_updates.recv().await else {
            panic!("bob was not told about the invite");
        };
        assert_eq!(seen.id, m.id);
        assert_eq!(seen.turn_status, TurnStatus::TheirTurn);
    }

    #[tokio::test]
    async fn only_turn_holder_may_take_a_turn() {
        let hub = MemoryMatchHub::new();
        let alice = hub.service("alice");
        let bob = hub.service("bob");
        let m = alice.create_match(MatchConfig::invite("bob")).await.unwrap();

        let err = bob.take_turn(&m.id, vec![1], Some("alice".into())).await.unwrap_err();
        assert_eq!(code(err), Some(ServiceErrorCode::NotYourTurn));

        let after = alice.take_turn(&m.id, vec![1], Some("bob".into())).await.unwrap();
        assert_eq!(after.version, 1);
        assert_eq!(after.turn_status, TurnStatus::TheirTurn);
        assert!(bob.fetch_match(&m.id).unwrap().is_my_turn());
    }

    #[tokio::test]
    async fn auto_match_pairs_two_players_and_hands_over_open_turn() {
        let hub = MemoryMatchHub::new();
        let alice = hub.service("alice");
        let bob = hub.service("bob");

        let room = alice.create_match(MatchConfig::auto_match()).await.unwrap();
        assert_eq!(room.status, MatchStatus::AutoMatching);
        assert_eq!(room.other_participant(), None);
        assert_eq!(hub.open_rooms(), 1);

        alice.take_turn(&room.id, vec![7], None).await.unwrap();
        assert!(!alice.fetch_match(&room.id).unwrap().is_my_turn());

        let joined = bob.create_match(MatchConfig::auto_match()).await.unwrap();
        assert_eq!(joined.id, room.id);
        assert!(joined.is_my_turn());
        assert_eq!(joined.data.as_deref(), Some(&[7u8][..]));
        assert_eq!(hub.open_rooms(), 0);
    }

    #[tokio::test]
    async fn player_never_joins_own_open_room() {
        let hub = MemoryMatchHub::new();
        let alice = hub.service("alice");
        let first = alice.create_match(MatchConfig::auto_match()).await.unwrap();
        let second = alice.create_match(MatchConfig::auto_match()).await.unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(hub.open_rooms(), 2);
    }

    #[tokio::test]
    async fn cancel_notifies_every_participant() {
        let hub = MemoryMatchHub::new();
        let alice = hub.service("alice");
        let bob = hub.service("bob");
        let m = alice.create_match(MatchConfig::invite("bob")).await.unwrap();
        let mut bob_updates = bob.subscribe_turn_updates();

        bob.cancel_match(&m.id).await.unwrap();
        let Some(TurnUpdate::MatchReceived(seen)) = bob_updates.recv().await else {
            panic!("no cancellation snapshot");
        };
        assert_eq!(seen.status, MatchStatus::Cancelled);

        let err = alice.take_turn(&m.id, vec![], Some("bob".into())).await.unwrap_err();
        assert_eq!(code(err), Some(ServiceErrorCode::InactiveMatch));
    }

    #[tokio::test]
    async fn dismiss_only_hides_the_match_from_the_dismisser() {
        let hub = MemoryMatchHub::new();
        let alice = hub.service("alice");
        let bob = hub.service("bob");
        let m = alice.create_match(MatchConfig::invite("bob")).await.unwrap();
        let mut alice_updates = alice.subscribe_turn_updates();

        alice.dismiss_match(&m.id).await.unwrap();
        assert_eq!(
            alice_updates.recv().await,
            Some(TurnUpdate::MatchRemoved(m.id.clone()))
        );
        assert!(alice.fetch_match(&m.id).is_err());
        assert!(bob.fetch_match(&m.id).is_ok());

        bob.dismiss_match(&m.id).await.unwrap();
        assert!(hub.snapshot(&m.id, &ParticipantId::from("bob")).is_none());
    }

    #[tokio::test]
    async fn expire_and_remove_reach_listeners() {
        let hub = MemoryMatchHub::new();
        let alice = hub.service("alice");
        let mut updates = alice.subscribe_turn_updates();
        let m = alice.create_match(MatchConfig::invite("bob")).await.unwrap();
        let _created = updates.recv().await;

        hub.expire(&m.id).unwrap();
        let Some(TurnUpdate::MatchReceived(seen)) = updates.recv().await else {
            panic!("no expiry snapshot");
        };
        assert_eq!(seen.status, MatchStatus::Expired);

        hub.remove(&m.id).unwrap();
        assert_eq!(updates.recv().await, Some(TurnUpdate::MatchRemoved(m.id.clone())));
        assert!(hub.remove(&m.id).is_err());
    }

    #[tokio::test]
    async fn signed_out_player_is_rejected() {
        let hub = MemoryMatchHub::new();
        let alice = hub.service("alice");
        alice.set_signed_in(false);
        assert!(!alice.is_signed_in());
        let err = alice.create_match(MatchConfig::auto_match()).await.unwrap_err();
        assert!(matches!(err, RendezvousError::NotSignedIn));
    }

    #[tokio::test]
    async fn invalid_match_configs_are_rejected() {
        let hub = MemoryMatchHub::new();
        let alice = hub.service("alice");
        let err = alice.create_match(MatchConfig::default()).await.unwrap_err();
        assert_eq!(code(err), Some(ServiceErrorCode::InvalidParticipant));
        let err = alice.create_match(MatchConfig::invite("alice")).await.unwrap_err();
        assert_eq!(code(err), Some(ServiceErrorCode::InvalidParticipant));
    }
}
