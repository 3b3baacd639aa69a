use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use uuid::Uuid;

use super::registry::{PeerRecord, PeerRegistry};
use super::room::{RoomManager, RoomSocket, RoomWatcher};
use super::server::stopped;
use super::session::{PeerSession, SessionHandle};
use crate::config::RelayConfig;
use crate::protocol::{
    EventKind, FileInit, FileStatus, JoinPayload, Message, PeerSummary, PeersPayload,
    RelayEnvelope,
};

/// Registry and room membership, mutated as one unit
#[derive(Default)]
struct RelayState {
    registry: PeerRegistry,
    rooms: RoomManager,
}

/// Central message bus and peer registry.
///
/// All handlers run synchronously under one lock that is never held across
/// an await; outbound writes are non-blocking queue pushes.
pub struct RelayServer {
    config: RelayConfig,
    state: Mutex<RelayState>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            state: Mutex::new(RelayState::default()),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    fn state(&self) -> MutexGuard<'_, RelayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wire a freshly accepted connection's handlers to this relay
    pub fn attach(self: &Arc<Self>, session: &mut PeerSession) {
        let handle = session.handle();
        let remote = session.remote_addr();

        let (relay, h) = (self.clone(), handle.clone());
        session.on(EventKind::Join, move |msg| {
            if let Message::Join(join) = msg {
                relay.on_join(&h, remote, join);
            }
        });

        let relay = self.clone();
        session.on(EventKind::Heartbeat, move |msg| {
            if let Message::Heartbeat(beat) = msg {
                relay.on_heartbeat(&beat.user_id);
            }
        });

        let (relay, h) = (self.clone(), handle.clone());
        session.on(EventKind::Message, move |msg| {
            if let Message::Message(envelope) = msg {
                relay.on_message(&h, envelope);
            }
        });

        for kind in [EventKind::FileInit, EventKind::FileTorrent, EventKind::Chunk] {
            let (relay, h) = (self.clone(), handle.clone());
            session.on(kind, move |msg| {
                relay.relay_to_room(&h, msg);
            });
        }

        let (relay, h) = (self.clone(), handle.clone());
        session.on(EventKind::FileStatus, move |msg| {
            if let Message::FileStatus(status) = msg {
                relay.relay_status(&h, status);
            }
        });

        let (relay, h) = (self.clone(), handle.clone());
        session.on(EventKind::RoomJoin, move |msg| {
            if let Message::RoomJoin(req) = msg {
                relay.join_room(&h, &req.room);
            }
        });

        let (relay, h) = (self.clone(), handle);
        session.on(EventKind::RoomLeave, move |msg| {
            if let Message::RoomLeave(req) = msg {
                relay.leave_room(&h, &req.room);
            }
        });
    }

    /// Register (or re-register) a peer and rebroadcast the roster
    pub fn on_join(&self, session: &SessionHandle, remote: Option<SocketAddr>, join: JoinPayload) {
        let mut state = self.state();
        let record = PeerRecord::from_join(join, session.clone(), remote, Instant::now());
        let socket = RoomSocket::new(session.clone(), &record.display_name, &record.peer_id);
        info!(
            "Peer joined: {} ({}) peer_id={} from {:?}",
            record.display_name, record.id, record.peer_id, remote
        );

        // A re-JOIN from the same connection keeps its room
        let current_room = state.rooms.room_of(session.id()).map(str::to_string);

        // One record per connection: a JOIN under a new id replaces the old one
        let previous_id = state
            .registry
            .by_session(session.id())
            .map(|r| r.id.clone())
            .filter(|id| *id != record.id);
        if let Some(previous_id) = previous_id {
            info!("Session {} re-joined as {}, dropping {}", session.id(), record.id, previous_id);
            state.registry.remove(&previous_id);
        }

        if let Some(old) = state.registry.join(record) {
            if old.session_id() != session.id() {
                // The old connection is dereferenced, not closed
                state.rooms.remove_everywhere(old.session_id());
            }
        }

        match current_room {
            Some(room) => {
                // Refresh the room's view of name / peer id
                if let Some(room) = state.rooms.get_mut(&room) {
                    room.update_socket(socket);
                }
            }
            None => {
                let default_room = self.config.default_room.clone();
                state.rooms.get_or_create(&default_room).add_socket(socket);
            }
        }

        Self::broadcast_roster(&state);
    }

    /// Refresh liveness only; heartbeats get no reply
    pub fn on_heartbeat(&self, id: &str) {
        if !self.state().registry.touch(id, Instant::now()) {
            debug!("Heartbeat from unregistered peer {}", id);
        }
    }

    /// Relay an application message; returns the number of sessions reached
    pub fn on_message(&self, session: &SessionHandle, envelope: RelayEnvelope) -> usize {
        let state = self.state();

        let Some(sender) = state.registry.by_session(session.id()) else {
            warn!("MESSAGE from unregistered session {}, dropping", session.id());
            return 0;
        };
        let sender_id = sender.id.clone();

        let frame = match Message::Message(envelope.clone()).to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                error!("Failed to encode MESSAGE from {}: {}", sender_id, e);
                return 0;
            }
        };

        if let Some(recipient) = envelope.message.recipient.as_deref() {
            return match state.registry.by_peer_id(recipient) {
                Some(target) => match target.session.send_frame(frame) {
                    Ok(()) => {
                        debug!("Relayed {} from {} to {}", envelope.message.kind, sender_id, target.id);
                        1
                    }
                    Err(e) => {
                        warn!("Send to {} failed: {}", target.id, e);
                        0
                    }
                },
                None => {
                    warn!(
                        "No peer with peer_id {} for message from {}, dropping",
                        recipient, sender_id
                    );
                    0
                }
            };
        }

        let mut delivered = 0;
        for record in state.registry.iter().filter(|r| r.session_id() != session.id()) {
            match record.session.send_frame(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => warn!("Broadcast to {} failed: {}", record.id, e),
            }
        }
        delivered
    }

    /// Evict silent peers; one roster broadcast per sweep that removed anyone
    pub fn sweep(&self, now: Instant) -> Vec<String> {
        let mut state = self.state();
        let evicted = state.registry.evict_expired(now, self.config.peer_timeout);
        if evicted.is_empty() {
            return Vec::new();
        }

        for record in &evicted {
            info!("Evicting silent peer {} ({})", record.display_name, record.id);
            record.session.close();
            state.rooms.remove_everywhere(record.session_id());
        }

        Self::broadcast_roster(&state);
        evicted.into_iter().map(|r| r.id).collect()
    }

    /// Forget everything a closed connection owned
    pub fn on_disconnect(&self, session_id: Uuid) {
        let mut state = self.state();
        state.rooms.remove_everywhere(session_id);

        let removed = state.registry.remove_session(session_id);
        if removed.is_empty() {
            debug!("Unregistered session {} disconnected", session_id);
            return;
        }
        for record in &removed {
            info!("Peer disconnected: {} ({})", record.display_name, record.id);
        }
        Self::broadcast_roster(&state);
    }

    /// Fan transfer traffic out to the other members of the origin's room
    pub fn relay_to_room(&self, session: &SessionHandle, message: Message) -> usize {
        let mut state = self.state();
        let name = state
            .registry
            .by_session(session.id())
            .map(|r| r.display_name.clone());
        let (Some(name), Some(room)) = (name, state.rooms.room_of_mut(session.id())) else {
            warn!("{} from session {} outside any room, dropping", message.kind(), session.id());
            return 0;
        };

        if let Message::FileInit(FileInit::Announce(announce)) = &message {
            info!(
                "Room {}: {} announces {} bytes in {} file(s)",
                room.name(),
                name,
                announce.size,
                announce.meta.len()
            );
            room.set_sender(name);
        }

        match message.into_frame() {
            Ok(frame) => room.broadcast_frame(&frame, Some(session.id())),
            Err(e) => {
                error!("Failed to encode transfer frame: {}", e);
                0
            }
        }
    }

    /// Route a receiver's ack to its room's sender
    pub fn relay_status(&self, session: &SessionHandle, status: FileStatus) -> bool {
        let state = self.state();
        let Some(room) = state
            .rooms
            .room_of(session.id())
            .and_then(|name| state.rooms.get(name))
        else {
            warn!("FILE_STATUS from session {} outside any room", session.id());
            return false;
        };

        match room.sender_socket() {
            Some(sender) => match sender.handle.send(&Message::FileStatus(status)) {
                Ok(()) => true,
                Err(e) => {
                    warn!("Ack to sender {} failed: {}", sender.name, e);
                    false
                }
            },
            None => {
                debug!("Room {} has no reachable sender for FILE_STATUS", room.name());
                false
            }
        }
    }

    /// Move a registered session into `room`
    pub fn join_room(&self, session: &SessionHandle, room: &str) -> bool {
        let mut state = self.state();
        let Some(record) = state.registry.by_session(session.id()) else {
            warn!("ROOM_JOIN from unregistered session {}", session.id());
            return false;
        };
        let socket = RoomSocket::new(session.clone(), &record.display_name, &record.peer_id);

        if state.rooms.room_of(session.id()) == Some(room) {
            return false;
        }
        state.rooms.remove_everywhere(session.id());
        state.rooms.get_or_create(room).add_socket(socket)
    }

    pub fn leave_room(&self, session: &SessionHandle, room: &str) -> bool {
        self.state().rooms.leave(room, session.id()).is_some()
    }

    /// Subscribe to roster snapshots of a room
    pub fn watch_room(&self, room: &str) -> RoomWatcher {
        self.state().rooms.watch(room)
    }

    /// Snapshot of active peers for the status endpoint
    pub fn active_peers(&self) -> Vec<PeerSummary> {
        self.state().registry.summaries()
    }

    pub fn peer_count(&self) -> usize {
        self.state().registry.len()
    }

    /// Run the eviction sweep on the configured interval until shutdown
    pub fn spawn_sweeper(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let relay = self.clone();
        tokio::spawn(async move {
            let mut ticker = time::interval(relay.config.sweep_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = relay.sweep(Instant::now());
                        if !evicted.is_empty() {
                            info!("Sweep evicted {} peer(s): {:?}", evicted.len(), evicted);
                        }
                    }
                    _ = stopped(&mut shutdown) => {
                        debug!("Eviction sweeper stopping");
                        break;
                    }
                }
            }
        })
    }

    fn broadcast_roster(state: &RelayState) {
        for record in state.registry.iter() {
            let roster = Message::Peers(PeersPayload {
                peers: state.registry.roster_for(&record.id),
            });
            if let Err(e) = record.session.send(&roster) {
                warn!("Roster update to {} failed: {}", record.id, e);
            }
        }
    }
}
