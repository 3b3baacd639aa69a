use log::{debug, info, warn};
use std::collections::HashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::session::SessionHandle;
use crate::protocol::{Frame, Message, PeerLeft, RoomMember, RoomPeers};

/// Push channel receiving a full roster on every membership change
pub type RoomWatcher = mpsc::UnboundedReceiver<RoomPeers>;

/// A session as seen by a room
#[derive(Debug, Clone)]
pub struct RoomSocket {
    pub handle: SessionHandle,
    pub name: String,
    pub peer_id: String,
}

impl RoomSocket {
    pub fn new(handle: SessionHandle, name: impl Into<String>, peer_id: impl Into<String>) -> Self {
        Self {
            handle,
            name: name.into(),
            peer_id: peer_id.into(),
        }
    }

    fn id(&self) -> Uuid {
        self.handle.id()
    }
}

/// Named group of sessions with one logical sender
pub struct Room {
    name: String,
    members: Vec<RoomSocket>,
    sender: Option<String>,
    watchers: Vec<mpsc::UnboundedSender<RoomPeers>>,
}

impl Room {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            members: Vec::new(),
            sender: None,
            watchers: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, session_id: Uuid) -> bool {
        self.members.iter().any(|m| m.id() == session_id)
    }

    pub fn members(&self) -> &[RoomSocket] {
        &self.members
    }

    pub fn has_watchers(&self) -> bool {
        !self.watchers.is_empty()
    }

    /// Add a session; adding an existing member changes nothing
    pub fn add_socket(&mut self, socket: RoomSocket) -> bool {
        if self.contains(socket.id()) {
            debug!("Room {}: {} is already a member", self.name, socket.name);
            return false;
        }

        info!("Room {}: {} joined", self.name, socket.name);
        self.members.push(socket);
        self.notify_watchers();
        true
    }

    /// Remove a session and tell the remaining members who left
    pub fn remove_socket(&mut self, session_id: Uuid) -> Option<RoomSocket> {
        let Some(pos) = self.members.iter().position(|m| m.id() == session_id) else {
            debug!("Room {}: session {} is not a member", self.name, session_id);
            return None;
        };

        let departed = self.members.remove(pos);
        info!("Room {}: {} left", self.name, departed.name);

        if !self.members.is_empty() {
            let notice = Message::PeerLeft(PeerLeft {
                name: departed.name.clone(),
            });
            match notice.to_frame() {
                Ok(frame) => {
                    for member in self.members.iter().filter(|m| m.name != departed.name) {
                        if let Err(e) = member.handle.send_frame(frame.clone()) {
                            warn!("Room {}: could not notify {}: {}", self.name, member.name, e);
                        }
                    }
                }
                Err(e) => warn!("Room {}: could not encode departure notice: {}", self.name, e),
            }
        }

        self.notify_watchers();
        Some(departed)
    }

    /// Replace a member's name and peer id in place; false if not a member
    pub fn update_socket(&mut self, socket: RoomSocket) -> bool {
        let Some(member) = self.members.iter_mut().find(|m| m.id() == socket.id()) else {
            return false;
        };
        if member.name == socket.name && member.peer_id == socket.peer_id {
            return true;
        }

        debug!("Room {}: {} is now {}", self.name, member.name, socket.name);
        *member = socket;
        self.notify_watchers();
        true
    }

    /// Track the sender by name; last write wins
    pub fn set_sender(&mut self, name: impl Into<String>) {
        self.sender = Some(name.into());
    }

    pub fn clear_sender(&mut self) {
        self.sender = None;
    }

    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    /// The member currently holding the sender role
    pub fn sender_socket(&self) -> Option<&RoomSocket> {
        let sender = self.sender.as_deref()?;
        self.members.iter().find(|m| m.name == sender)
    }

    /// Register a watcher; it immediately receives the current roster
    pub fn watch(&mut self) -> RoomWatcher {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(self.snapshot());
        self.watchers.push(tx);
        rx
    }

    pub fn snapshot(&self) -> RoomPeers {
        RoomPeers {
            room: self.name.clone(),
            peers: self
                .members
                .iter()
                .map(|m| RoomMember {
                    name: m.name.clone(),
                    peer_id: m.peer_id.clone(),
                })
                .collect(),
        }
    }

    /// Send an encoded frame to every member except `except`; returns deliveries
    pub fn broadcast_frame(&self, frame: &Frame, except: Option<Uuid>) -> usize {
        let mut delivered = 0;
        for member in &self.members {
            if Some(member.id()) == except {
                continue;
            }
            match member.handle.send_frame(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => warn!("Room {}: send to {} failed: {}", self.name, member.name, e),
            }
        }
        delivered
    }

    fn notify_watchers(&mut self) {
        let snapshot = self.snapshot();
        self.watchers.retain(|w| w.send(snapshot.clone()).is_ok());
    }
}

/// Rooms by name, created on demand
#[derive(Default)]
pub struct RoomManager {
    rooms: HashMap<String, Room>,
}

impl RoomManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Room> {
        self.rooms.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Room> {
        self.rooms.get_mut(name)
    }

    pub fn get_or_create(&mut self, name: &str) -> &mut Room {
        self.rooms
            .entry(name.to_string())
            .or_insert_with(|| Room::new(name))
    }

    /// Name of the room a session is in
    pub fn room_of(&self, session_id: Uuid) -> Option<&str> {
        self.rooms
            .values()
            .find(|room| room.contains(session_id))
            .map(Room::name)
    }

    pub fn room_of_mut(&mut self, session_id: Uuid) -> Option<&mut Room> {
        self.rooms.values_mut().find(|room| room.contains(session_id))
    }

    /// Remove a session from every room it belongs to
    pub fn remove_everywhere(&mut self, session_id: Uuid) -> Vec<RoomSocket> {
        let removed = self
            .rooms
            .values_mut()
            .filter_map(|room| room.remove_socket(session_id))
            .collect();
        self.prune();
        removed
    }

    /// Remove a session from one room
    pub fn leave(&mut self, name: &str, session_id: Uuid) -> Option<RoomSocket> {
        let removed = self.rooms.get_mut(name)?.remove_socket(session_id);
        self.prune();
        removed
    }

    pub fn watch(&mut self, name: &str) -> RoomWatcher {
        self.get_or_create(name).watch()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.rooms.keys().cloned().collect();
        names.sort();
        names
    }

    fn prune(&mut self) {
        self.rooms.retain(|_, room| !room.is_empty() || room.has_watchers());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::networking::session::PeerSession;

    fn socket(name: &str) -> (RoomSocket, PeerSession, mpsc::UnboundedReceiver<Frame>) {
        let (session, rx) = PeerSession::channel(None);
        (
            RoomSocket::new(session.handle(), name, format!("peer-{}", name)),
            session,
            rx,
        )
    }

    #[test]
    fn test_add_and_remove_are_idempotent() {
        let mut room = Room::new("lobby");
        let (alice, alice_session, _ra) = socket("alice");

        assert!(room.add_socket(alice.clone()));
        assert!(!room.add_socket(alice));
        assert_eq!(room.len(), 1);

        assert!(room.remove_socket(alice_session.id()).is_some());
        assert!(room.remove_socket(alice_session.id()).is_none());
        assert!(room.is_empty());
    }

    #[test]
    fn test_departure_notifies_remaining_members() {
        let mut room = Room::new("lobby");
        let (alice, alice_session, mut alice_rx) = socket("alice");
        let (bob, _bob_session, mut bob_rx) = socket("bob");
        room.add_socket(alice);
        room.add_socket(bob);

        room.remove_socket(alice_session.id());

        let frame = bob_rx.try_recv().unwrap();
        assert_eq!(
            frame,
            Message::PeerLeft(PeerLeft { name: "alice".into() })
                .to_frame()
                .unwrap()
        );
        assert!(alice_rx.try_recv().is_err());
    }

    #[test]
    fn test_watchers_receive_full_snapshots() {
        let mut room = Room::new("lobby");
        let mut watcher = room.watch();
        assert!(watcher.try_recv().unwrap().peers.is_empty());

        let (alice, alice_session, _ra) = socket("alice");
        let (bob, _bob_session, _rb) = socket("bob");
        room.add_socket(alice);
        room.add_socket(bob);
        room.remove_socket(alice_session.id());

        let names = |snap: RoomPeers| snap.peers.into_iter().map(|p| p.name).collect::<Vec<_>>();
        assert_eq!(names(watcher.try_recv().unwrap()), vec!["alice"]);
        assert_eq!(names(watcher.try_recv().unwrap()), vec!["alice", "bob"]);
        assert_eq!(names(watcher.try_recv().unwrap()), vec!["bob"]);
        assert!(watcher.try_recv().is_err());
    }

    #[test]
    fn test_update_renames_member_in_place() {
        let mut room = Room::new("lobby");
        let (alice, alice_session, mut alice_rx) = socket("alice");
        let (bob, _bob_session, mut bob_rx) = socket("bob");
        room.add_socket(alice);
        room.add_socket(bob);
        let mut watcher = room.watch();
        watcher.try_recv().unwrap();

        let renamed = RoomSocket::new(alice_session.handle(), "alicia", "peer-alicia");
        assert!(room.update_socket(renamed.clone()));
        // Unchanged identity is a no-op
        assert!(room.update_socket(renamed));

        assert!(bob_rx.try_recv().is_err());
        assert!(alice_rx.try_recv().is_err());
        let snap = watcher.try_recv().unwrap();
        let names: Vec<_> = snap.peers.into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["alicia", "bob"]);
        assert!(watcher.try_recv().is_err());

        let (carol, _carol_session, _rc) = socket("carol");
        assert!(!room.update_socket(carol));
        assert_eq!(room.len(), 2);
    }

    #[test]
    fn test_sender_is_last_write_wins_and_sticky() {
        let mut room = Room::new("lobby");
        let (alice, alice_session, _ra) = socket("alice");
        let (bob, _bob_session, _rb) = socket("bob");
        room.add_socket(alice);
        room.add_socket(bob);

        room.set_sender("alice");
        room.set_sender("bob");
        assert_eq!(room.sender_socket().unwrap().name, "bob");

        room.set_sender("alice");
        room.remove_socket(alice_session.id());
        // Not cleared on departure, just unresolvable
        assert_eq!(room.sender(), Some("alice"));
        assert!(room.sender_socket().is_none());

        room.clear_sender();
        assert_eq!(room.sender(), None);
    }

    #[test]
    fn test_broadcast_skips_origin() {
        let mut room = Room::new("lobby");
        let (alice, alice_session, mut alice_rx) = socket("alice");
        let (bob, _bob_session, mut bob_rx) = socket("bob");
        room.add_socket(alice);
        room.add_socket(bob);

        let delivered = room.broadcast_frame(&Frame::Binary(vec![7]), Some(alice_session.id()));
        assert_eq!(delivered, 1);
        assert_eq!(bob_rx.try_recv().unwrap(), Frame::Binary(vec![7]));
        assert!(alice_rx.try_recv().is_err());
    }

    #[test]
    fn test_manager_prunes_empty_rooms() {
        let mut rooms = RoomManager::new();
        let (alice, alice_session, _ra) = socket("alice");
        rooms.get_or_create("games").add_socket(alice);

        assert_eq!(rooms.room_of(alice_session.id()), Some("games"));
        assert_eq!(rooms.remove_everywhere(alice_session.id()).len(), 1);
        assert!(rooms.get("games").is_none());

        let _watcher = rooms.watch("kept");
        rooms.prune();
        assert_eq!(rooms.names(), vec!["kept"]);
    }
}
