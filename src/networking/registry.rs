use chrono::{DateTime, Utc};
use log::{debug, info};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use super::session::SessionHandle;
use crate::protocol::{JoinPayload, PeerSummary};

/// A registered peer, keyed by its user id
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub id: String,
    pub display_name: String,
    pub peer_id: String,
    pub avatar: Option<String>,
    /// Wall-clock time of the last JOIN or HEARTBEAT, reported to clients
    pub last_seen_at: DateTime<Utc>,
    /// Monotonic twin of `last_seen_at`, used for eviction
    pub last_seen: Instant,
    pub remote_address: Option<SocketAddr>,
    pub session: SessionHandle,
}

impl PeerRecord {
    pub fn from_join(
        join: JoinPayload,
        session: SessionHandle,
        remote_address: Option<SocketAddr>,
        now: Instant,
    ) -> Self {
        Self {
            id: join.user_id,
            display_name: join.user_name,
            peer_id: join.peer_id,
            avatar: join.avatar,
            last_seen_at: Utc::now(),
            last_seen: now,
            remote_address,
            session,
        }
    }

    pub fn summary(&self) -> PeerSummary {
        PeerSummary {
            id: self.id.clone(),
            name: self.display_name.clone(),
            peer_id: self.peer_id.clone(),
            last_seen: self.last_seen_at.timestamp_millis(),
            avatar: self.avatar.clone(),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session.id()
    }
}

/// Registry of joined peers; ids are unique at all times
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: HashMap<String, PeerRecord>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a record, returning the one it superseded
    pub fn join(&mut self, record: PeerRecord) -> Option<PeerRecord> {
        let previous = self.peers.insert(record.id.clone(), record);
        if let Some(old) = &previous {
            info!("Peer {} re-joined, superseding session {}", old.id, old.session_id());
        }
        previous
    }

    /// Refresh liveness of a peer; false if the id is unknown
    pub fn touch(&mut self, id: &str, now: Instant) -> bool {
        match self.peers.get_mut(id) {
            Some(record) => {
                record.last_seen = now;
                record.last_seen_at = Utc::now();
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &str) -> Option<&PeerRecord> {
        self.peers.get(id)
    }

    /// The record currently owned by a connection
    pub fn by_session(&self, session_id: Uuid) -> Option<&PeerRecord> {
        self.peers.values().find(|r| r.session_id() == session_id)
    }

    /// Resolve a relay recipient; with duplicates the freshest record wins
    pub fn by_peer_id(&self, peer_id: &str) -> Option<&PeerRecord> {
        self.peers
            .values()
            .filter(|r| r.peer_id == peer_id)
            .max_by_key(|r| r.last_seen)
    }

    pub fn remove(&mut self, id: &str) -> Option<PeerRecord> {
        self.peers.remove(id)
    }

    /// Remove every record owned by a connection. Superseded connections own nothing.
    pub fn remove_session(&mut self, session_id: Uuid) -> Vec<PeerRecord> {
        let ids: Vec<String> = self
            .peers
            .values()
            .filter(|r| r.session_id() == session_id)
            .map(|r| r.id.clone())
            .collect();
        ids.iter().filter_map(|id| self.peers.remove(id)).collect()
    }

    /// Remove and return every peer silent for longer than `timeout`
    pub fn evict_expired(&mut self, now: Instant, timeout: Duration) -> Vec<PeerRecord> {
        let expired: Vec<String> = self
            .peers
            .values()
            .filter(|r| now.saturating_duration_since(r.last_seen) > timeout)
            .map(|r| r.id.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|id| {
                debug!("Peer {} exceeded the {:?} timeout", id, timeout);
                self.peers.remove(&id)
            })
            .collect()
    }

    /// Roster as seen by `viewer`: everyone except the viewer itself
    pub fn roster_for(&self, viewer: &str) -> Vec<PeerSummary> {
        let mut roster: Vec<PeerSummary> = self
            .peers
            .values()
            .filter(|r| r.id != viewer)
            .map(PeerRecord::summary)
            .collect();
        roster.sort_by(|a, b| a.id.cmp(&b.id));
        roster
    }

    /// Every registered peer
    pub fn summaries(&self) -> Vec<PeerSummary> {
        let mut all: Vec<PeerSummary> = self.peers.values().map(PeerRecord::summary).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerRecord> {
        self.peers.values()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::networking::session::PeerSession;

    fn join(id: &str, peer_id: &str) -> JoinPayload {
        JoinPayload {
            user_id: id.to_string(),
            user_name: format!("user-{}", id),
            peer_id: peer_id.to_string(),
            avatar: None,
        }
    }

    fn record(id: &str, peer_id: &str, now: Instant) -> (PeerRecord, PeerSession) {
        let (session, _rx) = PeerSession::channel(None);
        (
            PeerRecord::from_join(join(id, peer_id), session.handle(), None, now),
            session,
        )
    }

    #[test]
    fn test_rejoin_supersedes() {
        let now = Instant::now();
        let mut registry = PeerRegistry::new();

        let (first, first_session) = record("a1", "p-a", now);
        let (second, second_session) = record("a1", "p-a2", now);

        assert!(registry.join(first).is_none());
        let old = registry.join(second).unwrap();
        assert_eq!(old.session_id(), first_session.id());

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("a1").unwrap().peer_id, "p-a2");
        assert_eq!(registry.summaries().len(), 1);

        // The superseded connection no longer owns a record
        assert!(registry.remove_session(first_session.id()).is_empty());
        assert_eq!(registry.remove_session(second_session.id()).len(), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_disconnect_removes_every_record_of_a_connection() {
        let now = Instant::now();
        let mut registry = PeerRegistry::new();
        let (first, session) = record("x1", "p-x", now);
        let second = PeerRecord::from_join(join("a1", "p-a"), session.handle(), None, now);
        let (other, _so) = record("b1", "p-b", now);
        registry.join(first);
        registry.join(second);
        registry.join(other);

        let mut removed: Vec<String> = registry
            .remove_session(session.id())
            .into_iter()
            .map(|r| r.id)
            .collect();
        removed.sort();
        assert_eq!(removed, vec!["a1", "x1"]);
        assert_eq!(registry.len(), 1);
        assert!(registry.get("b1").is_some());
    }

    #[test]
    fn test_eviction_waits_for_full_timeout() {
        let start = Instant::now();
        let timeout = Duration::from_secs(30);
        let mut registry = PeerRegistry::new();
        let (a, _sa) = record("a1", "p-a", start);
        let (b, _sb) = record("b1", "p-b", start);
        registry.join(a);
        registry.join(b);

        registry.touch("b1", start + Duration::from_secs(20));

        // Exactly at the timeout nobody is evicted
        assert!(registry.evict_expired(start + timeout, timeout).is_empty());

        let evicted = registry.evict_expired(start + timeout + Duration::from_millis(1), timeout);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].id, "a1");

        // No double removal
        assert!(registry
            .evict_expired(start + timeout + Duration::from_millis(2), timeout)
            .is_empty());
        assert!(registry.get("b1").is_some());
    }

    #[test]
    fn test_roster_excludes_viewer() {
        let now = Instant::now();
        let mut registry = PeerRegistry::new();
        let (a, _sa) = record("a1", "p-a", now);
        let (b, _sb) = record("b1", "p-b", now);
        registry.join(a);
        registry.join(b);

        let ids: Vec<String> = registry.roster_for("b1").into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["a1"]);

        assert_eq!(registry.by_peer_id("p-b").unwrap().id, "b1");
        assert!(registry.by_peer_id("p-zz").is_none());
        assert!(!registry.touch("zz", now));
    }
}
