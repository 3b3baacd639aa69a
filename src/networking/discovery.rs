use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use super::client::RelayClient;
use super::server::stopped;
use crate::config::DiscoveryConfig;
use crate::protocol::{
    AppMessage, EventKind, HeartbeatPayload, JoinPayload, Message, PeerSummary, PeersPayload,
    RelayEnvelope,
};

/// `MESSAGE` type used for self-announcements
pub const ANNOUNCE_TYPE: &str = "announce";

/// A peer known to the local agent
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredPeer {
    pub id: String,
    pub name: String,
    pub peer_id: String,
    pub avatar: Option<String>,
    pub seen_at: Instant,
}

/// Locally cached peer set, keyed by peer id
#[derive(Debug)]
pub struct PeerCache {
    local_id: String,
    peers: HashMap<String, DiscoveredPeer>,
}

impl PeerCache {
    pub fn new(local_id: impl Into<String>) -> Self {
        Self {
            local_id: local_id.into(),
            peers: HashMap::new(),
        }
    }

    /// Record that `peer` was heard from; returns true if it is new
    pub fn refresh(&mut self, peer: DiscoveredPeer) -> bool {
        if peer.id == self.local_id {
            return false;
        }
        let is_new = !self.peers.contains_key(&peer.id);
        if is_new {
            info!("Discovered peer: {} ({})", peer.name, peer.id);
        }
        self.peers.insert(peer.id.clone(), peer);
        is_new
    }

    /// Replace the cache with the relay's roster
    pub fn apply_roster(&mut self, roster: &[PeerSummary], now: Instant) {
        let mut next = HashMap::with_capacity(roster.len());
        for row in roster.iter().filter(|row| row.id != self.local_id) {
            next.insert(
                row.id.clone(),
                DiscoveredPeer {
                    id: row.id.clone(),
                    name: row.name.clone(),
                    peer_id: row.peer_id.clone(),
                    avatar: row.avatar.clone(),
                    seen_at: now,
                },
            );
        }
        for gone in self.peers.keys().filter(|id| !next.contains_key(*id)) {
            debug!("Peer {} left the roster", gone);
        }
        self.peers = next;
    }

    /// Drop peers not heard from within `stale_after`
    pub fn sweep(&mut self, now: Instant, stale_after: Duration) -> Vec<String> {
        let mut dropped = Vec::new();
        self.peers.retain(|id, peer| {
            let stale = now.saturating_duration_since(peer.seen_at) > stale_after;
            if stale {
                info!("Dropping stale peer: {} ({})", peer.name, id);
                dropped.push(id.clone());
            }
            !stale
        });
        dropped
    }

    /// Current peer set, ordered by id
    pub fn snapshot(&self) -> Vec<DiscoveredPeer> {
        let mut peers: Vec<DiscoveredPeer> = self.peers.values().cloned().collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

enum ConnectionEnd {
    Stopped,
    Lost,
}

/// Client-side membership liveness over a relay connection.
///
/// One task owns the connection loop, so at most one reconnect is ever
/// pending and attempts are spaced by the configured backoff.
pub struct DiscoveryAgent {
    url: String,
    identity: JoinPayload,
    config: DiscoveryConfig,
    cache: Mutex<PeerCache>,
    attempts: AtomicU64,
    snapshot: watch::Sender<Vec<DiscoveredPeer>>,
}

impl DiscoveryAgent {
    /// Create an agent that announces `identity` to the relay at `url`
    pub fn new(url: impl Into<String>, identity: JoinPayload, config: DiscoveryConfig) -> Self {
        let (snapshot, _) = watch::channel(Vec::new());
        Self {
            url: url.into(),
            cache: Mutex::new(PeerCache::new(identity.user_id.clone())),
            identity,
            config,
            attempts: AtomicU64::new(0),
            snapshot,
        }
    }

    /// Receive a fresh peer snapshot after every announce, sweep or roster
    pub fn subscribe(&self) -> watch::Receiver<Vec<DiscoveredPeer>> {
        self.snapshot.subscribe()
    }

    pub fn peers(&self) -> Vec<DiscoveredPeer> {
        self.snapshot.borrow().clone()
    }

    /// Connection attempts made so far, successful or not
    pub fn connect_attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Connect, announce and reconnect until `shutdown` flips to true
    pub fn start(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let agent = self.clone();
        tokio::spawn(async move {
            info!(
                "Starting discovery for {} ({}) via {}",
                agent.identity.user_name, agent.identity.user_id, agent.url
            );
            loop {
                match agent.run_connection(&mut shutdown).await {
                    Ok(ConnectionEnd::Stopped) => break,
                    Ok(ConnectionEnd::Lost) => warn!("Lost relay connection"),
                    Err(e) => warn!("Relay connection failed: {:#}", e),
                }

                debug!("Reconnecting in {:?}", agent.config.reconnect_backoff);
                tokio::select! {
                    _ = time::sleep(agent.config.reconnect_backoff) => {}
                    _ = stopped(&mut shutdown) => break,
                }
            }
            info!("Discovery stopped");
        })
    }

    async fn run_connection(&self, shutdown: &mut watch::Receiver<bool>) -> Result<ConnectionEnd> {
        if *shutdown.borrow() {
            return Ok(ConnectionEnd::Stopped);
        }

        self.attempts.fetch_add(1, Ordering::Relaxed);
        let (roster_tx, mut rosters) = mpsc::unbounded_channel::<PeersPayload>();
        let (announce_tx, mut announces) = mpsc::unbounded_channel::<RelayEnvelope>();

        let connected = RelayClient::connect(&self.url, |session| {
            session.on(EventKind::Peers, move |msg| {
                if let Message::Peers(roster) = msg {
                    let _ = roster_tx.send(roster);
                }
            });
            session.on(EventKind::Message, move |msg| {
                if let Message::Message(envelope) = msg {
                    if envelope.message.kind == ANNOUNCE_TYPE {
                        let _ = announce_tx.send(envelope);
                    }
                }
            });
        })
        .await;
        let mut client = connected?;

        client
            .send(&Message::Join(self.identity.clone()))
            .context("Failed to send JOIN")?;

        let mut ticker = time::interval(self.config.announce_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.announce(&client).context("Failed to announce")?;
                    self.update(|cache| {
                        cache.sweep(Instant::now(), self.config.stale_after());
                    });
                }
                Some(roster) = rosters.recv() => {
                    self.update(|cache| cache.apply_roster(&roster.peers, Instant::now()));
                }
                Some(envelope) = announces.recv() => {
                    let peer = announced_peer(&envelope);
                    self.update(|cache| {
                        cache.refresh(peer);
                    });
                }
                _ = client.closed() => return Ok(ConnectionEnd::Lost),
                _ = stopped(&mut *shutdown) => {
                    client.close().await;
                    return Ok(ConnectionEnd::Stopped);
                }
            }
        }
    }

    fn announce(&self, client: &RelayClient) -> Result<()> {
        client.send(&Message::Heartbeat(HeartbeatPayload {
            user_id: self.identity.user_id.clone(),
            peer_id: self.identity.peer_id.clone(),
        }))?;
        client.send(&Message::Message(RelayEnvelope {
            user_id: self.identity.user_id.clone(),
            peer_id: self.identity.peer_id.clone(),
            message: AppMessage {
                kind: ANNOUNCE_TYPE.to_string(),
                data: json!({
                    "name": self.identity.user_name,
                    "avatar": self.identity.avatar,
                }),
                recipient: None,
            },
        }))?;
        debug!("Announced {}", self.identity.user_id);
        Ok(())
    }

    /// Mutate the cache and publish the resulting snapshot
    fn update<F: FnOnce(&mut PeerCache)>(&self, f: F) {
        let snapshot = {
            let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut cache);
            cache.snapshot()
        };
        self.snapshot.send_replace(snapshot);
    }
}

fn announced_peer(envelope: &RelayEnvelope) -> DiscoveredPeer {
    let data = &envelope.message.data;
    DiscoveredPeer {
        id: envelope.user_id.clone(),
        name: data
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or(envelope.user_id.as_str())
            .to_string(),
        peer_id: envelope.peer_id.clone(),
        avatar: data
            .get("avatar")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        seen_at: Instant::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use crate::networking::server::start_relay_server;
    use std::net::{IpAddr, Ipv4Addr};

    fn peer(id: &str, seen_at: Instant) -> DiscoveredPeer {
        DiscoveredPeer {
            id: id.to_string(),
            name: id.to_uppercase(),
            peer_id: format!("p-{}", id),
            avatar: None,
            seen_at,
        }
    }

    fn identity(id: &str, name: &str) -> JoinPayload {
        JoinPayload {
            user_id: id.to_string(),
            user_name: name.to_string(),
            peer_id: format!("p-{}", id),
            avatar: None,
        }
    }

    #[test]
    fn test_cache_refresh_and_sweep() {
        let start = Instant::now();
        let mut cache = PeerCache::new("me");

        assert!(!cache.refresh(peer("me", start)));
        assert!(cache.refresh(peer("a", start)));
        assert!(cache.refresh(peer("b", start)));
        assert!(!cache.refresh(peer("b", start + Duration::from_secs(10))));

        // Exactly at the limit is still fresh
        let dropped = cache.sweep(start + Duration::from_secs(15), Duration::from_secs(15));
        assert!(dropped.is_empty());

        let dropped = cache.sweep(start + Duration::from_secs(16), Duration::from_secs(15));
        assert_eq!(dropped, vec!["a".to_string()]);
        let ids: Vec<String> = cache.snapshot().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["b".to_string()]);
    }

    #[test]
    fn test_roster_replaces_cache() {
        let now = Instant::now();
        let mut cache = PeerCache::new("me");
        cache.refresh(peer("old", now));

        let row = |id: &str| PeerSummary {
            id: id.to_string(),
            name: id.to_string(),
            peer_id: format!("p-{}", id),
            last_seen: 0,
            avatar: None,
        };
        cache.apply_roster(&[row("z"), row("me"), row("a")], now);

        let ids: Vec<String> = cache.snapshot().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["a".to_string(), "z".to_string()]);
        assert_eq!(cache.len(), 2);
    }

    fn fast() -> DiscoveryConfig {
        DiscoveryConfig {
            announce_interval: Duration::from_millis(50),
            stale_multiplier: 3,
            reconnect_backoff: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn test_agents_discover_each_other() -> Result<()> {
        let _ = env_logger::builder().is_test(true).try_init();
        let (stop_tx, stop_rx) = watch::channel(false);
        let relay = start_relay_server(
            RelayConfig {
                bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
                port: 0,
                ..RelayConfig::default()
            },
            stop_rx,
        )
        .await?;

        let alice = Arc::new(DiscoveryAgent::new(relay.url(), identity("a1", "Alice"), fast()));
        let bob = Arc::new(DiscoveryAgent::new(relay.url(), identity("b1", "Bob"), fast()));
        let (agents_stop, agents_rx) = watch::channel(false);
        let (bob_stop, bob_rx) = watch::channel(false);
        let alice_task = alice.start(agents_rx);
        let bob_task = bob.start(bob_rx);

        let mut view = alice.subscribe();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if view.borrow_and_update().iter().any(|p| p.id == "b1") {
                    break;
                }
                if view.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .context("Alice never saw Bob")?;
        let bob_seen = alice.peers().into_iter().find(|p| p.id == "b1").context("b1")?;
        assert_eq!(bob_seen.name, "Bob");
        assert!(bob.peers().iter().all(|p| p.id != "b1"));

        // Bob leaves: the relay roster removes him from Alice's view
        bob_stop.send(true)?;
        bob_task.await?;
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if view.borrow_and_update().iter().all(|p| p.id != "b1") {
                    break;
                }
                if view.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .context("Bob never left Alice's view")?;

        agents_stop.send(true)?;
        alice_task.await?;
        stop_tx.send(true)?;
        relay.wait().await
    }

    #[tokio::test]
    async fn test_unreachable_relay_keeps_retrying() -> Result<()> {
        // Reserve a port and release it so nothing listens there
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        drop(listener);

        let agent = Arc::new(DiscoveryAgent::new(
            format!("ws://{}/relay", addr),
            identity("c1", "Carol"),
            fast(),
        ));
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = agent.start(stop_rx);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(agent.peers().is_empty());
        assert!(!task.is_finished());
        // Attempts are spaced by the 50ms backoff, never stacked
        let attempts = agent.connect_attempts();
        assert!((2..=6).contains(&attempts), "{} attempts", attempts);

        stop_tx.send(true)?;
        tokio::time::timeout(Duration::from_secs(5), task).await??;
        Ok(())
    }
}
