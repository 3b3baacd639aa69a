pub mod client;
pub mod discovery;
pub mod interface;
pub mod registry;
pub mod relay;
pub mod room;
pub mod server;
pub mod session;

// Re-export key components for easier access
pub use client::RelayClient;
pub use discovery::{DiscoveredPeer, DiscoveryAgent, PeerCache};
pub use interface::{InterfaceKind, LanAddress};
pub use registry::{PeerRecord, PeerRegistry};
pub use relay::RelayServer;
pub use room::{Room, RoomManager, RoomSocket, RoomWatcher};
pub use server::{router, start_relay_server, IpResponse, RunningRelay, StatusResponse};
pub use session::{PeerSession, SessionHandle};
