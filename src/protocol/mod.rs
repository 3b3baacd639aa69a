pub mod messages;

pub use messages::{
    AppMessage, EventKind, FileAnnounce, FileInit, FileMeta, FileStatus, FileTorrent, Frame,
    HeartbeatPayload, JoinPayload, Message, PeerLeft, PeerSummary, PeersPayload, RelayEnvelope,
    RoomMember, RoomPeers, RoomRequest,
};
