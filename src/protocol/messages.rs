use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::ProtocolError;

/// A single frame on a peer connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// JSON `{event, data}` envelope
    Text(String),
    /// Raw chunk bytes
    Binary(Vec<u8>),
    /// Ask the connection task to close the socket
    Close,
}

/// Discriminant of every message the relay understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Join,
    Heartbeat,
    Peers,
    Message,
    FileInit,
    Chunk,
    FileStatus,
    FileTorrent,
    RoomJoin,
    RoomLeave,
    RoomPeers,
    PeerLeft,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Join => "JOIN",
            Self::Heartbeat => "HEARTBEAT",
            Self::Peers => "PEERS",
            Self::Message => "MESSAGE",
            Self::FileInit => "FILE_INIT",
            Self::Chunk => "CHUNK",
            Self::FileStatus => "FILE_STATUS",
            Self::FileTorrent => "FILE_TORRENT",
            Self::RoomJoin => "ROOM_JOIN",
            Self::RoomLeave => "ROOM_LEAVE",
            Self::RoomPeers => "ROOM_PEERS",
            Self::PeerLeft => "PEER_LEFT",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        serde_json::from_value(Value::String(name.to_string())).ok()
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinPayload {
    pub user_id: String,
    pub user_name: String,
    pub peer_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPayload {
    pub user_id: String,
    pub peer_id: String,
}

/// One roster row as seen by other peers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSummary {
    pub id: String,
    pub name: String,
    pub peer_id: String,
    /// Epoch milliseconds
    pub last_seen: i64,
    #[serde(default)]
    pub avatar: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeersPayload {
    pub peers: Vec<PeerSummary>,
}

/// Application payload carried by a `MESSAGE` envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayEnvelope {
    pub user_id: String,
    pub peer_id: String,
    pub message: AppMessage,
}

/// Per-file metadata declared up front by a sender
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    pub name: String,
    pub size: u64,
    #[serde(rename = "type", default)]
    pub mime: String,
}

impl FileMeta {
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
            mime: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileAnnounce {
    pub sender: String,
    /// Sum of every declared file length
    pub size: u64,
    pub meta: Vec<FileMeta>,
}

/// `FILE_INIT` either opens a transfer or closes it with `{end: true}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FileInit {
    End { end: bool },
    Announce(FileAnnounce),
}

impl FileInit {
    pub fn end() -> Self {
        Self::End { end: true }
    }

    pub fn is_end(&self) -> bool {
        matches!(self, Self::End { end: true })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileStatus {
    /// Fraction of the transfer the receiver is ready for
    pub progress: f64,
    pub peer: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileTorrent {
    pub info_hash: String,
    pub sender: String,
    pub size: u64,
    pub meta: Vec<FileMeta>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomRequest {
    pub room: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomMember {
    pub name: String,
    pub peer_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomPeers {
    pub room: String,
    pub peers: Vec<RoomMember>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerLeft {
    pub name: String,
}

/// Every message exchanged over a peer connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    Join(JoinPayload),
    Heartbeat(HeartbeatPayload),
    Peers(PeersPayload),
    Message(RelayEnvelope),
    FileInit(FileInit),
    FileStatus(FileStatus),
    FileTorrent(FileTorrent),
    RoomJoin(RoomRequest),
    RoomLeave(RoomRequest),
    RoomPeers(RoomPeers),
    PeerLeft(PeerLeft),
    /// Carried as a binary frame, never inside a JSON envelope
    #[serde(skip)]
    Chunk(Vec<u8>),
}

#[derive(Deserialize)]
struct RawEnvelope {
    event: String,
}

impl Message {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Join(_) => EventKind::Join,
            Self::Heartbeat(_) => EventKind::Heartbeat,
            Self::Peers(_) => EventKind::Peers,
            Self::Message(_) => EventKind::Message,
            Self::FileInit(_) => EventKind::FileInit,
            Self::FileStatus(_) => EventKind::FileStatus,
            Self::FileTorrent(_) => EventKind::FileTorrent,
            Self::RoomJoin(_) => EventKind::RoomJoin,
            Self::RoomLeave(_) => EventKind::RoomLeave,
            Self::RoomPeers(_) => EventKind::RoomPeers,
            Self::PeerLeft(_) => EventKind::PeerLeft,
            Self::Chunk(_) => EventKind::Chunk,
        }
    }

    /// Encode for the wire: chunks as binary, everything else as a text envelope
    pub fn to_frame(&self) -> Result<Frame, ProtocolError> {
        match self {
            Self::Chunk(bytes) => Ok(Frame::Binary(bytes.clone())),
            other => Ok(Frame::Text(serde_json::to_string(other)?)),
        }
    }

    /// Consuming variant of [`Message::to_frame`] that avoids copying chunk bytes
    pub fn into_frame(self) -> Result<Frame, ProtocolError> {
        match self {
            Self::Chunk(bytes) => Ok(Frame::Binary(bytes)),
            other => other.to_frame(),
        }
    }

    /// Decode a text envelope
    pub fn from_text(text: &str) -> Result<Self, ProtocolError> {
        let raw: RawEnvelope = serde_json::from_str(text)?;
        match EventKind::from_name(&raw.event) {
            None => Err(ProtocolError::UnknownEvent(raw.event)),
            Some(EventKind::Chunk) => Err(ProtocolError::ChunkAsText),
            Some(_) => Ok(serde_json::from_str(text)?),
        }
    }
}
