use thiserror::Error;

/// Failures decoding a frame received from a peer connection
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    MalformedMessage(#[from] serde_json::Error),

    #[error("unknown event `{0}`")]
    UnknownEvent(String),

    #[error("chunk payloads travel as binary frames only")]
    ChunkAsText,
}

/// Failures surfaced to the caller of a transfer operation
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("transfer of {size} bytes exceeds the {limit} byte ceiling")]
    OversizeTransfer { size: u64, limit: u64 },

    #[error("swarm transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("every receiving peer went away before the transfer finished")]
    PeerGone,

    #[error("relay link closed")]
    LinkClosed,

    #[error("invalid transfer state: {0}")]
    InvalidState(&'static str),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Failures writing a message to a session's outbound channel
#[derive(Debug, Error)]
pub enum SendError {
    #[error(transparent)]
    Encode(#[from] ProtocolError),

    #[error("connection closed")]
    Closed,
}

impl From<SendError> for TransferError {
    fn from(err: SendError) -> Self {
        match err {
            SendError::Encode(e) => TransferError::Protocol(e),
            SendError::Closed => TransferError::LinkClosed,
        }
    }
}
