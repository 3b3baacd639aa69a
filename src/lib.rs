//! LAN peer relay: a WebSocket relay that keeps a roster of peers, groups
//! them into rooms and forwards chunked, flow-controlled file transfers
//! between them.

pub mod config;
pub mod error;
pub mod networking;
pub mod protocol;
pub mod transfer;

pub use config::{DiscoveryConfig, RelayConfig, TransferLimits};
pub use error::{ProtocolError, SendError, TransferError};
