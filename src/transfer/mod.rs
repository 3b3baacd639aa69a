//! Chunked relay transfers and the swarm transport boundary.
//!
//! Receivers acknowledge progress at permille thresholds 250, 400, 550, ...
//! and every `FILE_STATUS` they send carries the next threshold they are
//! ready for. Senders stream while their own progress is below the window
//! granted by all expected receivers.

pub mod assembly;
pub mod coordinator;
pub mod swarm;
pub mod window;

pub use assembly::{IncomingState, IncomingTransfer, ReceivedTransfer};
pub use coordinator::{OutgoingFile, TransferCoordinator, TransferLink, TransferReport};
pub use swarm::{SwarmDownload, SwarmEvent, SwarmTransfer, SwarmTransport};
pub use window::{AckWindow, OutgoingState, OutgoingTransfer};

/// First receiver threshold, in permille of the total size
pub const FIRST_THRESHOLD: u32 = 250;
/// Distance between successive thresholds, in permille
pub const THRESHOLD_STEP: u32 = 150;

pub(crate) fn permille_to_fraction(permille: u32) -> f64 {
    f64::from(permille) / 1000.0
}

pub(crate) fn fraction_to_permille(fraction: f64) -> Option<u32> {
    if !fraction.is_finite() || fraction < 0.0 {
        return None;
    }
    Some((fraction * 1000.0).round().min(f64::from(u32::MAX)) as u32)
}

/// `done / total >= permille / 1000` without floating point
pub(crate) fn reached(done: u64, total: u64, permille: u32) -> bool {
    u128::from(done) * 1000 >= u128::from(total) * u128::from(permille)
}
