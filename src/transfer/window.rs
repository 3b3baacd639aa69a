use log::{debug, info, warn};
use std::collections::HashSet;

use super::{fraction_to_permille, permille_to_fraction, reached, FIRST_THRESHOLD};
use crate::error::TransferError;
use crate::protocol::{FileAnnounce, FileInit, FileMeta, FileStatus, Message};

/// Lifecycle of a transfer we are sending
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutgoingState {
    Idle,
    /// `FILE_INIT` sent
    Announced,
    /// Chunks flowing, gated by the ack window
    Streaming,
    /// `FILE_INIT {end}` sent
    Completed,
}

/// The progress window granted by receivers.
///
/// Acks are collected per threshold value. An ack carrying a value other
/// than the tracked one restarts the collection with just that peer, even if
/// it is a late ack for an older threshold. The window only moves forward.
#[derive(Debug, Clone)]
pub struct AckWindow {
    expected_peers: usize,
    tracked: Option<u32>,
    acked: HashSet<String>,
    threshold: u32,
}

impl AckWindow {
    pub fn new(expected_peers: usize) -> Self {
        Self {
            expected_peers,
            tracked: None,
            acked: HashSet::new(),
            // Without receivers to wait for the window is wide open
            threshold: if expected_peers == 0 {
                u32::MAX
            } else {
                FIRST_THRESHOLD
            },
        }
    }

    /// Current window in permille of the total size
    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn threshold_fraction(&self) -> f64 {
        permille_to_fraction(self.threshold)
    }

    /// Current window in bytes of a `total`-byte transfer
    pub fn threshold_bytes(&self, total: u64) -> u64 {
        let bytes = u128::from(total) * u128::from(self.threshold) / 1000;
        u64::try_from(bytes).unwrap_or(u64::MAX)
    }

    pub fn expected_peers(&self) -> usize {
        self.expected_peers
    }

    /// Peers that acknowledged the tracked threshold
    pub fn acked_peers(&self) -> usize {
        self.acked.len()
    }

    /// Record an ack; returns true if the window advanced
    pub fn on_status(&mut self, status: &FileStatus) -> bool {
        let Some(value) = fraction_to_permille(status.progress) else {
            warn!("Ignoring FILE_STATUS with progress {} from {}", status.progress, status.peer);
            return false;
        };

        if self.tracked != Some(value) {
            if !self.acked.is_empty() {
                debug!(
                    "Ack for {} from {} replaces {} pending ack(s) for {:?}",
                    value,
                    status.peer,
                    self.acked.len(),
                    self.tracked
                );
            }
            self.tracked = Some(value);
            self.acked.clear();
        }
        self.acked.insert(status.peer.clone());

        if self.acked.len() >= self.expected_peers && value > self.threshold {
            debug!("Ack window advanced {} -> {}", self.threshold, value);
            self.threshold = value;
            true
        } else {
            false
        }
    }
}

/// Sender side of one chunked transfer
#[derive(Debug)]
pub struct OutgoingTransfer {
    sender: String,
    meta: Vec<FileMeta>,
    total_size: u64,
    bytes_sent: u64,
    chunks_sent: u64,
    window: AckWindow,
    state: OutgoingState,
}

impl OutgoingTransfer {
    /// Validate a transfer against `ceiling`; nothing is created when it is too large
    pub fn new(
        sender: impl Into<String>,
        meta: Vec<FileMeta>,
        expected_peers: usize,
        ceiling: u64,
    ) -> Result<Self, TransferError> {
        let total_size = meta
            .iter()
            .fold(0u64, |acc, file| acc.saturating_add(file.size));
        if total_size > ceiling {
            return Err(TransferError::OversizeTransfer {
                size: total_size,
                limit: ceiling,
            });
        }

        Ok(Self {
            sender: sender.into(),
            meta,
            total_size,
            bytes_sent: 0,
            chunks_sent: 0,
            window: AckWindow::new(expected_peers),
            state: OutgoingState::Idle,
        })
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn chunks_sent(&self) -> u64 {
        self.chunks_sent
    }

    pub fn meta(&self) -> &[FileMeta] {
        &self.meta
    }

    pub fn window(&self) -> &AckWindow {
        &self.window
    }

    pub fn state(&self) -> OutgoingState {
        self.state
    }

    pub fn progress(&self) -> f64 {
        if self.total_size == 0 {
            1.0
        } else {
            self.bytes_sent as f64 / self.total_size as f64
        }
    }

    /// Produce the `FILE_INIT` announcement
    pub fn announce(&mut self) -> Result<Message, TransferError> {
        if self.state != OutgoingState::Idle {
            return Err(TransferError::InvalidState("transfer already announced"));
        }
        self.state = OutgoingState::Announced;
        info!(
            "Announcing {} bytes in {} file(s) from {}",
            self.total_size,
            self.meta.len(),
            self.sender
        );

        Ok(Message::FileInit(FileInit::Announce(FileAnnounce {
            sender: self.sender.clone(),
            size: self.total_size,
            meta: self.meta.clone(),
        })))
    }

    /// Whether the next chunk may go out. Checked once per chunk, so the
    /// sender can end up one chunk past the window.
    pub fn may_send(&self) -> bool {
        matches!(self.state, OutgoingState::Announced | OutgoingState::Streaming)
            && !reached(self.bytes_sent, self.total_size, self.window.threshold)
    }

    pub fn record_chunk(&mut self, len: usize) {
        self.state = OutgoingState::Streaming;
        self.bytes_sent += len as u64;
        self.chunks_sent += 1;
    }

    pub fn on_status(&mut self, status: &FileStatus) -> bool {
        self.window.on_status(status)
    }

    /// Produce the `FILE_INIT {end: true}` marker
    pub fn finish(&mut self) -> Result<Message, TransferError> {
        match self.state {
            OutgoingState::Announced | OutgoingState::Streaming => {
                self.state = OutgoingState::Completed;
                Ok(Message::FileInit(FileInit::end()))
            }
            OutgoingState::Idle => Err(TransferError::InvalidState("transfer never announced")),
            OutgoingState::Completed => Err(TransferError::InvalidState("transfer already ended")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(progress: f64, peer: &str) -> FileStatus {
        FileStatus {
            progress,
            peer: peer.to_string(),
        }
    }

    #[test]
    fn test_oversize_rejected_without_state() {
        let ceiling = 1000;
        let err = OutgoingTransfer::new("Alice", vec![FileMeta::new("big", ceiling + 1)], 1, ceiling)
            .unwrap_err();
        assert!(matches!(
            err,
            TransferError::OversizeTransfer { size: 1001, limit: 1000 }
        ));

        // Exactly at the ceiling is fine, as is a split across files
        assert!(OutgoingTransfer::new("Alice", vec![FileMeta::new("ok", ceiling)], 1, ceiling).is_ok());
        let split = vec![FileMeta::new("a", 600), FileMeta::new("b", 401)];
        assert!(OutgoingTransfer::new("Alice", split, 1, ceiling).is_err());
    }

    #[test]
    fn test_window_waits_for_every_expected_peer() {
        let mut window = AckWindow::new(2);
        assert_eq!(window.threshold(), 250);

        assert!(!window.on_status(&status(0.4, "b1")));
        assert_eq!(window.threshold(), 250);
        assert!(!window.on_status(&status(0.4, "b1")));
        assert!(window.on_status(&status(0.4, "c1")));
        assert_eq!(window.threshold(), 400);
    }

    #[test]
    fn test_divergent_ack_resets_collection() {
        let mut window = AckWindow::new(2);

        window.on_status(&status(0.55, "b1"));
        // c1 is still on the previous threshold: b1's ack is forgotten
        window.on_status(&status(0.4, "c1"));
        assert_eq!(window.acked_peers(), 1);
        window.on_status(&status(0.55, "c1"));
        assert_eq!(window.acked_peers(), 1);
        assert_eq!(window.threshold(), 250);

        assert!(window.on_status(&status(0.55, "b1")));
        assert_eq!(window.threshold(), 550);
    }

    #[test]
    fn test_window_is_monotonic() {
        let mut window = AckWindow::new(1);
        assert!(window.on_status(&status(0.7, "b1")));
        assert!(!window.on_status(&status(0.4, "b1")));
        assert_eq!(window.threshold(), 700);
        assert!(!window.on_status(&status(f64::NAN, "b1")));
        assert_eq!(window.threshold(), 700);
    }

    #[test]
    fn test_send_gate_and_state_machine() {
        let mut transfer =
            OutgoingTransfer::new("Alice", vec![FileMeta::new("a", 1000)], 1, 10_000).unwrap();
        assert!(!transfer.may_send());
        assert!(transfer.finish().is_err());

        transfer.announce().unwrap();
        assert!(transfer.announce().is_err());
        assert_eq!(transfer.state(), OutgoingState::Announced);

        transfer.record_chunk(200);
        assert!(transfer.may_send());
        transfer.record_chunk(100);
        // 300 bytes sent, window at 250: paused
        assert!(!transfer.may_send());
        assert_eq!(transfer.state(), OutgoingState::Streaming);

        transfer.on_status(&status(0.4, "b1"));
        assert!(transfer.may_send());

        assert_eq!(transfer.finish().unwrap(), Message::FileInit(FileInit::end()));
        assert!(!transfer.may_send());
        assert!(transfer.finish().is_err());
    }

    #[test]
    fn test_no_expected_peers_means_no_gate() {
        let mut transfer =
            OutgoingTransfer::new("Alice", vec![FileMeta::new("a", 10)], 0, 100).unwrap();
        transfer.announce().unwrap();
        transfer.record_chunk(10);
        assert!(transfer.may_send());
    }
}
