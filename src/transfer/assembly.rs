use log::{debug, info, warn};
use sha2::{Digest, Sha256};

use super::{permille_to_fraction, reached, FIRST_THRESHOLD, THRESHOLD_STEP};
use crate::protocol::{FileAnnounce, FileMeta, FileStatus};

/// Lifecycle of a transfer we are receiving
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncomingState {
    AwaitingInit,
    Receiving,
    Assembled,
}

/// A fully received transfer
#[derive(Debug, Clone)]
pub struct ReceivedTransfer {
    pub sender: String,
    pub meta: Vec<FileMeta>,
    /// Every chunk concatenated in arrival order
    pub data: Vec<u8>,
    /// Hex SHA-256 of `data`
    pub sha256: String,
}

impl ReceivedTransfer {
    /// Split the artifact back into the declared files
    pub fn files(&self) -> Vec<(&FileMeta, &[u8])> {
        let mut offset = 0usize;
        self.meta
            .iter()
            .map(|meta| {
                let start = offset.min(self.data.len());
                let end = start
                    .saturating_add(usize::try_from(meta.size).unwrap_or(usize::MAX))
                    .min(self.data.len());
                offset = end;
                (meta, &self.data[start..end])
            })
            .collect()
    }
}

/// Receiver side of one chunked transfer
#[derive(Debug)]
pub struct IncomingTransfer {
    local_peer: String,
    sender: String,
    meta: Vec<FileMeta>,
    total_size: u64,
    bytes_received: u64,
    next_ack: u32,
    chunks: Vec<Vec<u8>>,
    state: IncomingState,
}

impl IncomingTransfer {
    /// `local_peer` is the id reported in our `FILE_STATUS` acks
    pub fn new(local_peer: impl Into<String>) -> Self {
        Self {
            local_peer: local_peer.into(),
            sender: String::new(),
            meta: Vec::new(),
            total_size: 0,
            bytes_received: 0,
            next_ack: FIRST_THRESHOLD,
            chunks: Vec::new(),
            state: IncomingState::AwaitingInit,
        }
    }

    pub fn state(&self) -> IncomingState {
        self.state
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub fn progress(&self) -> f64 {
        if self.total_size == 0 {
            1.0
        } else {
            self.bytes_received as f64 / self.total_size as f64
        }
    }

    /// Start (or restart) receiving the announced transfer
    pub fn on_init(&mut self, announce: FileAnnounce) {
        if self.state == IncomingState::Receiving {
            warn!(
                "New transfer from {} replaces unfinished one from {} at {}/{} bytes",
                announce.sender, self.sender, self.bytes_received, self.total_size
            );
        }
        info!(
            "Receiving {} bytes in {} file(s) from {}",
            announce.size,
            announce.meta.len(),
            announce.sender
        );

        self.sender = announce.sender;
        self.meta = announce.meta;
        self.total_size = announce.size;
        self.bytes_received = 0;
        self.next_ack = FIRST_THRESHOLD;
        self.chunks.clear();
        self.state = IncomingState::Receiving;
    }

    /// Buffer a chunk; returns the ack to send when a threshold was crossed
    pub fn on_chunk(&mut self, chunk: Vec<u8>) -> Option<FileStatus> {
        if self.state != IncomingState::Receiving {
            warn!("Dropping {}-byte chunk outside of a transfer", chunk.len());
            return None;
        }

        self.bytes_received += chunk.len() as u64;
        self.chunks.push(chunk);

        if self.total_size == 0 {
            return None;
        }

        let mut crossed = false;
        while reached(self.bytes_received, self.total_size, self.next_ack) {
            self.next_ack += THRESHOLD_STEP;
            crossed = true;
        }

        if !crossed {
            return None;
        }

        debug!(
            "Received {}/{} bytes, granting window {}",
            self.bytes_received, self.total_size, self.next_ack
        );
        Some(FileStatus {
            progress: permille_to_fraction(self.next_ack),
            peer: self.local_peer.clone(),
        })
    }

    /// Assemble on the end marker; yields the artifact exactly once
    pub fn on_end(&mut self) -> Option<ReceivedTransfer> {
        if self.state != IncomingState::Receiving {
            debug!("Ignoring end marker in state {:?}", self.state);
            return None;
        }
        if self.bytes_received != self.total_size {
            warn!(
                "Transfer from {} ended at {} of {} announced bytes",
                self.sender, self.bytes_received, self.total_size
            );
        }

        self.state = IncomingState::Assembled;
        let data = std::mem::take(&mut self.chunks).concat();
        let sha256 = format!("{:x}", Sha256::digest(&data));
        info!(
            "Transfer from {} assembled: {} bytes, sha256 {}",
            self.sender,
            data.len(),
            sha256
        );

        Some(ReceivedTransfer {
            sender: self.sender.clone(),
            meta: self.meta.clone(),
            data,
            sha256,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn announce(sizes: &[u64]) -> FileAnnounce {
        FileAnnounce {
            sender: "Alice".into(),
            size: sizes.iter().sum(),
            meta: sizes
                .iter()
                .enumerate()
                .map(|(i, s)| FileMeta::new(format!("f{}", i), *s))
                .collect(),
        }
    }

    #[test]
    fn test_chunks_before_init_are_dropped() {
        let mut incoming = IncomingTransfer::new("b1");
        assert!(incoming.on_chunk(vec![1, 2, 3]).is_none());
        assert!(incoming.on_end().is_none());
        assert_eq!(incoming.state(), IncomingState::AwaitingInit);
    }

    #[test]
    fn test_large_chunk_crosses_several_thresholds() {
        let mut incoming = IncomingTransfer::new("b1");
        incoming.on_init(announce(&[1000]));

        // 560 bytes crosses 250, 400 and 550 at once
        let status = incoming.on_chunk(vec![0; 560]).unwrap();
        assert_eq!(status.progress, 0.7);

        let status = incoming.on_chunk(vec![0; 440]).unwrap();
        assert_eq!(status.progress, 1.15);
        assert_eq!(incoming.progress(), 1.0);
    }

    #[test]
    fn test_assembly_preserves_order_and_splits_files() {
        let mut incoming = IncomingTransfer::new("b1");
        incoming.on_init(announce(&[3, 2]));
        incoming.on_chunk(b"ab".to_vec());
        incoming.on_chunk(b"cd".to_vec());
        incoming.on_chunk(b"e".to_vec());

        let received = incoming.on_end().unwrap();
        assert_eq!(received.data, b"abcde");
        assert_eq!(
            received.sha256,
            format!("{:x}", Sha256::digest(b"abcde"))
        );

        let files = received.files();
        assert_eq!(files[0].1, b"abc");
        assert_eq!(files[1].1, b"de");

        assert!(incoming.on_end().is_none());
        assert_eq!(incoming.state(), IncomingState::Assembled);
    }

    #[test]
    fn test_single_byte_transfer() {
        let mut incoming = IncomingTransfer::new("b1");
        incoming.on_init(announce(&[1]));
        let status = incoming.on_chunk(vec![42]).unwrap();
        assert_eq!(status.progress, 1.15);
        assert_eq!(incoming.on_end().unwrap().data, vec![42]);
    }

    #[test]
    fn test_reinit_starts_over() {
        let mut incoming = IncomingTransfer::new("b1");
        incoming.on_init(announce(&[10]));
        incoming.on_chunk(vec![1; 5]);
        incoming.on_init(announce(&[2]));
        incoming.on_chunk(vec![9, 9]);
        assert_eq!(incoming.on_end().unwrap().data, vec![9, 9]);
    }
}
