use log::{debug, info, warn};
use std::io::Cursor;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;

use super::assembly::{IncomingTransfer, ReceivedTransfer};
use super::window::OutgoingTransfer;
use crate::config::TransferLimits;
use crate::error::{SendError, TransferError};
use crate::networking::session::{PeerSession, SessionHandle};
use crate::protocol::{EventKind, FileInit, FileMeta, FileStatus, Message};

/// Anything transfer messages can be written to
pub trait TransferLink: Send + Sync {
    fn send_message(&self, message: Message) -> Result<(), SendError>;
}

impl TransferLink for SessionHandle {
    fn send_message(&self, message: Message) -> Result<(), SendError> {
        self.send_frame(message.into_frame()?)
    }
}

impl TransferLink for mpsc::UnboundedSender<Message> {
    fn send_message(&self, message: Message) -> Result<(), SendError> {
        self.send(message).map_err(|_| SendError::Closed)
    }
}

/// A file to stream, read at whatever granularity the reader yields
pub struct OutgoingFile {
    pub meta: FileMeta,
    reader: Box<dyn AsyncRead + Send + Unpin>,
}

impl OutgoingFile {
    pub fn from_reader(meta: FileMeta, reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self {
            meta,
            reader: Box::new(reader),
        }
    }

    pub fn from_bytes(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        let meta = FileMeta::new(name, bytes.len() as u64);
        Self::from_reader(meta, Cursor::new(bytes))
    }

    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, TransferError> {
        let path = path.as_ref();
        let file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or(TransferError::InvalidState("path has no file name"))?;

        Ok(Self::from_reader(FileMeta::new(name, size), file))
    }
}

/// Outcome of a completed send
#[derive(Debug, Clone)]
pub struct TransferReport {
    pub bytes_sent: u64,
    pub chunks: u64,
    /// Times the sender had to wait for the ack window
    pub pauses: u64,
    pub elapsed: Duration,
}

/// Drives chunked transfers and the swarm boundary for one local peer
#[derive(Debug, Clone)]
pub struct TransferCoordinator {
    local_name: String,
    local_peer: String,
    limits: TransferLimits,
}

impl TransferCoordinator {
    /// `local_name` is announced as the sender, `local_peer` is reported in acks
    pub fn new(
        local_name: impl Into<String>,
        local_peer: impl Into<String>,
        limits: TransferLimits,
    ) -> Self {
        Self {
            local_name: local_name.into(),
            local_peer: local_peer.into(),
            limits,
        }
    }

    pub fn local_name(&self) -> &str {
        &self.local_name
    }

    pub fn limits(&self) -> &TransferLimits {
        &self.limits
    }

    /// Validate files for the chunked transport without sending anything
    pub fn prepare(
        &self,
        files: &[OutgoingFile],
        expected_peers: usize,
    ) -> Result<OutgoingTransfer, TransferError> {
        let meta = files.iter().map(|f| f.meta.clone()).collect();
        OutgoingTransfer::new(
            self.local_name.clone(),
            meta,
            expected_peers,
            self.limits.chunked_max_bytes,
        )
    }

    /// Announce, stream and finish a transfer, pausing whenever the sender
    /// reaches the window acknowledged by `expected_peers` receivers
    pub async fn send_files<L: TransferLink + ?Sized>(
        &self,
        files: Vec<OutgoingFile>,
        expected_peers: usize,
        link: &L,
        acks: &mut mpsc::UnboundedReceiver<FileStatus>,
    ) -> Result<TransferReport, TransferError> {
        let mut transfer = self.prepare(&files, expected_peers)?;
        let started = Instant::now();

        // Leftover acks belong to an earlier transfer
        while acks.try_recv().is_ok() {}

        link.send_message(transfer.announce()?)?;

        let mut buffer = vec![0u8; self.limits.chunk_size.max(1)];
        let mut pauses = 0u64;

        for mut file in files {
            debug!("Streaming {} ({} bytes)", file.meta.name, file.meta.size);
            loop {
                let n = file.reader.read(&mut buffer).await?;
                if n == 0 {
                    break;
                }

                while let Ok(status) = acks.try_recv() {
                    transfer.on_status(&status);
                }
                if !transfer.may_send() {
                    pauses += 1;
                    debug!(
                        "Paused at {}/{} bytes, window {}",
                        transfer.bytes_sent(),
                        transfer.total_size(),
                        transfer.window().threshold_fraction()
                    );
                }
                while !transfer.may_send() {
                    let status = acks.recv().await.ok_or(TransferError::PeerGone)?;
                    transfer.on_status(&status);
                }

                link.send_message(Message::Chunk(buffer[..n].to_vec()))?;
                transfer.record_chunk(n);
            }
        }

        if transfer.bytes_sent() != transfer.total_size() {
            warn!(
                "Sources yielded {} bytes but {} were announced",
                transfer.bytes_sent(),
                transfer.total_size()
            );
        }
        link.send_message(transfer.finish()?)?;

        let report = TransferReport {
            bytes_sent: transfer.bytes_sent(),
            chunks: transfer.chunks_sent(),
            pauses,
            elapsed: started.elapsed(),
        };
        info!(
            "Sent {} bytes in {} chunks ({} pauses) in {:.2}s",
            report.bytes_sent,
            report.chunks,
            report.pauses,
            report.elapsed.as_secs_f32()
        );
        Ok(report)
    }

    /// Forward `FILE_STATUS` acks arriving on `session` to the returned channel
    pub fn install_ack_listener(session: &mut PeerSession) -> mpsc::UnboundedReceiver<FileStatus> {
        let (tx, rx) = mpsc::unbounded_channel();
        session.on(EventKind::FileStatus, move |msg| {
            if let Message::FileStatus(status) = msg {
                let _ = tx.send(status);
            }
        });
        rx
    }

    /// Receive transfers on `session`, acking thresholds back through it.
    /// Each assembled transfer is yielded once on the returned channel.
    pub fn install_receiver(
        &self,
        session: &mut PeerSession,
    ) -> mpsc::UnboundedReceiver<ReceivedTransfer> {
        let incoming = Arc::new(Mutex::new(IncomingTransfer::new(self.local_peer.clone())));
        let (done_tx, done_rx) = mpsc::unbounded_channel();

        let state = incoming.clone();
        session.on(EventKind::FileInit, move |msg| {
            let Message::FileInit(init) = msg else {
                return;
            };
            let mut incoming = state.lock().unwrap_or_else(PoisonError::into_inner);
            match init {
                FileInit::Announce(announce) => incoming.on_init(announce),
                end if end.is_end() => {
                    if let Some(received) = incoming.on_end() {
                        let _ = done_tx.send(received);
                    }
                }
                other => debug!("Ignoring FILE_INIT {:?}", other),
            }
        });

        let handle = session.handle();
        session.on(EventKind::Chunk, move |msg| {
            let Message::Chunk(bytes) = msg else {
                return;
            };
            let status = incoming
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .on_chunk(bytes);
            if let Some(status) = status {
                if let Err(e) = handle.send(&Message::FileStatus(status)) {
                    warn!("Failed to ack transfer progress: {}", e);
                }
            }
        });

        done_rx
    }
}
