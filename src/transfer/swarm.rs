use async_trait::async_trait;
use log::{debug, info, warn};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;

use super::coordinator::TransferCoordinator;
use crate::error::TransferError;
use crate::protocol::{FileMeta, FileTorrent, Message};

/// A seeded transfer, identified by its locator
#[derive(Debug, Clone, PartialEq)]
pub struct SwarmTransfer {
    pub locator: String,
    pub total_size: u64,
    pub meta: Vec<FileMeta>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SwarmEvent {
    /// Descriptors of the files in the swarm, always first
    Metadata(Vec<FileMeta>),
    Progress { received: u64, total: u64 },
    Completed { files: Vec<PathBuf> },
}

/// External swarm transport. Peers only ever exchange its locator.
#[async_trait]
pub trait SwarmTransport: Send + Sync {
    /// Start seeding `files`
    async fn seed(&self, files: &[PathBuf]) -> anyhow::Result<SwarmTransfer>;

    /// Join the swarm behind `locator`
    async fn join(&self, locator: &str) -> anyhow::Result<mpsc::Receiver<SwarmEvent>>;
}

/// A joined swarm whose metadata has arrived
#[derive(Debug)]
pub struct SwarmDownload {
    pub meta: Vec<FileMeta>,
    pub events: mpsc::Receiver<SwarmEvent>,
}

impl SwarmDownload {
    /// Follow progress until the swarm reports completion
    pub async fn completed(mut self) -> Result<Vec<PathBuf>, TransferError> {
        while let Some(event) = self.events.recv().await {
            match event {
                SwarmEvent::Progress { received, total } => {
                    debug!("Swarm progress {}/{}", received, total);
                }
                SwarmEvent::Completed { files } => return Ok(files),
                SwarmEvent::Metadata(_) => {}
            }
        }
        Err(TransferError::TransportUnavailable(
            "swarm closed before completion".to_string(),
        ))
    }
}

impl TransferCoordinator {
    /// Seed `paths` and build the `FILE_TORRENT` announcing them
    pub async fn create_swarm_transfer<S: SwarmTransport + ?Sized>(
        &self,
        swarm: &S,
        paths: &[PathBuf],
    ) -> Result<(SwarmTransfer, Message), TransferError> {
        let mut total = 0u64;
        for path in paths {
            total = total.saturating_add(tokio::fs::metadata(path).await?.len());
        }
        let limit = self.limits().swarm_max_bytes;
        if total > limit {
            return Err(TransferError::OversizeTransfer { size: total, limit });
        }

        let transfer = swarm
            .seed(paths)
            .await
            .map_err(|e| TransferError::TransportUnavailable(e.to_string()))?;
        info!(
            "Seeding {} file(s), {} bytes as {}",
            transfer.meta.len(),
            transfer.total_size,
            transfer.locator
        );

        let torrent = FileTorrent {
            info_hash: transfer.locator.clone(),
            sender: self.local_name().to_string(),
            size: transfer.total_size,
            meta: transfer.meta.clone(),
        };
        Ok((transfer, Message::FileTorrent(torrent)))
    }

    /// Join the swarm behind `torrent`, waiting up to `wait` for its metadata
    pub async fn join_swarm_transfer<S: SwarmTransport + ?Sized>(
        &self,
        swarm: &S,
        torrent: &FileTorrent,
        wait: Duration,
    ) -> Result<SwarmDownload, TransferError> {
        let limit = self.limits().swarm_max_bytes;
        if torrent.size > limit {
            return Err(TransferError::OversizeTransfer {
                size: torrent.size,
                limit,
            });
        }

        let joining = async {
            let mut events = swarm
                .join(&torrent.info_hash)
                .await
                .map_err(|e| TransferError::TransportUnavailable(e.to_string()))?;
            loop {
                match events.recv().await {
                    Some(SwarmEvent::Metadata(meta)) => return Ok(SwarmDownload { meta, events }),
                    Some(other) => warn!("Swarm event before metadata: {:?}", other),
                    None => {
                        return Err(TransferError::TransportUnavailable(
                            "swarm closed before metadata".to_string(),
                        ))
                    }
                }
            }
        };

        match tokio::time::timeout(wait, joining).await {
            Ok(result) => result,
            Err(_) => Err(TransferError::TransportUnavailable(format!(
                "no metadata for {} within {:?}",
                torrent.info_hash, wait
            ))),
        }
    }
}
