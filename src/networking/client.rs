use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use super::session::{PeerSession, SessionHandle};
use crate::error::SendError;
use crate::protocol::{Frame, Message};

/// One client connection to the relay.
///
/// Owns the connection's [`PeerSession`]; there is no shared global client,
/// callers construct one per connection and tear it down with [`RelayClient::close`].
pub struct RelayClient {
    handle: SessionHandle,
    reader: Option<JoinHandle<()>>,
}

impl RelayClient {
    /// Connect to `url` and install handlers with `configure` before any frame is read
    pub async fn connect<F>(url: &str, configure: F) -> Result<Self>
    where
        F: FnOnce(&mut PeerSession),
    {
        let (stream, _response) = connect_async(url)
            .await
            .with_context(|| format!("Failed to connect to relay at {}", url))?;
        info!("Connected to relay at {}", url);

        let (mut sink, mut source) = stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();

        let mut session = PeerSession::new(None, tx);
        configure(&mut session);
        let handle = session.handle();

        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let message = match frame {
                    Frame::Text(text) => WsMessage::Text(text),
                    Frame::Binary(bytes) => WsMessage::Binary(bytes),
                    Frame::Close => {
                        let _ = sink.send(WsMessage::Close(None)).await;
                        break;
                    }
                };
                if let Err(e) = sink.send(message).await {
                    warn!("Relay write failed: {}", e);
                    break;
                }
            }
        });

        let reader = tokio::spawn(async move {
            while let Some(item) = source.next().await {
                match item {
                    Ok(WsMessage::Text(text)) => session.dispatch(Frame::Text(text)),
                    Ok(WsMessage::Binary(bytes)) => session.dispatch(Frame::Binary(bytes)),
                    Ok(WsMessage::Close(frame)) => {
                        debug!("Relay closed the connection: {:?}", frame);
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Relay read failed: {}", e);
                        break;
                    }
                }
            }
            writer.abort();
            // Dropping the session drops its handlers
            drop(session);
        });

        Ok(Self {
            handle,
            reader: Some(reader),
        })
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    pub fn send(&self, message: &Message) -> Result<(), SendError> {
        self.handle.send(message)
    }

    /// Resolve once the connection is gone
    pub async fn closed(&mut self) {
        if let Some(reader) = self.reader.as_mut() {
            let _ = reader.await;
            self.reader = None;
        }
    }

    /// Close the socket and wait for the reader to finish
    pub async fn close(mut self) {
        self.handle.close();
        self.closed().await;
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}
