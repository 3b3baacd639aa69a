use log::{debug, warn};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::SendError;
use crate::protocol::{EventKind, Frame, Message};

/// Sending half of a connection; frames are written by the connection task
pub type Outbound = mpsc::UnboundedSender<Frame>;

/// Callback invoked for one kind of incoming message
pub type Handler = Box<dyn FnMut(Message) + Send>;

/// Cloneable handle used to write to a session from anywhere
#[derive(Clone)]
pub struct SessionHandle {
    id: Uuid,
    outbound: Outbound,
}

impl SessionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Encode and queue a message; chunks go out as binary frames
    pub fn send(&self, message: &Message) -> Result<(), SendError> {
        self.send_frame(message.to_frame()?)
    }

    /// Queue an already-encoded frame
    pub fn send_frame(&self, frame: Frame) -> Result<(), SendError> {
        self.outbound.send(frame).map_err(|_| SendError::Closed)
    }

    /// Ask the connection task to close the socket
    pub fn close(&self) {
        let _ = self.outbound.send(Frame::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle").field("id", &self.id).finish()
    }
}

/// Wire-level demultiplexer for one connection.
///
/// Text frames are decoded into [`Message`]s and routed by [`EventKind`];
/// binary frames always go to the `CHUNK` handler. At most one handler is
/// registered per kind.
pub struct PeerSession {
    handle: SessionHandle,
    name: Option<String>,
    remote_addr: Option<SocketAddr>,
    handlers: HashMap<EventKind, Handler>,
}

impl PeerSession {
    pub fn new(remote_addr: Option<SocketAddr>, outbound: Outbound) -> Self {
        Self {
            handle: SessionHandle {
                id: Uuid::new_v4(),
                outbound,
            },
            name: None,
            remote_addr,
            handlers: HashMap::new(),
        }
    }

    /// Create a session together with the receiving end of its outbound queue
    pub fn channel(remote_addr: Option<SocketAddr>) -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(remote_addr, tx), rx)
    }

    pub fn id(&self) -> Uuid {
        self.handle.id
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = Some(name.into());
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Register the handler for `kind`, returning true if one was replaced
    pub fn on<F>(&mut self, kind: EventKind, handler: F) -> bool
    where
        F: FnMut(Message) + Send + 'static,
    {
        let replaced = self.handlers.insert(kind, Box::new(handler)).is_some();
        if replaced {
            debug!("Session {}: replaced handler for {}", self.handle.id, kind);
        }
        replaced
    }

    /// Drop the handler for `kind`, if any
    pub fn off(&mut self, kind: EventKind) {
        self.handlers.remove(&kind);
    }

    pub fn has_handler(&self, kind: EventKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    pub fn send(&self, message: &Message) -> Result<(), SendError> {
        self.handle.send(message)
    }

    /// Route one incoming frame to its handler. Undecodable frames are dropped.
    pub fn dispatch(&mut self, frame: Frame) {
        let message = match frame {
            Frame::Binary(bytes) => Message::Chunk(bytes),
            Frame::Text(text) => match Message::from_text(&text) {
                Ok(message) => message,
                Err(e) => {
                    warn!(
                        "Session {} ({}): dropping frame: {}",
                        self.handle.id,
                        self.describe_peer(),
                        e
                    );
                    return;
                }
            },
            Frame::Close => return,
        };

        let kind = message.kind();
        match self.handlers.get_mut(&kind) {
            Some(handler) => handler(message),
            None => debug!("Session {}: no handler for {}", self.handle.id, kind),
        }
    }

    fn describe_peer(&self) -> String {
        match (&self.name, self.remote_addr) {
            (Some(name), Some(addr)) => format!("{}@{}", name, addr),
            (Some(name), None) => name.clone(),
            (None, Some(addr)) => addr.to_string(),
            (None, None) => "unknown".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FileInit, FileStatus, HeartbeatPayload};
    use std::sync::{Arc, Mutex};

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&'static str) -> Handler) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        let make = move |tag: &'static str| -> Handler {
            let log = log.clone();
            Box::new(move |msg: Message| {
                log.lock().unwrap().push(format!("{}:{}", tag, msg.kind()));
            })
        };
        (seen, make)
    }

    #[test]
    fn test_text_and_binary_routing() {
        let (mut session, _rx) = PeerSession::channel(None);
        let (seen, make) = recorder();

        session.on(EventKind::Heartbeat, make("hb"));
        session.on(EventKind::Chunk, make("chunk"));

        session.dispatch(Frame::Text(
            r#"{"event":"HEARTBEAT","data":{"userId":"a1","peerId":"p"}}"#.to_string(),
        ));
        session.dispatch(Frame::Binary(vec![9, 9, 9]));

        assert_eq!(*seen.lock().unwrap(), vec!["hb:HEARTBEAT", "chunk:CHUNK"]);
    }

    #[test]
    fn test_registration_replaces_and_off_is_idempotent() {
        let (mut session, _rx) = PeerSession::channel(None);
        let (seen, make) = recorder();

        assert!(!session.on(EventKind::Heartbeat, make("first")));
        assert!(session.on(EventKind::Heartbeat, make("second")));

        let frame = Message::Heartbeat(HeartbeatPayload {
            user_id: "a1".into(),
            peer_id: "p".into(),
        })
        .to_frame()
        .unwrap();
        session.dispatch(frame.clone());
        assert_eq!(*seen.lock().unwrap(), vec!["second:HEARTBEAT"]);

        session.off(EventKind::Heartbeat);
        session.off(EventKind::Heartbeat);
        session.off(EventKind::Peers);
        assert!(!session.has_handler(EventKind::Heartbeat));

        session.dispatch(frame);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_malformed_frames_are_dropped() {
        let (mut session, _rx) = PeerSession::channel(None);
        let (seen, make) = recorder();
        session.on(EventKind::Heartbeat, make("hb"));

        session.dispatch(Frame::Text("{oops".to_string()));
        session.dispatch(Frame::Text(r#"{"event":"NOPE","data":null}"#.to_string()));
        session.dispatch(Frame::Text(r#"{"event":"HEARTBEAT","data":{}}"#.to_string()));

        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_send_writes_binary_for_chunks_only() {
        let (session, mut rx) = PeerSession::channel(None);

        session.send(&Message::Chunk(vec![1, 2])).unwrap();
        session.send(&Message::FileInit(FileInit::end())).unwrap();
        session
            .send(&Message::FileStatus(FileStatus {
                progress: 0.25,
                peer: "b1".into(),
            }))
            .unwrap();

        assert_eq!(rx.try_recv().unwrap(), Frame::Binary(vec![1, 2]));
        assert_eq!(
            rx.try_recv().unwrap(),
            Frame::Text(r#"{"event":"FILE_INIT","data":{"end":true}}"#.to_string())
        );
        assert!(matches!(rx.try_recv().unwrap(), Frame::Text(_)));
    }

    #[test]
    fn test_send_after_close_fails() {
        let (session, rx) = PeerSession::channel(None);
        drop(rx);
        assert!(matches!(
            session.send(&Message::Chunk(vec![0])),
            Err(SendError::Closed)
        ));
        assert!(session.handle().is_closed());
    }
}
