//! In-memory broker for tests and embedding.
//!
//! Each successful [`MockConnector::connect`] yields a [`MockSession`]: the
//! broker side of that connection, with helpers to answer the handshake,
//! push messages and inspect what the client wrote.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use courier_core::{CourierError, MessageEnvelope, Result, Topic};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::frame::{Command, Frame, HEARTBEAT};
use crate::link::{Connector, Link, LinkEvent, LinkPeer};

/// How long session helpers wait before giving up.
pub const MOCK_WAIT: Duration = Duration::from_secs(5);

/// Connector backed by in-process channels.
pub struct MockConnector {
    capacity: usize,
    connects: AtomicUsize,
    refusals: Mutex<VecDeque<CourierError>>,
    sessions_tx: mpsc::UnboundedSender<MockSession>,
    sessions_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MockSession>>,
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MockConnector {
    /// Connector whose links hold 64 frames each way.
    pub fn new() -> Self {
        Self::with_capacity(64)
    }

    /// Connector whose links hold `capacity` frames each way.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sessions_tx, sessions_rx) = mpsc::unbounded_channel();
        Self {
            capacity,
            connects: AtomicUsize::new(0),
            refusals: Mutex::new(VecDeque::new()),
            sessions_tx,
            sessions_rx: tokio::sync::Mutex::new(sessions_rx),
        }
    }

    /// Fail the next `connect` with `error`. Queued refusals apply in order.
    pub fn refuse_next(&self, error: CourierError) {
        self.refusals.lock().push_back(error);
    }

    /// `connect` calls so far, refused ones included.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// The next opened connection, waiting up to [`MOCK_WAIT`].
    pub async fn next_session(&self) -> Option<MockSession> {
        let mut rx = self.sessions_rx.lock().await;
        tokio::time::timeout(MOCK_WAIT, rx.recv()).await.ok().flatten()
    }

    /// A connection that was already opened, without waiting.
    pub async fn try_next_session(&self) -> Option<MockSession> {
        self.sessions_rx.lock().await.try_recv().ok()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, url: &str) -> Result<Link> {
        let _ = self.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.refusals.lock().pop_front() {
            return Err(error);
        }
        let (link, peer) = Link::pair(self.capacity);
        let session = MockSession {
            url: url.to_string(),
            peer,
            message_seq: 0,
        };
        self.sessions_tx
            .send(session)
            .map_err(|_| CourierError::Transport("mock broker gone".into()))?;
        Ok(link)
    }
}

/// Broker side of one mock connection.
pub struct MockSession {
    url: String,
    peer: LinkPeer,
    message_seq: u64,
}

impl MockSession {
    /// URL the client connected to.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Next frame the client wrote, skipping heartbeats. `None` if the
    /// client closed the link or nothing arrived within [`MOCK_WAIT`].
    pub async fn recv_frame(&mut self) -> Option<Frame> {
        loop {
            let text = tokio::time::timeout(MOCK_WAIT, self.peer.outbound.recv())
                .await
                .ok()
                .flatten()?;
            if let Ok(Some(frame)) = Frame::parse(&text) {
                return Some(frame);
            }
        }
    }

    /// Next raw text the client wrote, heartbeats included.
    pub async fn recv_raw(&mut self) -> Option<String> {
        tokio::time::timeout(MOCK_WAIT, self.peer.outbound.recv())
            .await
            .ok()
            .flatten()
    }

    /// Frames already written by the client, without waiting.
    pub fn drain_frames(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(text) = self.peer.outbound.try_recv() {
            if let Ok(Some(frame)) = Frame::parse(&text) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Wait for `CONNECT` and answer `CONNECTED` with heart-beating off.
    /// Returns the client's `CONNECT` frame.
    pub async fn accept(&mut self) -> Option<Frame> {
        self.accept_with_heartbeat(0, 0).await
    }

    /// Wait for `CONNECT` and answer `CONNECTED` advertising `sx,sy`.
    pub async fn accept_with_heartbeat(&mut self, sx: u64, sy: u64) -> Option<Frame> {
        let connect = self.recv_frame().await?;
        if connect.command != Command::Connect {
            return None;
        }
        let connected = Frame::new(Command::Connected)
            .header("version", "1.2")
            .header("heart-beat", format!("{sx},{sy}"));
        self.send_raw(connected.encode()).await.then_some(connect)
    }

    /// Wait for `CONNECT` and answer `ERROR`.
    pub async fn reject(&mut self, message: &str) -> Option<Frame> {
        let connect = self.recv_frame().await?;
        let error = Frame::new(Command::Error).header("message", message);
        self.send_raw(error.encode()).await.then_some(connect)
    }

    /// Push `envelope` as a `MESSAGE` on its recipient's topic.
    pub async fn deliver(&mut self, envelope: &MessageEnvelope) -> bool {
        let Ok(body) = envelope.to_json() else {
            return false;
        };
        let destination = Topic::for_recipient(&envelope.recipient_id).destination("/topic");
        self.deliver_body(&destination, &body).await
    }

    /// Push an arbitrary `MESSAGE` body.
    pub async fn deliver_body(&mut self, destination: &str, body: &str) -> bool {
        self.message_seq += 1;
        let frame = Frame::new(Command::Message)
            .header("destination", destination)
            .header("message-id", self.message_seq.to_string())
            .header("content-type", "application/json")
            .body(body);
        self.send_raw(frame.encode()).await
    }

    /// Send a heartbeat.
    pub async fn heartbeat(&self) -> bool {
        self.send_raw(HEARTBEAT).await
    }

    /// Send raw text as if read off the socket.
    pub async fn send_raw(&self, text: impl Into<String>) -> bool {
        self.peer
            .inbound
            .send(LinkEvent::Text(text.into()))
            .await
            .is_ok()
    }

    /// Report a transport failure to the client.
    pub async fn fail(&self, reason: &str) -> bool {
        self.peer
            .inbound
            .send(LinkEvent::Error(reason.to_string()))
            .await
            .is_ok()
    }

    /// Close the connection from the broker side.
    pub async fn close(self) {
        let _ = self
            .peer
            .inbound
            .send(LinkEvent::Closed(Some("broker closed".into())))
            .await;
    }

    /// Whether the client has dropped its end.
    pub fn is_closed_by_client(&self) -> bool {
        self.peer.inbound.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_yields_session() {
        let connector = MockConnector::new();
        let mut link = connector.connect("ws://mock/ws").await.unwrap();
        let mut session = connector.next_session().await.unwrap();
        assert_eq!(session.url(), "ws://mock/ws");
        assert_eq!(connector.connect_count(), 1);

        link.outbound
            .send(Frame::new(Command::Connect).encode())
            .await
            .unwrap();
        assert!(session.accept().await.is_some());

        match link.inbound.recv().await.unwrap() {
            LinkEvent::Text(text) => {
                let frame = Frame::parse(&text).unwrap().unwrap();
                assert_eq!(frame.command, Command::Connected);
                assert_eq!(frame.get("heart-beat"), Some("0,0"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn refusals_apply_in_order() {
        let connector = MockConnector::new();
        connector.refuse_next(CourierError::Transport("refused".into()));
        assert!(connector.connect("ws://mock").await.is_err());
        assert!(connector.connect("ws://mock").await.is_ok());
        assert_eq!(connector.connect_count(), 2);
    }

    #[tokio::test]
    async fn recv_frame_skips_heartbeats() {
        let connector = MockConnector::new();
        let link = connector.connect("ws://mock").await.unwrap();
        let mut session = connector.next_session().await.unwrap();
        link.outbound.send(HEARTBEAT.to_string()).await.unwrap();
        link.outbound
            .send(Frame::new(Command::Disconnect).encode())
            .await
            .unwrap();
        assert_eq!(
            session.recv_frame().await.unwrap().command,
            Command::Disconnect
        );
    }

    #[tokio::test]
    async fn deliver_targets_recipient_topic() {
        let connector = MockConnector::new();
        let mut link = connector.connect("ws://mock").await.unwrap();
        let mut session = connector.next_session().await.unwrap();
        assert!(session.deliver(&MessageEnvelope::text("U9", "U1", "hi")).await);

        let LinkEvent::Text(text) = link.inbound.recv().await.unwrap() else {
            panic!("expected text");
        };
        let frame = Frame::parse(&text).unwrap().unwrap();
        assert_eq!(frame.get("destination"), Some("/topic/messages/U1"));
        assert_eq!(frame.get("message-id"), Some("1"));
    }
}
