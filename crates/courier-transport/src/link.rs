//! The seam between the supervisor and a physical connection.
//!
//! A [`Link`] is a pair of channels. Whatever owns the socket holds the other
//! ends ([`LinkPeer`]) and pumps text frames across.

use async_trait::async_trait;
use courier_core::Result;
use tokio::sync::mpsc;

/// Something that happened on the connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkEvent {
    /// A text message (one frame or a heartbeat).
    Text(String),
    /// A transport-level pong.
    Pong,
    /// The peer closed the connection, with its reason if it gave one.
    Closed(Option<String>),
    /// The connection failed.
    Error(String),
}

/// Supervisor side of an open connection.
#[derive(Debug)]
pub struct Link {
    /// Frames to write. Closing every sender closes the connection.
    pub outbound: mpsc::Sender<String>,
    /// Everything read from the connection, in order.
    pub inbound: mpsc::Receiver<LinkEvent>,
}

/// Socket side of an open connection.
#[derive(Debug)]
pub struct LinkPeer {
    /// Frames the supervisor wants written.
    pub outbound: mpsc::Receiver<String>,
    /// Where to report what was read.
    pub inbound: mpsc::Sender<LinkEvent>,
}

impl Link {
    /// A connected pair with `capacity` slots in each direction.
    pub fn pair(capacity: usize) -> (Link, LinkPeer) {
        let (out_tx, out_rx) = mpsc::channel(capacity.max(1));
        let (in_tx, in_rx) = mpsc::channel(capacity.max(1));
        (
            Link {
                outbound: out_tx,
                inbound: in_rx,
            },
            LinkPeer {
                outbound: out_rx,
                inbound: in_tx,
            },
        )
    }
}

/// Opens physical connections.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a connection to `url`.
    ///
    /// Errors: `Rejected` when the endpoint refuses us outright, `Transport`
    /// for everything else.
    async fn connect(&self, url: &str) -> Result<Link>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pair_is_cross_wired() {
        let (mut link, mut peer) = Link::pair(4);

        link.outbound.send("SEND\n\n\0".into()).await.unwrap();
        assert_eq!(peer.outbound.recv().await.unwrap(), "SEND\n\n\0");

        peer.inbound.send(LinkEvent::Pong).await.unwrap();
        assert_eq!(link.inbound.recv().await.unwrap(), LinkEvent::Pong);
    }

    #[tokio::test]
    async fn dropping_peer_ends_inbound() {
        let (mut link, peer) = Link::pair(1);
        drop(peer);
        assert!(link.inbound.recv().await.is_none());
        assert!(link.outbound.send("x".into()).await.is_err());
    }
}
