//! WebSocket links via `tokio-tungstenite`.

use async_trait::async_trait;
use courier_core::{CourierError, Result};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace, warn};

use crate::config::TransportConfig;
use crate::link::{Connector, Link, LinkEvent, LinkPeer};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens real WebSocket connections.
#[derive(Clone, Debug)]
pub struct WsConnector {
    queue_capacity: usize,
    max_frame_size: usize,
}

impl WsConnector {
    /// Connector sized by `config`.
    pub fn new(config: &TransportConfig) -> Self {
        Self {
            queue_capacity: config.outbound_queue_capacity,
            max_frame_size: config.max_frame_size,
        }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Link> {
        let (socket, response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(classify_error)?;
        debug!(url, status = %response.status(), "websocket open");

        let (link, peer) = Link::pair(self.queue_capacity);
        let _ = tokio::spawn(pump(socket, peer, self.max_frame_size));
        Ok(link)
    }
}

fn classify_error(err: WsError) -> CourierError {
    match err {
        WsError::Http(response)
            if matches!(
                response.status(),
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
            ) =>
        {
            CourierError::Rejected(format!("upgrade refused with {}", response.status()))
        }
        WsError::Http(response) => {
            CourierError::Transport(format!("upgrade failed with {}", response.status()))
        }
        other => CourierError::Transport(other.to_string()),
    }
}

/// Own both halves of the socket until either side goes away.
async fn pump(socket: Socket, mut peer: LinkPeer, max_frame_size: usize) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let end = loop {
        tokio::select! {
            outgoing = peer.outbound.recv() => {
                let Some(text) = outgoing else {
                    // every sender dropped: the supervisor is done with us
                    let _ = ws_tx.send(WsMessage::Close(None)).await;
                    break None;
                };
                if let Err(e) = ws_tx.send(WsMessage::Text(text.into())).await {
                    break Some(LinkEvent::Error(e.to_string()));
                }
            }
            incoming = ws_rx.next() => {
                let event = match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        if text.len() > max_frame_size {
                            warn!(len = text.len(), max_frame_size, "dropping oversized frame");
                            continue;
                        }
                        LinkEvent::Text(text.as_str().to_owned())
                    }
                    Some(Ok(WsMessage::Pong(_))) => LinkEvent::Pong,
                    Some(Ok(WsMessage::Close(frame))) => {
                        break Some(LinkEvent::Closed(frame.map(|f| f.reason.as_str().to_owned())));
                    }
                    Some(Ok(other)) => {
                        trace!(kind = ?other, "ignoring non-text message");
                        continue;
                    }
                    Some(Err(e)) => break Some(LinkEvent::Error(e.to_string())),
                    None => break Some(LinkEvent::Closed(None)),
                };
                if peer.inbound.send(event).await.is_err() {
                    let _ = ws_tx.send(WsMessage::Close(None)).await;
                    break None;
                }
            }
        }
    };

    if let Some(event) = end {
        let _ = peer.inbound.send(event).await;
    }
    debug!("websocket pump finished");
}
