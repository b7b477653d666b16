//! WebSocket client that speaks the relay handshake.
//!
//! Provides:
//! - Join/peer handshake with a bounded wait
//! - Frame send/receive over background reader and writer tasks
//! - Close with an explicit status code
//!
//! Used by the integration tests and by tooling that needs to talk to a
//! running relay.

use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};

use crate::protocol::{Frame, PeerId, PeerMetadata, ProtocolError};

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("No peer reply within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("Connection closed")]
    Closed,
}

/// The remote side as announced in its peer reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePeer {
    pub peer_id: PeerId,
    pub peer_metadata: Option<PeerMetadata>,
    pub protocol_version: String,
}

/// A joined connection to a relay.
pub struct RelayClient {
    peer_id: PeerId,
    remote: RemotePeer,
    /// Channel to the WebSocket writer task
    outgoing: mpsc::UnboundedSender<Message>,
    /// Frames decoded by the reader task
    incoming: mpsc::UnboundedReceiver<Frame>,
}

impl RelayClient {
    /// Connect to `url`, send a join as `peer_id`, and wait up to `timeout`
    /// for the relay's peer reply.
    pub async fn connect(
        url: &str,
        peer_id: impl Into<PeerId>,
        peer_metadata: Option<PeerMetadata>,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        let peer_id = peer_id.into();
        let (ws_stream, _) = tokio_tungstenite::connect_async(url).await?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (outgoing, mut out_rx) = mpsc::unbounded_channel::<Message>();
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if ws_writer.send(msg).await.is_err() || closing {
                    break;
                }
            }
        });

        // Reader task: decode frames until the socket goes away
        let (frames_tx, mut incoming) = mpsc::unbounded_channel::<Frame>();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => match Frame::decode(&data) {
                        Ok(frame) => {
                            if frames_tx.send(frame).is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("Discarding undecodable frame from relay: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
        });

        let join = Frame::join(peer_id.clone(), peer_metadata).encode()?;
        outgoing
            .send(Message::Binary(join.into()))
            .map_err(|_| ClientError::Closed)?;

        let remote = tokio::time::timeout(timeout, Self::await_peer(&mut incoming))
            .await
            .map_err(|_| ClientError::HandshakeTimeout(timeout))??;
        log::debug!("{peer_id} joined relay {}", remote.peer_id);

        Ok(Self {
            peer_id,
            remote,
            outgoing,
            incoming,
        })
    }

    async fn await_peer(
        incoming: &mut mpsc::UnboundedReceiver<Frame>,
    ) -> Result<RemotePeer, ClientError> {
        loop {
            match incoming.recv().await {
                Some(Frame::Peer {
                    sender_id,
                    peer_metadata,
                    selected_protocol_version,
                    ..
                }) => {
                    return Ok(RemotePeer {
                        peer_id: sender_id,
                        peer_metadata,
                        protocol_version: selected_protocol_version,
                    })
                }
                Some(other) => log::debug!("Ignoring {} frame before handshake", other.kind()),
                None => return Err(ClientError::Closed),
            }
        }
    }

    /// Our own peer id.
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// The relay as it identified itself.
    pub fn remote(&self) -> &RemotePeer {
        &self.remote
    }

    /// Encode and send a frame.
    pub fn send(&self, frame: &Frame) -> Result<(), ClientError> {
        self.send_raw(frame.encode()?)
    }

    /// Send bytes as a binary message without encoding them.
    pub fn send_raw(&self, bytes: Vec<u8>) -> Result<(), ClientError> {
        self.outgoing
            .send(Message::Binary(bytes.into()))
            .map_err(|_| ClientError::Closed)
    }

    /// Next frame from the relay, or `None` once the connection ended.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.incoming.recv().await
    }

    /// Like [`recv`](Self::recv), but gives up after `limit`.
    pub async fn recv_timeout(&mut self, limit: Duration) -> Option<Frame> {
        tokio::time::timeout(limit, self.incoming.recv())
            .await
            .ok()
            .flatten()
    }

    /// Close the connection with a status code and reason.
    pub fn close(&self, code: u16, reason: &str) -> Result<(), ClientError> {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        };
        self.outgoing
            .send(Message::Close(Some(frame)))
            .map_err(|_| ClientError::Closed)
    }
}
