//! Merge engine contract.
//!
//! The engine owns document state and all merge decisions. It sees the relay
//! only through [`RelayEvent`]s and [`PeerRelay::send`], and persists through
//! the [`StorageAdapter`]. A session host starts at most one engine.

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::sync::mpsc;

use crate::protocol::{DataMessage, Frame};
use crate::relay::{PeerRelay, RelayEvent};
use crate::storage::StorageAdapter;

/// Everything an engine gets when it starts.
pub struct EngineContext {
    pub relay: PeerRelay,
    pub storage: StorageAdapter,
    pub events: mpsc::UnboundedReceiver<RelayEvent>,
}

/// A merge engine driven by relay events.
pub trait MergeEngine: Send + 'static {
    /// Run until the event stream ends or the relay closes.
    fn run(self: Box<Self>, ctx: EngineContext) -> BoxFuture<'static, ()>;
}

/// Engine with no document state: routes peer-to-peer data messages.
///
/// Targeted messages go to their target. Untargeted ones are fanned out
/// to every other joined peer. Messages addressed to the relay itself
/// are dropped, since there is no document state to apply them to.
#[derive(Debug, Default)]
pub struct ForwardingEngine;

impl ForwardingEngine {
    async fn forward(relay: &PeerRelay, frame: Frame) {
        let msg = match frame {
            Frame::Data(msg) => msg,
            other => {
                log::debug!("Ignoring {} frame from {}", other.kind(), other.sender_id());
                return;
            }
        };

        let own_id = relay.identity().map(|i| &i.peer_id);
        if msg.target_id.is_some() && msg.target_id.as_ref() == own_id {
            log::debug!("Dropping {} addressed to relay", msg.message_type);
            return;
        }

        if msg.target_id.is_some() {
            if let Err(e) = relay.send(&Frame::Data(msg)).await {
                log::error!("Forward failed: {e}");
            }
            return;
        }

        for peer in relay.joined_peers().await {
            if peer == msg.sender_id {
                continue;
            }
            let copy = DataMessage {
                target_id: Some(peer),
                ..msg.clone()
            };
            if let Err(e) = relay.send(&Frame::Data(copy)).await {
                log::error!("Fan-out failed: {e}");
            }
        }
    }
}

impl MergeEngine for ForwardingEngine {
    fn run(self: Box<Self>, mut ctx: EngineContext) -> BoxFuture<'static, ()> {
        async move {
            while let Some(event) = ctx.events.recv().await {
                match event {
                    RelayEvent::PeerCandidate {
                        peer_id,
                        peer_metadata,
                    } => {
                        log::info!(
                            "Peer {peer_id} available (ephemeral: {})",
                            peer_metadata.is_ephemeral
                        );
                    }
                    RelayEvent::PeerDisconnected { peer_id } => {
                        log::info!("Peer {peer_id} disconnected");
                    }
                    RelayEvent::Message(frame) => Self::forward(&ctx.relay, frame).await,
                    RelayEvent::Closed => break,
                }
            }
            log::info!("Forwarding engine stopped");
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PeerMetadata;
    use crate::transport::{ChannelTransport, ConnectionId, Outbound};
    use std::sync::Arc;
    use tokio::sync::mpsc::UnboundedReceiver;

    async fn joined(relay: &PeerRelay, peer: &str) -> UnboundedReceiver<Outbound> {
        let (transport, mut rx) = ChannelTransport::open();
        let id = ConnectionId::new();
        relay.register(id, Arc::new(transport)).await.unwrap();
        relay
            .on_frame(id, &Frame::join(peer, None).encode().unwrap())
            .await;
        let _ = rx.try_recv(); // peer reply
        rx
    }

    fn frames(rx: &mut UnboundedReceiver<Outbound>) -> Vec<Frame> {
        let mut out = Vec::new();
        while let Ok(Outbound::Binary(bytes)) = rx.try_recv() {
            out.push(Frame::decode(&bytes).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_targeted_message_forwarded() {
        let (relay, _events) = PeerRelay::new();
        relay.bind("relay".into(), PeerMetadata::default()).await.unwrap();
        let mut a = joined(&relay, "A").await;
        let mut b = joined(&relay, "B").await;

        let frame = Frame::data("sync", "A", Some("B".into()), vec![1]);
        ForwardingEngine::forward(&relay, frame.clone()).await;

        assert_eq!(frames(&mut b), vec![frame]);
        assert!(frames(&mut a).is_empty());
    }

    #[tokio::test]
    async fn test_untargeted_fans_out_to_others() {
        let (relay, _events) = PeerRelay::new();
        relay.bind("relay".into(), PeerMetadata::default()).await.unwrap();
        let mut a = joined(&relay, "A").await;
        let mut b = joined(&relay, "B").await;
        let mut c = joined(&relay, "C").await;

        ForwardingEngine::forward(&relay, Frame::data("ephemeral", "A", None, vec![9])).await;

        assert!(frames(&mut a).is_empty());
        let to_b = frames(&mut b);
        let to_c = frames(&mut c);
        assert_eq!(to_b.len(), 1);
        assert_eq!(to_c.len(), 1);
        assert_eq!(to_b[0].target_id(), Some(&"B".into()));
        assert_eq!(to_c[0].target_id(), Some(&"C".into()));
    }

    #[tokio::test]
    async fn test_message_to_relay_dropped() {
        let (relay, _events) = PeerRelay::new();
        relay.bind("relay".into(), PeerMetadata::default()).await.unwrap();
        let mut a = joined(&relay, "A").await;

        ForwardingEngine::forward(&relay, Frame::data("sync", "A", Some("relay".into()), vec![])).await;
        assert!(frames(&mut a).is_empty());
    }

    #[tokio::test]
    async fn test_engine_stops_on_close() {
        let (relay, events) = PeerRelay::new();
        let ctx = EngineContext {
            relay: relay.clone(),
            storage: StorageAdapter::in_memory(),
            events,
        };
        let task = tokio::spawn(Box::new(ForwardingEngine).run(ctx));

        relay.disconnect().await;
        tokio::time::timeout(std::time::Duration::from_secs(1), task)
            .await
            .expect("engine should stop")
            .unwrap();
    }
}
