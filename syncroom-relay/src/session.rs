//! Session host: one room, one relay, one merge engine.
//!
//! ```text
//!  accept ──► ensure engine (once) ──► register transport ──► caller gets its side
//!
//!  transport events:
//!    message(bytes)       ──► PeerRelay::on_frame
//!    close(code, reason)  ──► PeerRelay::unregister, then close transport
//!    error(cause)         ──► log
//! ```
//!
//! The host owns its transports; the relay only holds references to them.
//! The merge engine is built lazily on the first connection and never
//! rebuilt, and the relay identity is bound at that moment.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::engine::{EngineContext, ForwardingEngine, MergeEngine};
use crate::protocol::{Frame, PeerId, PeerMetadata};
use crate::relay::{PeerRelay, RelayError, RelayEvent};
use crate::storage::StorageAdapter;
use crate::transport::{ChannelTransport, ConnectionId, Outbound, Transport};

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Identity the relay announces in its peer replies
    pub peer_id: PeerId,
    pub peer_metadata: PeerMetadata,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            peer_id: PeerId::new(format!("syncroom-{}", Uuid::new_v4().simple())),
            peer_metadata: PeerMetadata::default(),
        }
    }
}

impl SessionConfig {
    /// Config with a fixed relay id.
    pub fn for_testing(peer_id: &str) -> Self {
        Self {
            peer_id: peer_id.into(),
            peer_metadata: PeerMetadata::default(),
        }
    }
}

type EngineBuilder = Box<dyn FnOnce() -> Box<dyn MergeEngine> + Send>;

enum EngineSlot {
    Pending(EngineBuilder, mpsc::UnboundedReceiver<RelayEvent>),
    Running(JoinHandle<()>),
    Stopped,
}

/// How long `shutdown` waits for the engine to drain its events.
const ENGINE_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Host for a single logical room.
pub struct SessionHost {
    config: SessionConfig,
    relay: PeerRelay,
    storage: StorageAdapter,
    transports: RwLock<HashMap<ConnectionId, Arc<dyn Transport>>>,
    engine: Mutex<EngineSlot>,
}

impl SessionHost {
    /// Create a host whose engine is built by `build` on first connection.
    pub fn new<E, F>(config: SessionConfig, storage: StorageAdapter, build: F) -> Self
    where
        E: MergeEngine,
        F: FnOnce() -> E + Send + 'static,
    {
        let (relay, events) = PeerRelay::new();
        let builder: EngineBuilder = Box::new(move || Box::new(build()) as Box<dyn MergeEngine>);
        Self {
            config,
            relay,
            storage,
            transports: RwLock::new(HashMap::new()),
            engine: Mutex::new(EngineSlot::Pending(builder, events)),
        }
    }

    /// Host running the pass-through [`ForwardingEngine`].
    pub fn forwarding(config: SessionConfig, storage: StorageAdapter) -> Self {
        Self::new(config, storage, || ForwardingEngine)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn relay(&self) -> &PeerRelay {
        &self.relay
    }

    pub fn storage(&self) -> &StorageAdapter {
        &self.storage
    }

    pub async fn engine_started(&self) -> bool {
        matches!(*self.engine.lock().await, EngineSlot::Running(_))
    }

    /// Bind the relay identity and start the engine, once.
    async fn ensure_engine(&self) {
        let mut slot = self.engine.lock().await;
        match std::mem::replace(&mut *slot, EngineSlot::Stopped) {
            EngineSlot::Pending(build, events) => {
                if let Err(e) = self
                    .relay
                    .bind(self.config.peer_id.clone(), self.config.peer_metadata.clone())
                    .await
                {
                    log::warn!("Relay identity already bound: {e}");
                }
                let ctx = EngineContext {
                    relay: self.relay.clone(),
                    storage: self.storage.clone(),
                    events,
                };
                *slot = EngineSlot::Running(tokio::spawn(build().run(ctx)));
                log::info!("Merge engine started as {}", self.config.peer_id);
            }
            other => *slot = other,
        }
    }

    // ─── Connection events ────────────────────────────────────────────

    /// Accept a server-held transport into the session.
    pub async fn open_connection(
        &self,
        transport: Arc<dyn Transport>,
    ) -> Result<ConnectionId, RelayError> {
        self.ensure_engine().await;

        let id = ConnectionId::new();
        self.relay.register(id, transport.clone()).await?;
        self.transports.write().await.insert(id, transport);
        Ok(id)
    }

    /// Accept an in-process connection and hand back the client side.
    pub async fn open_local(&self) -> Result<LocalConnection, RelayError> {
        let (transport, outbound) = ChannelTransport::open();
        let transport = Arc::new(transport);
        let id = self.open_connection(transport.clone()).await?;
        Ok(LocalConnection {
            id,
            transport,
            outbound,
        })
    }

    pub async fn on_message(&self, id: ConnectionId, bytes: &[u8]) {
        self.relay.on_frame(id, bytes).await;
    }

    /// Remote side closed: drop the connection and close with the same status.
    pub async fn on_close(&self, id: ConnectionId, code: u16, reason: &str) {
        self.relay.unregister(id).await;
        let transport = self.transports.write().await.remove(&id);
        if let Some(transport) = transport {
            transport.close(code, reason);
        }
        log::info!("Connection {id} closed ({code} {reason})");
    }

    /// Transport error. A close event is expected to follow.
    pub fn on_error(&self, id: ConnectionId, cause: &dyn fmt::Display) {
        log::error!("Transport error on {id}: {cause}");
    }

    /// Disconnect every peer and wait for the engine to stop.
    /// The engine sees `RelayEvent::Closed`; no engine is started afterwards.
    pub async fn shutdown(&self) {
        self.relay.disconnect().await;
        self.transports.write().await.clear();

        let mut slot = self.engine.lock().await;
        if let EngineSlot::Running(handle) = std::mem::replace(&mut *slot, EngineSlot::Stopped) {
            match tokio::time::timeout(ENGINE_STOP_TIMEOUT, handle).await {
                Ok(Ok(())) => log::info!("Merge engine stopped"),
                Ok(Err(e)) => log::error!("Merge engine task failed: {e}"),
                Err(_) => log::warn!("Merge engine still running after {ENGINE_STOP_TIMEOUT:?}"),
            }
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.transports.read().await.len()
    }
}

/// Client side of an in-process connection.
pub struct LocalConnection {
    pub id: ConnectionId,
    transport: Arc<ChannelTransport>,
    outbound: mpsc::UnboundedReceiver<Outbound>,
}

impl LocalConnection {
    pub fn transport(&self) -> &Arc<ChannelTransport> {
        &self.transport
    }

    /// Next frame the relay wrote, or `None` once the transport closed.
    pub async fn recv_frame(&mut self) -> Option<Frame> {
        loop {
            match self.outbound.recv().await? {
                Outbound::Binary(bytes) => match Frame::decode(&bytes) {
                    Ok(frame) => return Some(frame),
                    Err(e) => log::warn!("Undecodable frame on {}: {e}", self.id),
                },
                Outbound::Close { .. } => return None,
            }
        }
    }

    /// Non-blocking variant of [`recv_frame`](Self::recv_frame).
    pub fn try_recv(&mut self) -> Option<Outbound> {
        self.outbound.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future::BoxFuture;
    use futures_util::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Engine that records every event it sees.
    struct RecordingEngine {
        seen: mpsc::UnboundedSender<RelayEvent>,
    }

    impl MergeEngine for RecordingEngine {
        fn run(self: Box<Self>, mut ctx: EngineContext) -> BoxFuture<'static, ()> {
            async move {
                while let Some(event) = ctx.events.recv().await {
                    let closed = event == RelayEvent::Closed;
                    let _ = self.seen.send(event);
                    if closed {
                        break;
                    }
                }
            }
            .boxed()
        }
    }

    fn recording_host() -> (SessionHost, mpsc::UnboundedReceiver<RelayEvent>) {
        let (seen, seen_rx) = mpsc::unbounded_channel();
        let host = SessionHost::new(SessionConfig::for_testing("host"), StorageAdapter::in_memory(), move || {
            RecordingEngine { seen }
        });
        (host, seen_rx)
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<RelayEvent>) -> RelayEvent {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("event in time")
            .expect("engine alive")
    }

    #[tokio::test]
    async fn test_engine_built_lazily_once() {
        let builds = Arc::new(AtomicUsize::new(0));
        let counter = builds.clone();
        let host = SessionHost::new(
            SessionConfig::default(),
            StorageAdapter::in_memory(),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                ForwardingEngine
            },
        );
        assert!(!host.engine_started().await);
        assert!(host.relay().identity().is_none());

        let _a = host.open_local().await.unwrap();
        let _b = host.open_local().await.unwrap();

        assert!(host.engine_started().await);
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert_eq!(host.relay().identity().unwrap().peer_id, host.config().peer_id);
    }

    #[tokio::test]
    async fn test_local_handshake_through_host() {
        let (host, mut seen) = recording_host();
        let mut conn = host.open_local().await.unwrap();

        let join = Frame::join("alice", None).encode().unwrap();
        host.on_message(conn.id, &join).await;

        let reply = conn.recv_frame().await.unwrap();
        assert_eq!(reply.kind(), "peer");
        assert_eq!(reply.sender_id(), &PeerId::from("host"));
        assert_eq!(reply.target_id(), Some(&PeerId::from("alice")));
        assert!(matches!(
            next_event(&mut seen).await,
            RelayEvent::PeerCandidate { peer_id, .. } if peer_id == PeerId::from("alice")
        ));
        assert!(host.relay().is_ready());
    }

    #[tokio::test]
    async fn test_data_reaches_engine() {
        let (host, mut seen) = recording_host();
        let conn = host.open_local().await.unwrap();
        host.on_message(conn.id, &Frame::join("alice", None).encode().unwrap())
            .await;
        let _ = next_event(&mut seen).await;

        let data = Frame::data("sync", "alice", Some("host".into()), vec![4, 2]);
        host.on_message(conn.id, &data.encode().unwrap()).await;
        assert_eq!(next_event(&mut seen).await, RelayEvent::Message(data));
    }

    #[tokio::test]
    async fn test_close_unregisters_and_closes_transport() {
        let (host, mut seen) = recording_host();
        let mut conn = host.open_local().await.unwrap();
        host.on_message(conn.id, &Frame::join("alice", None).encode().unwrap())
            .await;
        let _ = next_event(&mut seen).await;
        let _ = conn.recv_frame().await;

        host.on_close(conn.id, 4000, "client gone").await;

        assert_eq!(host.connection_count().await, 0);
        assert!(!host.relay().is_registered(conn.id).await);
        assert!(!host.relay().is_ready());
        assert_eq!(
            conn.try_recv(),
            Some(Outbound::Close {
                code: 4000,
                reason: "client gone".into()
            })
        );
        assert_eq!(
            next_event(&mut seen).await,
            RelayEvent::PeerDisconnected {
                peer_id: "alice".into()
            }
        );
    }

    #[tokio::test]
    async fn test_error_does_not_tear_down() {
        let (host, _seen) = recording_host();
        let conn = host.open_local().await.unwrap();

        host.on_error(conn.id, &"connection reset");

        assert_eq!(host.connection_count().await, 1);
        assert!(host.relay().is_registered(conn.id).await);
    }

    #[tokio::test]
    async fn test_shutdown_reaches_engine() {
        let (host, mut seen) = recording_host();
        let mut conn = host.open_local().await.unwrap();

        host.shutdown().await;

        assert_eq!(next_event(&mut seen).await, RelayEvent::Closed);
        assert_eq!(host.connection_count().await, 0);
        assert!(!host.engine_started().await);
        assert!(conn.recv_frame().await.is_none());
    }
}
