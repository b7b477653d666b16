//! Connection registry and frame router.
//!
//! ```text
//!  transport ──bytes──► on_frame ──decode──┬── Join ──► bind identity ──► Peer reply
//!                                          │                          └─► PeerCandidate
//!                                          └── other ─► RelayEvent::Message ──► engine
//!
//!  engine ──Frame──► send ──┬── target_id ──► first joined+open match (or drop)
//!                           └── none ───────► every joined+open connection
//! ```
//!
//! A connection starts unjoined and becomes joined on its first join frame.
//! Only joined connections receive outbound frames. The relay never looks
//! inside data payloads.

use indexmap::IndexMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch, RwLock};

use crate::protocol::{Frame, PeerId, PeerMetadata, ProtocolError, PROTOCOL_VERSION};
use crate::transport::{ConnectionId, ReadyState, Transport, CLOSE_GOING_AWAY};

/// Notifications surfaced to the merge engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// A connection completed the join handshake
    PeerCandidate {
        peer_id: PeerId,
        peer_metadata: PeerMetadata,
    },
    /// A joined connection went away
    PeerDisconnected { peer_id: PeerId },
    /// Any non-join frame, verbatim
    Message(Frame),
    /// The relay dropped every connection
    Closed,
}

/// Relay errors.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Connection {0} is already registered")]
    DuplicateConnection(ConnectionId),
    #[error("Relay identity is already bound")]
    AlreadyBound,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("Relay not ready after {0:?}")]
    ReadyTimeout(Duration),
    #[error("Relay shut down")]
    Closed,
}

/// The relay's own identity, fixed once bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayIdentity {
    pub peer_id: PeerId,
    pub metadata: PeerMetadata,
}

/// Per-connection state.
pub struct ConnectionRecord {
    transport: Arc<dyn Transport>,
    peer_id: Option<PeerId>,
    peer_metadata: Option<PeerMetadata>,
}

impl ConnectionRecord {
    fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            peer_id: None,
            peer_metadata: None,
        }
    }

    pub fn peer_id(&self) -> Option<&PeerId> {
        self.peer_id.as_ref()
    }

    pub fn peer_metadata(&self) -> Option<&PeerMetadata> {
        self.peer_metadata.as_ref()
    }

    pub fn is_joined(&self) -> bool {
        self.peer_id.is_some()
    }

    fn is_deliverable(&self) -> bool {
        self.is_joined() && self.transport.ready_state() == ReadyState::Open
    }
}

/// Counters for monitoring relay traffic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub frames_received: u64,
    pub frames_sent: u64,
    pub decode_failures: u64,
    pub dropped_unicasts: u64,
}

#[derive(Default)]
struct AtomicRelayStats {
    frames_received: AtomicU64,
    frames_sent: AtomicU64,
    decode_failures: AtomicU64,
    dropped_unicasts: AtomicU64,
}

struct RelayInner {
    connections: RwLock<IndexMap<ConnectionId, ConnectionRecord>>,
    identity: OnceLock<RelayIdentity>,
    ready: watch::Sender<bool>,
    events: mpsc::UnboundedSender<RelayEvent>,
    stats: AtomicRelayStats,
}

/// The peer relay. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct PeerRelay {
    inner: Arc<RelayInner>,
}

impl PeerRelay {
    /// Create a relay and the event stream the merge engine consumes.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RelayEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (ready, _) = watch::channel(false);
        let relay = Self {
            inner: Arc::new(RelayInner {
                connections: RwLock::new(IndexMap::new()),
                identity: OnceLock::new(),
                ready,
                events,
                stats: AtomicRelayStats::default(),
            }),
        };
        (relay, events_rx)
    }

    // ─── Connection lifecycle ─────────────────────────────────────────

    /// Track a freshly accepted transport. No frames are sent.
    pub async fn register(
        &self,
        id: ConnectionId,
        transport: Arc<dyn Transport>,
    ) -> Result<(), RelayError> {
        let mut connections = self.inner.connections.write().await;
        if connections.contains_key(&id) {
            return Err(RelayError::DuplicateConnection(id));
        }
        connections.insert(id, ConnectionRecord::new(transport));
        log::debug!("Registered {id} ({} live)", connections.len());
        Ok(())
    }

    /// Forget a transport. Returns the peer it was joined as, if any.
    pub async fn unregister(&self, id: ConnectionId) -> Option<PeerId> {
        let mut connections = self.inner.connections.write().await;
        let record = connections.shift_remove(&id)?;
        if connections.is_empty() {
            self.set_ready(false);
        }
        log::debug!("Unregistered {id} ({} live)", connections.len());

        let peer_id = record.peer_id?;
        self.emit(RelayEvent::PeerDisconnected {
            peer_id: peer_id.clone(),
        });
        Some(peer_id)
    }

    /// Handle one raw inbound frame. Malformed input is logged and dropped.
    pub async fn on_frame(&self, id: ConnectionId, bytes: &[u8]) {
        self.inner.stats.frames_received.fetch_add(1, Ordering::Relaxed);

        let frame = match Frame::decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                self.inner.stats.decode_failures.fetch_add(1, Ordering::Relaxed);
                log::warn!("Discarding malformed frame on {id}: {e}");
                return;
            }
        };

        let mut connections = self.inner.connections.write().await;
        match frame {
            Frame::Join {
                sender_id,
                peer_metadata,
                supported_protocol_versions,
            } => {
                let Some(record) = connections.get_mut(&id) else {
                    log::warn!("Join from unregistered {id} ignored");
                    return;
                };
                if !supported_protocol_versions.iter().any(|v| v == PROTOCOL_VERSION) {
                    log::warn!(
                        "Peer {sender_id} supports {supported_protocol_versions:?}, replying with {PROTOCOL_VERSION}"
                    );
                }
                let peer_id = self.join(id, record, sender_id, peer_metadata.clone());

                if let Some(identity) = self.inner.identity.get() {
                    let reply = Frame::peer(
                        identity.peer_id.clone(),
                        Some(identity.metadata.clone()),
                        peer_id.clone(),
                    );
                    self.deliver(id, record, &reply);
                }

                self.emit(RelayEvent::PeerCandidate {
                    peer_id,
                    peer_metadata: peer_metadata.unwrap_or_default(),
                });
            }
            other => {
                log::trace!("{} frame from {} on {id}", other.kind(), other.sender_id());
                self.emit(RelayEvent::Message(other));
            }
        }

        if !*self.inner.ready.borrow()
            && self.inner.identity.get().is_some()
            && !connections.is_empty()
        {
            self.set_ready(true);
        }
    }

    /// Record a join on `record`. The first join's identity is authoritative;
    /// metadata from the latest join wins.
    fn join(
        &self,
        id: ConnectionId,
        record: &mut ConnectionRecord,
        sender_id: PeerId,
        peer_metadata: Option<PeerMetadata>,
    ) -> PeerId {
        record.peer_metadata = peer_metadata;
        match &record.peer_id {
            Some(existing) => {
                if *existing != sender_id {
                    log::warn!(
                        "{id} already joined as {existing}, ignoring new identity {sender_id}"
                    );
                }
                existing.clone()
            }
            None => {
                log::info!("Peer {sender_id} joined on {id}");
                record.peer_id = Some(sender_id.clone());
                sender_id
            }
        }
    }

    // ─── Identity & readiness ─────────────────────────────────────────

    /// Bind the relay's own identity. Allowed once.
    pub async fn bind(&self, peer_id: PeerId, metadata: PeerMetadata) -> Result<(), RelayError> {
        self.inner
            .identity
            .set(RelayIdentity { peer_id, metadata })
            .map_err(|_| RelayError::AlreadyBound)?;

        let connections = self.inner.connections.read().await;
        if !connections.is_empty() {
            self.set_ready(true);
        }
        Ok(())
    }

    pub fn identity(&self) -> Option<&RelayIdentity> {
        self.inner.identity.get()
    }

    pub fn is_ready(&self) -> bool {
        *self.inner.ready.borrow() && self.inner.identity.get().is_some()
    }

    /// Resolve once the relay is ready. Waits indefinitely; see
    /// `await_ready_timeout` for a bounded wait.
    pub async fn await_ready(&self) -> Result<(), RelayError> {
        let mut ready = self.inner.ready.subscribe();
        ready
            .wait_for(|ready| *ready)
            .await
            .map_err(|_| RelayError::Closed)?;
        Ok(())
    }

    pub async fn await_ready_timeout(&self, limit: Duration) -> Result<(), RelayError> {
        tokio::time::timeout(limit, self.await_ready())
            .await
            .map_err(|_| RelayError::ReadyTimeout(limit))?
    }

    fn set_ready(&self, value: bool) {
        let changed = self.inner.ready.send_if_modified(|ready| {
            let changed = *ready != value;
            *ready = value;
            changed
        });
        if changed {
            log::debug!("Relay ready = {value}");
        }
    }

    // ─── Outbound ─────────────────────────────────────────────────────

    /// Route a frame. Unicast goes to the first joined, open connection
    /// for `target_id`; no match drops the frame silently. Without a target
    /// the frame is broadcast to every joined, open connection.
    ///
    /// Returns the number of connections written to.
    pub async fn send(&self, frame: &Frame) -> Result<usize, RelayError> {
        let encoded = frame.encode()?;
        let connections = self.inner.connections.read().await;

        match frame.target_id() {
            Some(target) => {
                let found = connections.iter().find(|(_, record)| {
                    record.peer_id.as_ref() == Some(target) && record.is_deliverable()
                });
                match found {
                    Some((id, record)) => Ok(self.write(*id, record, encoded) as usize),
                    None => {
                        self.inner.stats.dropped_unicasts.fetch_add(1, Ordering::Relaxed);
                        log::debug!("No open connection for {target}, dropping {}", frame.kind());
                        Ok(0)
                    }
                }
            }
            None => {
                let mut delivered = 0;
                for (id, record) in connections.iter().filter(|(_, r)| r.is_deliverable()) {
                    if self.write(*id, record, encoded.clone()) {
                        delivered += 1;
                    }
                }
                Ok(delivered)
            }
        }
    }

    fn deliver(&self, id: ConnectionId, record: &ConnectionRecord, frame: &Frame) {
        match frame.encode() {
            Ok(encoded) => {
                self.write(id, record, encoded);
            }
            Err(e) => log::error!("Failed to encode {} for {id}: {e}", frame.kind()),
        }
    }

    fn write(&self, id: ConnectionId, record: &ConnectionRecord, encoded: Vec<u8>) -> bool {
        match record.transport.send(encoded) {
            Ok(()) => {
                self.inner.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                log::debug!("Send to {id} failed: {e}");
                false
            }
        }
    }

    // ─── Shutdown ─────────────────────────────────────────────────────

    /// Close every open transport and forget all connections.
    pub async fn disconnect(&self) {
        let mut connections = self.inner.connections.write().await;
        for (_, record) in connections.drain(..) {
            if record.transport.ready_state() == ReadyState::Open {
                record.transport.close(CLOSE_GOING_AWAY, "relay disconnected");
            }
        }
        self.set_ready(false);
        self.emit(RelayEvent::Closed);
        log::info!("Relay disconnected all peers");
    }

    // ─── Introspection ────────────────────────────────────────────────

    pub async fn connection_count(&self) -> usize {
        self.inner.connections.read().await.len()
    }

    pub async fn is_registered(&self, id: ConnectionId) -> bool {
        self.inner.connections.read().await.contains_key(&id)
    }

    /// Peer identity bound to a connection, if it has joined.
    pub async fn peer_of(&self, id: ConnectionId) -> Option<PeerId> {
        let connections = self.inner.connections.read().await;
        connections.get(&id).and_then(|r| r.peer_id.clone())
    }

    pub async fn metadata_of(&self, id: ConnectionId) -> Option<PeerMetadata> {
        let connections = self.inner.connections.read().await;
        connections.get(&id).and_then(|r| r.peer_metadata.clone())
    }

    /// Identities of all joined connections, in registration order.
    pub async fn joined_peers(&self) -> Vec<PeerId> {
        let connections = self.inner.connections.read().await;
        connections
            .values()
            .filter_map(|r| r.peer_id.clone())
            .collect()
    }

    pub fn stats(&self) -> RelayStats {
        let stats = &self.inner.stats;
        RelayStats {
            frames_received: stats.frames_received.load(Ordering::Relaxed),
            frames_sent: stats.frames_sent.load(Ordering::Relaxed),
            decode_failures: stats.decode_failures.load(Ordering::Relaxed),
            dropped_unicasts: stats.dropped_unicasts.load(Ordering::Relaxed),
        }
    }

    fn emit(&self, event: RelayEvent) {
        if self.inner.events.send(event).is_err() {
            log::trace!("No engine listening for relay events");
        }
    }
}
