//! # syncroom-relay: Peer relay and storage adapter for mergeable documents
//!
//! Routes binary sync frames between connected peers and gives a merge
//! engine key-addressed durable storage. The relay never interprets
//! document payloads; merging is the engine's job.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐   RelayEvent   ┌─────────────┐
//! │ RelayClient │ ◄─────────────────► │ SyncServer  │ ─────────────► │ MergeEngine │
//! │ (per peer)  │   bincode Frames    │ SessionHost │ ◄───────────── │             │
//! └─────────────┘                     │ PeerRelay   │   send(Frame)  └──────┬──────┘
//!                                     └─────────────┘                       │
//!                                                                    ┌──────┴───────┐
//!                                                                    │StorageAdapter│
//!                                                                    │ (BlobStore)  │
//!                                                                    └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Binary wire protocol (bincode-encoded `Frame`)
//! - [`transport`]: Connection boundary and the channel-backed transport
//! - [`relay`]: Connection registry, handshake, unicast/broadcast routing
//! - [`storage`]: Hierarchical keys over a flat blob store (memory, RocksDB)
//! - [`engine`]: Merge engine contract and the pass-through forwarding engine
//! - [`session`]: One relay, one storage adapter, one lazily started engine
//! - [`server`]: WebSocket server attaching sockets to the session
//! - [`client`]: WebSocket client performing the join handshake

pub mod protocol;
pub mod transport;
pub mod relay;
pub mod storage;
pub mod engine;
pub mod session;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use protocol::{DataMessage, Frame, PeerId, PeerMetadata, ProtocolError, PROTOCOL_VERSION};
pub use transport::{ChannelTransport, ConnectionId, Outbound, ReadyState, Transport, TransportError};
pub use relay::{PeerRelay, RelayError, RelayEvent, RelayIdentity, RelayStats};
pub use storage::{
    BlobStore, Chunk, MemoryBlobStore, RocksBlobStore, StorageAdapter, StorageKey, StoreConfig,
    StoreError,
};
pub use engine::{EngineContext, ForwardingEngine, MergeEngine};
pub use session::{LocalConnection, SessionConfig, SessionHost};
pub use server::{ServerConfig, ServerError, ServerStats, StorageBackend, SyncServer};
pub use client::{ClientError, RelayClient, RemotePeer};
