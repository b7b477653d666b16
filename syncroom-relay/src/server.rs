//! WebSocket relay server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                       ┌── PeerRelay ──► RelayEvent ──► MergeEngine
//!             ├── WebSocket ── SessionHost                                 │
//! Client B ──┘   (read loop)         └── StorageAdapter ◄───────────────────┘
//!      ▲                                                   (RocksDB / memory)
//!      └──── writer task ◄── Outbound ◄── ChannelTransport
//! ```
//!
//! Every accepted socket gets a `ChannelTransport` registered with the single
//! session host. The read loop feeds raw messages to the host; a writer task
//! drains the transport's outbound queue into the socket.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};

use crate::engine::MergeEngine;
use crate::relay::RelayError;
use crate::session::{SessionConfig, SessionHost};
use crate::storage::{RocksBlobStore, StorageAdapter, StoreConfig, StoreError};
use crate::transport::{ChannelTransport, Outbound, CLOSE_ABNORMAL, CLOSE_NO_STATUS};

/// Where the session's blobs live.
#[derive(Debug, Clone)]
pub enum StorageBackend {
    /// Lost on restart
    Memory,
    RocksDb(StoreConfig),
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    pub session: SessionConfig,
    pub storage: StorageBackend,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            session: SessionConfig::default(),
            storage: StorageBackend::Memory,
        }
    }
}

impl ServerConfig {
    /// Ephemeral port, in-memory storage, fixed relay id.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            session: SessionConfig::for_testing("relay"),
            storage: StorageBackend::Memory,
        }
    }
}

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
}

/// The relay server.
pub struct SyncServer {
    config: ServerConfig,
    host: Arc<SessionHost>,
    stats: Arc<AtomicServerStats>,
}

impl SyncServer {
    /// Create a server running the [`ForwardingEngine`](crate::engine::ForwardingEngine).
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let storage = Self::open_storage(&config.storage)?;
        let host = SessionHost::forwarding(config.session.clone(), storage);
        Ok(Self::with_host(config, host))
    }

    /// Create a server whose engine is built by `build` on first connection.
    pub fn with_engine<E, F>(config: ServerConfig, build: F) -> Result<Self, ServerError>
    where
        E: MergeEngine,
        F: FnOnce() -> E + Send + 'static,
    {
        let storage = Self::open_storage(&config.storage)?;
        let host = SessionHost::new(config.session.clone(), storage, build);
        Ok(Self::with_host(config, host))
    }

    fn with_host(config: ServerConfig, host: SessionHost) -> Self {
        Self {
            config,
            host: Arc::new(host),
            stats: Arc::new(AtomicServerStats::default()),
        }
    }

    fn open_storage(backend: &StorageBackend) -> Result<StorageAdapter, StoreError> {
        match backend {
            StorageBackend::Memory => Ok(StorageAdapter::in_memory()),
            StorageBackend::RocksDb(config) => {
                let store = RocksBlobStore::open(config.clone())?;
                Ok(StorageAdapter::new(Arc::new(store)))
            }
        }
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve until `shutdown` resolves, then disconnect every peer.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay listening on {}", listener.local_addr()?);

        tokio::select! {
            result = self.serve(listener) => result?,
            _ = shutdown => log::info!("Shutdown requested"),
        }
        self.host.shutdown().await;
        Ok(())
    }

    /// Accept connections on an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let host = self.host.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, host, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        host: Arc<SessionHost>,
        stats: Arc<AtomicServerStats>,
    ) -> Result<(), ServerError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let (transport, mut outbound) = ChannelTransport::open();
        let transport = Arc::new(transport);
        let id = host.open_connection(transport.clone()).await?;
        log::info!("WebSocket connection {id} established from {addr}");

        stats.total_connections.fetch_add(1, Ordering::Relaxed);
        stats.active_connections.fetch_add(1, Ordering::Relaxed);

        // Writer task: drain the transport queue into the socket
        let writer = tokio::spawn(async move {
            while let Some(item) = outbound.recv().await {
                match item {
                    Outbound::Binary(bytes) => {
                        if ws_sender.send(Message::Binary(bytes.into())).await.is_err() {
                            break;
                        }
                    }
                    Outbound::Close { code, reason } => {
                        let frame = CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.into(),
                        };
                        let _ = ws_sender.send(Message::Close(Some(frame))).await;
                        break;
                    }
                }
            }
        });

        let (code, reason) = loop {
            match ws_receiver.next().await {
                Some(Ok(Message::Binary(data))) => {
                    stats.total_messages.fetch_add(1, Ordering::Relaxed);
                    stats.total_bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
                    host.on_message(id, &data).await;
                }
                Some(Ok(Message::Text(text))) => {
                    stats.total_messages.fetch_add(1, Ordering::Relaxed);
                    stats.total_bytes.fetch_add(text.len() as u64, Ordering::Relaxed);
                    host.on_message(id, text.as_bytes()).await;
                }
                Some(Ok(Message::Close(frame))) => {
                    break match frame {
                        Some(frame) => (u16::from(frame.code), frame.reason.to_string()),
                        None => (CLOSE_NO_STATUS, String::new()),
                    };
                }
                // Pings are answered by tungstenite
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    host.on_error(id, &e);
                    break (CLOSE_ABNORMAL, "transport error".to_string());
                }
                None => break (CLOSE_ABNORMAL, String::new()),
            }
        };

        host.on_close(id, code, &reason).await;
        drop(transport);
        let _ = writer.await;

        stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        log::info!("Connection {id} from {addr} finished");
        Ok(())
    }

    /// Get server statistics.
    pub fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            total_messages: self.stats.total_messages.load(Ordering::Relaxed),
            total_bytes: self.stats.total_bytes.load(Ordering::Relaxed),
        }
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn host(&self) -> &Arc<SessionHost> {
        &self.host
    }
}
