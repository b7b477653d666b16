//! syncroom-server: WebSocket relay for mergeable-document peers
//!
//! Runs one session: a peer relay, a storage adapter (in memory or RocksDB),
//! and the forwarding merge engine.

use std::path::PathBuf;

use clap::Parser;
use syncroom_relay::protocol::{PeerId, PeerMetadata};
use syncroom_relay::server::{ServerConfig, StorageBackend, SyncServer};
use syncroom_relay::session::SessionConfig;
use syncroom_relay::storage::StoreConfig;

#[derive(Parser)]
#[command(name = "syncroom-server")]
#[command(about = "Peer relay and storage adapter for syncing mergeable documents")]
struct Cli {
    /// Address to listen on
    #[arg(short, long, env = "SYNCROOM_BIND", default_value = "127.0.0.1:9090")]
    bind: String,

    /// Peer id the relay announces (random if unset)
    #[arg(long, env = "SYNCROOM_PEER_ID")]
    peer_id: Option<String>,

    /// RocksDB directory; blobs stay in memory if unset
    #[arg(short, long, env = "SYNCROOM_STORAGE_PATH")]
    storage_path: Option<PathBuf>,

    /// Storage id announced in the relay's peer metadata
    #[arg(long, env = "SYNCROOM_STORAGE_ID")]
    storage_id: Option<String>,

    /// Announce the relay as ephemeral
    #[arg(long)]
    ephemeral: bool,
}

impl Cli {
    fn into_config(self) -> ServerConfig {
        let mut session = SessionConfig::default();
        if let Some(peer_id) = self.peer_id {
            session.peer_id = PeerId::new(peer_id);
        }
        session.peer_metadata = PeerMetadata {
            storage_id: self.storage_id,
            is_ephemeral: self.ephemeral,
        };

        let storage = match self.storage_path {
            Some(path) => StorageBackend::RocksDb(StoreConfig {
                path,
                ..StoreConfig::default()
            }),
            None => StorageBackend::Memory,
        };

        ServerConfig {
            bind_addr: self.bind,
            session,
            storage,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Cli::parse().into_config();
    log::info!("Starting syncroom-server as {}", config.session.peer_id);
    match &config.storage {
        StorageBackend::Memory => log::info!("Storage: in memory"),
        StorageBackend::RocksDb(store) => log::info!("Storage: {}", store.path.display()),
    }

    let server = SyncServer::new(config)?;
    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for ctrl-c: {e}");
            }
        })
        .await?;

    log::info!("syncroom-server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_use_memory() {
        let config = Cli::parse_from(["syncroom-server"]).into_config();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert!(matches!(config.storage, StorageBackend::Memory));
        assert!(!config.session.peer_metadata.is_ephemeral);
    }

    #[test]
    fn test_flags_map_onto_config() {
        let config = Cli::parse_from([
            "syncroom-server",
            "--bind",
            "0.0.0.0:8080",
            "--peer-id",
            "relay-1",
            "--storage-path",
            "/tmp/syncroom",
            "--storage-id",
            "store-1",
            "--ephemeral",
        ])
        .into_config();

        assert_eq!(config.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.session.peer_id.as_str(), "relay-1");
        assert_eq!(config.session.peer_metadata.storage_id.as_deref(), Some("store-1"));
        assert!(config.session.peer_metadata.is_ephemeral);
        match config.storage {
            StorageBackend::RocksDb(store) => assert_eq!(store.path, PathBuf::from("/tmp/syncroom")),
            other => panic!("Expected RocksDb, got {other:?}"),
        }
    }
}
