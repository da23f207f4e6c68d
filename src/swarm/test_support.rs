//! Shared fixtures for swarm tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::config::{FileConfig, FlotillaConfig, StorageConfig};

use super::engine::ProtocolEngine;
use super::peers::PeerRegistry;
use super::piece_store::PieceStore;
use super::transport::Transport;
use super::{Message, PeerId, SwarmError};

/// Transport that records outbound traffic instead of delivering it.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<(PeerId, Message)>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything sent so far, in order.
    pub async fn sent(&self) -> Vec<(PeerId, Message)> {
        self.sent.lock().await.clone()
    }

    pub async fn clear(&self) {
        self.sent.lock().await.clear();
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, target: &PeerId, message: Message) -> Result<(), SwarmError> {
        self.sent.lock().await.push((target.clone(), message));
        Ok(())
    }
}

/// Test config rooted in a fresh temp directory, sharing "shared.dat".
pub fn temp_config(file_size: u64, piece_size: u64) -> (tempfile::TempDir, FlotillaConfig) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = FlotillaConfig::for_testing();
    config.file = FileConfig {
        file_name: "shared.dat".to_string(),
        file_size,
        piece_size,
    };
    config.storage = StorageConfig {
        root_dir: dir.path().to_path_buf(),
    };
    (dir, config)
}

/// Deterministic source file content of the given size.
pub fn source_bytes(file_size: u64) -> Vec<u8> {
    (0..file_size).map(|i| (i % 251) as u8).collect()
}

/// Store for local peer "L" with a source file written to the root.
///
/// The store is not initialized; tests choose seeding or leeching.
pub async fn store_with_source(file_size: u64, piece_size: u64) -> (tempfile::TempDir, PieceStore) {
    let (dir, config) = temp_config(file_size, piece_size);
    tokio::fs::write(dir.path().join("shared.dat"), source_bytes(file_size))
        .await
        .unwrap();
    let store = PieceStore::new(PeerId::new("L"), &config);
    (dir, store)
}

/// A wired-up engine for local peer "L" over a recording transport.
pub struct EngineFixture {
    pub engine: Arc<ProtocolEngine>,
    pub transport: Arc<RecordingTransport>,
    pub store: Arc<PieceStore>,
    pub dir: tempfile::TempDir,
}

/// Builds an initialized engine; seeding fixtures get a split source
/// file, leeching ones start empty. Request timeout is zero so staleness
/// paths fire without waiting.
pub async fn engine_fixture(file_size: u64, piece_size: u64, seeding: bool) -> EngineFixture {
    let (dir, mut config) = temp_config(file_size, piece_size);
    config.swarm.request_timeout = Duration::ZERO;

    if seeding {
        tokio::fs::write(dir.path().join("shared.dat"), source_bytes(file_size))
            .await
            .unwrap();
    }

    let store = Arc::new(PieceStore::new(PeerId::new("L"), &config));
    store.initialize(seeding).await.unwrap();

    let registry = Arc::new(PeerRegistry::new(
        PeerId::new("L"),
        store.total_pieces(),
        config.swarm.number_of_preferred_neighbors,
        config.storage.root_dir.clone(),
    ));
    let transport = Arc::new(RecordingTransport::new());
    let engine = ProtocolEngine::new(
        &config,
        Arc::clone(&store),
        registry,
        Arc::clone(&transport) as Arc<dyn Transport>,
    );

    EngineFixture {
        engine,
        transport,
        store,
        dir,
    }
}
