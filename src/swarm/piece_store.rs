//! Piece storage for the local session.
//!
//! Owns piece bytes (an in-memory cache backed by one file per piece in
//! the peer's storage namespace) and the local bitfield. Splits a
//! complete source file into pieces at session start and merges a
//! complete set back into the output file.
//!
//! Namespace layout, relied on by upload/download tooling:
//!
//! ```text
//! <root>/peer_<id>/piece_<index>        piece files
//! <root>/peer_<id>/metadata/filename    original file name
//! <root>/peer_<id>/metadata/content_type
//! <root>/peer_<id>/<filename>           merged output
//! ```

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::{FileConfig, FlotillaConfig};

use super::{Bitfield, PeerId, PieceIndex, SwarmError};

/// Piece cache, local bitfield, and file segmentation/reassembly for
/// one session.
///
/// All mutation is monotonic on the bitfield side: bits are only ever
/// set, never cleared, so the local piece count can only grow within a
/// session.
pub struct PieceStore {
    local_peer_id: PeerId,
    file: FileConfig,
    root_dir: PathBuf,
    total_pieces: u32,
    /// Declared-complete flag: enables piece regeneration from the source file.
    seeding: AtomicBool,
    bitfield: RwLock<Bitfield>,
    cache: RwLock<HashMap<u32, Bytes>>,
    /// Merges read every piece and write one output stream; one at a time.
    merge_lock: Mutex<()>,
}

impl PieceStore {
    /// Creates a store for the given local identity.
    ///
    /// Total piece count is fixed here from the configured file
    /// size/piece size pairing and never recomputed from a scan.
    pub fn new(local_peer_id: PeerId, config: &FlotillaConfig) -> Self {
        let total_pieces = config.file.total_pieces();
        Self {
            local_peer_id,
            file: config.file.clone(),
            root_dir: config.storage.root_dir.clone(),
            total_pieces,
            seeding: AtomicBool::new(false),
            bitfield: RwLock::new(Bitfield::new(total_pieces as usize)),
            cache: RwLock::new(HashMap::new()),
            merge_lock: Mutex::new(()),
        }
    }

    /// Total number of pieces in the session.
    pub fn total_pieces(&self) -> u32 {
        self.total_pieces
    }

    /// Identity owning this store's namespace.
    pub fn local_peer_id(&self) -> &PeerId {
        &self.local_peer_id
    }

    fn namespace_dir(&self) -> PathBuf {
        self.root_dir.join(format!("peer_{}", self.local_peer_id))
    }

    fn piece_path(&self, index: u32) -> PathBuf {
        self.namespace_dir().join(format!("piece_{index}"))
    }

    fn metadata_dir(&self) -> PathBuf {
        self.namespace_dir().join("metadata")
    }

    /// Initializes the session namespace and bitfield.
    ///
    /// Seeders split the source file into pieces synchronously and end
    /// up with an all-ones bitfield. Leechers scan the namespace for
    /// pieces persisted by a previous run and resume from them.
    ///
    /// # Errors
    ///
    /// - `SwarmError::SourceFileMissing` - Declared complete but the
    ///   source file is absent. The session stays usable with an empty
    ///   bitfield; callers log and continue.
    /// - `SwarmError::Io` - Namespace directories cannot be created
    pub async fn initialize(&self, has_complete_file: bool) -> Result<(), SwarmError> {
        fs::create_dir_all(self.metadata_dir()).await?;
        fs::write(
            self.metadata_dir().join("filename"),
            self.file.file_name.as_bytes(),
        )
        .await?;

        self.seeding.store(has_complete_file, Ordering::Release);

        if has_complete_file {
            self.split_source_file().await?;
            info!(
                peer = %self.local_peer_id,
                pieces = self.total_pieces,
                "seeding: source file split into pieces"
            );
        } else {
            let resumed = self.scan_persisted_pieces().await;
            if resumed > 0 {
                info!(
                    peer = %self.local_peer_id,
                    pieces = resumed,
                    "resumed session from persisted pieces"
                );
            }
        }
        Ok(())
    }

    /// Records the declared content type in the metadata namespace.
    pub async fn store_content_type(&self, content_type: &str) -> Result<(), SwarmError> {
        fs::create_dir_all(self.metadata_dir()).await?;
        fs::write(
            self.metadata_dir().join("content_type"),
            content_type.as_bytes(),
        )
        .await?;
        Ok(())
    }

    /// Reads the file name to merge into, preferring persisted metadata.
    async fn merge_file_name(&self) -> String {
        match fs::read_to_string(self.metadata_dir().join("filename")).await {
            Ok(name) if !name.trim().is_empty() => name.trim().to_string(),
            _ => self.file.file_name.clone(),
        }
    }

    async fn split_source_file(&self) -> Result<(), SwarmError> {
        let source_path = self.root_dir.join(&self.file.file_name);
        if !fs::try_exists(&source_path).await.unwrap_or(false) {
            error!(path = %source_path.display(), "source file missing at split time");
            return Err(SwarmError::SourceFileMissing {
                path: source_path.display().to_string(),
            });
        }

        let mut source = fs::File::open(&source_path).await?;
        for index in 0..self.total_pieces {
            let data = read_piece_at(&mut source, &self.file, index).await?;
            self.persist_piece(index, &data).await?;
            self.cache.write().await.insert(index, data);
        }
        self.bitfield.write().await.set_all();
        Ok(())
    }

    /// Sets bits for piece files already present in the namespace.
    async fn scan_persisted_pieces(&self) -> usize {
        let mut found = 0;
        for index in 0..self.total_pieces {
            if let Ok(meta) = fs::metadata(self.piece_path(index)).await {
                if meta.len() > 0 {
                    self.bitfield.write().await.set(index as usize);
                    found += 1;
                }
            }
        }
        found
    }

    async fn persist_piece(&self, index: u32, data: &[u8]) -> Result<(), SwarmError> {
        let path = self.piece_path(index);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, data).await?;
        Ok(())
    }

    /// Retrieves piece bytes, producing them through whichever path works.
    ///
    /// Lookup order: memory cache, then the persisted piece file
    /// (populating cache and bitfield), then regeneration by offset
    /// read from the source file when this session is seeding.
    ///
    /// # Errors
    ///
    /// - `SwarmError::PieceNotFound` - Index out of range or no
    ///   production path succeeded
    pub async fn piece_data(&self, index: PieceIndex) -> Result<Bytes, SwarmError> {
        let i = index.as_u32();
        if i >= self.total_pieces {
            return Err(SwarmError::PieceNotFound { index });
        }

        if let Some(data) = self.cache.read().await.get(&i).cloned() {
            return Ok(data);
        }

        // Piece file persisted by an earlier run or an out-of-band write
        if let Ok(raw) = fs::read(self.piece_path(i)).await {
            if !raw.is_empty() {
                debug!(piece = i, "loaded piece from disk");
                let data = Bytes::from(raw);
                self.cache.write().await.insert(i, data.clone());
                self.bitfield.write().await.set(i as usize);
                return Ok(data);
            }
        }

        if self.seeding.load(Ordering::Acquire) {
            let source_path = self.root_dir.join(&self.file.file_name);
            if let Ok(mut source) = fs::File::open(&source_path).await {
                let data = read_piece_at(&mut source, &self.file, i).await?;
                info!(piece = i, "regenerated piece from source file");
                self.persist_piece(i, &data).await?;
                self.cache.write().await.insert(i, data.clone());
                self.bitfield.write().await.set(i as usize);
                return Ok(data);
            }
            warn!(
                piece = i,
                path = %source_path.display(),
                "seeding but source file unavailable for regeneration"
            );
        }

        Err(SwarmError::PieceNotFound { index })
    }

    /// Stores a piece received from the swarm.
    ///
    /// Idempotent per index: duplicate delivery overwrites with the
    /// same bytes and re-setting the bit is a no-op. Distinct indices
    /// proceed independently.
    ///
    /// # Errors
    ///
    /// - `SwarmError::EmptyPiece` - Zero-length payload
    /// - `SwarmError::PieceNotFound` - Index out of range
    pub async fn receive_piece(&self, index: PieceIndex, data: Bytes) -> Result<(), SwarmError> {
        let i = index.as_u32();
        if data.is_empty() {
            return Err(SwarmError::EmptyPiece { index });
        }
        if i >= self.total_pieces {
            return Err(SwarmError::PieceNotFound { index });
        }

        self.cache.write().await.insert(i, data.clone());
        self.persist_piece(i, &data).await?;
        self.bitfield.write().await.set(i as usize);
        debug!(piece = i, size = data.len(), "stored received piece");
        Ok(())
    }

    /// Returns true if the given piece is recorded in the local bitfield.
    pub async fn has_piece(&self, index: PieceIndex) -> bool {
        self.bitfield.read().await.has(index.as_u32() as usize)
    }

    /// Indices not yet present locally, ascending.
    pub async fn missing_pieces(&self) -> Vec<PieceIndex> {
        self.bitfield
            .read()
            .await
            .missing()
            .into_iter()
            .map(PieceIndex::new)
            .collect()
    }

    /// Snapshot of the local bitfield.
    pub async fn bitfield(&self) -> Bitfield {
        self.bitfield.read().await.clone()
    }

    /// Number of pieces held locally.
    pub async fn cardinality(&self) -> usize {
        self.bitfield.read().await.count()
    }

    /// Whether every piece is held locally.
    ///
    /// Re-validates against disk first: a persisted piece file not yet
    /// reflected in the bitfield gets its bit set, healing the state
    /// after out-of-band writes.
    pub async fn is_complete(&self) -> bool {
        let unset: Vec<u32> = self.bitfield.read().await.missing();
        for index in unset {
            if let Ok(meta) = fs::metadata(self.piece_path(index)).await {
                if meta.len() > 0 {
                    info!(piece = index, "found persisted piece missing from bitfield");
                    self.bitfield.write().await.set(index as usize);
                }
            }
        }
        self.bitfield.read().await.is_complete()
    }

    /// Concatenates pieces 0..total in order into the output file.
    ///
    /// Every piece is collected before the output file is created, so a
    /// gap never leaves a partial file behind. Merges for the same
    /// store are serialized.
    ///
    /// # Errors
    ///
    /// - `SwarmError::IncompleteMerge` - A piece was unavailable
    /// - `SwarmError::Io` - Output file could not be written
    pub async fn merge_file(&self) -> Result<PathBuf, SwarmError> {
        let _guard = self.merge_lock.lock().await;

        let mut pieces: Vec<Bytes> = Vec::with_capacity(self.total_pieces as usize);
        for i in 0..self.total_pieces {
            let index = PieceIndex::new(i);
            match self.piece_data(index).await {
                Ok(data) => pieces.push(data),
                Err(_) => {
                    error!(piece = i, "merge aborted: piece unavailable");
                    return Err(SwarmError::IncompleteMerge { index });
                }
            }
        }

        let file_name = self.merge_file_name().await;
        let output_path = self.namespace_dir().join(&file_name);
        let total_bytes: usize = pieces.iter().map(Bytes::len).sum();

        let mut assembled = Vec::with_capacity(total_bytes);
        for data in &pieces {
            assembled.extend_from_slice(data);
        }
        fs::write(&output_path, assembled).await?;

        info!(
            peer = %self.local_peer_id,
            output = %output_path.display(),
            bytes = total_bytes,
            "merged pieces into output file"
        );
        Ok(output_path)
    }
}

/// Reads piece `index` from the source file by direct offset.
///
/// The last piece carries the file-size remainder and may be shorter
/// than the configured piece size.
async fn read_piece_at(
    source: &mut fs::File,
    file: &FileConfig,
    index: u32,
) -> Result<Bytes, SwarmError> {
    let offset = u64::from(index) * file.piece_size;
    let length = file.piece_length(index) as usize;

    source.seek(SeekFrom::Start(offset)).await?;
    let mut data = vec![0u8; length];
    source.read_exact(&mut data).await?;
    Ok(Bytes::from(data))
}
