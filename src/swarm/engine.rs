//! Message-driven protocol engine.
//!
//! One handler per inbound message kind; each mutates registry/store
//! state and emits outbound messages through the injected transport.
//! A message naming an unknown peer is a logged no-op in every handler:
//! the engine tolerates stale or late traffic about peers it has
//! forgotten. Nothing here is fatal to the process.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, error, info, warn};

use crate::config::FlotillaConfig;

use super::peers::{PeerAddress, PeerRegistry};
use super::piece_store::PieceStore;
use super::transport::Transport;
use super::{Bitfield, Message, MessageKind, PeerId, PiecePolicy, PieceIndex, SwarmError};

/// A piece request issued but not yet answered.
#[derive(Debug, Clone)]
struct PendingRequest {
    peer: PeerId,
    issued_at: Instant,
}

/// The protocol state machine coordinating piece store, peer registry,
/// and transport for one session.
pub struct ProtocolEngine {
    local_peer_id: PeerId,
    policy: PiecePolicy,
    request_batch_size: usize,
    request_timeout: Duration,
    store: Arc<PieceStore>,
    registry: Arc<PeerRegistry>,
    transport: Arc<dyn Transport>,
    /// Outstanding piece requests, keyed by index.
    pending: RwLock<HashMap<u32, PendingRequest>>,
}

impl ProtocolEngine {
    pub fn new(
        config: &FlotillaConfig,
        store: Arc<PieceStore>,
        registry: Arc<PeerRegistry>,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_peer_id: store.local_peer_id().clone(),
            policy: PiecePolicy::for_file(&config.file.file_name),
            request_batch_size: config.swarm.request_batch_size,
            request_timeout: config.swarm.request_timeout,
            store,
            registry,
            transport,
            pending: RwLock::new(HashMap::new()),
        })
    }

    /// Consumes the inbound mailbox, spawning one task per message so
    /// slow piece I/O never blocks the receive loop. Handler errors are
    /// logged, never dropped silently.
    pub async fn run(self: Arc<Self>, mut inbound: mpsc::Receiver<Message>) {
        while let Some(message) = inbound.recv().await {
            let engine = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = engine.handle_message(message).await {
                    error!(error = %e, "message handler failed");
                }
            });
        }
        info!(peer = %self.local_peer_id, "inbound channel closed, dispatch loop ending");
    }

    /// Dispatches one inbound message to its handler.
    pub async fn handle_message(&self, message: Message) -> Result<(), SwarmError> {
        let sender = message.sender_peer_id.clone();
        debug!(kind = ?message.kind, from = %sender, "inbound message");

        match message.kind {
            MessageKind::Handshake => self.handle_handshake(&sender).await,
            MessageKind::Bitfield => match message.bitfield {
                Some(encoded) => self.handle_bitfield(&sender, &encoded).await,
                None => {
                    warn!(from = %sender, "BITFIELD without payload, ignoring");
                    Ok(())
                }
            },
            MessageKind::Have => match message.piece_index {
                Some(index) => self.handle_have(&sender, index).await,
                None => {
                    warn!(from = %sender, "HAVE without piece index, ignoring");
                    Ok(())
                }
            },
            MessageKind::Interested => self.set_peer_interested(&sender, true).await,
            MessageKind::NotInterested => self.set_peer_interested(&sender, false).await,
            MessageKind::Choke => self.handle_choke(&sender).await,
            MessageKind::Unchoke => self.handle_unchoke(&sender).await,
            MessageKind::Request => match message.piece_index {
                Some(index) => self.handle_request(&sender, index).await,
                None => {
                    warn!(from = %sender, "REQUEST without piece index, ignoring");
                    Ok(())
                }
            },
            MessageKind::Piece => match message.piece_index {
                Some(index) => {
                    let data = message.data.unwrap_or_default();
                    self.handle_piece(&sender, index, data).await
                }
                None => {
                    warn!(from = %sender, "PIECE without piece index, ignoring");
                    Ok(())
                }
            },
        }
    }

    // --- outward operation surface -------------------------------------

    /// Shared handle to the peer roster, for the scheduler's rounds.
    pub fn registry_handle(&self) -> Arc<PeerRegistry> {
        Arc::clone(&self.registry)
    }

    /// Adds a peer to the roster.
    pub async fn register_peer(
        &self,
        id: PeerId,
        address: PeerAddress,
        declared_complete: bool,
    ) {
        self.registry.register(id, address, declared_complete).await;
    }

    /// Initializes the local piece store for this session.
    ///
    /// # Errors
    ///
    /// - `SwarmError::SourceFileMissing` - Declared complete without a
    ///   source file; the session continues with an empty bitfield
    pub async fn initialize_session(&self, has_complete_file: bool) -> Result<(), SwarmError> {
        self.store.initialize(has_complete_file).await
    }

    /// Snapshot of the local bitfield.
    pub async fn bitfield_snapshot(&self) -> Bitfield {
        self.store.bitfield().await
    }

    /// Locally missing piece indices, ascending.
    pub async fn missing_pieces(&self) -> Vec<PieceIndex> {
        self.store.missing_pieces().await
    }

    /// Piece bytes via the store's production paths.
    ///
    /// # Errors
    ///
    /// - `SwarmError::PieceNotFound` - No production path succeeded
    pub async fn piece_bytes(&self, index: PieceIndex) -> Result<Bytes, SwarmError> {
        self.store.piece_data(index).await
    }

    /// Whether the local session holds every piece.
    pub async fn is_complete(&self) -> bool {
        self.store.is_complete().await
    }

    /// Assembles the output file from the local pieces.
    ///
    /// # Errors
    ///
    /// - `SwarmError::IncompleteMerge` - A piece is missing
    pub async fn merge_file(&self) -> Result<std::path::PathBuf, SwarmError> {
        self.store.merge_file().await
    }

    /// Explicitly requests one piece from one peer.
    pub async fn request_piece(&self, peer: &PeerId, index: PieceIndex) -> Result<(), SwarmError> {
        self.record_pending(index, peer).await;
        self.send(peer, Message::request(self.local_peer_id.clone(), index))
            .await;
        Ok(())
    }

    /// Opens the protocol exchange with a peer: HANDSHAKE followed by
    /// our current BITFIELD.
    pub async fn send_handshake(&self, peer: &PeerId) -> Result<(), SwarmError> {
        self.send(peer, Message::handshake(self.local_peer_id.clone()))
            .await;
        let encoded = self.store.bitfield().await.to_wire();
        self.send(peer, Message::bitfield(self.local_peer_id.clone(), encoded))
            .await;
        Ok(())
    }

    // --- handlers -------------------------------------------------------

    async fn handle_handshake(&self, sender: &PeerId) -> Result<(), SwarmError> {
        if self.registry.peer(sender).await.is_none() {
            debug!(peer = %sender, "handshake from unknown peer, ignoring");
            return Ok(());
        }
        let encoded = self.store.bitfield().await.to_wire();
        self.send(sender, Message::bitfield(self.local_peer_id.clone(), encoded))
            .await;
        Ok(())
    }

    async fn handle_bitfield(&self, sender: &PeerId, encoded: &str) -> Result<(), SwarmError> {
        let Some(handle) = self.registry.peer(sender).await else {
            debug!(peer = %sender, "bitfield from unknown peer, ignoring");
            return Ok(());
        };

        let total = self.store.total_pieces() as usize;
        let mut theirs = Bitfield::from_wire(encoded, total);

        let overlap = {
            let mut peer = handle.write().await;
            // The declared flag outranks wire data claiming less
            if peer.declared_complete && !theirs.is_complete() {
                info!(
                    peer = %sender,
                    claimed = theirs.count(),
                    "declared-complete peer sent short bitfield, forcing all-ones"
                );
                theirs.set_all();
            }
            let local = self.store.bitfield().await;
            peer.bitfield = theirs;
            let overlap = peer.bitfield.held_and_missing_from(&local);
            if !overlap.is_empty() {
                peer.am_interested = true;
            }
            overlap
        };

        if overlap.is_empty() {
            self.send(sender, Message::not_interested(self.local_peer_id.clone()))
                .await;
        } else {
            debug!(peer = %sender, overlap = overlap.len(), "peer has pieces we need");
            self.send(sender, Message::interested(self.local_peer_id.clone()))
                .await;
        }
        Ok(())
    }

    async fn handle_have(&self, sender: &PeerId, index: PieceIndex) -> Result<(), SwarmError> {
        let Some(handle) = self.registry.peer(sender).await else {
            debug!(peer = %sender, "HAVE from unknown peer, ignoring");
            return Ok(());
        };

        let became_interesting = {
            let mut peer = handle.write().await;
            peer.bitfield.set(index.as_u32() as usize);
            let newly = !peer.am_interested && !self.store.has_piece(index).await;
            if newly {
                peer.am_interested = true;
            }
            newly
        };

        if became_interesting {
            self.send(sender, Message::interested(self.local_peer_id.clone()))
                .await;
        }
        Ok(())
    }

    async fn set_peer_interested(&self, sender: &PeerId, interested: bool) -> Result<(), SwarmError> {
        if let Some(handle) = self.registry.peer(sender).await {
            handle.write().await.peer_interested = interested;
        }
        Ok(())
    }

    async fn handle_choke(&self, sender: &PeerId) -> Result<(), SwarmError> {
        if let Some(handle) = self.registry.peer(sender).await {
            handle.write().await.peer_choking = true;
        }
        Ok(())
    }

    /// Being unchoked opens a request window: burst-request up to the
    /// configured batch of missing pieces the peer is known to have.
    async fn handle_unchoke(&self, sender: &PeerId) -> Result<(), SwarmError> {
        let Some(handle) = self.registry.peer(sender).await else {
            return Ok(());
        };
        handle.write().await.peer_choking = false;

        let candidates = self.candidates_from(sender).await;
        let burst: Vec<PieceIndex> = candidates.into_iter().take(self.request_batch_size).collect();
        info!(peer = %sender, count = burst.len(), "unchoked, bursting piece requests");
        for index in burst {
            self.request_piece(sender, index).await?;
        }
        Ok(())
    }

    /// Serves a piece request. A request is never refused on
    /// choke-state grounds: the requester is unchoked first, then the
    /// piece is served.
    async fn handle_request(&self, sender: &PeerId, index: PieceIndex) -> Result<(), SwarmError> {
        let Some(handle) = self.registry.peer(sender).await else {
            debug!(peer = %sender, "REQUEST from unknown peer, ignoring");
            return Ok(());
        };
        if sender == &self.local_peer_id {
            warn!("ignoring self-addressed piece request");
            return Ok(());
        }

        let was_choking = {
            let mut peer = handle.write().await;
            let was = peer.am_choking;
            peer.am_choking = false;
            was
        };
        if was_choking {
            info!(peer = %sender, "auto-unchoking requester");
            self.send(sender, Message::unchoke(self.local_peer_id.clone()))
                .await;
        }

        match self.store.piece_data(index).await {
            Ok(data) => {
                self.send(
                    sender,
                    Message::piece(self.local_peer_id.clone(), index, data),
                )
                .await;
            }
            Err(e) => {
                warn!(peer = %sender, piece = %index, error = %e, "cannot serve requested piece");
                // Liveness signal: advertise something we do hold
                let held = self.store.bitfield().await;
                if let Some(first_held) =
                    (0..held.piece_count()).find(|&i| held.has(i))
                {
                    self.send(
                        sender,
                        Message::have(
                            self.local_peer_id.clone(),
                            PieceIndex::new(first_held as u32),
                        ),
                    )
                    .await;
                }
            }
        }
        Ok(())
    }

    async fn handle_piece(
        &self,
        sender: &PeerId,
        index: PieceIndex,
        data: Bytes,
    ) -> Result<(), SwarmError> {
        if self.registry.peer(sender).await.is_none() {
            debug!(peer = %sender, "PIECE from unknown peer, ignoring");
            return Ok(());
        }

        if data.is_empty() {
            warn!(peer = %sender, piece = %index, "empty piece payload, re-requesting");
            self.request_piece(sender, index).await?;
            self.request_next_from(sender, Some(index)).await;
            return Ok(());
        }

        let size = data.len() as u64;
        match self.store.receive_piece(index, data).await {
            Ok(()) => {}
            Err(e) => {
                warn!(peer = %sender, piece = %index, error = %e, "could not store piece");
                return Ok(());
            }
        }

        self.registry.record_download(sender, size).await;
        self.clear_pending(index).await;

        // Every known peer learns we now hold this piece, the sender
        // included: the uploader tracks our availability the same way
        // everyone else does.
        let have = Message::have(self.local_peer_id.clone(), index);
        for peer in self.registry.snapshot().await {
            if peer.id != self.local_peer_id {
                self.send(&peer.id, have.clone()).await;
            }
        }

        if self.store.is_complete().await {
            info!(peer = %self.local_peer_id, "download complete, assembling file");
            if let Err(e) = self.store.merge_file().await {
                error!(error = %e, "merge after completion failed");
            }
            return Ok(());
        }

        // Keep the pipeline moving: the sender first, then every other
        // peer that has unchoked us and holds something we need.
        self.request_next_from(sender, None).await;
        for peer in self.registry.snapshot().await {
            if peer.id != *sender && !peer.peer_choking && !peer.bitfield.is_empty() {
                self.request_next_from(&peer.id, None).await;
            }
        }
        Ok(())
    }

    // --- piece request plumbing ----------------------------------------

    /// Missing pieces this peer can supply, by bitfield intersection.
    /// Declared-complete peers count as holding everything.
    async fn candidates_from(&self, peer_id: &PeerId) -> Vec<PieceIndex> {
        let Some(handle) = self.registry.peer(peer_id).await else {
            return Vec::new();
        };
        let missing = self.store.missing_pieces().await;
        let peer = handle.read().await;
        missing
            .into_iter()
            .filter(|index| {
                peer.declared_complete || peer.bitfield.has(index.as_u32() as usize)
            })
            .collect()
    }

    /// Requests one more piece from `peer_id` under the selection
    /// policy, excluding `skip`. When the peer is choking us, declares
    /// interest instead so a future unchoke opens the window.
    async fn request_next_from(&self, peer_id: &PeerId, skip: Option<PieceIndex>) {
        let Some(handle) = self.registry.peer(peer_id).await else {
            return;
        };

        let choking_us = handle.read().await.peer_choking;
        if choking_us {
            debug!(peer = %peer_id, "peer is choking us, declaring interest");
            handle.write().await.am_interested = true;
            self.send(peer_id, Message::interested(self.local_peer_id.clone()))
                .await;
            return;
        }

        let mut candidates = self.candidates_from(peer_id).await;
        if let Some(skip) = skip {
            candidates.retain(|&c| c != skip);
        }

        match self.policy.select(&candidates) {
            Some(index) => {
                self.record_pending(index, peer_id).await;
                self.send(peer_id, Message::request(self.local_peer_id.clone(), index))
                    .await;
            }
            None => {
                let declared_complete = handle.read().await.declared_complete;
                // A seeder will grow no new pieces; stay interested in it
                if !declared_complete {
                    handle.write().await.am_interested = false;
                    self.send(
                        peer_id,
                        Message::not_interested(self.local_peer_id.clone()),
                    )
                    .await;
                }
            }
        }
    }

    async fn record_pending(&self, index: PieceIndex, peer: &PeerId) {
        self.pending.write().await.insert(
            index.as_u32(),
            PendingRequest {
                peer: peer.clone(),
                issued_at: Instant::now(),
            },
        );
    }

    async fn clear_pending(&self, index: PieceIndex) {
        self.pending.write().await.remove(&index.as_u32());
    }

    /// Re-issues requests for pieces pending longer than the timeout.
    ///
    /// Prefers a peer that currently has the piece and is not choking
    /// us; falls back to the original target. Bounded per call by the
    /// request batch size.
    pub async fn retry_stale_requests(&self) {
        let now = Instant::now();
        let stale: Vec<(u32, PeerId)> = {
            let pending = self.pending.read().await;
            pending
                .iter()
                .filter(|(_, req)| now.duration_since(req.issued_at) >= self.request_timeout)
                .map(|(&index, req)| (index, req.peer.clone()))
                .take(self.request_batch_size)
                .collect()
        };

        for (raw_index, original) in stale {
            let index = PieceIndex::new(raw_index);
            if self.store.has_piece(index).await {
                self.clear_pending(index).await;
                continue;
            }

            let mut target = original;
            for peer in self.registry.snapshot().await {
                if !peer.peer_choking
                    && (peer.declared_complete || peer.bitfield.has(raw_index as usize))
                {
                    target = peer.id;
                    break;
                }
            }

            info!(piece = %index, peer = %target, "re-requesting stale piece");
            self.record_pending(index, &target).await;
            self.send(&target, Message::request(self.local_peer_id.clone(), index))
                .await;
        }
    }

    /// Best-effort send; delivery failures degrade that message only.
    async fn send(&self, target: &PeerId, message: Message) {
        if let Err(e) = self.transport.send(target, message).await {
            warn!(peer = %target, error = %e, "outbound delivery failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swarm::test_support::{engine_fixture, EngineFixture};

    #[tokio::test]
    async fn test_handshake_replies_with_local_bitfield() {
        let EngineFixture { engine, transport, dir: _dir, .. } = engine_fixture(3000, 1000, false).await;
        engine
            .register_peer(PeerId::new("P"), test_addr(), false)
            .await;

        engine
            .handle_message(Message::handshake(PeerId::new("P")))
            .await
            .unwrap();

        let sent = transport.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1.kind, MessageKind::Bitfield);
        assert_eq!(sent[0].1.bitfield.as_deref(), Some("000"));
    }

    #[tokio::test]
    async fn test_unknown_peer_messages_are_noops() {
        let EngineFixture { engine, transport, dir: _dir, .. } = engine_fixture(3000, 1000, false).await;

        for message in [
            Message::handshake(PeerId::new("ghost")),
            Message::have(PeerId::new("ghost"), PieceIndex::new(0)),
            Message::bitfield(PeerId::new("ghost"), "111".to_string()),
            Message::request(PeerId::new("ghost"), PieceIndex::new(0)),
            Message::piece(PeerId::new("ghost"), PieceIndex::new(0), Bytes::from_static(b"x")),
        ] {
            engine.handle_message(message).await.unwrap();
        }

        assert!(transport.sent().await.is_empty());
    }

    #[tokio::test]
    async fn test_bitfield_with_no_overlap_sends_not_interested() {
        let EngineFixture { engine, transport, dir: _dir, .. } = engine_fixture(3000, 1000, false).await;
        engine
            .register_peer(PeerId::new("P"), test_addr(), false)
            .await;

        engine
            .handle_message(Message::bitfield(PeerId::new("P"), "000".to_string()))
            .await
            .unwrap();

        let sent = transport.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1.kind, MessageKind::NotInterested);

        let peer = engine.registry.peer(&PeerId::new("P")).await.unwrap();
        assert!(!peer.read().await.am_interested);
    }

    #[tokio::test]
    async fn test_bitfield_with_overlap_sends_interested() {
        let EngineFixture { engine, transport, dir: _dir, .. } = engine_fixture(3000, 1000, false).await;
        engine
            .register_peer(PeerId::new("P"), test_addr(), false)
            .await;

        engine
            .handle_message(Message::bitfield(PeerId::new("P"), "010".to_string()))
            .await
            .unwrap();

        let sent = transport.sent().await;
        assert_eq!(sent[0].1.kind, MessageKind::Interested);

        let peer = engine.registry.peer(&PeerId::new("P")).await.unwrap();
        let peer = peer.read().await;
        assert!(peer.am_interested);
        assert!(peer.bitfield.has(1));
    }

    #[tokio::test]
    async fn test_declared_complete_peer_short_bitfield_forced_full() {
        let EngineFixture { engine, dir: _dir, .. } = engine_fixture(3000, 1000, false).await;
        engine
            .register_peer(PeerId::new("seed"), test_addr(), true)
            .await;

        engine
            .handle_message(Message::bitfield(PeerId::new("seed"), "100".to_string()))
            .await
            .unwrap();

        let peer = engine.registry.peer(&PeerId::new("seed")).await.unwrap();
        assert!(peer.read().await.bitfield.is_complete());
    }

    #[tokio::test]
    async fn test_have_creating_overlap_triggers_interested() {
        let EngineFixture { engine, transport, dir: _dir, .. } = engine_fixture(3000, 1000, false).await;
        engine
            .register_peer(PeerId::new("P"), test_addr(), false)
            .await;

        engine
            .handle_message(Message::have(PeerId::new("P"), PieceIndex::new(2)))
            .await
            .unwrap();

        let sent = transport.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1.kind, MessageKind::Interested);

        // A second HAVE does not repeat the declaration
        engine
            .handle_message(Message::have(PeerId::new("P"), PieceIndex::new(1)))
            .await
            .unwrap();
        assert_eq!(transport.sent().await.len(), 1);
    }

    #[tokio::test]
    async fn test_interested_flags_follow_messages() {
        let EngineFixture { engine, dir: _dir, .. } = engine_fixture(3000, 1000, false).await;
        engine
            .register_peer(PeerId::new("P"), test_addr(), false)
            .await;
        let handle = engine.registry.peer(&PeerId::new("P")).await.unwrap();

        engine
            .handle_message(Message::interested(PeerId::new("P")))
            .await
            .unwrap();
        assert!(handle.read().await.peer_interested);

        engine
            .handle_message(Message::not_interested(PeerId::new("P")))
            .await
            .unwrap();
        assert!(!handle.read().await.peer_interested);
    }

    #[tokio::test]
    async fn test_unchoke_bursts_requests_for_pieces_peer_holds() {
        let EngineFixture { engine, transport, dir: _dir, .. } = engine_fixture(5000, 1000, false).await;
        engine
            .register_peer(PeerId::new("P"), test_addr(), false)
            .await;
        engine
            .handle_message(Message::bitfield(PeerId::new("P"), "11010".to_string()))
            .await
            .unwrap();
        transport.clear().await;

        engine
            .handle_message(Message::unchoke(PeerId::new("P")))
            .await
            .unwrap();

        let sent = transport.sent().await;
        let requested: Vec<u32> = sent
            .iter()
            .filter(|(_, m)| m.kind == MessageKind::Request)
            .map(|(_, m)| m.piece_index.unwrap().as_u32())
            .collect();
        // Only pieces the peer holds: 0, 1, 3
        assert_eq!(requested.len(), 3);
        for index in requested {
            assert!([0, 1, 3].contains(&index));
        }
    }

    #[tokio::test]
    async fn test_request_auto_unchokes_and_serves_piece() {
        let EngineFixture { engine, transport, dir: _dir, .. } = engine_fixture(2500, 1000, true).await;
        engine
            .register_peer(PeerId::new("P"), test_addr(), false)
            .await;

        engine
            .handle_message(Message::request(PeerId::new("P"), PieceIndex::new(2)))
            .await
            .unwrap();

        let peer = engine.registry.peer(&PeerId::new("P")).await.unwrap();
        assert!(!peer.read().await.am_choking, "requester must end unchoked");

        let sent = transport.sent().await;
        let kinds: Vec<MessageKind> = sent.iter().map(|(_, m)| m.kind).collect();
        assert_eq!(kinds, vec![MessageKind::Unchoke, MessageKind::Piece]);
        assert_eq!(sent[1].1.data.as_ref().unwrap().len(), 500);
    }

    #[tokio::test]
    async fn test_unservable_request_falls_back_to_have_signal() {
        let EngineFixture { engine, transport, store, dir: _dir, .. } =
            engine_fixture(3000, 1000, false).await;
        engine
            .register_peer(PeerId::new("P"), test_addr(), false)
            .await;
        store
            .receive_piece(PieceIndex::new(1), Bytes::from_static(b"held"))
            .await
            .unwrap();

        engine
            .handle_message(Message::request(PeerId::new("P"), PieceIndex::new(0)))
            .await
            .unwrap();

        let sent = transport.sent().await;
        let have = sent.iter().find(|(_, m)| m.kind == MessageKind::Have);
        assert_eq!(have.unwrap().1.piece_index, Some(PieceIndex::new(1)));
    }

    #[tokio::test]
    async fn test_empty_piece_triggers_rerequest_not_storage() {
        let EngineFixture { engine, transport, store, dir: _dir, .. } =
            engine_fixture(3000, 1000, false).await;
        engine
            .register_peer(PeerId::new("P"), test_addr(), false)
            .await;

        engine
            .handle_message(Message::piece(PeerId::new("P"), PieceIndex::new(1), Bytes::new()))
            .await
            .unwrap();

        assert!(!store.has_piece(PieceIndex::new(1)).await);
        let sent = transport.sent().await;
        let rerequested = sent
            .iter()
            .any(|(id, m)| id.as_str() == "P"
                && m.kind == MessageKind::Request
                && m.piece_index == Some(PieceIndex::new(1)));
        assert!(rerequested, "empty payload must re-request the same piece");
    }

    #[tokio::test]
    async fn test_received_piece_is_stored_and_have_broadcast() {
        let EngineFixture { engine, transport, store, dir: _dir, .. } =
            engine_fixture(3000, 1000, false).await;
        engine
            .register_peer(PeerId::new("P"), test_addr(), false)
            .await;
        engine
            .register_peer(PeerId::new("Q"), test_addr(), false)
            .await;
        transport.clear().await;

        engine
            .handle_message(Message::piece(
                PeerId::new("P"),
                PieceIndex::new(0),
                Bytes::from_static(b"chunk"),
            ))
            .await
            .unwrap();

        assert!(store.has_piece(PieceIndex::new(0)).await);

        let sent = transport.sent().await;
        let mut have_targets: Vec<&str> = sent
            .iter()
            .filter(|(_, m)| m.kind == MessageKind::Have)
            .map(|(id, _)| id.as_str())
            .collect();
        have_targets.sort_unstable();
        assert_eq!(
            have_targets,
            vec!["P", "Q"],
            "HAVE goes to every peer, the sender included"
        );

        let peer = engine.registry.peer(&PeerId::new("P")).await.unwrap();
        assert_eq!(peer.read().await.downloaded_this_round, 5);
    }

    #[tokio::test]
    async fn test_stale_requests_are_reissued() {
        let EngineFixture { engine, transport, dir: _dir, .. } = engine_fixture(3000, 1000, false).await;
        engine
            .register_peer(PeerId::new("P"), test_addr(), false)
            .await;

        engine
            .request_piece(&PeerId::new("P"), PieceIndex::new(2))
            .await
            .unwrap();
        transport.clear().await;

        // Fixture timeout is zero, so the request is immediately stale
        engine.retry_stale_requests().await;

        let sent = transport.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1.kind, MessageKind::Request);
        assert_eq!(sent[0].1.piece_index, Some(PieceIndex::new(2)));
    }

    #[tokio::test]
    async fn test_fixture_storage_root_outlives_the_test_body() {
        let EngineFixture { engine, store, dir, .. } = engine_fixture(2000, 1000, false).await;
        engine
            .register_peer(PeerId::new("P"), test_addr(), false)
            .await;

        // The root must still exist here, and pieces must land in it
        assert!(dir.path().exists());
        engine
            .handle_message(Message::piece(
                PeerId::new("P"),
                PieceIndex::new(0),
                Bytes::from_static(b"persisted"),
            ))
            .await
            .unwrap();

        let on_disk = dir.path().join("peer_L").join("piece_0");
        assert!(on_disk.exists(), "piece file must persist under the fixture root");
        assert!(store.has_piece(PieceIndex::new(0)).await);
    }

    fn test_addr() -> PeerAddress {
        PeerAddress {
            host: "localhost".to_string(),
            port: 6881,
        }
    }
}
