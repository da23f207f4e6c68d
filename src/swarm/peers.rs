//! Peer roster and the periodic choking algorithm.
//!
//! The registry owns per-peer protocol state behind one lock per peer,
//! so message handlers touching unrelated peers never serialize. The
//! two choking rounds (preferred neighbors, optimistic unchoke) run on
//! independent schedules and communicate only through this state.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use rand::Rng as _;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::transport::Transport;
use super::{Bitfield, Message, PeerId, PieceIndex};

/// Network location of a peer, informational for the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddress {
    pub host: String,
    pub port: u16,
}

/// Protocol state for one known peer.
///
/// The interest/choke flags are directional: `peer_interested` and
/// `peer_choking` describe what the remote end declared, while
/// `am_interested` and `am_choking` are decisions we made about it.
#[derive(Debug, Clone)]
pub struct Peer {
    pub id: PeerId,
    pub address: PeerAddress,
    /// Peer declared possession of the complete file at registration.
    pub declared_complete: bool,
    pub bitfield: Bitfield,
    /// The peer wants pieces from us.
    pub peer_interested: bool,
    /// We want pieces from the peer.
    pub am_interested: bool,
    /// We deny the peer's requests.
    pub am_choking: bool,
    /// The peer denies our requests.
    pub peer_choking: bool,
    pub optimistically_unchoked: bool,
    /// Bytes received from this peer in the current choking round.
    pub downloaded_this_round: u64,
}

impl Peer {
    fn new(id: PeerId, address: PeerAddress, declared_complete: bool, total_pieces: u32) -> Self {
        let bitfield = if declared_complete {
            Bitfield::full(total_pieces as usize)
        } else {
            Bitfield::new(total_pieces as usize)
        };
        Self {
            id,
            address,
            declared_complete,
            bitfield,
            peer_interested: false,
            am_interested: false,
            am_choking: true,
            peer_choking: true,
            optimistically_unchoked: false,
            downloaded_this_round: 0,
        }
    }
}

/// Concurrent roster of known peers plus the choking rounds.
pub struct PeerRegistry {
    local_peer_id: PeerId,
    total_pieces: u32,
    number_of_preferred_neighbors: usize,
    root_dir: PathBuf,
    peers: RwLock<HashMap<PeerId, Arc<RwLock<Peer>>>>,
}

impl PeerRegistry {
    pub fn new(
        local_peer_id: PeerId,
        total_pieces: u32,
        number_of_preferred_neighbors: usize,
        root_dir: PathBuf,
    ) -> Self {
        Self {
            local_peer_id,
            total_pieces,
            number_of_preferred_neighbors,
            root_dir,
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a peer, replacing any previous entry for the id.
    ///
    /// The peer's storage namespace is (re)created and its bitfield
    /// sized to the session's piece count; declared-complete peers
    /// start all-ones, bypassing discovery.
    pub async fn register(&self, id: PeerId, address: PeerAddress, declared_complete: bool) {
        let namespace = self.root_dir.join(format!("peer_{id}")).join("metadata");
        if let Err(e) = tokio::fs::create_dir_all(&namespace).await {
            warn!(peer = %id, error = %e, "could not create peer namespace");
        }

        let peer = Peer::new(id.clone(), address, declared_complete, self.total_pieces);
        self.peers
            .write()
            .await
            .insert(id.clone(), Arc::new(RwLock::new(peer)));
        info!(peer = %id, declared_complete, "registered peer");
    }

    /// Looks up a peer's shared state handle.
    pub async fn peer(&self, id: &PeerId) -> Option<Arc<RwLock<Peer>>> {
        self.peers.read().await.get(id).cloned()
    }

    /// Cloned snapshot of every known peer, not a live view.
    pub async fn snapshot(&self) -> Vec<Peer> {
        let handles: Vec<Arc<RwLock<Peer>>> = self.peers.read().await.values().cloned().collect();
        let mut peers = Vec::with_capacity(handles.len());
        for handle in handles {
            peers.push(handle.read().await.clone());
        }
        peers
    }

    /// Marks `id` as possessing piece `index`.
    ///
    /// Unknown peers are ignored: stale HAVE messages about forgotten
    /// peers must not fail.
    pub async fn set_bit(&self, id: &PeerId, index: PieceIndex) {
        if let Some(handle) = self.peer(id).await {
            handle.write().await.bitfield.set(index.as_u32() as usize);
        }
    }

    /// Accumulates bytes received from `id` in the current round.
    pub async fn record_download(&self, id: &PeerId, bytes: u64) {
        if let Some(handle) = self.peer(id).await {
            handle.write().await.downloaded_this_round += bytes;
        }
    }

    /// One preferred-neighbor evaluation round.
    ///
    /// Interested peers are ranked by bytes downloaded from them this
    /// round, descending, ties broken by peer id so rounds are
    /// deterministic under test. The top `number_of_preferred_neighbors`
    /// plus any optimistically-unchoked peer end the round unchoked;
    /// everyone else ends choked. Accumulators reset afterwards.
    pub async fn run_preferred_round(&self, transport: &dyn Transport) {
        let handles: Vec<Arc<RwLock<Peer>>> = self.peers.read().await.values().cloned().collect();

        let mut ranked: Vec<(u64, PeerId)> = Vec::new();
        for handle in &handles {
            let peer = handle.read().await;
            if peer.peer_interested {
                ranked.push((peer.downloaded_this_round, peer.id.clone()));
            }
        }
        ranked.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));

        let preferred: Vec<PeerId> = ranked
            .into_iter()
            .take(self.number_of_preferred_neighbors)
            .map(|(_, id)| id)
            .collect();

        let mut outgoing: Vec<(PeerId, Message)> = Vec::new();
        for handle in &handles {
            let mut peer = handle.write().await;
            let should_unchoke =
                preferred.contains(&peer.id) || peer.optimistically_unchoked;

            if should_unchoke && peer.am_choking {
                peer.am_choking = false;
                info!(peer = %peer.id, "unchoked preferred neighbor");
                outgoing.push((peer.id.clone(), Message::unchoke(self.local_peer_id.clone())));
            } else if !should_unchoke && !peer.am_choking {
                peer.am_choking = true;
                info!(peer = %peer.id, "choked non-preferred peer");
                outgoing.push((peer.id.clone(), Message::choke(self.local_peer_id.clone())));
            }
            peer.downloaded_this_round = 0;
        }

        for (target, message) in outgoing {
            if let Err(e) = transport.send(&target, message).await {
                warn!(peer = %target, error = %e, "choke decision delivery failed");
            }
        }
    }

    /// One optimistic-unchoke round.
    ///
    /// Clears all optimistic flags, then picks one peer uniformly at
    /// random among those interested in us and currently choked, and
    /// unchokes it.
    pub async fn run_optimistic_round(&self, transport: &dyn Transport) {
        let handles: Vec<Arc<RwLock<Peer>>> = self.peers.read().await.values().cloned().collect();

        let mut candidates: Vec<Arc<RwLock<Peer>>> = Vec::new();
        for handle in &handles {
            let mut peer = handle.write().await;
            peer.optimistically_unchoked = false;
            if peer.peer_interested && peer.am_choking {
                candidates.push(handle.clone());
            }
        }

        if candidates.is_empty() {
            debug!("no optimistic unchoke candidates");
            return;
        }

        let chosen = &candidates[rand::rng().random_range(0..candidates.len())];
        let target = {
            let mut peer = chosen.write().await;
            peer.optimistically_unchoked = true;
            peer.am_choking = false;
            info!(peer = %peer.id, "optimistically unchoked");
            peer.id.clone()
        };

        let message = Message::unchoke(self.local_peer_id.clone());
        if let Err(e) = transport.send(&target, message).await {
            warn!(peer = %target, error = %e, "optimistic unchoke delivery failed");
        }
    }
}
