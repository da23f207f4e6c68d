//! Swarm protocol implementation: piece store, peer registry, and the
//! message-driven engine coordinating them.

pub mod bitfield;
pub mod engine;
pub mod message;
pub mod peers;
pub mod picker;
pub mod piece_store;
pub mod scheduler;
pub mod transport;

#[cfg(test)]
pub mod test_support;


use std::fmt;

pub use bitfield::Bitfield;
pub use engine::ProtocolEngine;
pub use message::{Message, MessageKind};
pub use peers::{Peer, PeerAddress, PeerRegistry};
pub use picker::PiecePolicy;
pub use piece_store::PieceStore;
pub use scheduler::ChokingScheduler;
pub use transport::{ChannelTransport, Transport};

/// Opaque identifier of a peer in the swarm.
///
/// Assigned at registration and used to address protocol messages.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct PeerId(String);

impl PeerId {
    /// Creates a PeerId from any string-like identity.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Zero-based index of a piece within the shared file.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct PieceIndex(pub u32);

impl PieceIndex {
    /// Creates PieceIndex from zero-based index.
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the underlying piece index as u32.
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for PieceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors that can occur during swarm operations.
///
/// Everything except `IncompleteMerge` and `PieceNotFound` is recovered
/// locally by the engine with a policy-specific fallback; nothing here
/// is fatal to the process.
#[derive(Debug, thiserror::Error)]
pub enum SwarmError {
    #[error("Piece {index} not found")]
    PieceNotFound { index: PieceIndex },

    #[error("Peer {peer_id} not found")]
    PeerNotFound { peer_id: PeerId },

    #[error("Empty payload for piece {index}")]
    EmptyPiece { index: PieceIndex },

    #[error("Source file missing: {path}")]
    SourceFileMissing { path: String },

    #[error("Merge aborted: piece {index} is missing")]
    IncompleteMerge { index: PieceIndex },

    #[error("Transport closed for peer {peer_id}")]
    TransportClosed { peer_id: PeerId },

    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_display() {
        let id = PeerId::new("1001");
        assert_eq!(id.to_string(), "1001");
        assert_eq!(id.as_str(), "1001");
    }

    #[test]
    fn test_piece_index_ordering() {
        let piece1 = PieceIndex::new(5);
        let piece2 = PieceIndex::new(10);
        assert!(piece1 < piece2);
        assert_eq!(piece1.as_u32(), 5);
    }

    #[test]
    fn test_error_messages_name_the_subject() {
        let err = SwarmError::PieceNotFound {
            index: PieceIndex::new(7),
        };
        assert_eq!(err.to_string(), "Piece 7 not found");

        let err = SwarmError::IncompleteMerge {
            index: PieceIndex::new(3),
        };
        assert!(err.to_string().contains("piece 3"));
    }
}
