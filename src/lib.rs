//! Flotilla - peer-to-peer file distribution engine
//!
//! This crate provides the protocol core for a BitTorrent-style swarm:
//! a piece store with bitfield tracking, a peer registry running the
//! periodic choking algorithm, and a message-driven protocol engine
//! that drives piece acquisition to completion over an injected
//! transport.

pub mod config;
pub mod swarm;
pub mod tracing_setup;

// Re-export main types for convenient access
pub use config::FlotillaConfig;
pub use swarm::{PeerId, PieceIndex, ProtocolEngine, SwarmError};

/// Core errors that can bubble up from any Flotilla subsystem.
#[derive(Debug, thiserror::Error)]
pub enum FlotillaError {
    #[error("Swarm error: {0}")]
    Swarm(#[from] SwarmError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FlotillaError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            FlotillaError::Swarm(e) => match e {
                SwarmError::PieceNotFound { index } => {
                    format!("Piece {index} is not available")
                }
                SwarmError::PeerNotFound { peer_id } => {
                    format!("Peer {peer_id} is not registered")
                }
                SwarmError::SourceFileMissing { path } => {
                    format!("Source file not found: {path}")
                }
                SwarmError::IncompleteMerge { index } => {
                    format!("Cannot assemble file: piece {index} is missing")
                }
                _ => "Transfer error occurred".to_string(),
            },
            FlotillaError::Configuration { .. } => "Configuration error occurred".to_string(),
            FlotillaError::Io(_) => "File system error occurred".to_string(),
        }
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        matches!(self, FlotillaError::Configuration { .. })
    }
}

pub type Result<T> = std::result::Result<T, FlotillaError>;
