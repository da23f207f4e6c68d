//! Piece selection policy.
//!
//! Streaming-sensitive files are fetched in order so playback can start
//! before the download completes; everything else picks at random to
//! spread load across the swarm instead of herding every leecher onto
//! the same index.

use rand::Rng as _;

use super::PieceIndex;

/// Extensions that get sequential (in-order) piece selection.
const STREAMING_EXTENSIONS: &[&str] = &["mp4", "webm", "mov"];

/// How the next piece is chosen among candidates a peer can supply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PiecePolicy {
    /// Lowest missing index first, for progressive playback.
    Sequential,
    /// Uniform random among candidates.
    Random,
}

impl PiecePolicy {
    /// Derives the policy from the shared file's name.
    pub fn for_file(file_name: &str) -> Self {
        let streaming = file_name
            .rsplit('.')
            .next()
            .is_some_and(|ext| STREAMING_EXTENSIONS.contains(&ext.to_lowercase().as_str()));
        if streaming {
            PiecePolicy::Sequential
        } else {
            PiecePolicy::Random
        }
    }

    /// Picks one piece from the candidate set, or None when empty.
    pub fn select(self, candidates: &[PieceIndex]) -> Option<PieceIndex> {
        if candidates.is_empty() {
            return None;
        }
        match self {
            PiecePolicy::Sequential => candidates.iter().min().copied(),
            PiecePolicy::Random => {
                Some(candidates[rand::rng().random_range(0..candidates.len())])
            }
        }
    }
}
