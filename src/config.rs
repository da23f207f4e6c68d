//! Centralized configuration for Flotilla.
//!
//! All tunable parameters are defined here to avoid hard-coded values
//! scattered throughout the codebase.

use std::path::PathBuf;
use std::time::Duration;

/// Central configuration for all Flotilla components.
///
/// Groups related settings into logical sections and supports
/// environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct FlotillaConfig {
    pub swarm: SwarmConfig,
    pub file: FileConfig,
    pub storage: StorageConfig,
}

/// Choking algorithm and piece request parameters.
#[derive(Debug, Clone)]
pub struct SwarmConfig {
    /// Number of preferred neighbors unchoked each evaluation round
    pub number_of_preferred_neighbors: usize,
    /// Interval between preferred-neighbor evaluations
    pub unchoking_interval: Duration,
    /// Interval between optimistic unchoke selections
    pub optimistic_unchoking_interval: Duration,
    /// Maximum pieces requested in one burst after an unchoke
    pub request_batch_size: usize,
    /// Time after which an unanswered piece request is re-issued
    pub request_timeout: Duration,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            number_of_preferred_neighbors: 3,
            unchoking_interval: Duration::from_secs(10),
            optimistic_unchoking_interval: Duration::from_secs(30),
            request_batch_size: 10,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Shared file geometry for the session.
///
/// Total piece count is derived once from file size and piece size and
/// stays fixed for the session's lifetime.
#[derive(Debug, Clone)]
pub struct FileConfig {
    /// Name of the distributed file (also the merge output name)
    pub file_name: String,
    /// Total file size in bytes
    pub file_size: u64,
    /// Piece size in bytes (last piece may be shorter)
    pub piece_size: u64,
}

impl FileConfig {
    /// Number of pieces the file divides into.
    pub fn total_pieces(&self) -> u32 {
        if self.file_size == 0 || self.piece_size == 0 {
            return 0;
        }
        self.file_size.div_ceil(self.piece_size) as u32
    }

    /// Size of the piece at `index`, accounting for the file-size remainder.
    pub fn piece_length(&self, index: u32) -> u64 {
        let offset = u64::from(index) * self.piece_size;
        self.piece_size.min(self.file_size.saturating_sub(offset))
    }
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            file_name: "shared.dat".to_string(),
            file_size: 0,
            piece_size: 32768, // 32 KiB
        }
    }
}

/// Piece persistence configuration.
///
/// Each peer identity gets one namespace directory under the root,
/// holding piece files, a metadata subdirectory, and the merged output.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Directory under which peer namespaces are created
    pub root_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("."),
        }
    }
}

impl FlotillaConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Allows runtime configuration via environment variables while
    /// maintaining sensible defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(count) = std::env::var("FLOTILLA_PREFERRED_NEIGHBORS") {
            if let Ok(n) = count.parse::<usize>() {
                config.swarm.number_of_preferred_neighbors = n;
            }
        }

        if let Ok(interval) = std::env::var("FLOTILLA_UNCHOKING_INTERVAL") {
            if let Ok(seconds) = interval.parse::<u64>() {
                config.swarm.unchoking_interval = Duration::from_secs(seconds);
            }
        }

        if let Ok(interval) = std::env::var("FLOTILLA_OPTIMISTIC_INTERVAL") {
            if let Ok(seconds) = interval.parse::<u64>() {
                config.swarm.optimistic_unchoking_interval = Duration::from_secs(seconds);
            }
        }

        if let Ok(size) = std::env::var("FLOTILLA_PIECE_SIZE") {
            if let Ok(bytes) = size.parse::<u64>() {
                config.file.piece_size = bytes;
            }
        }

        if let Ok(dir) = std::env::var("FLOTILLA_ROOT_DIR") {
            config.storage.root_dir = PathBuf::from(dir);
        }

        config
    }

    /// Creates a configuration optimized for testing.
    ///
    /// Short intervals so choking rounds fire quickly under test.
    pub fn for_testing() -> Self {
        Self {
            swarm: SwarmConfig {
                number_of_preferred_neighbors: 2,
                unchoking_interval: Duration::from_millis(50),
                optimistic_unchoking_interval: Duration::from_millis(120),
                request_batch_size: 10,
                request_timeout: Duration::from_millis(200),
            },
            ..Default::default()
        }
    }
}


#[cfg(test)]
mod property_tests {
    use proptest::prelude::*;

    use super::*;

    proptest! {
        #[test]
        fn piece_lengths_sum_to_file_size(
            file_size in 0u64..1_000_000,
            piece_size in 1u64..10_000,
        ) {
            let file = FileConfig {
                file_name: "f.dat".to_string(),
                file_size,
                piece_size,
            };
            let sum: u64 = (0..file.total_pieces()).map(|i| file.piece_length(i)).sum();
            prop_assert_eq!(sum, file_size);
        }

        #[test]
        fn only_the_last_piece_is_short(
            file_size in 1u64..1_000_000,
            piece_size in 1u64..10_000,
        ) {
            let file = FileConfig {
                file_name: "f.dat".to_string(),
                file_size,
                piece_size,
            };
            let total = file.total_pieces();
            for index in 0..total.saturating_sub(1) {
                prop_assert_eq!(file.piece_length(index), piece_size);
            }
            prop_assert!(file.piece_length(total - 1) >= 1);
        }
    }
}
