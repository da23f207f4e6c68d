//! Tracing setup for Flotilla
//!
//! Console logging with a user-controlled level. The engine reports
//! every recovered protocol fault through these subscribers, so the
//! outer process should install them early.

use tracing::Level;
use tracing_subscriber::{EnvFilter, fmt};

/// Initialize console tracing at the given default level.
///
/// `RUST_LOG` takes precedence over `default_level` when set, so
/// operators can raise verbosity per target without code changes.
///
/// # Errors
///
/// - Boxed error - If a global subscriber is already installed
pub fn init_tracing(
    default_level: Level,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init()?;

    tracing::info!("Tracing initialized: level={}", default_level);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_reports_error() {
        // Only one global subscriber can be installed per process
        let first = init_tracing(Level::WARN);
        assert!(first.is_ok());

        let second = init_tracing(Level::WARN);
        assert!(second.is_err());
    }
}
