//! Periodic protocol timers.
//!
//! Three independent interval tasks: the preferred-neighbor round, the
//! optimistic unchoke round, and the stale-request retry sweep. Each
//! runs until shutdown; a slow round delays only its own schedule.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::debug;

use crate::config::SwarmConfig;

use super::engine::ProtocolEngine;
use super::peers::PeerRegistry;
use super::transport::Transport;

/// Owns the background timer tasks for one session.
///
/// Aborted on shutdown or drop; the rounds themselves hold no state, so
/// aborting mid-round leaves the registry consistent.
pub struct ChokingScheduler {
    tasks: Vec<JoinHandle<()>>,
}

impl ChokingScheduler {
    /// Spawns the three timer tasks with the configured intervals.
    pub fn start(
        config: &SwarmConfig,
        registry: Arc<PeerRegistry>,
        engine: Arc<ProtocolEngine>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let mut tasks = Vec::with_capacity(3);

        let preferred_registry = Arc::clone(&registry);
        let preferred_transport = Arc::clone(&transport);
        let unchoking_interval = config.unchoking_interval;
        tasks.push(tokio::spawn(async move {
            let mut ticker = interval(floor_interval(unchoking_interval));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                debug!("running preferred neighbor round");
                preferred_registry
                    .run_preferred_round(preferred_transport.as_ref())
                    .await;
            }
        }));

        let optimistic_interval = config.optimistic_unchoking_interval;
        tasks.push(tokio::spawn(async move {
            let mut ticker = interval(floor_interval(optimistic_interval));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                debug!("running optimistic unchoke round");
                registry.run_optimistic_round(transport.as_ref()).await;
            }
        }));

        let retry_interval = config.request_timeout;
        tasks.push(tokio::spawn(async move {
            let mut ticker = interval(floor_interval(retry_interval));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                engine.retry_stale_requests().await;
            }
        }));

        Self { tasks }
    }

    /// Stops all timer tasks.
    pub fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for ChokingScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// tokio's interval panics on a zero period.
fn floor_interval(period: Duration) -> Duration {
    period.max(Duration::from_millis(1))
}
