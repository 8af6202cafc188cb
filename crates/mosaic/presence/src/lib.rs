//! Liveness and population monitoring.
//!
//! Three concerns live here: the heartbeat book (who is still there),
//! arena quorum with soft-fail decisions (what to do when too many are
//! not), and AI elasticity (keeping arenas lively as humans come and
//! go). All of them sit on top of the control plane's session and
//! instance registries.

pub mod elasticity;
pub mod heartbeat;
pub mod quorum;

pub use self::elasticity::{
	AiActuator, AiElasticityMonitor, ScalingAction, ScalingRecommendation,
};
pub use self::heartbeat::HeartbeatBook;
pub use self::quorum::{
	run_quorum_worker, ArenaQuorumMonitor, QuorumAction, QuorumDecision,
};

use std::sync::Arc;
use std::time::Duration;

use mosaic_core::UnixMillis;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Probes the heartbeat book at the heartbeat interval, accumulating
/// failures for silent players.
pub fn spawn_liveness_sweep(
	book: Arc<HeartbeatBook>,
	period: Duration,
	shutdown: CancellationToken,
) -> JoinHandle<()> {
	tokio::spawn(async move {
		let mut interval = tokio::time::interval(period);
		interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
		interval.tick().await;
		loop {
			tokio::select! {
				() = shutdown.cancelled() => break,
				_ = interval.tick() => {
					book.sweep_missed(UnixMillis::now());
				}
			}
		}
	})
}

/// Periodically recomputes AI scaling for every registered arena.
pub fn spawn_elasticity_worker(
	monitor: Arc<AiElasticityMonitor>,
	shutdown: CancellationToken,
) -> JoinHandle<()> {
	let period = Duration::from_secs(monitor.config().recompute_interval_seconds);
	tokio::spawn(async move {
		let mut interval = tokio::time::interval(period);
		interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
		interval.tick().await;
		loop {
			tokio::select! {
				() = shutdown.cancelled() => break,
				_ = interval.tick() => {
					let now = UnixMillis::now();
					for arena in monitor.arenas() {
						monitor.recompute(arena, now);
					}
				}
			}
		}
	})
}
