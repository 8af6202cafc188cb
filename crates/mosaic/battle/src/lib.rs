//! Battle execution: the per-battle tick worker and its replay.
//!
//! Each active battle owns one single-threaded worker driving the tick
//! loop. The worker buffers placement attempts between ticks, resolves
//! them deterministically, broadcasts the accepted batch, records the
//! replay and watches the end conditions. Everything it needs from the
//! outside comes in through channels and the broadcast seam.

pub mod replay;
pub mod tick;

pub use self::replay::{
	InMemoryReplayStorage, ReplayError, ReplayStorage, ReplayStorageError, ReplaySummary,
	ReplayWriter,
};
pub use self::tick::{EndReason, PlacementAttempt, TickEngine, TickReport};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mosaic_control::store::Metrics;
use mosaic_core::config::BattleConfig;
use mosaic_core::messages::session::Clientbound;
use mosaic_core::{CharacterId, InstanceId, UnixMillis};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Seam to the transport fan-out for one battle.
pub trait BattleBroadcast: Send + Sync {
	/// To every participant, in tick order.
	fn broadcast(&self, instance: InstanceId, message: Clientbound);
	/// To one participant.
	fn send_to(&self, character: CharacterId, message: Clientbound);
}

/// Control inputs a running battle accepts.
#[derive(Debug, Clone, Copy)]
pub enum BattleControl {
	/// Halt tick advancement, preserve state.
	Pause,
	Resume,
	/// End now with the given outcome.
	Abort { reason: EndReason },
}

fn player_bucket(count: usize) -> &'static str {
	match count {
		0..=4 => "0-4",
		5..=8 => "5-8",
		9..=16 => "9-16",
		_ => "17+",
	}
}

/// The per-battle worker. Runs until an end condition, an abort command
/// or process shutdown, then seals the replay and reports the outcome.
#[allow(clippy::too_many_arguments)]
pub async fn run_battle_worker(
	cfg: BattleConfig,
	mut engine: TickEngine,
	mut attempts_rx: mpsc::UnboundedReceiver<PlacementAttempt>,
	mut control_rx: mpsc::UnboundedReceiver<BattleControl>,
	population: Arc<AtomicUsize>,
	broadcast: Arc<dyn BattleBroadcast>,
	replay: Arc<ReplayWriter>,
	metrics: Arc<dyn Metrics>,
	resolved_tx: mpsc::UnboundedSender<(InstanceId, EndReason)>,
	shutdown: CancellationToken,
) {
	let instance_id = engine.instance_id();
	let started_at = UnixMillis::now();
	if let Err(err) = replay.append("battle_started", None, serde_json::json!({}), started_at) {
		warn!(battle = %instance_id, %err, "failed to record battle start");
	}
	broadcast.broadcast(
		instance_id,
		Clientbound::BattleStarted { instance_id, tick_period_ms: cfg.tick_period_ms },
	);

	let mut interval = tokio::time::interval(Duration::from_millis(cfg.tick_period_ms));
	interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
	interval.tick().await;
	let mut paused = false;
	let mut pending: Vec<PlacementAttempt> = Vec::new();

	let end_reason = loop {
		tokio::select! {
			() = shutdown.cancelled() => break EndReason::Shutdown,
			Some(control) = control_rx.recv() => match control {
				BattleControl::Pause => {
					paused = true;
					info!(battle = %instance_id, "battle paused");
				}
				BattleControl::Resume => {
					paused = false;
					info!(battle = %instance_id, "battle resumed");
				}
				BattleControl::Abort { reason } => break reason,
			},
			Some(attempt) = attempts_rx.recv() => pending.push(attempt),
			_ = interval.tick() => {
				if paused {
					continue;
				}
				let now = UnixMillis::now();
				let tick_start = std::time::Instant::now();
				let report = engine.resolve_tick(std::mem::take(&mut pending));

				for placement in &report.accepted {
					let record = replay.append(
						"tile_placed",
						Some(placement.character_id),
						serde_json::json!({
							"x": placement.x,
							"y": placement.y,
							"sequence": placement.sequence,
							"tick": report.tick,
						}),
						now,
					);
					if let Err(err) = record {
						warn!(battle = %instance_id, %err, "replay append failed");
					}
				}
				for (attempt, reason) in &report.rejected {
					broadcast.send_to(
						attempt.character_id,
						Clientbound::TileRejected {
							x: attempt.x,
							y: attempt.y,
							sequence: attempt.sequence,
							reason: *reason,
						},
					);
				}
				if !report.accepted.is_empty() {
					broadcast.broadcast(
						instance_id,
						Clientbound::TilesUpdated {
							tick: report.tick,
							placements: report.accepted.clone(),
							conflicts_resolved: report.conflicts_resolved,
						},
					);
				}
				let _ = replay.maybe_flush(now);

				let players = population.load(Ordering::Relaxed);
				metrics.histogram_ms(
					"battle_tick_duration_ms",
					&[("players", player_bucket(players))],
					tick_start.elapsed().as_millis() as u64,
				);

				if now.saturating_since(started_at) >= cfg.time_limit_seconds * 1000 {
					break EndReason::Timeout;
				}
				if players == 0 {
					break EndReason::Empty;
				}
			}
		}
	};

	// Terminal: freeze the map, seal the replay, tell everyone.
	let now = UnixMillis::now();
	let _ = replay.append(
		"battle_ended",
		None,
		serde_json::json!({"outcome": end_reason.as_str(), "tiles": engine.tiles_placed()}),
		now,
	);
	if let Err(err) = replay.finalize(now) {
		warn!(battle = %instance_id, %err, "replay finalize failed");
	}
	broadcast.broadcast(
		instance_id,
		Clientbound::BattleResolved { outcome: end_reason.as_str().to_owned() },
	);
	info!(battle = %instance_id, outcome = end_reason.as_str(), "battle ended");
	let _ = resolved_tx.send((instance_id, end_reason));
}

#[cfg(test)]
mod test {
	use super::*;
	use mosaic_control::store::NoopMetrics;
	use mosaic_core::config::ReplayConfig;
	use parking_lot::Mutex;

	#[derive(Default)]
	struct RecordingBroadcast {
		broadcasts: Mutex<Vec<Clientbound>>,
		direct: Mutex<Vec<(CharacterId, Clientbound)>>,
	}

	impl BattleBroadcast for RecordingBroadcast {
		fn broadcast(&self, _instance: InstanceId, message: Clientbound) {
			self.broadcasts.lock().push(message);
		}

		fn send_to(&self, character: CharacterId, message: Clientbound) {
			self.direct.lock().push((character, message));
		}
	}

	#[tokio::test(start_paused = true)]
	async fn ticks_batch_broadcast_and_seal_on_abort() {
		let instance = InstanceId::random();
		let storage = Arc::new(InMemoryReplayStorage::default());
		let replay = Arc::new(ReplayWriter::new(
			ReplayConfig::default(),
			instance,
			None,
			storage.clone(),
			UnixMillis::now(),
		));
		let broadcast = Arc::new(RecordingBroadcast::default());
		let (attempts_tx, attempts_rx) = mpsc::unbounded_channel();
		let (control_tx, control_rx) = mpsc::unbounded_channel();
		let (resolved_tx, mut resolved_rx) = mpsc::unbounded_channel();
		let population = Arc::new(AtomicUsize::new(2));
		let shutdown = CancellationToken::new();

		let worker = tokio::spawn(run_battle_worker(
			BattleConfig::default(),
			TickEngine::new(instance),
			attempts_rx,
			control_rx,
			population,
			broadcast.clone(),
			replay,
			Arc::new(NoopMetrics),
			resolved_tx,
			shutdown.clone(),
		));

		let (a, b) = (CharacterId::random(), CharacterId::random());
		attempts_tx
			.send(PlacementAttempt {
				character_id: a,
				x: 1,
				y: 1,
				sequence: 1,
				timestamp: UnixMillis(100),
			})
			.unwrap();
		attempts_tx
			.send(PlacementAttempt {
				character_id: b,
				x: 1,
				y: 1,
				sequence: 1,
				timestamp: UnixMillis(101),
			})
			.unwrap();

		// Let one tick elapse.
		tokio::time::sleep(Duration::from_millis(1_100)).await;
		{
			let broadcasts = broadcast.broadcasts.lock();
			assert!(matches!(broadcasts[0], Clientbound::BattleStarted { .. }));
			let tiles = broadcasts
				.iter()
				.find_map(|m| match m {
					Clientbound::TilesUpdated { tick, placements, conflicts_resolved } => {
						Some((*tick, placements.clone(), *conflicts_resolved))
					}
					_ => None,
				})
				.expect("tick batch broadcast");
			assert_eq!(tiles.0, 1);
			assert_eq!(tiles.1.len(), 1);
			assert_eq!(tiles.1[0].character_id, a);
			assert_eq!(tiles.2, 1);
		}
		// The loser got a direct conflict rejection.
		assert!(broadcast
			.direct
			.lock()
			.iter()
			.any(|(character, _)| *character == b));

		control_tx
			.send(BattleControl::Abort { reason: EndReason::QuorumLost })
			.unwrap();
		let (ended, reason) = resolved_rx.recv().await.unwrap();
		assert_eq!(ended, instance);
		assert_eq!(reason, EndReason::QuorumLost);
		worker.await.unwrap();

		// Replay sealed with gap-free sequences.
		let events = storage.events(instance);
		let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
		assert_eq!(seqs, (1..=events.len() as u64).collect::<Vec<_>>());
		assert_eq!(events.first().unwrap().event_type, "battle_started");
		assert_eq!(events.last().unwrap().event_type, "battle_ended");
		assert!(storage.summary(instance).is_some());
	}

	#[tokio::test(start_paused = true)]
	async fn empty_battle_resolves_empty() {
		let instance = InstanceId::random();
		let storage = Arc::new(InMemoryReplayStorage::default());
		let replay = Arc::new(ReplayWriter::new(
			ReplayConfig::default(),
			instance,
			None,
			storage,
			UnixMillis::now(),
		));
		let (_attempts_tx, attempts_rx) = mpsc::unbounded_channel();
		let (_control_tx, control_rx) = mpsc::unbounded_channel();
		let (resolved_tx, mut resolved_rx) = mpsc::unbounded_channel();
		let shutdown = CancellationToken::new();

		tokio::spawn(run_battle_worker(
			BattleConfig::default(),
			TickEngine::new(instance),
			attempts_rx,
			control_rx,
			Arc::new(AtomicUsize::new(0)),
			Arc::new(RecordingBroadcast::default()),
			replay,
			Arc::new(NoopMetrics),
			resolved_tx,
			shutdown,
		));

		tokio::time::sleep(Duration::from_millis(1_100)).await;
		let (_, reason) = resolved_rx.recv().await.unwrap();
		assert_eq!(reason, EndReason::Empty);
	}
}
