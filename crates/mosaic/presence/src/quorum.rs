//! Arena quorum evaluation and the soft-fail decision.
//!
//! The decision is a pure function of `(total, responsive, streak)` and
//! the configured thresholds, evaluated strictly top to bottom, so it is
//! trivially table-testable. The per-arena worker adds the streak
//! bookkeeping and emits actionable decisions to the supervisor.

use std::sync::Arc;

use dashmap::DashMap;
use mosaic_core::config::QuorumConfig;
use mosaic_core::{InstanceId, UnixMillis};
use mosaic_control::instance::InstanceRegistry;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::heartbeat::HeartbeatBook;

/// Band in which relocating the remaining players beats pausing.
const MIGRATE_PCT_LOW: u32 = 30;
const MIGRATE_PCT_HIGH: u32 = 40;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum QuorumAction {
	/// Keep ticking.
	Continue,
	/// Halt tick advancement, preserve state.
	Pause,
	/// Relocate remaining players to a smaller arena.
	Migrate,
	/// Broadcast shutdown, drain, dispose.
	Abort,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuorumDecision {
	pub action: QuorumAction,
	pub confidence: f64,
	pub quorum_pct: u32,
	pub total_players: u32,
	pub responsive_players: u32,
	pub failure_streak: u32,
}

/// The soft-fail decision table.
pub fn evaluate(
	cfg: &QuorumConfig,
	total_players: u32,
	responsive_players: u32,
	initial_human_count: u32,
	failure_streak: u32,
) -> QuorumDecision {
	let quorum_pct = if initial_human_count == 0 {
		0
	} else {
		responsive_players * 100 / initial_human_count
	};
	let critical_pct = cfg.threshold_percent / 2;
	let decide = |action, confidence| QuorumDecision {
		action,
		confidence,
		quorum_pct,
		total_players,
		responsive_players,
		failure_streak,
	};

	if total_players < 2 {
		return decide(QuorumAction::Abort, 0.95);
	}
	if quorum_pct <= critical_pct || responsive_players < cfg.min_responsive_players {
		return decide(QuorumAction::Abort, 0.90);
	}
	if quorum_pct < cfg.threshold_percent && failure_streak > 3 {
		return decide(QuorumAction::Abort, 0.80);
	}
	if quorum_pct < cfg.threshold_percent && failure_streak <= 2 {
		return decide(QuorumAction::Pause, 0.70);
	}
	if responsive_players >= 3 && (MIGRATE_PCT_LOW..=MIGRATE_PCT_HIGH).contains(&quorum_pct) {
		return decide(QuorumAction::Migrate, 0.60);
	}
	decide(QuorumAction::Continue, 0.80)
}

/// Per-arena quorum state plus the shared evaluation entry point.
pub struct ArenaQuorumMonitor {
	cfg: QuorumConfig,
	heartbeats: Arc<HeartbeatBook>,
	instances: Arc<InstanceRegistry>,
	streaks: DashMap<InstanceId, u32>,
}

impl ArenaQuorumMonitor {
	pub fn new(
		cfg: QuorumConfig,
		heartbeats: Arc<HeartbeatBook>,
		instances: Arc<InstanceRegistry>,
	) -> Self {
		Self { cfg, heartbeats, instances, streaks: DashMap::new() }
	}

	pub fn config(&self) -> &QuorumConfig {
		&self.cfg
	}

	/// Runs one quorum check. Internal errors never continue silently:
	/// the fail-safe answer is a low-confidence pause.
	pub fn check_arena(&self, arena: InstanceId, now: UnixMillis) -> QuorumDecision {
		let Some(instance) = self.instances.get(arena) else {
			warn!(%arena, "quorum check against unknown arena");
			return QuorumDecision {
				action: QuorumAction::Pause,
				confidence: 0.30,
				quorum_pct: 0,
				total_players: 0,
				responsive_players: 0,
				failure_streak: 0,
			};
		};

		let total = self.heartbeats.tracked_count(arena);
		let responsive = self.heartbeats.responsive_count(arena, now);
		let held = {
			let pct = if instance.initial_human_count == 0 {
				0
			} else {
				responsive * 100 / instance.initial_human_count
			};
			pct >= self.cfg.threshold_percent && responsive >= self.cfg.min_responsive_players
		};
		let streak = {
			let mut entry = self.streaks.entry(arena).or_insert(0);
			if held {
				*entry = 0;
			} else {
				*entry += 1;
			}
			*entry
		};

		let decision = evaluate(
			&self.cfg,
			total,
			responsive,
			instance.initial_human_count,
			streak,
		);
		if decision.action != QuorumAction::Continue {
			info!(
				%arena,
				action = ?decision.action,
				confidence = decision.confidence,
				quorum_pct = decision.quorum_pct,
				responsive,
				total,
				streak,
				"quorum decision"
			);
		}
		decision
	}

	pub fn forget_arena(&self, arena: InstanceId) {
		self.streaks.remove(&arena);
	}
}

/// Runs the periodic quorum check for one arena, pushing every
/// actionable (non-continue) decision to the supervisor.
pub async fn run_quorum_worker(
	monitor: Arc<ArenaQuorumMonitor>,
	arena: InstanceId,
	decisions: mpsc::UnboundedSender<(InstanceId, QuorumDecision)>,
	shutdown: CancellationToken,
) {
	let period = std::time::Duration::from_secs(monitor.config().check_period_seconds);
	let mut interval = tokio::time::interval(period);
	interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
	interval.tick().await;
	loop {
		tokio::select! {
			() = shutdown.cancelled() => break,
			_ = interval.tick() => {
				let decision = monitor.check_arena(arena, UnixMillis::now());
				if decision.action != QuorumAction::Continue
					&& decisions.send((arena, decision)).is_err()
				{
					break;
				}
			}
		}
	}
	monitor.forget_arena(arena);
}

#[cfg(test)]
mod test {
	use super::*;

	fn decide(total: u32, responsive: u32, initial: u32, streak: u32) -> QuorumDecision {
		evaluate(&QuorumConfig::default(), total, responsive, initial, streak)
	}

	#[test]
	fn empty_arenas_abort_with_highest_confidence() {
		let d = decide(1, 1, 10, 0);
		assert_eq!(d.action, QuorumAction::Abort);
		assert_eq!(d.confidence, 0.95);
	}

	#[test]
	fn collapse_to_critical_aborts() {
		// At or below the critical fraction: abort at 0.90.
		let d = decide(10, 3, 10, 0);
		assert_eq!(d.action, QuorumAction::Abort);
		assert_eq!(d.confidence, 0.90);
		let d = decide(10, 2, 7, 0);
		assert_eq!(d.action, QuorumAction::Abort);

		// Fewer than two responsive players always aborts.
		let d = decide(10, 1, 2, 0);
		assert_eq!(d.action, QuorumAction::Abort);
		assert_eq!(d.confidence, 0.90);
	}

	#[test]
	fn degraded_quorum_pauses_then_aborts_with_streak() {
		// Below threshold with a short streak: pause.
		let d = decide(10, 5, 10, 1);
		assert_eq!(d.action, QuorumAction::Pause);
		assert_eq!(d.confidence, 0.70);

		// The same numbers with a long streak: abort.
		let d = decide(10, 5, 10, 4);
		assert_eq!(d.action, QuorumAction::Abort);
		assert_eq!(d.confidence, 0.80);
	}

	#[test]
	fn migration_band_prefers_relocation() {
		// 4 responsive of 10 initial = 40%, streak past the pause rules.
		let d = decide(10, 4, 10, 3);
		assert_eq!(d.action, QuorumAction::Migrate);
		assert_eq!(d.confidence, 0.60);
	}

	#[test]
	fn healthy_arena_continues() {
		let d = decide(10, 8, 10, 0);
		assert_eq!(d.action, QuorumAction::Continue);
		assert_eq!(d.quorum_pct, 80);
	}

	#[tokio::test(start_paused = true)]
	async fn worker_reports_actionable_decisions() {
		use mosaic_control::rules::RuleConfigRegistry;
		use mosaic_control::store::InMemoryAuditLog;
		use mosaic_core::config::HeartbeatConfig;
		use mosaic_core::CharacterId;
		use tokio_util::sync::CancellationToken;

		let rules = Arc::new(RuleConfigRegistry::new(Arc::new(InMemoryAuditLog::default())));
		let instances = Arc::new(InstanceRegistry::new(rules));
		let arena = instances
			.create_arena(mosaic_core::data_model::ArenaTier::Tutorial, "s0", "eu")
			.instance_id;
		instances.activate(arena, 10).unwrap();

		let heartbeats = Arc::new(HeartbeatBook::new(HeartbeatConfig::default()));
		// Ten players whose last heartbeat is ancient: all unresponsive.
		for _ in 0..10 {
			heartbeats.register(arena, CharacterId::random(), UnixMillis(0));
		}
		let monitor = Arc::new(ArenaQuorumMonitor::new(
			QuorumConfig::default(),
			heartbeats,
			instances,
		));

		let (tx, mut rx) = mpsc::unbounded_channel();
		let shutdown = CancellationToken::new();
		let worker = tokio::spawn(run_quorum_worker(
			monitor,
			arena,
			tx,
			shutdown.clone(),
		));

		tokio::time::sleep(std::time::Duration::from_millis(10_100)).await;
		let (reported, decision) = rx.recv().await.unwrap();
		assert_eq!(reported, arena);
		assert_eq!(decision.action, QuorumAction::Abort);
		assert_eq!(decision.responsive_players, 0);

		shutdown.cancel();
		worker.await.unwrap();
	}

	#[test]
	fn seven_of_ten_lost_aborts_at_ninety() {
		// An arena with 10 initial humans loses 7 to heartbeat timeout:
		// 30% quorum aborts at 0.90 on the very next check.
		let d = decide(10, 3, 10, 1);
		assert_eq!(d.action, QuorumAction::Abort);
		assert_eq!(d.confidence, 0.90);
		assert_eq!(d.quorum_pct, 30);
	}
}
