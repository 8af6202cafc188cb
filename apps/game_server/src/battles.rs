//! Battle lifecycle: ready-up, worker spawn, attempt routing.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use mosaic_battle::{
	run_battle_worker, BattleControl, EndReason, PlacementAttempt, ReplayStorage, ReplayWriter,
	TickEngine,
};
use mosaic_control::instance::InstanceRegistry;
use mosaic_control::store::Metrics;
use mosaic_core::config::{BattleConfig, ReplayConfig};
use mosaic_core::data_model::InstanceState;
use mosaic_core::{CharacterId, InstanceId, UnixMillis};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::channel::ClientHub;

struct BattleHandle {
	attempts_tx: mpsc::UnboundedSender<PlacementAttempt>,
	control_tx: mpsc::UnboundedSender<BattleControl>,
	population: Arc<AtomicUsize>,
}

/// Owns the per-battle workers and their channels.
pub struct BattleManager {
	battle_cfg: BattleConfig,
	replay_cfg: ReplayConfig,
	instances: Arc<InstanceRegistry>,
	hub: Arc<ClientHub>,
	storage: Arc<dyn ReplayStorage>,
	metrics: Arc<dyn Metrics>,
	resolved_tx: mpsc::UnboundedSender<(InstanceId, EndReason)>,
	shutdown: CancellationToken,
	battles: DashMap<InstanceId, BattleHandle>,
	ready: DashMap<InstanceId, HashSet<CharacterId>>,
}

impl BattleManager {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		battle_cfg: BattleConfig,
		replay_cfg: ReplayConfig,
		instances: Arc<InstanceRegistry>,
		hub: Arc<ClientHub>,
		storage: Arc<dyn ReplayStorage>,
		metrics: Arc<dyn Metrics>,
		resolved_tx: mpsc::UnboundedSender<(InstanceId, EndReason)>,
		shutdown: CancellationToken,
	) -> Self {
		Self {
			battle_cfg,
			replay_cfg,
			instances,
			hub,
			storage,
			metrics,
			resolved_tx,
			shutdown,
			battles: DashMap::new(),
			ready: DashMap::new(),
		}
	}

	/// Records a ready-up; starts the battle once every active player on
	/// a pending battle instance is ready (minimum two).
	pub fn note_ready(&self, instance_id: InstanceId, character: CharacterId, active: usize) {
		let ready_count = {
			let mut set = self.ready.entry(instance_id).or_default();
			set.insert(character);
			set.len()
		};
		let Some(instance) = self.instances.get(instance_id) else {
			return;
		};
		if instance.state == InstanceState::Pending
			&& !instance.mode.is_arena()
			&& active >= 2
			&& ready_count >= active
		{
			self.start(instance_id, active);
		}
	}

	/// Activates the instance and spawns its tick worker.
	pub fn start(&self, instance_id: InstanceId, humans: usize) {
		if self.battles.contains_key(&instance_id) {
			return;
		}
		let Some(instance) = self.instances.get(instance_id) else {
			return;
		};
		if let Err(err) = self.instances.activate(instance_id, humans as u32) {
			warn!(instance = %instance_id, %err, "battle activation refused");
			return;
		}
		let (attempts_tx, attempts_rx) = mpsc::unbounded_channel();
		let (control_tx, control_rx) = mpsc::unbounded_channel();
		let population = Arc::new(AtomicUsize::new(humans));
		let replay = Arc::new(ReplayWriter::new(
			self.replay_cfg.clone(),
			instance_id,
			instance.rule_stamp.clone(),
			self.storage.clone(),
			UnixMillis::now(),
		));
		tokio::spawn(run_battle_worker(
			self.battle_cfg.clone(),
			TickEngine::new(instance_id),
			attempts_rx,
			control_rx,
			population.clone(),
			self.hub.clone(),
			replay,
			self.metrics.clone(),
			self.resolved_tx.clone(),
			self.shutdown.child_token(),
		));
		self.battles
			.insert(instance_id, BattleHandle { attempts_tx, control_tx, population });
		self.ready.remove(&instance_id);
		info!(instance = %instance_id, humans, "battle started");
	}

	/// Routes a placement attempt to its battle. `false` when no battle
	/// is running for the instance.
	pub fn route_attempt(&self, instance_id: InstanceId, attempt: PlacementAttempt) -> bool {
		match self.battles.get(&instance_id) {
			Some(handle) => handle.attempts_tx.send(attempt).is_ok(),
			None => false,
		}
	}

	pub fn control(&self, instance_id: InstanceId, control: BattleControl) -> bool {
		match self.battles.get(&instance_id) {
			Some(handle) => handle.control_tx.send(control).is_ok(),
			None => false,
		}
	}

	pub fn set_population(&self, instance_id: InstanceId, count: usize) {
		if let Some(handle) = self.battles.get(&instance_id) {
			handle.population.store(count, Ordering::Relaxed);
		}
	}

	pub fn is_running(&self, instance_id: InstanceId) -> bool {
		self.battles.contains_key(&instance_id)
	}

	/// Drops the handle once the worker reported its end.
	pub fn remove(&self, instance_id: InstanceId) {
		self.battles.remove(&instance_id);
		self.ready.remove(&instance_id);
	}
}
