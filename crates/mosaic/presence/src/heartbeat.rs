//! Per-player liveness from heartbeats.
//!
//! Every connected player heartbeats at most every 30 seconds. A player
//! is unresponsive once `consecutive_failures` reaches the limit or
//! their silence exceeds the timeout, whichever happens first.

use std::collections::{HashSet, VecDeque};

use dashmap::DashMap;
use mosaic_core::config::HeartbeatConfig;
use mosaic_core::{CharacterId, InstanceId, UnixMillis};
use parking_lot::Mutex;
use tracing::debug;

#[derive(Debug)]
struct PlayerLiveness {
	last_heartbeat_at: UnixMillis,
	consecutive_failures: u32,
	rtt_samples: VecDeque<u32>,
}

/// Tracks liveness per player and membership per arena.
pub struct HeartbeatBook {
	cfg: HeartbeatConfig,
	players: DashMap<CharacterId, Mutex<PlayerLiveness>>,
	members: DashMap<InstanceId, HashSet<CharacterId>>,
}

impl HeartbeatBook {
	pub fn new(cfg: HeartbeatConfig) -> Self {
		Self { cfg, players: DashMap::new(), members: DashMap::new() }
	}

	/// Starts tracking a player; the admission timestamp counts as the
	/// first heartbeat.
	pub fn register(&self, instance: InstanceId, character: CharacterId, now: UnixMillis) {
		self.players.insert(
			character,
			Mutex::new(PlayerLiveness {
				last_heartbeat_at: now,
				consecutive_failures: 0,
				rtt_samples: VecDeque::with_capacity(self.cfg.rtt_sample_capacity),
			}),
		);
		self.members.entry(instance).or_default().insert(character);
	}

	pub fn unregister(&self, instance: InstanceId, character: CharacterId) {
		self.players.remove(&character);
		if let Some(mut set) = self.members.get_mut(&instance) {
			set.remove(&character);
		}
	}

	pub fn forget_instance(&self, instance: InstanceId) {
		if let Some((_, members)) = self.members.remove(&instance) {
			for character in members {
				self.players.remove(&character);
			}
		}
	}

	/// Records a heartbeat, clearing the failure streak.
	pub fn record_heartbeat(&self, character: CharacterId, now: UnixMillis, rtt_ms: Option<u32>) {
		let Some(cell) = self.players.get(&character) else {
			debug!(%character, "heartbeat from untracked player");
			return;
		};
		let mut liveness = cell.lock();
		liveness.last_heartbeat_at = now;
		liveness.consecutive_failures = 0;
		if let Some(rtt) = rtt_ms {
			if liveness.rtt_samples.len() == self.cfg.rtt_sample_capacity {
				liveness.rtt_samples.pop_front();
			}
			liveness.rtt_samples.push_back(rtt);
		}
	}

	/// Records a missed or failed heartbeat probe.
	pub fn note_failure(&self, character: CharacterId) {
		if let Some(cell) = self.players.get(&character) {
			cell.lock().consecutive_failures += 1;
		}
	}

	pub fn is_responsive(&self, character: CharacterId, now: UnixMillis) -> bool {
		let Some(cell) = self.players.get(&character) else {
			return false;
		};
		let liveness = cell.lock();
		if liveness.consecutive_failures >= self.cfg.max_consecutive_failures {
			return false;
		}
		now.saturating_since(liveness.last_heartbeat_at) <= self.cfg.timeout_seconds * 1000
	}

	pub fn average_rtt_ms(&self, character: CharacterId) -> Option<u32> {
		let cell = self.players.get(&character)?;
		let liveness = cell.lock();
		if liveness.rtt_samples.is_empty() {
			return None;
		}
		let sum: u64 = liveness.rtt_samples.iter().map(|&s| u64::from(s)).sum();
		Some((sum / liveness.rtt_samples.len() as u64) as u32)
	}

	/// One probe pass: every tracked player who stayed silent for a full
	/// heartbeat interval collects a failure. Run at the heartbeat
	/// interval so the failure count approximates missed beats.
	pub fn sweep_missed(&self, now: UnixMillis) -> u32 {
		let interval_ms = self.cfg.interval_seconds * 1000;
		let mut missed = 0;
		for cell in self.players.iter() {
			let mut liveness = cell.lock();
			if now.saturating_since(liveness.last_heartbeat_at) > interval_ms {
				liveness.consecutive_failures += 1;
				missed += 1;
			}
		}
		if missed > 0 {
			debug!(missed, "heartbeat sweep found silent players");
		}
		missed
	}

	pub fn tracked_count(&self, instance: InstanceId) -> u32 {
		self.members.get(&instance).map_or(0, |set| set.len() as u32)
	}

	pub fn responsive_count(&self, instance: InstanceId, now: UnixMillis) -> u32 {
		let Some(set) = self.members.get(&instance) else {
			return 0;
		};
		set.iter()
			.filter(|character| self.is_responsive(**character, now))
			.count() as u32
	}
}
