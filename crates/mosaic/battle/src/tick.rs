//! The fixed-period battle tick.
//!
//! Placement attempts buffer between ticks; at the tick boundary they
//! are grouped by position and resolved deterministically: an occupied
//! position rejects everyone, otherwise the earliest attempt wins with
//! ties broken on `(character_id, sequence)`. Accepted placements go out
//! as one batch per tick.

use std::collections::{BTreeMap, HashMap};

use mosaic_core::messages::session::{TilePlacement, TileRejectReason};
use mosaic_core::{CharacterId, InstanceId, UnixMillis};
use tracing::debug;

/// One buffered placement attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlacementAttempt {
	pub character_id: CharacterId,
	pub x: i32,
	pub y: i32,
	/// Client-local ordering of this character's attempts.
	pub sequence: u64,
	pub timestamp: UnixMillis,
}

/// Everything one tick decided.
#[derive(Debug, Clone)]
pub struct TickReport {
	pub tick: u64,
	pub accepted: Vec<TilePlacement>,
	pub rejected: Vec<(PlacementAttempt, TileRejectReason)>,
	/// Number of attempts that lost a same-tick conflict.
	pub conflicts_resolved: u32,
}

/// Why a battle ended.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum EndReason {
	Timeout,
	Empty,
	QuorumLost,
	Resolved,
	/// The server process is going down.
	Shutdown,
}

impl EndReason {
	pub fn as_str(&self) -> &'static str {
		match self {
			Self::Timeout => "timeout",
			Self::Empty => "empty",
			Self::QuorumLost => "quorum_lost",
			Self::Resolved => "resolved",
			Self::Shutdown => "shutdown",
		}
	}
}

/// The authoritative tile map and tick counter for one battle.
pub struct TickEngine {
	instance_id: InstanceId,
	tiles: HashMap<(i32, i32), CharacterId>,
	tick: u64,
}

impl TickEngine {
	pub fn new(instance_id: InstanceId) -> Self {
		Self { instance_id, tiles: HashMap::new(), tick: 0 }
	}

	pub fn instance_id(&self) -> InstanceId {
		self.instance_id
	}

	pub fn tick(&self) -> u64 {
		self.tick
	}

	pub fn tile_owner(&self, x: i32, y: i32) -> Option<CharacterId> {
		self.tiles.get(&(x, y)).copied()
	}

	pub fn tiles_placed(&self) -> usize {
		self.tiles.len()
	}

	/// Resolves one tick's worth of attempts.
	pub fn resolve_tick(&mut self, attempts: Vec<PlacementAttempt>) -> TickReport {
		self.tick += 1;
		let mut accepted = Vec::new();
		let mut rejected = Vec::new();
		let mut conflicts_resolved = 0u32;

		// BTreeMap so iteration (and with it the broadcast batch) has a
		// stable order.
		let mut by_position: BTreeMap<(i32, i32), Vec<PlacementAttempt>> = BTreeMap::new();
		for attempt in attempts {
			by_position.entry((attempt.x, attempt.y)).or_default().push(attempt);
		}

		for ((x, y), mut contenders) in by_position {
			if self.tiles.contains_key(&(x, y)) {
				for attempt in contenders {
					rejected.push((attempt, TileRejectReason::Occupied));
				}
				continue;
			}
			contenders.sort_by_key(|a| (a.timestamp, a.character_id, a.sequence));
			let winner = contenders.remove(0);
			self.tiles.insert((x, y), winner.character_id);
			accepted.push(TilePlacement {
				x,
				y,
				character_id: winner.character_id,
				sequence: winner.sequence,
				timestamp: winner.timestamp,
			});
			conflicts_resolved += contenders.len() as u32;
			for loser in contenders {
				rejected.push((loser, TileRejectReason::Conflict));
			}
		}

		debug!(
			battle = %self.instance_id,
			tick = self.tick,
			accepted = accepted.len(),
			rejected = rejected.len(),
			"tick resolved"
		);
		TickReport { tick: self.tick, accepted, rejected, conflicts_resolved }
	}
}

#[cfg(test)]
mod test {
	use super::*;

	fn attempt(
		character: CharacterId,
		x: i32,
		y: i32,
		sequence: u64,
		ts: u64,
	) -> PlacementAttempt {
		PlacementAttempt { character_id: character, x, y, sequence, timestamp: UnixMillis(ts) }
	}

	#[test]
	fn earliest_timestamp_wins_the_position() {
		let mut engine = TickEngine::new(InstanceId::random());
		let (a, b, c) = (CharacterId::random(), CharacterId::random(), CharacterId::random());

		let report = engine.resolve_tick(vec![
			attempt(a, 5, 5, 1, 100),
			attempt(b, 5, 5, 1, 100),
			attempt(c, 5, 5, 1, 99),
		]);

		assert_eq!(report.accepted.len(), 1);
		assert_eq!(report.accepted[0].character_id, c);
		assert_eq!(report.conflicts_resolved, 2);
		assert_eq!(report.rejected.len(), 2);
		assert!(report
			.rejected
			.iter()
			.all(|(_, reason)| *reason == TileRejectReason::Conflict));
		assert_eq!(engine.tile_owner(5, 5), Some(c));
	}

	#[test]
	fn equal_timestamps_break_on_character_then_sequence() {
		let mut engine = TickEngine::new(InstanceId::random());
		let mut ids = [CharacterId::random(), CharacterId::random()];
		ids.sort();

		let report = engine.resolve_tick(vec![
			attempt(ids[1], 0, 0, 1, 100),
			attempt(ids[0], 0, 0, 2, 100),
			attempt(ids[0], 0, 0, 1, 100),
		]);
		assert_eq!(report.accepted[0].character_id, ids[0]);
		assert_eq!(report.accepted[0].sequence, 1);
	}

	#[test]
	fn occupied_positions_reject_everyone() {
		let mut engine = TickEngine::new(InstanceId::random());
		let (a, b) = (CharacterId::random(), CharacterId::random());

		engine.resolve_tick(vec![attempt(a, 3, 3, 1, 10)]);
		let report = engine.resolve_tick(vec![attempt(b, 3, 3, 1, 20), attempt(a, 3, 3, 2, 21)]);

		assert!(report.accepted.is_empty());
		assert_eq!(report.rejected.len(), 2);
		assert!(report
			.rejected
			.iter()
			.all(|(_, reason)| *reason == TileRejectReason::Occupied));
		// Occupied rejections are not conflicts.
		assert_eq!(report.conflicts_resolved, 0);
		assert_eq!(engine.tile_owner(3, 3), Some(a));
	}

	#[test]
	fn independent_positions_resolve_in_one_tick() {
		let mut engine = TickEngine::new(InstanceId::random());
		let (a, b) = (CharacterId::random(), CharacterId::random());

		let report = engine.resolve_tick(vec![attempt(a, 0, 0, 1, 5), attempt(b, 1, 0, 1, 5)]);
		assert_eq!(report.accepted.len(), 2);
		assert_eq!(report.tick, 1);
		assert_eq!(engine.tiles_placed(), 2);

		let report = engine.resolve_tick(vec![]);
		assert_eq!(report.tick, 2);
		assert!(report.accepted.is_empty());
	}
}
