//! Instances: self-contained game sessions with capacity and a state machine.

use serde::{Deserialize, Serialize};

use crate::data_model::rules::RuleVersionStamp;
use crate::{AttemptId, CharacterId, InstanceId, UnixMillis, UserId};

/// Battle capacity class.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BattleSize {
	Skirmish,
	Standard,
}

impl BattleSize {
	pub fn capacity(&self) -> usize {
		match self {
			Self::Skirmish => 8,
			Self::Standard => 16,
		}
	}
}

/// Arena capacity tier.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArenaTier {
	Tutorial,
	Skirmish,
	Epic,
}

impl ArenaTier {
	pub fn capacity(&self) -> usize {
		match self {
			Self::Tutorial => 80,
			Self::Skirmish => 160,
			Self::Epic => 300,
		}
	}
}

/// What kind of instance this is, with its capacity class.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum InstanceMode {
	Battle { size: BattleSize },
	Arena { tier: ArenaTier },
}

impl InstanceMode {
	pub fn capacity(&self) -> usize {
		match self {
			Self::Battle { size } => size.capacity(),
			Self::Arena { tier } => tier.capacity(),
		}
	}

	pub fn is_arena(&self) -> bool {
		matches!(self, Self::Arena { .. })
	}
}

/// Forward-only instance lifecycle. `Resolved` and `Aborted` are terminal.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
	Pending,
	Active,
	Resolved,
	Aborted,
}

impl InstanceState {
	pub fn is_terminal(&self) -> bool {
		matches!(self, Self::Resolved | Self::Aborted)
	}

	/// Legal forward transition check.
	pub fn can_transition_to(&self, next: InstanceState) -> bool {
		use InstanceState::*;
		matches!(
			(self, next),
			(Pending, Active) | (Pending, Aborted) | (Active, Resolved) | (Active, Aborted)
		)
	}
}

/// A self-contained game session (battle or arena).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
	pub instance_id: InstanceId,
	pub mode: InstanceMode,
	pub state: InstanceState,
	/// Rule configuration in force when the instance was created.
	pub rule_stamp: Option<RuleVersionStamp>,
	pub shard_key: String,
	pub region: String,
	/// Human population at activation; the quorum denominator.
	pub initial_human_count: u32,
	pub created_at: UnixMillis,
	/// Draining instances reject new admissions but keep running.
	pub drain_mode: bool,
}

impl Instance {
	pub fn capacity(&self) -> usize {
		self.mode.capacity()
	}
}

/// One character waiting for a slot on one instance.
///
/// Unique per `(instance, character)`; ordered by `enqueued_at`, ties
/// broken on `character_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
	pub character_id: CharacterId,
	pub user_id: UserId,
	pub instance_id: InstanceId,
	pub enqueued_at: UnixMillis,
	pub attempt_id: AttemptId,
}
