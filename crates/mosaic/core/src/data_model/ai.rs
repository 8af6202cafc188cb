//! AI filler entities.

use serde::{Deserialize, Serialize};

use crate::{AiEntityId, InstanceId, UnixMillis};

/// AI entity class. Each class has a fixed priority and cost weight.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AiKind {
	Merchant,
	Guard,
	Monster,
	Ambient,
}

impl AiKind {
	/// Spawn priority; lower is more urgent.
	pub fn priority(&self) -> u8 {
		match self {
			Self::Guard => 1,
			Self::Merchant => 2,
			Self::Monster => 3,
			Self::Ambient => 4,
		}
	}

	/// Relative simulation cost of one entity of this class.
	pub fn cost_weight(&self) -> u32 {
		match self {
			Self::Ambient => 1,
			Self::Merchant => 2,
			Self::Guard => 3,
			Self::Monster => 5,
		}
	}
}

/// One AI entity living in an arena.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiEntity {
	pub entity_id: AiEntityId,
	pub instance_id: InstanceId,
	pub kind: AiKind,
	pub spawned_at: UnixMillis,
	pub despawned_at: Option<UnixMillis>,
}
