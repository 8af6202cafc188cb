//! Messages on the per-session bidirectional channel.

use serde::{Deserialize, Serialize};

use crate::data_model::{ChannelType, ChatMessage, DeliveryTier};
use crate::{CharacterId, InstanceId, SessionId, UnixMillis};

/// Client → server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Serverbound {
	Heartbeat {
		sent_at: UnixMillis,
	},
	PlaceTile {
		x: i32,
		y: i32,
		/// Client-local ordering of this session's attempts.
		sequence: u64,
	},
	Chat {
		channel: ChannelType,
		recipient_id: Option<CharacterId>,
		content: String,
		timestamp: UnixMillis,
		/// Overrides the channel's default tier when set.
		tier: Option<DeliveryTier>,
	},
	Ready,
	Leave,
}

/// Server → client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Clientbound {
	/// One tick's accepted placements, delivered to every participant in
	/// tick order.
	TilesUpdated {
		tick: u64,
		placements: Vec<TilePlacement>,
		conflicts_resolved: u32,
	},
	ChatMessage {
		message: ChatMessage,
	},
	BattleStarted {
		instance_id: InstanceId,
		tick_period_ms: u64,
	},
	ArenaPaused {
		reason: String,
	},
	ArenaShutdown {
		reason: String,
	},
	BattleResolved {
		outcome: String,
	},
	HeartbeatAck {
		sent_at: UnixMillis,
		server_time: UnixMillis,
	},
	TileRejected {
		x: i32,
		y: i32,
		sequence: u64,
		reason: TileRejectReason,
	},
	ReconnectionSuccess {
		session_id: SessionId,
	},
	/// `reason` is one of the stable rejection strings; chat adds
	/// `INVALID_CONTENT` and `MUTED` for its validation outcomes.
	MessageRejected {
		reason: String,
	},
	/// Out-of-band server notices: kicks, guild dissolution, migration
	/// targets.
	SystemNotice {
		event: String,
		data: serde_json::Value,
	},
}

/// One accepted placement inside a tick batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TilePlacement {
	pub x: i32,
	pub y: i32,
	pub character_id: CharacterId,
	pub sequence: u64,
	pub timestamp: UnixMillis,
}

/// Why a placement attempt lost its tick.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TileRejectReason {
	/// The position was already occupied before the tick.
	Occupied,
	/// Another attempt in the same tick won the position.
	Conflict,
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn serverbound_uses_snake_case_tags() {
		let msg: Serverbound =
			serde_json::from_str(r#"{"type": "place_tile", "x": 5, "y": 5, "sequence": 1}"#)
				.unwrap();
		assert_eq!(msg, Serverbound::PlaceTile { x: 5, y: 5, sequence: 1 });
	}

	#[test]
	fn tile_reject_reasons_are_stable_strings() {
		assert_eq!(
			serde_json::to_string(&TileRejectReason::Conflict).unwrap(),
			"\"CONFLICT\""
		);
		assert_eq!(
			serde_json::to_string(&TileRejectReason::Occupied).unwrap(),
			"\"OCCUPIED\""
		);
	}

	#[test]
	fn clientbound_tag_matches_protocol_name() {
		let json = serde_json::to_string(&Clientbound::ArenaShutdown {
			reason: "quorum_lost".into(),
		})
		.unwrap();
		assert!(json.contains(r#""type":"arena_shutdown""#));
	}
}
