//! Replay event stream contract.

use serde::{Deserialize, Serialize};

use crate::{CharacterId, UnixMillis};

/// One event in a battle's replay stream.
///
/// Per replay, `seq` values form the gap-free prefix `1..N` and
/// timestamps are non-decreasing. The writer assigns both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayEvent {
	pub seq: u64,
	pub timestamp: UnixMillis,
	#[serde(rename = "type")]
	pub event_type: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub player_id: Option<CharacterId>,
	pub data: serde_json::Value,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub metadata: Option<serde_json::Value>,
}
