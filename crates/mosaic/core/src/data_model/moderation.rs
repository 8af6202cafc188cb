//! Moderation records.

use serde::{Deserialize, Serialize};

use crate::{CharacterId, GuildId, InstanceId, UnixMillis, UserId};

/// Where a mute applies.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "scope")]
pub enum MuteScope {
	Global,
	Guild { guild_id: GuildId },
	Arena { instance_id: InstanceId },
}

/// An active mute against one player.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MuteStatus {
	pub player_id: CharacterId,
	pub scope: MuteScope,
	pub issued_by: UserId,
	pub issued_at: UnixMillis,
	pub expires_at: UnixMillis,
	pub reason: Option<String>,
}

impl MuteStatus {
	pub fn is_expired(&self, now: UnixMillis) -> bool {
		self.expires_at <= now
	}

	/// Whether this mute silences a message on the given channel scope.
	pub fn applies_to(&self, guild: Option<GuildId>, arena: Option<InstanceId>) -> bool {
		match self.scope {
			MuteScope::Global => true,
			MuteScope::Guild { guild_id } => guild == Some(guild_id),
			MuteScope::Arena { instance_id } => arena == Some(instance_id),
		}
	}
}

/// One append-only audit record for an admin or moderation action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
	pub at: UnixMillis,
	pub actor: UserId,
	pub action: String,
	pub subject: String,
	pub detail: serde_json::Value,
}
