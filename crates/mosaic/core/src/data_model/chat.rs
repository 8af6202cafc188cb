//! Chat messages, delivery receipts and the block relation.

use serde::{Deserialize, Serialize};

use crate::{CharacterId, GuildId, InstanceId, MessageId, UnixMillis};

/// Where a message is addressed.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "channel")]
pub enum ChannelType {
	/// Direct message to one recipient.
	Private,
	/// Everyone in one arena.
	Arena { instance_id: InstanceId },
	/// Every connected player.
	Global,
	/// Every member of one guild.
	Guild { guild_id: GuildId },
}

/// The per-message delivery contract.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryTier {
	ExactlyOnce,
	AtLeastOnce,
	BestEffort,
}

impl ChannelType {
	/// The tier a channel uses unless the sender asks for a stricter one.
	pub fn default_tier(&self) -> DeliveryTier {
		match self {
			Self::Private | Self::Guild { .. } => DeliveryTier::ExactlyOnce,
			Self::Arena { .. } | Self::Global => DeliveryTier::AtLeastOnce,
		}
	}
}

/// A validated chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
	pub message_id: MessageId,
	pub sender_id: CharacterId,
	pub recipient_id: Option<CharacterId>,
	pub channel: ChannelType,
	pub content: String,
	pub timestamp: UnixMillis,
	pub tier: DeliveryTier,
}

/// Delivery progress for one `(message, recipient)` pair.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
	Pending,
	Delivered,
	Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryReceipt {
	pub message_id: MessageId,
	pub recipient_id: CharacterId,
	pub status: DeliveryStatus,
	pub attempts: u32,
	pub last_error: Option<String>,
}

/// Directed block edge. The effective relation is the symmetric closure:
/// a pair is blocked iff either direction exists.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct BlockEdge {
	pub owner: CharacterId,
	pub blocked: CharacterId,
}
