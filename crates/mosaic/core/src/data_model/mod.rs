//! The entity model shared by every subsystem.

pub mod ai;
pub mod chat;
pub mod instance;
pub mod moderation;
pub mod replay;
pub mod rules;
pub mod session;

pub use self::ai::{AiEntity, AiKind};
pub use self::chat::{
	BlockEdge, ChannelType, ChatMessage, DeliveryReceipt, DeliveryStatus, DeliveryTier,
};
pub use self::instance::{
	ArenaTier, BattleSize, Instance, InstanceMode, InstanceState, QueueEntry,
};
pub use self::moderation::{AuditEntry, MuteScope, MuteStatus};
pub use self::replay::ReplayEvent;
pub use self::rules::{RuleConfig, RuleConfigType, RuleVersion, RuleVersionStamp};
pub use self::session::{CharacterSession, SessionState, TerminateReason};
