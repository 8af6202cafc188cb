//! Moderation commands: mute, unmute, kick, guild dissolution.
//!
//! Every command authenticates the moderator, loads the target, applies
//! the mutation, writes an audit entry, and (where players must learn
//! about it) emits a system event for the transport layer to broadcast.

use std::sync::Arc;

use dashmap::DashMap;
use mosaic_core::data_model::{AuditEntry, MuteScope, MuteStatus, TerminateReason};
use mosaic_core::{CharacterId, GuildId, InstanceId, UnixMillis, UserId};
use tracing::info;

use crate::session::SessionRegistry;
use crate::store::{AuditLog, PlayerDirectory, StoreError};

#[derive(Debug, Clone, thiserror::Error)]
pub enum ModerationError {
	#[error("principal is not a moderator")]
	NotAuthorized,
	#[error("moderator account is not active")]
	ModeratorInactive,
	#[error("target not found")]
	TargetNotFound,
	#[error(transparent)]
	Store(#[from] StoreError),
}

/// System events that must reach connected players.
#[derive(Debug, Clone)]
pub enum SystemEvent {
	PlayerKicked {
		character_id: CharacterId,
		instance_id: Option<InstanceId>,
		reason: Option<String>,
	},
	GuildDissolved {
		guild_id: GuildId,
		members: Vec<CharacterId>,
	},
}

/// Seam to the transport layer's broadcast fan-out.
pub trait SystemNotifier: Send + Sync {
	fn notify(&self, event: SystemEvent);
}

/// Notifier that drops events; useful in tests and tools.
#[derive(Debug, Default)]
pub struct NoopNotifier;

impl SystemNotifier for NoopNotifier {
	fn notify(&self, _event: SystemEvent) {}
}

pub struct ModerationService {
	directory: Arc<dyn PlayerDirectory>,
	audit: Arc<dyn AuditLog>,
	sessions: Arc<SessionRegistry>,
	notifier: Arc<dyn SystemNotifier>,
	mutes: DashMap<CharacterId, Vec<MuteStatus>>,
}

impl ModerationService {
	pub fn new(
		directory: Arc<dyn PlayerDirectory>,
		audit: Arc<dyn AuditLog>,
		sessions: Arc<SessionRegistry>,
		notifier: Arc<dyn SystemNotifier>,
	) -> Self {
		Self { directory, audit, sessions, notifier, mutes: DashMap::new() }
	}

	fn authenticate(&self, moderator: UserId) -> Result<(), ModerationError> {
		let record = self
			.directory
			.moderator(moderator)?
			.ok_or(ModerationError::NotAuthorized)?;
		if !record.is_active {
			return Err(ModerationError::ModeratorInactive);
		}
		Ok(())
	}

	pub fn mute(
		&self,
		moderator: UserId,
		player: CharacterId,
		scope: MuteScope,
		duration_seconds: u64,
		reason: Option<String>,
		now: UnixMillis,
	) -> Result<MuteStatus, ModerationError> {
		self.authenticate(moderator)?;
		self.directory
			.player(player)?
			.ok_or(ModerationError::TargetNotFound)?;

		let status = MuteStatus {
			player_id: player,
			scope,
			issued_by: moderator,
			issued_at: now,
			expires_at: now.saturating_add_secs(duration_seconds),
			reason: reason.clone(),
		};
		let mut list = self.mutes.entry(player).or_default();
		list.retain(|m| m.scope != scope);
		list.push(status.clone());
		drop(list);

		info!(%player, ?scope, duration_seconds, "player muted");
		self.audit.append(AuditEntry {
			at: now,
			actor: moderator,
			action: "moderation.mute".into(),
			subject: player.to_string(),
			detail: serde_json::json!({"scope": scope, "duration_seconds": duration_seconds, "reason": reason}),
		});
		Ok(status)
	}

	pub fn unmute(
		&self,
		moderator: UserId,
		player: CharacterId,
		scope: MuteScope,
		now: UnixMillis,
	) -> Result<(), ModerationError> {
		self.authenticate(moderator)?;
		let removed = match self.mutes.get_mut(&player) {
			Some(mut list) => {
				let before = list.len();
				list.retain(|m| m.scope != scope);
				before != list.len()
			}
			None => false,
		};
		if !removed {
			return Err(ModerationError::TargetNotFound);
		}
		self.audit.append(AuditEntry {
			at: now,
			actor: moderator,
			action: "moderation.unmute".into(),
			subject: player.to_string(),
			detail: serde_json::json!({"scope": scope}),
		});
		Ok(())
	}

	pub fn kick(
		&self,
		moderator: UserId,
		character: CharacterId,
		reason: Option<String>,
		now: UnixMillis,
	) -> Result<(), ModerationError> {
		self.authenticate(moderator)?;
		self.directory
			.player(character)?
			.ok_or(ModerationError::TargetNotFound)?;

		let session = self.sessions.live_session_of(character);
		let instance_id = session.as_ref().map(|s| s.instance_id);
		if let Some(session) = session {
			self.sessions.terminate(session.session_id, TerminateReason::Kick);
		}
		self.audit.append(AuditEntry {
			at: now,
			actor: moderator,
			action: "moderation.kick".into(),
			subject: character.to_string(),
			detail: serde_json::json!({"instance": instance_id, "reason": reason}),
		});
		self.notifier.notify(SystemEvent::PlayerKicked {
			character_id: character,
			instance_id,
			reason,
		});
		Ok(())
	}

	pub fn dissolve_guild(
		&self,
		moderator: UserId,
		guild: GuildId,
		now: UnixMillis,
	) -> Result<(), ModerationError> {
		self.authenticate(moderator)?;
		let members = self.directory.guild_members(guild)?;
		if members.is_empty() {
			return Err(ModerationError::TargetNotFound);
		}
		self.directory.dissolve_guild(guild)?;
		self.audit.append(AuditEntry {
			at: now,
			actor: moderator,
			action: "moderation.dissolve_guild".into(),
			subject: guild.to_string(),
			detail: serde_json::json!({"member_count": members.len()}),
		});
		self.notifier
			.notify(SystemEvent::GuildDissolved { guild_id: guild, members });
		Ok(())
	}

	/// Whether a message from `player` on the given scope is silenced.
	/// Expired mutes encountered here are removed on the spot.
	pub fn is_muted(
		&self,
		player: CharacterId,
		guild: Option<GuildId>,
		arena: Option<InstanceId>,
		now: UnixMillis,
	) -> bool {
		let Some(mut list) = self.mutes.get_mut(&player) else {
			return false;
		};
		list.retain(|m| !m.is_expired(now));
		list.iter().any(|m| m.applies_to(guild, arena))
	}

	/// Periodic sweep of expired mutes.
	pub fn reap_expired(&self, now: UnixMillis) {
		self.mutes.retain(|_, list| {
			list.retain(|m| !m.is_expired(now));
			!list.is_empty()
		});
	}
}
