//! The authoritative presence record for one character in one instance.

use serde::{Deserialize, Serialize};

use crate::token::ReconnectionToken;
use crate::{CharacterId, InstanceId, SessionId, UnixMillis, UserId};

/// Lifecycle state of a [`CharacterSession`].
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
	/// Connected and holding a capacity slot.
	Active,
	/// Transport dropped; reclaimable by its owner until the grace deadline.
	/// Grace sessions do not hold a capacity slot.
	Grace,
	/// On its way out. Terminal; the record is removed shortly after.
	Terminating,
}

impl SessionState {
	/// Whether the session still binds the character identity.
	pub fn is_live(&self) -> bool {
		!matches!(self, Self::Terminating)
	}
}

/// Why a session was terminated.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminateReason {
	Leave,
	Kick,
	Replace,
	GraceExpired,
	/// Hard ceiling on total session lifetime reached.
	Expired,
	InstanceResolved,
	InstanceAborted,
	ServerShutdown,
}

/// One character's presence in one instance.
///
/// Owned by the session registry; every transition goes through it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CharacterSession {
	pub session_id: SessionId,
	pub character_id: CharacterId,
	pub user_id: UserId,
	pub instance_id: InstanceId,
	pub state: SessionState,
	pub admitted_at: UnixMillis,
	pub last_heartbeat_at: UnixMillis,
	/// Set only in [`SessionState::Grace`].
	pub grace_expires_at: Option<UnixMillis>,
	/// Issued at admission so the client holds it before any drop, but
	/// resolvable only while the session is in grace. Single use; a
	/// fresh one is minted on every successful reconnect.
	pub reconnection_token: Option<ReconnectionToken>,
	/// The session this one replaced, if admission consumed a replacement.
	pub replacement_of: Option<SessionId>,
}

impl CharacterSession {
	pub fn new(
		character_id: CharacterId,
		user_id: UserId,
		instance_id: InstanceId,
		now: UnixMillis,
	) -> Self {
		Self {
			session_id: SessionId::random(),
			character_id,
			user_id,
			instance_id,
			state: SessionState::Active,
			admitted_at: now,
			last_heartbeat_at: now,
			grace_expires_at: None,
			reconnection_token: Some(ReconnectionToken::mint()),
			replacement_of: None,
		}
	}
}
