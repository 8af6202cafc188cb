//! The authoritative session table and its state machine.
//!
//! ```text
//!       admit          lost-connection          reconnect(valid token)
//! pending ──► active ──────────────────► grace ─────────────────────► active
//!                               ▲  │
//!                               │  │ grace deadline reached
//!                               │  ▼
//!                             (none) ──► terminating ──► (removed)
//! ```
//!
//! Capacity counts only `active` sessions. A session entering grace
//! releases its slot immediately so the queue can advance; reclaiming it
//! races the queue on purpose and the loser goes through normal
//! admission again.

use std::collections::HashSet;

use dashmap::DashMap;
use mosaic_core::config::SessionConfig;
use mosaic_core::data_model::{CharacterSession, SessionState, TerminateReason};
use mosaic_core::token::ReconnectionToken;
use mosaic_core::{CharacterId, InstanceId, SessionId, UnixMillis, UserId};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Receives the instance id every time an active slot is released
/// (termination of an active session, or an active session entering
/// grace). The admission promotion worker drains this.
pub type SlotFreedReceiver = mpsc::UnboundedReceiver<InstanceId>;

#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum SessionError {
	/// The character already has a non-terminating session.
	#[error("character already has a live session")]
	IdentityConflict,
	#[error("no such session")]
	NotFound,
	/// The session is not in the state the transition requires.
	#[error("invalid session state for this transition")]
	InvalidState,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum TokenError {
	#[error("unknown reconnection token")]
	NotFound,
	#[error("reconnection token expired")]
	Expired,
}

/// Owns every [`CharacterSession`] and the three indexes over them.
///
/// Identity-critical mutations (create, replace) must run under the
/// admission controller's character lock; the registry checks the
/// one-live-session rule defensively but does not serialize callers
/// itself.
pub struct SessionRegistry {
	cfg: SessionConfig,
	sessions: DashMap<SessionId, CharacterSession>,
	by_character: DashMap<CharacterId, SessionId>,
	/// Active sessions only; this is the instance capacity set.
	by_instance: DashMap<InstanceId, HashSet<SessionId>>,
	by_token: DashMap<String, SessionId>,
	slot_freed: mpsc::UnboundedSender<InstanceId>,
}

impl SessionRegistry {
	pub fn new(cfg: SessionConfig) -> (Self, SlotFreedReceiver) {
		let (slot_freed, slot_rx) = mpsc::unbounded_channel();
		let registry = Self {
			cfg,
			sessions: DashMap::new(),
			by_character: DashMap::new(),
			by_instance: DashMap::new(),
			by_token: DashMap::new(),
			slot_freed,
		};
		(registry, slot_rx)
	}

	pub fn get(&self, id: SessionId) -> Option<CharacterSession> {
		self.sessions.get(&id).map(|s| s.clone())
	}

	/// The character's non-terminating session, if any.
	pub fn live_session_of(&self, character: CharacterId) -> Option<CharacterSession> {
		let id = *self.by_character.get(&character)?;
		self.sessions.get(&id).map(|s| s.clone())
	}

	/// Number of sessions counting against the instance's capacity.
	pub fn active_count(&self, instance: InstanceId) -> usize {
		self.by_instance.get(&instance).map_or(0, |set| set.len())
	}

	pub fn active_sessions(&self, instance: InstanceId) -> Vec<SessionId> {
		self.by_instance
			.get(&instance)
			.map(|set| set.iter().copied().collect())
			.unwrap_or_default()
	}

	/// Characters with an active session on the instance.
	pub fn active_characters(&self, instance: InstanceId) -> Vec<CharacterId> {
		self.active_sessions(instance)
			.into_iter()
			.filter_map(|id| self.get(id).map(|s| s.character_id))
			.collect()
	}

	/// Every character with an active session anywhere.
	pub fn all_active_characters(&self) -> Vec<CharacterId> {
		self.sessions
			.iter()
			.filter(|s| s.state == SessionState::Active)
			.map(|s| s.character_id)
			.collect()
	}

	/// Creates a new `active` session. Fails with
	/// [`SessionError::IdentityConflict`] if the character already has a
	/// live session.
	pub fn create_active(
		&self,
		character: CharacterId,
		user: UserId,
		instance: InstanceId,
		now: UnixMillis,
	) -> Result<CharacterSession, SessionError> {
		let session = CharacterSession::new(character, user, instance, now);
		match self.by_character.entry(character) {
			dashmap::mapref::entry::Entry::Occupied(_) => {
				return Err(SessionError::IdentityConflict)
			}
			dashmap::mapref::entry::Entry::Vacant(slot) => {
				slot.insert(session.session_id);
			}
		}
		self.by_instance
			.entry(instance)
			.or_default()
			.insert(session.session_id);
		self.sessions.insert(session.session_id, session.clone());
		debug!(session = %session.session_id, %character, %instance, "session created");
		Ok(session)
	}

	/// `active → grace`: the transport dropped. Releases the capacity
	/// slot and arms the session's reconnection token, which only now
	/// becomes resolvable.
	pub fn begin_grace(
		&self,
		id: SessionId,
		now: UnixMillis,
	) -> Result<ReconnectionToken, SessionError> {
		let mut session = self.sessions.get_mut(&id).ok_or(SessionError::NotFound)?;
		if session.state != SessionState::Active {
			return Err(SessionError::InvalidState);
		}
		let token = session
			.reconnection_token
			.clone()
			.unwrap_or_else(ReconnectionToken::mint);
		session.state = SessionState::Grace;
		session.grace_expires_at =
			Some(now.saturating_add_secs(self.cfg.grace_period_seconds));
		session.reconnection_token = Some(token.clone());
		let instance = session.instance_id;
		drop(session);

		self.by_token.insert(token.as_str().to_owned(), id);
		self.release_slot(instance, id);
		info!(session = %id, %instance, "session entered grace");
		Ok(token)
	}

	/// Resolves a token to its grace session. Tokens resolve only while
	/// the session is in grace and the deadline has not passed.
	pub fn resolve_reconnect_token(
		&self,
		token: &ReconnectionToken,
		now: UnixMillis,
	) -> Result<CharacterSession, TokenError> {
		let id = *self
			.by_token
			.get(token.as_str())
			.ok_or(TokenError::NotFound)?;
		let session = self.sessions.get(&id).ok_or(TokenError::NotFound)?;
		if session.state != SessionState::Grace {
			return Err(TokenError::NotFound);
		}
		match session.grace_expires_at {
			Some(deadline) if now < deadline => Ok(session.clone()),
			_ => Err(TokenError::Expired),
		}
	}

	/// `grace → active`: consumes the token and retakes a capacity slot.
	/// The caller is responsible for having checked capacity under the
	/// instance lock. A fresh token is minted for the next drop.
	pub fn restore_active(
		&self,
		id: SessionId,
		now: UnixMillis,
	) -> Result<ReconnectionToken, SessionError> {
		let mut session = self.sessions.get_mut(&id).ok_or(SessionError::NotFound)?;
		if session.state != SessionState::Grace {
			return Err(SessionError::InvalidState);
		}
		if let Some(token) = session.reconnection_token.take() {
			self.by_token.remove(token.as_str());
		}
		let fresh = ReconnectionToken::mint();
		session.state = SessionState::Active;
		session.grace_expires_at = None;
		session.last_heartbeat_at = now;
		session.reconnection_token = Some(fresh.clone());
		let instance = session.instance_id;
		drop(session);
		self.by_instance.entry(instance).or_default().insert(id);
		info!(session = %id, %instance, "session reconnected");
		Ok(fresh)
	}

	/// Any state → `terminating`, and removal. Returns the final record.
	pub fn terminate(
		&self,
		id: SessionId,
		reason: TerminateReason,
	) -> Option<CharacterSession> {
		let (_, mut session) = self.sessions.remove(&id)?;
		let was_active = session.state == SessionState::Active;
		session.state = SessionState::Terminating;
		self.by_character
			.remove_if(&session.character_id, |_, sid| *sid == id);
		if let Some(token) = session.reconnection_token.take() {
			self.by_token.remove(token.as_str());
		}
		if was_active {
			self.release_slot(session.instance_id, id);
		}
		info!(session = %id, character = %session.character_id, ?reason, "session terminated");
		Some(session)
	}

	/// Terminates sessions past the configured lifetime ceiling,
	/// whatever their state. Returns the terminated records.
	pub fn expire_overaged(&self, now: UnixMillis) -> Vec<CharacterSession> {
		let ceiling_ms = self.cfg.session_timeout_seconds * 1000;
		let overaged: Vec<SessionId> = self
			.sessions
			.iter()
			.filter(|s| now.saturating_since(s.admitted_at) >= ceiling_ms)
			.map(|s| s.session_id)
			.collect();
		overaged
			.into_iter()
			.filter_map(|id| self.terminate(id, TerminateReason::Expired))
			.collect()
	}

	/// Terminates every grace session whose deadline passed. Returns the
	/// terminated records.
	pub fn expire_grace(&self, now: UnixMillis) -> Vec<CharacterSession> {
		let expired: Vec<SessionId> = self
			.sessions
			.iter()
			.filter(|s| {
				s.state == SessionState::Grace
					&& s.grace_expires_at.is_some_and(|deadline| deadline <= now)
			})
			.map(|s| s.session_id)
			.collect();
		expired
			.into_iter()
			.filter_map(|id| self.terminate(id, TerminateReason::GraceExpired))
			.collect()
	}

	pub fn touch_heartbeat(&self, id: SessionId, now: UnixMillis) {
		if let Some(mut session) = self.sessions.get_mut(&id) {
			session.last_heartbeat_at = now;
		}
	}

	/// Marks the replaced-session provenance on a freshly created session.
	pub fn mark_replacement_of(&self, id: SessionId, old: SessionId) {
		if let Some(mut session) = self.sessions.get_mut(&id) {
			session.replacement_of = Some(old);
		}
	}

	fn release_slot(&self, instance: InstanceId, id: SessionId) {
		if let Some(mut set) = self.by_instance.get_mut(&instance) {
			set.remove(&id);
		}
		// Promotion worker may be gone during shutdown; dropping the
		// event is fine then.
		let _ = self.slot_freed.send(instance);
	}
}

#[cfg(test)]
mod test {
	use super::*;

	fn registry() -> SessionRegistry {
		SessionRegistry::new(SessionConfig::default()).0
	}

	#[test]
	fn one_live_session_per_character() {
		let reg = registry();
		let character = CharacterId::random();
		let user = UserId::random();
		let instance = InstanceId::random();
		let now = UnixMillis(1_000);

		let first = reg.create_active(character, user, instance, now).unwrap();
		assert_eq!(
			reg.create_active(character, user, instance, now).unwrap_err(),
			SessionError::IdentityConflict
		);
		reg.terminate(first.session_id, TerminateReason::Leave).unwrap();
		assert!(reg.create_active(character, user, instance, now).is_ok());
	}

	#[test]
	fn grace_releases_the_capacity_slot() {
		let reg = registry();
		let instance = InstanceId::random();
		let now = UnixMillis(1_000);
		let session = reg
			.create_active(CharacterId::random(), UserId::random(), instance, now)
			.unwrap();
		assert_eq!(reg.active_count(instance), 1);

		reg.begin_grace(session.session_id, now).unwrap();
		assert_eq!(reg.active_count(instance), 0);
		// Still the character's live session.
		assert!(reg.live_session_of(session.character_id).is_some());
	}

	#[test]
	fn reconnect_token_single_use_within_deadline() {
		let reg = registry();
		let instance = InstanceId::random();
		let now = UnixMillis(1_000);
		let session = reg
			.create_active(CharacterId::random(), UserId::random(), instance, now)
			.unwrap();
		let token = reg.begin_grace(session.session_id, now).unwrap();

		let resolved = reg.resolve_reconnect_token(&token, UnixMillis(2_000)).unwrap();
		assert_eq!(resolved.session_id, session.session_id);
		reg.restore_active(session.session_id, UnixMillis(2_000)).unwrap();
		assert_eq!(reg.active_count(instance), 1);

		// Consumed: the token no longer resolves.
		assert_eq!(
			reg.resolve_reconnect_token(&token, UnixMillis(2_001)).unwrap_err(),
			TokenError::NotFound
		);
	}

	#[test]
	fn reconnect_token_expires_at_grace_deadline() {
		let reg = registry();
		let now = UnixMillis(1_000);
		let session = reg
			.create_active(
				CharacterId::random(),
				UserId::random(),
				InstanceId::random(),
				now,
			)
			.unwrap();
		let token = reg.begin_grace(session.session_id, now).unwrap();

		// Deadline is now + 60s.
		let at_deadline = now.saturating_add_secs(60);
		assert_eq!(
			reg.resolve_reconnect_token(&token, at_deadline).unwrap_err(),
			TokenError::Expired
		);
	}

	#[test]
	fn expire_grace_terminates_and_unbinds_identity() {
		let reg = registry();
		let character = CharacterId::random();
		let now = UnixMillis(1_000);
		let session = reg
			.create_active(character, UserId::random(), InstanceId::random(), now)
			.unwrap();
		reg.begin_grace(session.session_id, now).unwrap();

		let expired = reg.expire_grace(now.saturating_add_secs(61));
		assert_eq!(expired.len(), 1);
		assert_eq!(expired[0].session_id, session.session_id);
		assert!(reg.live_session_of(character).is_none());
		assert!(reg.get(session.session_id).is_none());
	}

	#[test]
	fn overaged_sessions_hit_the_lifetime_ceiling() {
		let reg = SessionRegistry::new(SessionConfig {
			session_timeout_seconds: 100,
			..SessionConfig::default()
		})
		.0;
		let old = reg
			.create_active(
				CharacterId::random(),
				UserId::random(),
				InstanceId::random(),
				UnixMillis(0),
			)
			.unwrap();
		let young = reg
			.create_active(
				CharacterId::random(),
				UserId::random(),
				InstanceId::random(),
				UnixMillis(50_000),
			)
			.unwrap();

		let expired = reg.expire_overaged(UnixMillis(100_000));
		assert_eq!(expired.len(), 1);
		assert_eq!(expired[0].session_id, old.session_id);
		assert!(reg.get(young.session_id).is_some());
	}

	#[test]
	fn slot_events_fire_on_terminate_and_grace() {
		let (reg, mut slot_rx) = SessionRegistry::new(SessionConfig::default());
		let instance = InstanceId::random();
		let now = UnixMillis(1_000);
		let a = reg
			.create_active(CharacterId::random(), UserId::random(), instance, now)
			.unwrap();
		let b = reg
			.create_active(CharacterId::random(), UserId::random(), instance, now)
			.unwrap();

		reg.terminate(a.session_id, TerminateReason::Leave).unwrap();
		reg.begin_grace(b.session_id, now).unwrap();

		assert_eq!(slot_rx.try_recv().unwrap(), instance);
		assert_eq!(slot_rx.try_recv().unwrap(), instance);
		assert!(slot_rx.try_recv().is_err());
	}
}
