//! The single atomic decision point for entering an instance.
//!
//! One admission is one critical section: per-instance lock first, then
//! per-character lock (always in that order, so admission, promotion and
//! reconnection can never deadlock each other). Inside it the controller
//! reads the character's existing session, the active-set size and the
//! queue, and performs at most one mutation.

use std::sync::Arc;

use dashmap::DashMap;
use mosaic_core::config::{QueueConfig, SessionConfig};
use mosaic_core::data_model::{CharacterSession, QueueEntry, SessionState, TerminateReason};
use mosaic_core::token::{ReconnectionToken, ReplacementToken};
use mosaic_core::{
	CharacterId, InstanceId, PrincipalId, RejectReason, SessionId, UnixMillis, UserId,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::instance::{InstanceError, InstanceRegistry};
use crate::queue::{AdmissionQueue, QueueError};
use crate::rate_limit::{RateChannel, RateLimiter};
use crate::session::{SessionRegistry, SlotFreedReceiver, TokenError};
use crate::store::Metrics;

/// Result of one `admit` call.
#[derive(Debug, Clone, PartialEq)]
pub enum AdmitOutcome {
	Admitted {
		session_id: SessionId,
		reconnection_token: Option<ReconnectionToken>,
	},
	Queued {
		position: usize,
		depth: usize,
		estimated_wait_seconds: u64,
	},
	/// The caller owns another active session; confirm with the token.
	ReplaceRequired {
		existing_session: SessionId,
		replacement_token: ReplacementToken,
	},
	/// Replacement consumed; the old session is terminating.
	Replaced {
		session_id: SessionId,
		reconnection_token: Option<ReconnectionToken>,
	},
	Rejected {
		reason: RejectReason,
	},
}

impl AdmitOutcome {
	fn rejected(reason: RejectReason) -> Self {
		Self::Rejected { reason }
	}

	fn label(&self) -> &'static str {
		match self {
			Self::Admitted { .. } => "admitted",
			Self::Queued { .. } => "queued",
			Self::ReplaceRequired { .. } => "replace_required",
			Self::Replaced { .. } => "replaced",
			Self::Rejected { .. } => "rejected",
		}
	}
}

/// Why a reconnection attempt failed.
#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum ReconnectError {
	#[error("unknown reconnection token")]
	NotFound,
	#[error("reconnection token expired")]
	Expired,
	/// The freed slot was taken (usually by a queue promotion); the
	/// client goes through normal admission again.
	#[error("instance is at capacity")]
	CapacityFull,
}

/// A queue entry that was promoted into a session.
#[derive(Debug, Clone)]
pub struct PromotedSession {
	pub entry: QueueEntry,
	pub session_id: SessionId,
}

/// Point-in-time occupancy of one instance.
#[derive(Debug, Clone, Copy)]
pub struct InstanceOccupancy {
	pub available: usize,
	pub total: usize,
	pub queue_depth: usize,
	pub drain_mode: bool,
}

struct PendingReplacement {
	character_id: CharacterId,
	existing_session: SessionId,
	expires_at: UnixMillis,
}

pub struct AdmissionController {
	session_cfg: SessionConfig,
	queue_cfg: QueueConfig,
	instances: Arc<InstanceRegistry>,
	sessions: Arc<SessionRegistry>,
	queue: Arc<AdmissionQueue>,
	rate: Arc<RateLimiter>,
	metrics: Arc<dyn Metrics>,
	instance_locks: DashMap<InstanceId, Arc<Mutex<()>>>,
	character_locks: DashMap<CharacterId, Arc<Mutex<()>>>,
	pending_replacements: DashMap<String, PendingReplacement>,
}

impl AdmissionController {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		session_cfg: SessionConfig,
		queue_cfg: QueueConfig,
		instances: Arc<InstanceRegistry>,
		sessions: Arc<SessionRegistry>,
		queue: Arc<AdmissionQueue>,
		rate: Arc<RateLimiter>,
		metrics: Arc<dyn Metrics>,
	) -> Self {
		Self {
			session_cfg,
			queue_cfg,
			instances,
			sessions,
			queue,
			rate,
			metrics,
			instance_locks: DashMap::new(),
			character_locks: DashMap::new(),
			pending_replacements: DashMap::new(),
		}
	}

	pub fn admit(
		&self,
		instance_id: InstanceId,
		character_id: CharacterId,
		user_id: UserId,
		replace_token: Option<&ReplacementToken>,
	) -> AdmitOutcome {
		self.admit_at(instance_id, character_id, user_id, replace_token, UnixMillis::now())
	}

	#[instrument(skip(self, replace_token), fields(%instance_id, %character_id))]
	pub fn admit_at(
		&self,
		instance_id: InstanceId,
		character_id: CharacterId,
		user_id: UserId,
		replace_token: Option<&ReplacementToken>,
		now: UnixMillis,
	) -> AdmitOutcome {
		let principal = PrincipalId::from(user_id);
		let decision = self.rate.check_and_record(principal, RateChannel::Admission, now);
		if !decision.allowed {
			return self.finish(AdmitOutcome::rejected(RejectReason::RateLimited), None, now);
		}

		let instance = match self.instances.admittable(instance_id) {
			Ok(instance) => instance,
			Err(InstanceError::NotFound) => {
				return self.finish(
					AdmitOutcome::rejected(RejectReason::InvalidInstance),
					Some(principal),
					now,
				)
			}
			Err(_) => {
				return self.finish(
					AdmitOutcome::rejected(RejectReason::InstanceUnavailable),
					Some(principal),
					now,
				)
			}
		};

		// Critical section: instance first, then character.
		let instance_lock = lock_handle(&self.instance_locks, instance_id);
		let _instance_guard = instance_lock.lock();
		let character_lock = lock_handle(&self.character_locks, character_id);
		let _character_guard = character_lock.lock();

		let mut replaced_old = None;
		if let Some(existing) = self.sessions.live_session_of(character_id) {
			match existing.state {
				SessionState::Active => match replace_token {
					None => {
						let token = self.mint_replacement(character_id, existing.session_id, now);
						return self.finish(
							AdmitOutcome::ReplaceRequired {
								existing_session: existing.session_id,
								replacement_token: token,
							},
							None,
							now,
						);
					}
					Some(token) => {
						if !self.consume_replacement(token, character_id, existing.session_id, now)
						{
							return self.finish(
								AdmitOutcome::rejected(RejectReason::TokenExpired),
								Some(principal),
								now,
							);
						}
						self.sessions
							.terminate(existing.session_id, TerminateReason::Replace);
						replaced_old = Some(existing.session_id);
					}
				},
				SessionState::Grace => {
					// The owner came back through the front door instead
					// of the reconnect path. The grace session holds no
					// slot; supersede it.
					self.sessions
						.terminate(existing.session_id, TerminateReason::Replace);
					replaced_old = Some(existing.session_id);
				}
				SessionState::Terminating => {}
			}
		}

		if self.sessions.active_count(instance_id) < admission_limit(&instance) {
			let session =
				match self.sessions.create_active(character_id, user_id, instance_id, now) {
					Ok(session) => session,
					Err(err) => {
						warn!(%err, "session creation failed inside admission");
						return self.finish(
							AdmitOutcome::rejected(RejectReason::InternalError),
							None,
							now,
						);
					}
				};
			let outcome = match replaced_old {
				Some(old) => {
					self.sessions.mark_replacement_of(session.session_id, old);
					AdmitOutcome::Replaced {
						session_id: session.session_id,
						reconnection_token: session.reconnection_token.clone(),
					}
				}
				None => AdmitOutcome::Admitted {
					session_id: session.session_id,
					reconnection_token: session.reconnection_token.clone(),
				},
			};
			return self.finish(outcome, None, now);
		}

		match self.queue.enqueue(instance_id, character_id, user_id, now) {
			Ok(position) => {
				let depth = self.queue.depth(instance_id);
				self.finish(
					AdmitOutcome::Queued {
						position,
						depth,
						estimated_wait_seconds: self
							.queue
							.estimated_wait_seconds(position, depth),
					},
					None,
					now,
				)
			}
			Err(QueueError::AlreadyQueued) => {
				let position = self
					.queue
					.position_of(instance_id, character_id)
					.unwrap_or(0);
				let depth = self.queue.depth(instance_id);
				self.finish(
					AdmitOutcome::Queued {
						position,
						depth,
						estimated_wait_seconds: self
							.queue
							.estimated_wait_seconds(position, depth),
					},
					None,
					now,
				)
			}
			Err(QueueError::Full) => self.finish(
				AdmitOutcome::rejected(RejectReason::QueueFull),
				Some(principal),
				now,
			),
		}
	}

	/// Reclaims a grace session. Capacity is re-checked under the
	/// instance lock; losing the race is a normal admission-path outcome.
	pub fn reconnect(
		&self,
		token: &ReconnectionToken,
	) -> Result<CharacterSession, ReconnectError> {
		self.reconnect_at(token, UnixMillis::now())
	}

	pub fn reconnect_at(
		&self,
		token: &ReconnectionToken,
		now: UnixMillis,
	) -> Result<CharacterSession, ReconnectError> {
		let probe = self
			.sessions
			.resolve_reconnect_token(token, now)
			.map_err(map_token_error)?;

		let instance_lock = lock_handle(&self.instance_locks, probe.instance_id);
		let _instance_guard = instance_lock.lock();
		let character_lock = lock_handle(&self.character_locks, probe.character_id);
		let _character_guard = character_lock.lock();

		// Re-resolve under the lock; the token may have been consumed or
		// expired while we waited.
		let session = self
			.sessions
			.resolve_reconnect_token(token, now)
			.map_err(map_token_error)?;
		let instance = self
			.instances
			.get(session.instance_id)
			.ok_or(ReconnectError::NotFound)?;
		if self.sessions.active_count(session.instance_id) >= instance.capacity() {
			self.metrics
				.counter("reconnect_outcomes", &[("outcome", "capacity_full")], 1);
			return Err(ReconnectError::CapacityFull);
		}
		self.sessions
			.restore_active(session.session_id, now)
			.map_err(|_| ReconnectError::NotFound)?;
		self.metrics
			.counter("reconnect_outcomes", &[("outcome", "restored")], 1);
		info!(session = %session.session_id, "reconnection succeeded");
		self.sessions
			.get(session.session_id)
			.ok_or(ReconnectError::NotFound)
	}

	/// Promotes waitlisted characters while the instance has room.
	///
	/// Each pass dequeues exactly one entry; entries whose character
	/// acquired another session or whose TTL elapsed are discarded
	/// without consuming the slot.
	pub fn promote_ready(&self, instance_id: InstanceId, now: UnixMillis) -> Vec<PromotedSession> {
		let mut promoted = Vec::new();
		let Some(instance) = self.instances.get(instance_id) else {
			return promoted;
		};
		if instance.state.is_terminal() || instance.drain_mode {
			return promoted;
		}

		let instance_lock = lock_handle(&self.instance_locks, instance_id);
		let _instance_guard = instance_lock.lock();
		let ttl_ms = self.queue_cfg.entry_ttl_seconds * 1000;
		while self.sessions.active_count(instance_id) < admission_limit(&instance) {
			let Some(entry) = self.queue.dequeue_head(instance_id) else {
				break;
			};
			if now.saturating_since(entry.enqueued_at) > ttl_ms {
				continue;
			}
			let character_lock = lock_handle(&self.character_locks, entry.character_id);
			let _character_guard = character_lock.lock();
			if self.sessions.live_session_of(entry.character_id).is_some() {
				// Acquired a session elsewhere while waiting.
				continue;
			}
			match self
				.sessions
				.create_active(entry.character_id, entry.user_id, instance_id, now)
			{
				Ok(session) => {
					self.metrics
						.counter("admission_outcomes", &[("outcome", "promoted")], 1);
					info!(character = %entry.character_id, %instance_id, "promoted from queue");
					promoted.push(PromotedSession { entry, session_id: session.session_id });
				}
				Err(err) => {
					warn!(%err, "promotion failed, entry discarded");
				}
			}
		}
		promoted
	}

	/// Occupancy for the status endpoint.
	pub fn occupancy(&self, instance_id: InstanceId) -> Option<InstanceOccupancy> {
		let instance = self.instances.get(instance_id)?;
		let total = instance.capacity();
		let used = self.sessions.active_count(instance_id);
		Some(InstanceOccupancy {
			available: total.saturating_sub(used),
			total,
			queue_depth: self.queue.depth(instance_id),
			drain_mode: instance.drain_mode,
		})
	}

	/// Tears down admission state for a disposed instance.
	pub fn forget_instance(&self, instance_id: InstanceId) {
		self.queue.clear_instance(instance_id);
		self.instance_locks.remove(&instance_id);
	}

	fn mint_replacement(
		&self,
		character_id: CharacterId,
		existing_session: SessionId,
		now: UnixMillis,
	) -> ReplacementToken {
		let token = ReplacementToken::mint();
		self.pending_replacements.insert(
			token.as_str().to_owned(),
			PendingReplacement {
				character_id,
				existing_session,
				expires_at: now
					.saturating_add_secs(self.session_cfg.replacement_token_ttl_seconds),
			},
		);
		token
	}

	fn consume_replacement(
		&self,
		token: &ReplacementToken,
		character_id: CharacterId,
		existing_session: SessionId,
		now: UnixMillis,
	) -> bool {
		let Some((_, pending)) = self.pending_replacements.remove(token.as_str()) else {
			return false;
		};
		pending.character_id == character_id
			&& pending.existing_session == existing_session
			&& now < pending.expires_at
	}

	fn finish(
		&self,
		outcome: AdmitOutcome,
		rejected_principal: Option<PrincipalId>,
		now: UnixMillis,
	) -> AdmitOutcome {
		if let Some(principal) = rejected_principal {
			self.rate.note_admission_rejection(principal, now);
		}
		self.metrics
			.counter("admission_outcomes", &[("outcome", outcome.label())], 1);
		outcome
	}
}

/// How many slots fresh admissions and promotions may fill. Arenas keep
/// a headroom past 90% utilization so reconnecting players (who check
/// the full capacity) are not instantly crowded out; battles fill
/// completely.
fn admission_limit(instance: &mosaic_core::data_model::Instance) -> usize {
	let capacity = instance.capacity();
	if instance.mode.is_arena() {
		capacity * 9 / 10
	} else {
		capacity
	}
}

fn map_token_error(err: TokenError) -> ReconnectError {
	match err {
		TokenError::NotFound => ReconnectError::NotFound,
		TokenError::Expired => ReconnectError::Expired,
	}
}

fn lock_handle<K: std::hash::Hash + Eq + Copy>(
	locks: &DashMap<K, Arc<Mutex<()>>>,
	key: K,
) -> Arc<Mutex<()>> {
	locks.entry(key).or_default().clone()
}

/// Drains slot-freed events and promotes queue heads, pushing each
/// promotion to the transport layer.
pub async fn run_promotion_worker(
	controller: Arc<AdmissionController>,
	mut slot_rx: SlotFreedReceiver,
	promoted_tx: mpsc::UnboundedSender<PromotedSession>,
	shutdown: CancellationToken,
) {
	loop {
		tokio::select! {
			() = shutdown.cancelled() => break,
			freed = slot_rx.recv() => {
				let Some(instance_id) = freed else { break };
				for promotion in controller.promote_ready(instance_id, UnixMillis::now()) {
					if promoted_tx.send(promotion).is_err() {
						return;
					}
				}
			}
		}
	}
}
