//! Seams to external collaborators: the persistent block relation, the
//! player directory, the audit log and the metrics pipeline.
//!
//! The control plane only ever talks to these traits. Production wires
//! real backends; tests and the default single-process deployment use
//! the in-memory implementations below.

use std::collections::HashMap;

use dashmap::DashMap;
use mosaic_core::data_model::AuditEntry;
use mosaic_core::{CharacterId, GuildId, UserId};
use parking_lot::Mutex;
use tracing::debug;

/// Failure of a backing store. Callers decide fail-open vs fail-safe.
#[derive(Debug, Clone, thiserror::Error)]
#[error("backing store unavailable: {0}")]
pub struct StoreError(pub String);

/// The persistent directed block relation.
pub trait BlockStore: Send + Sync {
	/// Whether `owner` has blocked `target` (directed).
	fn has_edge(&self, owner: CharacterId, target: CharacterId) -> Result<bool, StoreError>;
}

/// Player facts the control plane needs but does not own.
#[derive(Debug, Clone)]
pub struct PlayerRecord {
	pub character_id: CharacterId,
	pub user_id: UserId,
	pub display_name: String,
	pub guild: Option<GuildId>,
}

/// A principal allowed to run moderation commands.
#[derive(Debug, Clone)]
pub struct ModeratorRecord {
	pub user_id: UserId,
	/// Suspended moderators fail authentication.
	pub is_active: bool,
}

pub trait PlayerDirectory: Send + Sync {
	fn player(&self, id: CharacterId) -> Result<Option<PlayerRecord>, StoreError>;
	fn moderator(&self, id: UserId) -> Result<Option<ModeratorRecord>, StoreError>;
	fn guild_members(&self, guild: GuildId) -> Result<Vec<CharacterId>, StoreError>;
	/// Removes the guild and clears membership. Idempotent.
	fn dissolve_guild(&self, guild: GuildId) -> Result<(), StoreError>;
}

/// Append-only audit sink for admin and moderation actions.
pub trait AuditLog: Send + Sync {
	fn append(&self, entry: AuditEntry);
}

/// Minimal metrics seam. Publication is an external concern; the default
/// implementation just emits trace events.
pub trait Metrics: Send + Sync {
	fn counter(&self, _name: &'static str, _labels: &[(&'static str, &str)], _value: u64) {}
	fn gauge(&self, _name: &'static str, _labels: &[(&'static str, &str)], _value: f64) {}
	fn histogram_ms(&self, _name: &'static str, _labels: &[(&'static str, &str)], _value: u64) {}
}

/// Metrics sink that drops everything.
#[derive(Debug, Default)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {}

/// Metrics sink that emits `tracing` debug events.
#[derive(Debug, Default)]
pub struct TracingMetrics;

impl Metrics for TracingMetrics {
	fn counter(&self, name: &'static str, labels: &[(&'static str, &str)], value: u64) {
		debug!(metric = name, ?labels, value, kind = "counter");
	}

	fn gauge(&self, name: &'static str, labels: &[(&'static str, &str)], value: f64) {
		debug!(metric = name, ?labels, value, kind = "gauge");
	}

	fn histogram_ms(&self, name: &'static str, labels: &[(&'static str, &str)], value: u64) {
		debug!(metric = name, ?labels, value, kind = "histogram");
	}
}

/// Audit log that emits `tracing` info events. Good enough for a single
/// process; production replaces it with a durable sink.
#[derive(Debug, Default)]
pub struct TracingAuditLog;

impl AuditLog for TracingAuditLog {
	fn append(&self, entry: AuditEntry) {
		tracing::info!(
			actor = %entry.actor,
			action = %entry.action,
			subject = %entry.subject,
			"audit"
		);
	}
}

// -- in-memory implementations --

/// In-memory block relation.
#[derive(Debug, Default)]
pub struct InMemoryBlockStore {
	edges: DashMap<CharacterId, Vec<CharacterId>>,
	/// When set, every query fails. Lets tests exercise fail-open paths.
	poisoned: parking_lot::RwLock<bool>,
}

impl InMemoryBlockStore {
	pub fn block(&self, owner: CharacterId, target: CharacterId) {
		let mut targets = self.edges.entry(owner).or_default();
		if !targets.contains(&target) {
			targets.push(target);
		}
	}

	pub fn unblock(&self, owner: CharacterId, target: CharacterId) {
		if let Some(mut targets) = self.edges.get_mut(&owner) {
			targets.retain(|t| *t != target);
		}
	}

	pub fn poison(&self, poisoned: bool) {
		*self.poisoned.write() = poisoned;
	}
}

impl BlockStore for InMemoryBlockStore {
	fn has_edge(&self, owner: CharacterId, target: CharacterId) -> Result<bool, StoreError> {
		if *self.poisoned.read() {
			return Err(StoreError("block store poisoned".into()));
		}
		Ok(self
			.edges
			.get(&owner)
			.is_some_and(|targets| targets.contains(&target)))
	}
}

/// In-memory player directory.
#[derive(Debug, Default)]
pub struct InMemoryPlayerDirectory {
	players: DashMap<CharacterId, PlayerRecord>,
	moderators: DashMap<UserId, ModeratorRecord>,
	guilds: Mutex<HashMap<GuildId, Vec<CharacterId>>>,
}

impl InMemoryPlayerDirectory {
	pub fn insert_player(&self, record: PlayerRecord) {
		if let Some(guild) = record.guild {
			self.guilds
				.lock()
				.entry(guild)
				.or_default()
				.push(record.character_id);
		}
		self.players.insert(record.character_id, record);
	}

	pub fn insert_moderator(&self, record: ModeratorRecord) {
		self.moderators.insert(record.user_id, record);
	}
}

impl PlayerDirectory for InMemoryPlayerDirectory {
	fn player(&self, id: CharacterId) -> Result<Option<PlayerRecord>, StoreError> {
		Ok(self.players.get(&id).map(|r| r.clone()))
	}

	fn moderator(&self, id: UserId) -> Result<Option<ModeratorRecord>, StoreError> {
		Ok(self.moderators.get(&id).map(|r| r.clone()))
	}

	fn guild_members(&self, guild: GuildId) -> Result<Vec<CharacterId>, StoreError> {
		Ok(self.guilds.lock().get(&guild).cloned().unwrap_or_default())
	}

	fn dissolve_guild(&self, guild: GuildId) -> Result<(), StoreError> {
		let members = self.guilds.lock().remove(&guild).unwrap_or_default();
		for member in members {
			if let Some(mut player) = self.players.get_mut(&member) {
				player.guild = None;
			}
		}
		Ok(())
	}
}

/// Audit log that remembers entries, for assertions in tests.
#[derive(Debug, Default)]
pub struct InMemoryAuditLog {
	entries: Mutex<Vec<AuditEntry>>,
}

impl InMemoryAuditLog {
	pub fn entries(&self) -> Vec<AuditEntry> {
		self.entries.lock().clone()
	}
}

impl AuditLog for InMemoryAuditLog {
	fn append(&self, entry: AuditEntry) {
		self.entries.lock().push(entry);
	}
}
