//! Per-instance admission waitlists.
//!
//! Order is `enqueued_at` ascending with a deterministic tie-break on
//! `character_id`, so promotion is causally consistent: whoever enqueued
//! first is promoted first.

use std::collections::{BTreeMap, HashMap};

use dashmap::DashMap;
use mosaic_core::config::QueueConfig;
use mosaic_core::data_model::QueueEntry;
use mosaic_core::{AttemptId, CharacterId, InstanceId, UnixMillis, UserId};
use parking_lot::Mutex;
use tracing::debug;

#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum QueueError {
	#[error("queue is full")]
	Full,
	#[error("character is already queued on this instance")]
	AlreadyQueued,
}

type OrderKey = (UnixMillis, CharacterId);

#[derive(Default)]
struct InstanceQueue {
	ordered: BTreeMap<OrderKey, QueueEntry>,
	by_character: HashMap<CharacterId, OrderKey>,
}

/// All instance waitlists.
pub struct AdmissionQueue {
	cfg: QueueConfig,
	queues: DashMap<InstanceId, Mutex<InstanceQueue>>,
}

impl AdmissionQueue {
	pub fn new(cfg: QueueConfig) -> Self {
		Self { cfg, queues: DashMap::new() }
	}

	/// Appends a waiting character. Returns its zero-based position.
	pub fn enqueue(
		&self,
		instance: InstanceId,
		character: CharacterId,
		user: UserId,
		now: UnixMillis,
	) -> Result<usize, QueueError> {
		let cell = self.queues.entry(instance).or_default();
		let mut queue = cell.lock();
		if queue.by_character.contains_key(&character) {
			return Err(QueueError::AlreadyQueued);
		}
		if queue.ordered.len() >= self.cfg.max_queue_size {
			return Err(QueueError::Full);
		}
		let key = (now, character);
		let entry = QueueEntry {
			character_id: character,
			user_id: user,
			instance_id: instance,
			enqueued_at: now,
			attempt_id: AttemptId::random(),
		};
		queue.ordered.insert(key, entry);
		queue.by_character.insert(character, key);
		let position = queue.ordered.keys().position(|k| *k == key).unwrap_or(0);
		debug!(%instance, %character, position, "queued for admission");
		Ok(position)
	}

	pub fn peek(&self, instance: InstanceId) -> Option<QueueEntry> {
		let cell = self.queues.get(&instance)?;
		let queue = cell.lock();
		queue.ordered.values().next().cloned()
	}

	/// Removes and returns the head of the waitlist.
	pub fn dequeue_head(&self, instance: InstanceId) -> Option<QueueEntry> {
		let cell = self.queues.get(&instance)?;
		let mut queue = cell.lock();
		let (key, entry) = queue.ordered.pop_first()?;
		debug_assert_eq!(key.1, entry.character_id);
		queue.by_character.remove(&entry.character_id);
		Some(entry)
	}

	/// Removes a specific character's entry, wherever it is.
	pub fn remove(&self, instance: InstanceId, character: CharacterId) -> Option<QueueEntry> {
		let cell = self.queues.get(&instance)?;
		let mut queue = cell.lock();
		let key = queue.by_character.remove(&character)?;
		queue.ordered.remove(&key)
	}

	/// Zero-based position of a queued character.
	pub fn position_of(&self, instance: InstanceId, character: CharacterId) -> Option<usize> {
		let cell = self.queues.get(&instance)?;
		let queue = cell.lock();
		let key = *queue.by_character.get(&character)?;
		queue.ordered.keys().position(|k| *k == key)
	}

	pub fn depth(&self, instance: InstanceId) -> usize {
		self.queues
			.get(&instance)
			.map_or(0, |cell| cell.lock().ordered.len())
	}

	/// Advisory wait estimate shown to queued clients.
	pub fn estimated_wait_seconds(&self, position: usize, depth: usize) -> u64 {
		let base = self.cfg.average_admission_interval_seconds;
		let inflation = 1.0 + depth as f64 / 100.0;
		(position as f64 * base * inflation).ceil() as u64
	}

	/// Drops an instance's whole waitlist, e.g. on disposal.
	pub fn clear_instance(&self, instance: InstanceId) -> Vec<QueueEntry> {
		let Some((_, cell)) = self.queues.remove(&instance) else {
			return Vec::new();
		};
		let mut queue = cell.into_inner();
		queue.by_character.clear();
		queue.ordered.into_values().collect()
	}

	/// Drops entries older than the configured TTL. Returns what was reaped.
	pub fn reap_expired(&self, now: UnixMillis) -> Vec<QueueEntry> {
		let ttl_ms = self.cfg.entry_ttl_seconds * 1000;
		let mut reaped = Vec::new();
		for cell in self.queues.iter() {
			let mut queue = cell.lock();
			let expired: Vec<OrderKey> = queue
				.ordered
				.iter()
				.take_while(|((enqueued, _), _)| now.saturating_since(*enqueued) > ttl_ms)
				.map(|(key, _)| *key)
				.collect();
			for key in expired {
				if let Some(entry) = queue.ordered.remove(&key) {
					queue.by_character.remove(&entry.character_id);
					reaped.push(entry);
				}
			}
		}
		if !reaped.is_empty() {
			debug!(count = reaped.len(), "reaped expired queue entries");
		}
		reaped
	}
}
