//! Append-only, buffered replay recording.
//!
//! One writer per active battle. Events get a gap-free sequence number
//! starting at 1 and a non-decreasing timestamp. Flushes are serial per
//! replay and happen on batch size, interval, or finalization. A failing
//! flush keeps the buffer, backs off boundedly and surfaces the error;
//! it never re-queues from a cleared buffer.

use std::sync::Arc;

use mosaic_core::config::ReplayConfig;
use mosaic_core::data_model::{ReplayEvent, RuleVersionStamp};
use mosaic_core::{CharacterId, InstanceId, UnixMillis};
use parking_lot::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Clone, thiserror::Error)]
pub enum ReplayError {
	/// Buffer is full and the forced flush could not drain it.
	#[error("replay buffer overflow")]
	BufferOverflow,
	#[error("replay write failed: {0}")]
	WriteFailed(String),
	#[error("replay is finalized")]
	Finalized,
}

/// Failure of the backing stream.
#[derive(Debug, Clone, thiserror::Error)]
#[error("replay storage unavailable: {0}")]
pub struct ReplayStorageError(pub String);

/// Totals recorded when a replay closes.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ReplaySummary {
	pub instance_id: InstanceId,
	pub rule_stamp: Option<RuleVersionStamp>,
	pub total_events: u64,
	pub total_bytes: u64,
	pub completed_at: UnixMillis,
	pub expires_at: UnixMillis,
}

/// Seam to the append-only JSON-lines stream.
pub trait ReplayStorage: Send + Sync {
	fn append_batch(
		&self,
		replay_id: InstanceId,
		events: &[ReplayEvent],
	) -> Result<(), ReplayStorageError>;
	fn finalize(
		&self,
		replay_id: InstanceId,
		summary: &ReplaySummary,
	) -> Result<(), ReplayStorageError>;
}

struct WriterInner {
	buffer: Vec<ReplayEvent>,
	next_seq: u64,
	last_timestamp: UnixMillis,
	last_flush_at: UnixMillis,
	total_events: u64,
	total_bytes: u64,
	flush_failures: u32,
	flush_backoff_until: UnixMillis,
	finalized: bool,
}

pub struct ReplayWriter {
	cfg: ReplayConfig,
	instance_id: InstanceId,
	rule_stamp: Option<RuleVersionStamp>,
	storage: Arc<dyn ReplayStorage>,
	inner: Mutex<WriterInner>,
}

impl ReplayWriter {
	pub fn new(
		cfg: ReplayConfig,
		instance_id: InstanceId,
		rule_stamp: Option<RuleVersionStamp>,
		storage: Arc<dyn ReplayStorage>,
		now: UnixMillis,
	) -> Self {
		Self {
			cfg,
			instance_id,
			rule_stamp,
			storage,
			inner: Mutex::new(WriterInner {
				buffer: Vec::new(),
				next_seq: 1,
				last_timestamp: UnixMillis(0),
				last_flush_at: now,
				total_events: 0,
				total_bytes: 0,
				flush_failures: 0,
				flush_backoff_until: UnixMillis(0),
				finalized: false,
			}),
		}
	}

	pub fn instance_id(&self) -> InstanceId {
		self.instance_id
	}

	/// Appends one event, assigning its sequence number and timestamp.
	pub fn append(
		&self,
		event_type: &str,
		player_id: Option<CharacterId>,
		data: serde_json::Value,
		now: UnixMillis,
	) -> Result<u64, ReplayError> {
		let mut inner = self.inner.lock();
		if inner.finalized {
			return Err(ReplayError::Finalized);
		}
		if inner.buffer.len() >= self.cfg.max_buffer_size {
			// Force an immediate flush; if that cannot drain, refuse.
			if self.flush_locked(&mut inner, now).is_err()
				&& inner.buffer.len() >= self.cfg.max_buffer_size
			{
				warn!(replay = %self.instance_id, "replay buffer overflow");
				return Err(ReplayError::BufferOverflow);
			}
		}

		let timestamp = now.max(inner.last_timestamp);
		let seq = inner.next_seq;
		inner.next_seq += 1;
		inner.last_timestamp = timestamp;
		inner.buffer.push(ReplayEvent {
			seq,
			timestamp,
			event_type: event_type.to_owned(),
			player_id,
			data,
			metadata: None,
		});

		if inner.buffer.len() >= self.cfg.batch_size {
			// Batch threshold reached; a failure here is surfaced but the
			// event itself is safely buffered.
			self.flush_locked(&mut inner, now)
				.map_err(|err| {
					debug!(replay = %self.instance_id, %err, "batch flush deferred");
					err
				})
				.ok();
		}
		Ok(seq)
	}

	/// Interval-driven flush; a no-op before the interval elapses.
	pub fn maybe_flush(&self, now: UnixMillis) -> Result<(), ReplayError> {
		let mut inner = self.inner.lock();
		if inner.finalized || inner.buffer.is_empty() {
			return Ok(());
		}
		if now.saturating_since(inner.last_flush_at) < self.cfg.flush_interval_ms {
			return Ok(());
		}
		self.flush_locked(&mut inner, now)
	}

	/// Forces a flush regardless of thresholds.
	pub fn flush(&self, now: UnixMillis) -> Result<(), ReplayError> {
		let mut inner = self.inner.lock();
		if inner.finalized {
			return Err(ReplayError::Finalized);
		}
		self.flush_locked(&mut inner, now)
	}

	/// Final flush, then closes the writer and records totals. The
	/// replay expires `retention_days` after completion.
	pub fn finalize(&self, now: UnixMillis) -> Result<ReplaySummary, ReplayError> {
		let mut inner = self.inner.lock();
		if inner.finalized {
			return Err(ReplayError::Finalized);
		}
		// The final flush must not be skipped by backoff.
		inner.flush_backoff_until = UnixMillis(0);
		self.flush_locked(&mut inner, now)?;
		inner.finalized = true;
		let summary = ReplaySummary {
			instance_id: self.instance_id,
			rule_stamp: self.rule_stamp.clone(),
			total_events: inner.total_events,
			total_bytes: inner.total_bytes,
			completed_at: now,
			expires_at: now.saturating_add_secs(self.cfg.retention_days * 24 * 3600),
		};
		self.storage
			.finalize(self.instance_id, &summary)
			.map_err(|err| ReplayError::WriteFailed(err.to_string()))?;
		debug!(replay = %self.instance_id, events = summary.total_events, "replay finalized");
		Ok(summary)
	}

	fn flush_locked(&self, inner: &mut WriterInner, now: UnixMillis) -> Result<(), ReplayError> {
		if inner.buffer.is_empty() {
			inner.last_flush_at = now;
			return Ok(());
		}
		if now < inner.flush_backoff_until {
			return Err(ReplayError::WriteFailed("flush backing off".into()));
		}
		match self.storage.append_batch(self.instance_id, &inner.buffer) {
			Ok(()) => {
				let bytes: u64 = inner
					.buffer
					.iter()
					.map(|e| serde_json::to_vec(e).map(|v| v.len() as u64 + 1).unwrap_or(0))
					.sum();
				inner.total_events += inner.buffer.len() as u64;
				inner.total_bytes += bytes;
				inner.buffer.clear();
				inner.last_flush_at = now;
				inner.flush_failures = 0;
				inner.flush_backoff_until = UnixMillis(0);
				Ok(())
			}
			Err(err) => {
				// Keep the buffer; back off exponentially, bounded.
				let exponent = inner.flush_failures.min(self.cfg.flush_max_retries);
				inner.flush_failures = inner.flush_failures.saturating_add(1);
				let delay = self.cfg.flush_retry_base_ms << exponent;
				inner.flush_backoff_until = now.saturating_add_millis(delay);
				warn!(replay = %self.instance_id, %err, delay_ms = delay, "replay flush failed");
				Err(ReplayError::WriteFailed(err.to_string()))
			}
		}
	}
}

/// In-memory storage: the default for tests and single-process runs.
#[derive(Default)]
pub struct InMemoryReplayStorage {
	streams: Mutex<std::collections::HashMap<InstanceId, Vec<ReplayEvent>>>,
	summaries: Mutex<std::collections::HashMap<InstanceId, ReplaySummary>>,
	poisoned: Mutex<bool>,
}

impl InMemoryReplayStorage {
	pub fn poison(&self, poisoned: bool) {
		*self.poisoned.lock() = poisoned;
	}

	pub fn events(&self, replay_id: InstanceId) -> Vec<ReplayEvent> {
		self.streams.lock().get(&replay_id).cloned().unwrap_or_default()
	}

	pub fn summary(&self, replay_id: InstanceId) -> Option<ReplaySummary> {
		self.summaries.lock().get(&replay_id).cloned()
	}
}

impl ReplayStorage for InMemoryReplayStorage {
	fn append_batch(
		&self,
		replay_id: InstanceId,
		events: &[ReplayEvent],
	) -> Result<(), ReplayStorageError> {
		if *self.poisoned.lock() {
			return Err(ReplayStorageError("poisoned".into()));
		}
		self.streams
			.lock()
			.entry(replay_id)
			.or_default()
			.extend_from_slice(events);
		Ok(())
	}

	fn finalize(
		&self,
		replay_id: InstanceId,
		summary: &ReplaySummary,
	) -> Result<(), ReplayStorageError> {
		if *self.poisoned.lock() {
			return Err(ReplayStorageError("poisoned".into()));
		}
		self.summaries.lock().insert(replay_id, summary.clone());
		Ok(())
	}
}

#[cfg(test)]
mod test {
	use super::*;

	fn writer(cfg: ReplayConfig) -> (ReplayWriter, Arc<InMemoryReplayStorage>) {
		let storage = Arc::new(InMemoryReplayStorage::default());
		let writer = ReplayWriter::new(
			cfg,
			InstanceId::random(),
			None,
			storage.clone(),
			UnixMillis(0),
		);
		(writer, storage)
	}

	#[test]
	fn sequences_are_gap_free_and_timestamps_monotone() {
		let (w, storage) = writer(ReplayConfig { batch_size: 3, ..ReplayConfig::default() });
		// Clock jitter: the second event's clock reads earlier.
		w.append("tile_placed", None, serde_json::json!({}), UnixMillis(100)).unwrap();
		w.append("tile_placed", None, serde_json::json!({}), UnixMillis(50)).unwrap();
		w.append("tile_placed", None, serde_json::json!({}), UnixMillis(200)).unwrap();

		let events = storage.events(w.instance_id());
		assert_eq!(events.len(), 3);
		let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
		assert_eq!(seqs, vec![1, 2, 3]);
		let stamps: Vec<UnixMillis> = events.iter().map(|e| e.timestamp).collect();
		assert!(stamps.windows(2).all(|w| w[0] <= w[1]));
	}

	#[test]
	fn interval_flush_and_finalize_totals() {
		let (w, storage) = writer(ReplayConfig::default());
		w.append("battle_started", None, serde_json::json!({}), UnixMillis(0)).unwrap();
		// Before the interval: buffered.
		w.maybe_flush(UnixMillis(1_000)).unwrap();
		assert!(storage.events(w.instance_id()).is_empty());
		// Past the interval: flushed.
		w.maybe_flush(UnixMillis(5_000)).unwrap();
		assert_eq!(storage.events(w.instance_id()).len(), 1);

		w.append("battle_ended", None, serde_json::json!({}), UnixMillis(6_000)).unwrap();
		let summary = w.finalize(UnixMillis(7_000)).unwrap();
		assert_eq!(summary.total_events, 2);
		assert!(summary.total_bytes > 0);
		assert_eq!(summary.expires_at, UnixMillis(7_000).saturating_add_secs(7 * 24 * 3600));
		assert!(storage.summary(w.instance_id()).is_some());

		// Closed for good.
		assert!(matches!(
			w.append("late", None, serde_json::json!({}), UnixMillis(8_000)),
			Err(ReplayError::Finalized)
		));
	}

	#[test]
	fn flush_failure_keeps_buffer_and_backs_off() {
		let (w, storage) = writer(ReplayConfig {
			batch_size: 1,
			flush_retry_base_ms: 100,
			..ReplayConfig::default()
		});
		storage.poison(true);

		// Batch flush fails but the append itself succeeds.
		w.append("tile_placed", None, serde_json::json!({}), UnixMillis(0)).unwrap();
		assert!(storage.events(w.instance_id()).is_empty());

		// Inside the backoff window even a forced flush refuses.
		assert!(matches!(w.flush(UnixMillis(50)), Err(ReplayError::WriteFailed(_))));

		// Storage heals; after the backoff the buffer drains intact.
		storage.poison(false);
		w.flush(UnixMillis(200)).unwrap();
		let events = storage.events(w.instance_id());
		assert_eq!(events.len(), 1);
		assert_eq!(events[0].seq, 1);
	}

	#[test]
	fn overflow_is_surfaced_when_forced_flush_cannot_drain() {
		let (w, storage) = writer(ReplayConfig {
			batch_size: 100,
			max_buffer_size: 2,
			flush_retry_base_ms: 1_000_000,
			..ReplayConfig::default()
		});
		storage.poison(true);

		w.append("a", None, serde_json::json!({}), UnixMillis(0)).unwrap();
		w.append("b", None, serde_json::json!({}), UnixMillis(1)).unwrap();
		let err = w.append("c", None, serde_json::json!({}), UnixMillis(2)).unwrap_err();
		assert!(matches!(err, ReplayError::BufferOverflow));

		// Nothing was lost or re-queued: the two buffered events flush
		// once storage recovers.
		storage.poison(false);
		w.finalize(UnixMillis(10)).unwrap();
		let events = storage.events(w.instance_id());
		assert_eq!(events.len(), 2);
		assert_eq!(events.last().unwrap().seq, 2);
	}
}
