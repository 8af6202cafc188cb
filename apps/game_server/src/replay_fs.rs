//! Filesystem replay storage: one JSON-lines stream per battle plus a
//! metadata document written at finalization.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use mosaic_battle::{ReplayStorage, ReplayStorageError, ReplaySummary};
use mosaic_core::data_model::ReplayEvent;
use mosaic_core::InstanceId;

pub struct JsonLinesReplayStorage {
	root: PathBuf,
}

impl JsonLinesReplayStorage {
	pub fn new(root: PathBuf) -> Result<Self, ReplayStorageError> {
		fs::create_dir_all(&root).map_err(|err| ReplayStorageError(err.to_string()))?;
		Ok(Self { root })
	}

	fn stream_path(&self, replay_id: InstanceId) -> PathBuf {
		self.root.join(format!("{replay_id}.jsonl"))
	}

	fn meta_path(&self, replay_id: InstanceId) -> PathBuf {
		self.root.join(format!("{replay_id}.meta.json"))
	}
}

impl ReplayStorage for JsonLinesReplayStorage {
	fn append_batch(
		&self,
		replay_id: InstanceId,
		events: &[ReplayEvent],
	) -> Result<(), ReplayStorageError> {
		let mut file = OpenOptions::new()
			.create(true)
			.append(true)
			.open(self.stream_path(replay_id))
			.map_err(|err| ReplayStorageError(err.to_string()))?;
		let mut out = Vec::new();
		for event in events {
			serde_json::to_writer(&mut out, event)
				.map_err(|err| ReplayStorageError(err.to_string()))?;
			out.push(b'\n');
		}
		file.write_all(&out).map_err(|err| ReplayStorageError(err.to_string()))
	}

	fn finalize(
		&self,
		replay_id: InstanceId,
		summary: &ReplaySummary,
	) -> Result<(), ReplayStorageError> {
		let doc = serde_json::to_vec_pretty(summary)
			.map_err(|err| ReplayStorageError(err.to_string()))?;
		fs::write(self.meta_path(replay_id), doc)
			.map_err(|err| ReplayStorageError(err.to_string()))
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use mosaic_core::UnixMillis;

	#[test]
	fn streams_are_appended_and_sealed() {
		let dir = std::env::temp_dir().join(format!("mosaic-replays-{}", uuid::Uuid::new_v4()));
		let storage = JsonLinesReplayStorage::new(dir.clone()).unwrap();
		let replay = InstanceId::random();

		let event = |seq| ReplayEvent {
			seq,
			timestamp: UnixMillis(seq * 10),
			event_type: "tile_placed".into(),
			player_id: None,
			data: serde_json::json!({"seq": seq}),
			metadata: None,
		};
		storage.append_batch(replay, &[event(1), event(2)]).unwrap();
		storage.append_batch(replay, &[event(3)]).unwrap();

		let raw = fs::read_to_string(dir.join(format!("{replay}.jsonl"))).unwrap();
		let lines: Vec<&str> = raw.lines().collect();
		assert_eq!(lines.len(), 3);
		let parsed: ReplayEvent = serde_json::from_str(lines[2]).unwrap();
		assert_eq!(parsed.seq, 3);

		storage
			.finalize(
				replay,
				&ReplaySummary {
					instance_id: replay,
					rule_stamp: None,
					total_events: 3,
					total_bytes: raw.len() as u64,
					completed_at: UnixMillis(100),
					expires_at: UnixMillis(200),
				},
			)
			.unwrap();
		assert!(dir.join(format!("{replay}.meta.json")).exists());
		fs::remove_dir_all(dir).unwrap();
	}
}
