//! Exactly-once dedup window.
//!
//! Within the window, `(sender, content, timestamp)` admits at most one
//! message. Content is hashed so the window never retains message text.

use dashmap::DashMap;
use mosaic_core::{CharacterId, UnixMillis};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
struct DedupKey {
	sender: CharacterId,
	content_hash: [u8; 32],
	timestamp: UnixMillis,
}

pub struct DedupWindow {
	window_ms: u64,
	entries: DashMap<DedupKey, UnixMillis>,
}

impl DedupWindow {
	pub fn new(window_seconds: u64) -> Self {
		Self { window_ms: window_seconds * 1000, entries: DashMap::new() }
	}

	/// Returns `true` and records the key if it is fresh; `false` if it
	/// was already seen inside the window.
	pub fn check_and_record(
		&self,
		sender: CharacterId,
		content: &str,
		timestamp: UnixMillis,
		now: UnixMillis,
	) -> bool {
		let key = DedupKey {
			sender,
			content_hash: Sha256::digest(content.as_bytes()).into(),
			timestamp,
		};
		match self.entries.entry(key) {
			dashmap::mapref::entry::Entry::Occupied(mut seen) => {
				if now.saturating_since(*seen.get()) < self.window_ms {
					return false;
				}
				seen.insert(now);
				true
			}
			dashmap::mapref::entry::Entry::Vacant(slot) => {
				slot.insert(now);
				true
			}
		}
	}

	pub fn reap_expired(&self, now: UnixMillis) {
		self.entries
			.retain(|_, seen_at| now.saturating_since(*seen_at) < self.window_ms);
	}

	#[cfg(test)]
	pub fn len(&self) -> usize {
		self.entries.len()
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn duplicate_within_window_is_refused() {
		let window = DedupWindow::new(300);
		let sender = CharacterId::random();

		assert!(window.check_and_record(sender, "hi", UnixMillis(100), UnixMillis(100)));
		assert!(!window.check_and_record(sender, "hi", UnixMillis(100), UnixMillis(200)));
		// Different timestamp: a different message.
		assert!(window.check_and_record(sender, "hi", UnixMillis(101), UnixMillis(200)));
		// Different sender: unrelated.
		assert!(window.check_and_record(
			CharacterId::random(),
			"hi",
			UnixMillis(100),
			UnixMillis(200)
		));
	}

	#[test]
	fn window_expiry_readmits() {
		let window = DedupWindow::new(300);
		let sender = CharacterId::random();
		assert!(window.check_and_record(sender, "hi", UnixMillis(0), UnixMillis(0)));
		assert!(window.check_and_record(sender, "hi", UnixMillis(0), UnixMillis(300_000)));
	}

	#[test]
	fn reaper_clears_stale_entries() {
		let window = DedupWindow::new(300);
		let sender = CharacterId::random();
		window.check_and_record(sender, "a", UnixMillis(0), UnixMillis(0));
		window.check_and_record(sender, "b", UnixMillis(0), UnixMillis(250_000));

		window.reap_expired(UnixMillis(300_000));
		assert_eq!(window.len(), 1);
	}
}
