//! Bounded TTL cache over the bidirectional block relation.
//!
//! Keys are the unordered pair in canonical `min:max` order. On a miss
//! both directions are fetched from the persistent relation and combined.
//! Repository outages fail open: chat proceeds as if unblocked, and
//! nothing is cached.

use dashmap::DashMap;
use mosaic_core::config::BlockCacheConfig;
use mosaic_core::{CharacterId, UnixMillis};
use std::sync::Arc;
use tracing::warn;

use crate::store::{BlockStore, Metrics};

/// Canonical unordered pair.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
struct PairKey(CharacterId, CharacterId);

impl PairKey {
	fn new(a: CharacterId, b: CharacterId) -> Self {
		if a <= b {
			Self(a, b)
		} else {
			Self(b, a)
		}
	}

	fn contains(&self, p: CharacterId) -> bool {
		self.0 == p || self.1 == p
	}
}

#[derive(Debug, Clone, Copy)]
struct CachedPair {
	/// `key.0` has blocked `key.1`.
	blocked: bool,
	/// `key.1` has blocked `key.0`.
	blocked_by: bool,
	cached_at: UnixMillis,
}

impl CachedPair {
	fn bidirectional(&self) -> bool {
		self.blocked || self.blocked_by
	}
}

pub struct BlockListCache {
	cfg: BlockCacheConfig,
	store: Arc<dyn BlockStore>,
	metrics: Arc<dyn Metrics>,
	entries: DashMap<PairKey, CachedPair>,
}

impl BlockListCache {
	pub fn new(
		cfg: BlockCacheConfig,
		store: Arc<dyn BlockStore>,
		metrics: Arc<dyn Metrics>,
	) -> Self {
		Self { cfg, store, metrics, entries: DashMap::new() }
	}

	/// Whether the pair is blocked in either direction.
	pub fn is_blocked(&self, a: CharacterId, b: CharacterId, now: UnixMillis) -> bool {
		let key = PairKey::new(a, b);
		let ttl_ms = self.cfg.ttl_seconds * 1000;
		if let Some(entry) = self.entries.get(&key) {
			if now.saturating_since(entry.cached_at) < ttl_ms {
				self.metrics.counter("block_cache_hits", &[], 1);
				return entry.bidirectional();
			}
		}

		self.metrics.counter("block_cache_misses", &[], 1);
		let forward = self.store.has_edge(key.0, key.1);
		let reverse = self.store.has_edge(key.1, key.0);
		match (forward, reverse) {
			(Ok(blocked), Ok(blocked_by)) => {
				let entry = CachedPair { blocked, blocked_by, cached_at: now };
				self.entries.insert(key, entry);
				entry.bidirectional()
			}
			(Err(err), _) | (_, Err(err)) => {
				// Fail open, don't cache the guess.
				warn!(%err, "block repository unavailable, failing open");
				self.metrics.counter("block_cache_repo_errors", &[], 1);
				false
			}
		}
	}

	pub fn invalidate_pair(&self, a: CharacterId, b: CharacterId) {
		self.entries.remove(&PairKey::new(a, b));
	}

	/// Removes every entry whose key contains `p`.
	pub fn invalidate_player(&self, p: CharacterId) {
		self.entries.retain(|key, _| !key.contains(p));
	}

	/// Drops entries past their TTL.
	pub fn reap_expired(&self, now: UnixMillis) {
		let ttl_ms = self.cfg.ttl_seconds * 1000;
		self.entries
			.retain(|_, entry| now.saturating_since(entry.cached_at) < ttl_ms);
	}

	#[cfg(test)]
	fn len(&self) -> usize {
		self.entries.len()
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::store::{InMemoryBlockStore, NoopMetrics};

	fn cache_with_store() -> (BlockListCache, Arc<InMemoryBlockStore>) {
		let store = Arc::new(InMemoryBlockStore::default());
		let cache = BlockListCache::new(
			BlockCacheConfig::default(),
			store.clone(),
			Arc::new(NoopMetrics),
		);
		(cache, store)
	}

	#[test]
	fn either_direction_blocks_the_pair() {
		let (cache, store) = cache_with_store();
		let (a, b) = (CharacterId::random(), CharacterId::random());
		assert!(!cache.is_blocked(a, b, UnixMillis(0)));

		store.block(b, a);
		// Cached answer until invalidated.
		assert!(!cache.is_blocked(a, b, UnixMillis(1)));
		cache.invalidate_pair(a, b);
		assert!(cache.is_blocked(a, b, UnixMillis(2)));
		// Symmetric closure: order of arguments is irrelevant.
		assert!(cache.is_blocked(b, a, UnixMillis(3)));
	}

	#[test]
	fn entries_expire_after_ttl() {
		let (cache, store) = cache_with_store();
		let (a, b) = (CharacterId::random(), CharacterId::random());
		assert!(!cache.is_blocked(a, b, UnixMillis(0)));

		store.block(a, b);
		// Within TTL: stale cached value.
		assert!(!cache.is_blocked(a, b, UnixMillis(299_999)));
		// Past TTL: refetched.
		assert!(cache.is_blocked(a, b, UnixMillis(300_000)));
	}

	#[test]
	fn repository_outage_fails_open_and_does_not_cache() {
		let (cache, store) = cache_with_store();
		let (a, b) = (CharacterId::random(), CharacterId::random());
		store.block(a, b);
		store.poison(true);
		assert!(!cache.is_blocked(a, b, UnixMillis(0)));
		assert_eq!(cache.len(), 0);

		// Recovery is immediate because nothing was cached.
		store.poison(false);
		assert!(cache.is_blocked(a, b, UnixMillis(1)));
	}

	#[test]
	fn invalidate_player_clears_all_their_pairs() {
		let (cache, _store) = cache_with_store();
		let (a, b, c) = (CharacterId::random(), CharacterId::random(), CharacterId::random());
		cache.is_blocked(a, b, UnixMillis(0));
		cache.is_blocked(a, c, UnixMillis(0));
		cache.is_blocked(b, c, UnixMillis(0));
		assert_eq!(cache.len(), 3);

		cache.invalidate_player(a);
		assert_eq!(cache.len(), 1);
	}
}
