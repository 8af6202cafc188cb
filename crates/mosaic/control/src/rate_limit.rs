//! Sliding-window rate limiting per `(principal, channel)`.
//!
//! Each window is mutated under its own mutex, so check-and-record is a
//! single atomic step even under contention.

use std::collections::VecDeque;

use dashmap::DashMap;
use mosaic_core::config::RateLimitConfig;
use mosaic_core::{PrincipalId, UnixMillis};
use parking_lot::Mutex;
use tracing::{debug, warn};

/// Which budget a request draws from.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum RateChannel {
	Chat,
	Action,
	Admission,
}

/// Outcome of one rate check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateDecision {
	pub allowed: bool,
	/// Budget left in the current window after this request.
	pub remaining: u32,
	/// When the oldest counted event leaves the window.
	pub reset_at: UnixMillis,
	/// Set when the caller should back off (denied or locked out).
	pub retry_after_seconds: Option<u64>,
}

#[derive(Default)]
struct Window {
	events: VecDeque<UnixMillis>,
}

/// Sliding-window counters plus the admission lockout book.
pub struct RateLimiter {
	cfg: RateLimitConfig,
	windows: DashMap<(PrincipalId, RateChannel), Mutex<Window>>,
	/// Admission rejections per user, for lockout tripping.
	rejections: DashMap<PrincipalId, Mutex<Window>>,
	lockouts: DashMap<PrincipalId, UnixMillis>,
}

impl RateLimiter {
	pub fn new(cfg: RateLimitConfig) -> Self {
		Self {
			cfg,
			windows: DashMap::new(),
			rejections: DashMap::new(),
			lockouts: DashMap::new(),
		}
	}

	fn limits(&self, channel: RateChannel) -> (u32, u64) {
		match channel {
			RateChannel::Chat => (self.cfg.chat_max_per_window, self.cfg.chat_window_seconds),
			RateChannel::Action => {
				(self.cfg.action_max_per_window, self.cfg.action_window_seconds)
			}
			RateChannel::Admission => (
				self.cfg.admission_max_per_window,
				self.cfg.admission_window_seconds,
			),
		}
	}

	/// Seconds until an active lockout ends, if one is in force.
	pub fn lockout_remaining(&self, principal: PrincipalId, now: UnixMillis) -> Option<u64> {
		let until = *self.lockouts.get(&principal)?;
		if now < until {
			Some(until.saturating_since(now).div_ceil(1000))
		} else {
			self.lockouts.remove(&principal);
			None
		}
	}

	/// Atomically checks the window and records the event when allowed.
	pub fn check_and_record(
		&self,
		principal: PrincipalId,
		channel: RateChannel,
		now: UnixMillis,
	) -> RateDecision {
		if let Some(retry_after) = self.lockout_remaining(principal, now) {
			return RateDecision {
				allowed: false,
				remaining: 0,
				reset_at: now.saturating_add_secs(retry_after),
				retry_after_seconds: Some(retry_after),
			};
		}

		let (max, window_seconds) = self.limits(channel);
		let window_ms = window_seconds * 1000;
		let cell = self.windows.entry((principal, channel)).or_default();
		let mut window = cell.lock();
		while let Some(oldest) = window.events.front() {
			if now.saturating_since(*oldest) >= window_ms {
				window.events.pop_front();
			} else {
				break;
			}
		}

		let count = window.events.len() as u32;
		let reset_at = window
			.events
			.front()
			.map(|oldest| oldest.saturating_add_millis(window_ms))
			.unwrap_or(now);
		if count >= max {
			let retry_after = reset_at.saturating_since(now).div_ceil(1000);
			debug!(?channel, "rate limit exceeded");
			return RateDecision {
				allowed: false,
				remaining: 0,
				reset_at,
				retry_after_seconds: Some(retry_after.max(1)),
			};
		}
		window.events.push_back(now);
		RateDecision {
			allowed: true,
			remaining: max - count - 1,
			reset_at,
			retry_after_seconds: None,
		}
	}

	/// Records an admission rejection; repeated rejections inside the
	/// admission window trip the lockout.
	pub fn note_admission_rejection(&self, principal: PrincipalId, now: UnixMillis) {
		let window_ms = self.cfg.admission_window_seconds * 1000;
		let cell = self.rejections.entry(principal).or_default();
		let mut window = cell.lock();
		while let Some(oldest) = window.events.front() {
			if now.saturating_since(*oldest) >= window_ms {
				window.events.pop_front();
			} else {
				break;
			}
		}
		window.events.push_back(now);
		if window.events.len() as u32 >= self.cfg.admission_max_per_window {
			let until = now.saturating_add_secs(self.cfg.lockout_seconds);
			warn!(%principal, lockout_seconds = self.cfg.lockout_seconds, "admission lockout");
			self.lockouts.insert(principal, until);
			window.events.clear();
		}
	}

	/// Drops windows that have gone fully idle.
	pub fn reap_idle(&self, now: UnixMillis) {
		let horizon = self
			.cfg
			.chat_window_seconds
			.max(self.cfg.action_window_seconds)
			.max(self.cfg.admission_window_seconds)
			* 1000;
		self.windows.retain(|_, cell| {
			let window = cell.lock();
			window
				.events
				.back()
				.is_some_and(|last| now.saturating_since(*last) < horizon)
		});
		self.rejections.retain(|_, cell| {
			let window = cell.lock();
			window
				.events
				.back()
				.is_some_and(|last| now.saturating_since(*last) < horizon)
		});
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use mosaic_core::UserId;

	fn limiter() -> RateLimiter {
		RateLimiter::new(RateLimitConfig::default())
	}

	fn principal() -> PrincipalId {
		UserId::random().into()
	}

	#[test]
	fn chat_window_allows_twenty_then_denies() {
		let rl = limiter();
		let p = principal();
		for i in 0..20 {
			let decision = rl.check_and_record(p, RateChannel::Chat, UnixMillis(i));
			assert!(decision.allowed, "attempt {i} should pass");
		}
		let denied = rl.check_and_record(p, RateChannel::Chat, UnixMillis(20));
		assert!(!denied.allowed);
		assert!(denied.retry_after_seconds.is_some());
	}

	#[test]
	fn window_slides_and_recovers() {
		let rl = limiter();
		let p = principal();
		for i in 0..20 {
			rl.check_and_record(p, RateChannel::Chat, UnixMillis(i));
		}
		assert!(!rl.check_and_record(p, RateChannel::Chat, UnixMillis(100)).allowed);
		// 10s later the oldest events have left the window.
		assert!(rl.check_and_record(p, RateChannel::Chat, UnixMillis(10_000)).allowed);
	}

	#[test]
	fn channels_have_independent_budgets() {
		let rl = limiter();
		let p = principal();
		for i in 0..20 {
			rl.check_and_record(p, RateChannel::Chat, UnixMillis(i));
		}
		assert!(!rl.check_and_record(p, RateChannel::Chat, UnixMillis(21)).allowed);
		assert!(rl.check_and_record(p, RateChannel::Action, UnixMillis(21)).allowed);
	}

	#[test]
	fn repeated_rejections_trip_the_lockout() {
		let rl = limiter();
		let p = principal();
		for _ in 0..10 {
			rl.note_admission_rejection(p, UnixMillis(1_000));
		}
		let remaining = rl.lockout_remaining(p, UnixMillis(1_001)).unwrap();
		assert!(remaining > 0 && remaining <= 30);
		let denied = rl.check_and_record(p, RateChannel::Admission, UnixMillis(1_001));
		assert!(!denied.allowed);

		// Lockout clears after its deadline.
		assert!(rl.lockout_remaining(p, UnixMillis(32_000)).is_none());
		assert!(rl.check_and_record(p, RateChannel::Admission, UnixMillis(32_000)).allowed);
	}
}
