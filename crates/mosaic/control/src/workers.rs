//! Background maintenance tasks.
//!
//! One scheduler task per concern, each with an explicit stop signal.
//! On shutdown the owner cancels the token and joins the handles.

use std::sync::Arc;
use std::time::Duration;

use mosaic_core::UnixMillis;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::block_list::BlockListCache;
use crate::moderation::ModerationService;
use crate::queue::AdmissionQueue;
use crate::rate_limit::RateLimiter;
use crate::session::SessionRegistry;

/// Runs `tick` every `period` until `shutdown` fires.
pub fn spawn_periodic(
	name: &'static str,
	period: Duration,
	shutdown: CancellationToken,
	mut tick: impl FnMut() + Send + 'static,
) -> JoinHandle<()> {
	tokio::spawn(async move {
		let mut interval = tokio::time::interval(period);
		interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
		// Clear the immediate first tick.
		interval.tick().await;
		loop {
			tokio::select! {
				() = shutdown.cancelled() => {
					debug!(task = name, "worker stopped");
					break;
				}
				_ = interval.tick() => tick(),
			}
		}
	})
}

pub fn spawn_queue_reaper(
	queue: Arc<AdmissionQueue>,
	period: Duration,
	shutdown: CancellationToken,
) -> JoinHandle<()> {
	spawn_periodic("queue-ttl-reaper", period, shutdown, move || {
		queue.reap_expired(UnixMillis::now());
	})
}

pub fn spawn_grace_reaper(
	sessions: Arc<SessionRegistry>,
	period: Duration,
	shutdown: CancellationToken,
) -> JoinHandle<()> {
	spawn_periodic("grace-expiry-reaper", period, shutdown, move || {
		sessions.expire_grace(UnixMillis::now());
	})
}

pub fn spawn_session_timeout_reaper(
	sessions: Arc<SessionRegistry>,
	period: Duration,
	shutdown: CancellationToken,
) -> JoinHandle<()> {
	spawn_periodic("session-timeout-reaper", period, shutdown, move || {
		sessions.expire_overaged(UnixMillis::now());
	})
}

pub fn spawn_block_cache_reaper(
	cache: Arc<BlockListCache>,
	period: Duration,
	shutdown: CancellationToken,
) -> JoinHandle<()> {
	spawn_periodic("block-cache-reaper", period, shutdown, move || {
		cache.reap_expired(UnixMillis::now());
	})
}

pub fn spawn_mute_reaper(
	moderation: Arc<ModerationService>,
	period: Duration,
	shutdown: CancellationToken,
) -> JoinHandle<()> {
	spawn_periodic("mute-reaper", period, shutdown, move || {
		moderation.reap_expired(UnixMillis::now());
	})
}

pub fn spawn_rate_window_reaper(
	rate: Arc<RateLimiter>,
	period: Duration,
	shutdown: CancellationToken,
) -> JoinHandle<()> {
	spawn_periodic("rate-window-reaper", period, shutdown, move || {
		rate.reap_idle(UnixMillis::now());
	})
}
