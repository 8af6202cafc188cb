//! Runtime configuration surface.
//!
//! Every tunable the subsystems consume is collected here so a single
//! JSON document can configure a server process. All sections and fields
//! default to production values; a config file only needs to spell out
//! what it overrides.

use serde::{Deserialize, Serialize};

/// Top-level runtime configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
	pub session: SessionConfig,
	pub queue: QueueConfig,
	pub rate: RateLimitConfig,
	pub heartbeat: HeartbeatConfig,
	pub quorum: QuorumConfig,
	pub battle: BattleConfig,
	pub chat: ChatConfig,
	pub replay: ReplayConfig,
	pub ai: AiScalingConfig,
	pub block_cache: BlockCacheConfig,
	pub moderation: ModerationConfig,
}

/// Session lifecycle tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
	/// How long a dropped session may be reclaimed by its owner.
	pub grace_period_seconds: u64,
	/// TTL of the minted reconnection token. Never exceeds the grace period.
	pub reconnection_token_ttl_seconds: u64,
	/// Hard ceiling on total session lifetime.
	pub session_timeout_seconds: u64,
	/// TTL of a replacement-confirmation token.
	pub replacement_token_ttl_seconds: u64,
}

impl Default for SessionConfig {
	fn default() -> Self {
		Self {
			grace_period_seconds: 60,
			reconnection_token_ttl_seconds: 60,
			session_timeout_seconds: 86_400,
			replacement_token_ttl_seconds: 300,
		}
	}
}

impl SessionConfig {
	/// The effective token TTL: configured TTL capped by the grace period.
	pub fn effective_token_ttl_seconds(&self) -> u64 {
		self.reconnection_token_ttl_seconds
			.min(self.grace_period_seconds)
	}
}

/// Admission queue tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
	/// Per-instance cap; a full queue rejects with QUEUE_FULL.
	pub max_queue_size: usize,
	/// Entries older than this are reaped without promotion.
	pub entry_ttl_seconds: u64,
	/// How often the TTL reaper scans.
	pub reap_interval_seconds: u64,
	/// Baseline admission interval used for the advisory wait estimate.
	pub average_admission_interval_seconds: f64,
}

impl Default for QueueConfig {
	fn default() -> Self {
		Self {
			max_queue_size: 100,
			entry_ttl_seconds: 300,
			reap_interval_seconds: 30,
			average_admission_interval_seconds: 5.0,
		}
	}
}

/// Sliding-window rate limits, per principal and channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
	pub chat_max_per_window: u32,
	pub chat_window_seconds: u64,
	pub action_max_per_window: u32,
	pub action_window_seconds: u64,
	pub admission_max_per_window: u32,
	pub admission_window_seconds: u64,
	/// Repeated admission rejections inside the window trip this lockout.
	pub lockout_seconds: u64,
}

impl Default for RateLimitConfig {
	fn default() -> Self {
		Self {
			chat_max_per_window: 20,
			chat_window_seconds: 10,
			action_max_per_window: 60,
			action_window_seconds: 10,
			admission_max_per_window: 10,
			admission_window_seconds: 10,
			lockout_seconds: 30,
		}
	}
}

/// Heartbeat liveness tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
	pub interval_seconds: u64,
	/// A player past this silence is unresponsive.
	pub timeout_seconds: u64,
	pub max_consecutive_failures: u32,
	/// Bounded ring of RTT samples kept per player.
	pub rtt_sample_capacity: usize,
}

impl Default for HeartbeatConfig {
	fn default() -> Self {
		Self {
			interval_seconds: 30,
			timeout_seconds: 30,
			max_consecutive_failures: 3,
			rtt_sample_capacity: 16,
		}
	}
}

/// Arena quorum thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuorumConfig {
	pub threshold_percent: u32,
	/// Quorum additionally requires at least this many responsive players.
	pub min_responsive_players: u32,
	pub check_period_seconds: u64,
	/// Seconds an aborting arena keeps draining after the shutdown broadcast.
	pub shutdown_drain_seconds: u64,
}

impl Default for QuorumConfig {
	fn default() -> Self {
		Self {
			threshold_percent: 60,
			min_responsive_players: 2,
			check_period_seconds: 10,
			shutdown_drain_seconds: 2,
		}
	}
}

/// Battle tick engine tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BattleConfig {
	pub tick_period_ms: u64,
	/// Wall-clock limit after which a battle resolves as a timeout.
	pub time_limit_seconds: u64,
}

impl Default for BattleConfig {
	fn default() -> Self {
		Self {
			tick_period_ms: 1000,
			time_limit_seconds: 1800,
		}
	}
}

/// Chat dispatcher tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
	pub max_content_chars: usize,
	/// Exactly-once dedup window.
	pub dedup_window_seconds: u64,
	pub exactly_once_max_retries: u32,
	pub exactly_once_timeout_seconds: u64,
	pub at_least_once_max_retries: u32,
	pub at_least_once_base_backoff_seconds: u64,
	pub at_least_once_backoff_multiplier: f64,
	pub best_effort_timeout_ms: u64,
	/// How often the retry scheduler scans its queue.
	pub retry_scan_interval_seconds: u64,
}

impl Default for ChatConfig {
	fn default() -> Self {
		Self {
			max_content_chars: 1000,
			dedup_window_seconds: 300,
			exactly_once_max_retries: 3,
			exactly_once_timeout_seconds: 10,
			at_least_once_max_retries: 5,
			at_least_once_base_backoff_seconds: 5,
			at_least_once_backoff_multiplier: 1.5,
			best_effort_timeout_ms: 1000,
			retry_scan_interval_seconds: 5,
		}
	}
}

/// Replay writer tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
	pub batch_size: usize,
	pub flush_interval_ms: u64,
	pub max_buffer_size: usize,
	pub retention_days: u64,
	/// Bounded retries for a failing flush before surfacing the error.
	pub flush_max_retries: u32,
	pub flush_retry_base_ms: u64,
}

impl Default for ReplayConfig {
	fn default() -> Self {
		Self {
			batch_size: 100,
			flush_interval_ms: 5000,
			max_buffer_size: 10_000,
			retention_days: 7,
			flush_max_retries: 3,
			flush_retry_base_ms: 50,
		}
	}
}

/// AI elasticity thresholds and throttles.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AiScalingConfig {
	/// Utilization at or above which scale-up rules fire.
	pub scale_up_utilization_pct: u32,
	/// Utilization at or below which scale-down rules fire.
	pub scale_down_utilization_pct: u32,
	pub min_ai_ratio: f64,
	pub max_ai_ratio: f64,
	/// After any scaling action the arena only gets throttle recommendations.
	pub cooldown_ms: u64,
	pub max_concurrent_operations: usize,
	pub recompute_interval_seconds: u64,
}

impl Default for AiScalingConfig {
	fn default() -> Self {
		Self {
			scale_up_utilization_pct: 70,
			scale_down_utilization_pct: 40,
			min_ai_ratio: 0.1,
			max_ai_ratio: 0.6,
			cooldown_ms: 30_000,
			max_concurrent_operations: 4,
			recompute_interval_seconds: 15,
		}
	}
}

/// Block-list cache tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockCacheConfig {
	pub ttl_seconds: u64,
	pub reap_interval_seconds: u64,
}

impl Default for BlockCacheConfig {
	fn default() -> Self {
		Self {
			ttl_seconds: 300,
			reap_interval_seconds: 60,
		}
	}
}

/// Moderation tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModerationConfig {
	/// How often expired mutes are reaped.
	pub mute_reap_interval_seconds: u64,
}

impl Default for ModerationConfig {
	fn default() -> Self {
		Self {
			mute_reap_interval_seconds: 60,
		}
	}
}
