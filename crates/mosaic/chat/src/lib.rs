//! Tiered chat delivery.
//!
//! Every message runs the same pre-delivery pipeline (validate, rate
//! limit, mute gate, block gate, dedup) and is then delivered with the
//! semantics of its tier: exactly-once with dedup and bounded retries,
//! at-least-once with exponential backoff, or best-effort with neither.
//! A single scheduler drains the shared retry queue, so no message id is
//! ever retried concurrently.

pub mod dedup;
pub mod retry;
pub mod sink;

pub use self::sink::{DeliveryFailure, DeliverySink, InMemorySink};

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use mosaic_control::block_list::BlockListCache;
use mosaic_control::moderation::ModerationService;
use mosaic_control::rate_limit::{RateChannel, RateLimiter};
use mosaic_control::session::SessionRegistry;
use mosaic_control::store::{Metrics, PlayerDirectory, StoreError};
use mosaic_core::config::ChatConfig;
use mosaic_core::data_model::{
	ChannelType, ChatMessage, DeliveryReceipt, DeliveryStatus, DeliveryTier,
};
use mosaic_core::{CharacterId, MessageId, UnixMillis};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use self::dedup::DedupWindow;
use self::retry::{RetryItem, RetryQueue};

/// Why a message was refused before delivery. All permanent.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChatError {
	#[error("invalid content: {0}")]
	InvalidContent(&'static str),
	#[error("unknown sender")]
	UnknownSender,
	#[error("unknown recipient")]
	UnknownRecipient,
	#[error("sender is rate limited")]
	RateLimited { retry_after_seconds: u64 },
	#[error("sender is muted on this channel")]
	Muted,
	#[error("pair is blocked")]
	Blocked,
	#[error("duplicate message")]
	Duplicate,
	#[error("internal error: {0}")]
	Internal(String),
}

impl ChatError {
	/// The stable string clients switch on.
	pub fn reason_str(&self) -> &'static str {
		match self {
			Self::InvalidContent(_) | Self::UnknownSender | Self::UnknownRecipient => {
				"INVALID_CONTENT"
			}
			Self::RateLimited { .. } => "RATE_LIMITED",
			Self::Muted => "MUTED",
			Self::Blocked => "BLOCKED",
			Self::Duplicate => "DUPLICATE",
			Self::Internal(_) => "INTERNAL_ERROR",
		}
	}
}

impl From<StoreError> for ChatError {
	fn from(err: StoreError) -> Self {
		Self::Internal(err.to_string())
	}
}

struct TierPolicy {
	max_retries: u32,
	attempt_timeout: Duration,
}

impl TierPolicy {
	fn for_tier(cfg: &ChatConfig, tier: DeliveryTier) -> Self {
		match tier {
			DeliveryTier::ExactlyOnce => Self {
				max_retries: cfg.exactly_once_max_retries,
				attempt_timeout: Duration::from_secs(cfg.exactly_once_timeout_seconds),
			},
			DeliveryTier::AtLeastOnce => Self {
				max_retries: cfg.at_least_once_max_retries,
				attempt_timeout: Duration::from_secs(cfg.at_least_once_base_backoff_seconds),
			},
			DeliveryTier::BestEffort => Self {
				max_retries: 0,
				attempt_timeout: Duration::from_millis(cfg.best_effort_timeout_ms),
			},
		}
	}

	/// Delay before retry number `next_attempt` (2-based: the first
	/// retry follows attempt 1).
	fn backoff_ms(&self, cfg: &ChatConfig, tier: DeliveryTier, prior_attempts: u32) -> u64 {
		match tier {
			DeliveryTier::ExactlyOnce => cfg.exactly_once_timeout_seconds * 1000,
			DeliveryTier::AtLeastOnce => {
				let base = cfg.at_least_once_base_backoff_seconds as f64 * 1000.0;
				let factor = cfg
					.at_least_once_backoff_multiplier
					.powi(prior_attempts.saturating_sub(1) as i32);
				(base * factor) as u64
			}
			DeliveryTier::BestEffort => 0,
		}
	}
}

struct PendingMessage {
	message: ChatMessage,
	outstanding: usize,
}

pub struct ChatDispatcher {
	cfg: ChatConfig,
	rate: Arc<RateLimiter>,
	blocks: Arc<BlockListCache>,
	moderation: Arc<ModerationService>,
	directory: Arc<dyn PlayerDirectory>,
	sessions: Arc<SessionRegistry>,
	sink: Arc<dyn DeliverySink>,
	metrics: Arc<dyn Metrics>,
	dedup: DedupWindow,
	pending: DashMap<MessageId, PendingMessage>,
	receipts: DashMap<(MessageId, CharacterId), DeliveryReceipt>,
	retry: RetryQueue,
}

impl ChatDispatcher {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		cfg: ChatConfig,
		rate: Arc<RateLimiter>,
		blocks: Arc<BlockListCache>,
		moderation: Arc<ModerationService>,
		directory: Arc<dyn PlayerDirectory>,
		sessions: Arc<SessionRegistry>,
		sink: Arc<dyn DeliverySink>,
		metrics: Arc<dyn Metrics>,
	) -> Self {
		let dedup = DedupWindow::new(cfg.dedup_window_seconds);
		Self {
			cfg,
			rate,
			blocks,
			moderation,
			directory,
			sessions,
			sink,
			metrics,
			dedup,
			pending: DashMap::new(),
			receipts: DashMap::new(),
			retry: RetryQueue::default(),
		}
	}

	pub async fn send(
		&self,
		sender: CharacterId,
		channel: ChannelType,
		recipient: Option<CharacterId>,
		content: String,
		timestamp: UnixMillis,
		tier_override: Option<DeliveryTier>,
	) -> Result<ChatMessage, ChatError> {
		self.send_at(sender, channel, recipient, content, timestamp, tier_override, UnixMillis::now())
			.await
	}

	/// The full pre-delivery pipeline plus the first delivery attempt
	/// per recipient. Returns the accepted message; delivery progress
	/// lives in the receipts.
	#[allow(clippy::too_many_arguments)]
	#[instrument(skip(self, content, tier_override, timestamp, now), fields(%sender))]
	pub async fn send_at(
		&self,
		sender: CharacterId,
		channel: ChannelType,
		recipient: Option<CharacterId>,
		content: String,
		timestamp: UnixMillis,
		tier_override: Option<DeliveryTier>,
		now: UnixMillis,
	) -> Result<ChatMessage, ChatError> {
		let chars = content.chars().count();
		if chars == 0 {
			return Err(ChatError::InvalidContent("empty"));
		}
		if chars > self.cfg.max_content_chars {
			return Err(ChatError::InvalidContent("too long"));
		}
		if self.directory.player(sender)?.is_none() {
			return Err(ChatError::UnknownSender);
		}

		let decision = self.rate.check_and_record(sender.into(), RateChannel::Chat, now);
		if !decision.allowed {
			return Err(ChatError::RateLimited {
				retry_after_seconds: decision.retry_after_seconds.unwrap_or(1),
			});
		}

		let (guild_scope, arena_scope) = match channel {
			ChannelType::Guild { guild_id } => (Some(guild_id), None),
			ChannelType::Arena { instance_id } => (None, Some(instance_id)),
			ChannelType::Private | ChannelType::Global => (None, None),
		};
		if self.moderation.is_muted(sender, guild_scope, arena_scope, now) {
			return Err(ChatError::Muted);
		}

		if let Some(recipient) = recipient {
			if self.directory.player(recipient)?.is_none() {
				return Err(ChatError::UnknownRecipient);
			}
			if self.blocks.is_blocked(sender, recipient, now) {
				return Err(ChatError::Blocked);
			}
		} else if matches!(channel, ChannelType::Private) {
			return Err(ChatError::InvalidContent("private message without recipient"));
		}

		let tier = tier_override.unwrap_or_else(|| channel.default_tier());
		if tier == DeliveryTier::ExactlyOnce
			&& !self.dedup.check_and_record(sender, &content, timestamp, now)
		{
			return Err(ChatError::Duplicate);
		}

		let message = ChatMessage {
			message_id: MessageId::random(),
			sender_id: sender,
			recipient_id: recipient,
			channel,
			content,
			timestamp,
			tier,
		};
		let recipients = self.resolve_recipients(&message, now)?;
		self.metrics.counter(
			"chat_messages",
			&[("tier", tier_label(tier))],
			1,
		);
		if recipients.is_empty() {
			debug!(message = %message.message_id, "no recipients after gating");
			return Ok(message);
		}

		self.pending.insert(
			message.message_id,
			PendingMessage { message: message.clone(), outstanding: recipients.len() },
		);
		for recipient in &recipients {
			self.receipts.insert(
				(message.message_id, *recipient),
				DeliveryReceipt {
					message_id: message.message_id,
					recipient_id: *recipient,
					status: DeliveryStatus::Pending,
					attempts: 0,
					last_error: None,
				},
			);
		}
		for recipient in recipients {
			self.attempt_delivery(message.message_id, recipient, now).await;
		}
		Ok(message)
	}

	fn resolve_recipients(
		&self,
		message: &ChatMessage,
		now: UnixMillis,
	) -> Result<Vec<CharacterId>, ChatError> {
		let candidates = match message.channel {
			ChannelType::Private => {
				vec![message.recipient_id.ok_or(ChatError::InvalidContent("missing recipient"))?]
			}
			ChannelType::Guild { guild_id } => self.directory.guild_members(guild_id)?,
			ChannelType::Arena { instance_id } => self.sessions.active_characters(instance_id),
			ChannelType::Global => self.sessions.all_active_characters(),
		};
		Ok(candidates
			.into_iter()
			.filter(|r| *r != message.sender_id)
			.filter(|r| {
				message.channel == ChannelType::Private
					|| !self.blocks.is_blocked(message.sender_id, *r, now)
			})
			.collect())
	}

	/// One delivery attempt for one recipient; schedules the retry or
	/// finalizes the receipt on failure.
	async fn attempt_delivery(&self, message_id: MessageId, recipient: CharacterId, now: UnixMillis) {
		let Some(pending) = self.pending.get(&message_id) else {
			return;
		};
		let message = pending.message.clone();
		drop(pending);
		let policy = TierPolicy::for_tier(&self.cfg, message.tier);

		let attempt = {
			let Some(mut receipt) = self.receipts.get_mut(&(message_id, recipient)) else {
				return;
			};
			if receipt.status != DeliveryStatus::Pending {
				return;
			}
			receipt.attempts += 1;
			receipt.attempts
		};

		let outcome =
			tokio::time::timeout(policy.attempt_timeout, self.sink.deliver(recipient, &message))
				.await;
		match outcome {
			Ok(Ok(())) => {
				self.finalize(message_id, recipient, DeliveryStatus::Delivered, None);
				self.metrics
					.counter("chat_deliveries", &[("outcome", "delivered")], 1);
			}
			Ok(Err(failure)) => {
				self.handle_failure(&message, recipient, attempt, &policy, failure.to_string(), now)
			}
			Err(_) => self.handle_failure(
				&message,
				recipient,
				attempt,
				&policy,
				"attempt timed out".into(),
				now,
			),
		}
	}

	fn handle_failure(
		&self,
		message: &ChatMessage,
		recipient: CharacterId,
		attempt: u32,
		policy: &TierPolicy,
		error: String,
		now: UnixMillis,
	) {
		if attempt > policy.max_retries {
			self.finalize(
				message.message_id,
				recipient,
				DeliveryStatus::Failed,
				Some(error),
			);
			self.metrics.counter(
				"chat_deliveries",
				&[("outcome", "max_attempts_exceeded")],
				1,
			);
			return;
		}
		if let Some(mut receipt) = self.receipts.get_mut(&(message.message_id, recipient)) {
			receipt.last_error = Some(error);
		}
		let delay = policy.backoff_ms(&self.cfg, message.tier, attempt);
		self.retry.push(RetryItem {
			next_retry_at: now.saturating_add_millis(delay),
			message_id: message.message_id,
			recipient,
		});
		debug!(message = %message.message_id, %recipient, attempt, delay_ms = delay, "delivery retry scheduled");
	}

	fn finalize(
		&self,
		message_id: MessageId,
		recipient: CharacterId,
		status: DeliveryStatus,
		error: Option<String>,
	) {
		if let Some(mut receipt) = self.receipts.get_mut(&(message_id, recipient)) {
			receipt.status = status;
			if error.is_some() {
				receipt.last_error = error;
			}
		}
		let emptied = {
			let Some(mut pending) = self.pending.get_mut(&message_id) else {
				return;
			};
			pending.outstanding = pending.outstanding.saturating_sub(1);
			pending.outstanding == 0
		};
		if emptied {
			self.pending.remove(&message_id);
		}
	}

	/// Re-dispatches every due retry. Called by the scheduler and by
	/// deterministic tests.
	pub async fn run_due_retries(&self, now: UnixMillis) {
		for item in self.retry.pop_due(now) {
			self.attempt_delivery(item.message_id, item.recipient, now).await;
		}
	}

	pub fn receipt(&self, message: MessageId, recipient: CharacterId) -> Option<DeliveryReceipt> {
		self.receipts.get(&(message, recipient)).map(|r| r.clone())
	}

	pub fn retry_queue_len(&self) -> usize {
		self.retry.len()
	}

	/// Drops dedup entries past the window.
	pub fn reap_dedup(&self, now: UnixMillis) {
		self.dedup.reap_expired(now);
	}
}

fn tier_label(tier: DeliveryTier) -> &'static str {
	match tier {
		DeliveryTier::ExactlyOnce => "exactly_once",
		DeliveryTier::AtLeastOnce => "at_least_once",
		DeliveryTier::BestEffort => "best_effort",
	}
}

/// Scans the retry queue on a fixed period until shutdown.
pub fn spawn_retry_scheduler(
	dispatcher: Arc<ChatDispatcher>,
	shutdown: CancellationToken,
) -> JoinHandle<()> {
	let period = Duration::from_secs(dispatcher.cfg.retry_scan_interval_seconds);
	tokio::spawn(async move {
		let mut interval = tokio::time::interval(period);
		interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
		interval.tick().await;
		loop {
			tokio::select! {
				() = shutdown.cancelled() => break,
				_ = interval.tick() => {
					dispatcher.run_due_retries(UnixMillis::now()).await;
				}
			}
		}
		info!("chat retry scheduler stopped");
	})
}
