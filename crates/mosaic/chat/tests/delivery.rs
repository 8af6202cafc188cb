//! Delivery semantics per tier, exercised at the dispatcher layer with
//! an in-memory sink and deterministic timestamps.

use std::sync::Arc;

use mosaic_chat::{ChatDispatcher, ChatError, InMemorySink};
use mosaic_control::block_list::BlockListCache;
use mosaic_control::moderation::{ModerationService, NoopNotifier};
use mosaic_control::rate_limit::RateLimiter;
use mosaic_control::session::SessionRegistry;
use mosaic_control::store::{
	InMemoryAuditLog, InMemoryBlockStore, InMemoryPlayerDirectory, ModeratorRecord,
	NoopMetrics, PlayerRecord,
};
use mosaic_core::config::{BlockCacheConfig, ChatConfig, RateLimitConfig, SessionConfig};
use mosaic_core::data_model::{ChannelType, DeliveryStatus, DeliveryTier, MuteScope};
use mosaic_core::{CharacterId, GuildId, InstanceId, UnixMillis, UserId};

struct Fixture {
	dispatcher: ChatDispatcher,
	directory: Arc<InMemoryPlayerDirectory>,
	blocks: Arc<InMemoryBlockStore>,
	sessions: Arc<SessionRegistry>,
	sink: Arc<InMemorySink>,
	moderation: Arc<ModerationService>,
	moderator: UserId,
}

fn fixture() -> Fixture {
	let directory = Arc::new(InMemoryPlayerDirectory::default());
	let blocks = Arc::new(InMemoryBlockStore::default());
	let sessions = Arc::new(SessionRegistry::new(SessionConfig::default()).0);
	let sink = Arc::new(InMemorySink::default());
	let moderator = UserId::random();
	directory.insert_moderator(ModeratorRecord { user_id: moderator, is_active: true });

	let moderation = Arc::new(ModerationService::new(
		directory.clone(),
		Arc::new(InMemoryAuditLog::default()),
		sessions.clone(),
		Arc::new(NoopNotifier),
	));
	let dispatcher = ChatDispatcher::new(
		ChatConfig::default(),
		Arc::new(RateLimiter::new(RateLimitConfig::default())),
		Arc::new(BlockListCache::new(
			BlockCacheConfig::default(),
			blocks.clone(),
			Arc::new(NoopMetrics),
		)),
		moderation.clone(),
		directory.clone(),
		sessions.clone(),
		sink.clone(),
		Arc::new(NoopMetrics),
	);
	Fixture { dispatcher, directory, blocks, sessions, sink, moderation, moderator }
}

fn player(f: &Fixture, guild: Option<GuildId>) -> CharacterId {
	let character = CharacterId::random();
	f.directory.insert_player(PlayerRecord {
		character_id: character,
		user_id: UserId::random(),
		display_name: "tester".into(),
		guild,
	});
	character
}

#[tokio::test]
async fn exactly_once_dedup_refuses_verbatim_resend() {
	let f = fixture();
	let sender = player(&f, None);
	let recipient = player(&f, None);

	let sent = f
		.dispatcher
		.send_at(
			sender,
			ChannelType::Private,
			Some(recipient),
			"hi".into(),
			UnixMillis(100),
			None,
			UnixMillis(1_000),
		)
		.await
		.unwrap();
	assert_eq!(sent.tier, DeliveryTier::ExactlyOnce);
	assert_eq!(f.sink.delivered_to(recipient).len(), 1);

	// Verbatim resend inside the window: refused, nothing delivered.
	let err = f
		.dispatcher
		.send_at(
			sender,
			ChannelType::Private,
			Some(recipient),
			"hi".into(),
			UnixMillis(100),
			None,
			UnixMillis(2_000),
		)
		.await
		.unwrap_err();
	assert!(matches!(err, ChatError::Duplicate));
	assert_eq!(err.reason_str(), "DUPLICATE");
	assert_eq!(f.sink.delivered_to(recipient).len(), 1);

	// A later client timestamp is a different message.
	f.dispatcher
		.send_at(
			sender,
			ChannelType::Private,
			Some(recipient),
			"hi".into(),
			UnixMillis(101),
			None,
			UnixMillis(3_000),
		)
		.await
		.unwrap();
	assert_eq!(f.sink.delivered_to(recipient).len(), 2);
}

#[tokio::test]
async fn at_least_once_retries_until_ack() {
	let f = fixture();
	let sender = player(&f, None);
	let recipient = player(&f, None);
	let arena = InstanceId::random();
	f.sessions
		.create_active(recipient, UserId::random(), arena, UnixMillis(0))
		.unwrap();
	// Third attempt will succeed.
	f.sink.fail_next(recipient, 2);

	let message = f
		.dispatcher
		.send_at(
			sender,
			ChannelType::Arena { instance_id: arena },
			None,
			"incoming".into(),
			UnixMillis(0),
			None,
			UnixMillis(0),
		)
		.await
		.unwrap();
	assert_eq!(message.tier, DeliveryTier::AtLeastOnce);

	// Attempt 1 failed inline; the retry waits out the 5s base backoff.
	let receipt = f.dispatcher.receipt(message.message_id, recipient).unwrap();
	assert_eq!(receipt.status, DeliveryStatus::Pending);
	assert_eq!(receipt.attempts, 1);
	f.dispatcher.run_due_retries(UnixMillis(4_999)).await;
	assert_eq!(
		f.dispatcher.receipt(message.message_id, recipient).unwrap().attempts,
		1
	);

	// Attempt 2 at +5s fails; attempt 3 at +12.5s (5s × 1.5) succeeds.
	f.dispatcher.run_due_retries(UnixMillis(5_000)).await;
	f.dispatcher.run_due_retries(UnixMillis(12_500)).await;
	let receipt = f.dispatcher.receipt(message.message_id, recipient).unwrap();
	assert_eq!(receipt.status, DeliveryStatus::Delivered);
	assert_eq!(receipt.attempts, 3);
	assert_eq!(f.sink.delivered_to(recipient).len(), 1);
}

#[tokio::test]
async fn exactly_once_exhausts_and_fails() {
	let f = fixture();
	let sender = player(&f, None);
	let recipient = player(&f, None);
	f.sink.fail_next(recipient, 10);

	let message = f
		.dispatcher
		.send_at(
			sender,
			ChannelType::Private,
			Some(recipient),
			"are you there".into(),
			UnixMillis(0),
			None,
			UnixMillis(0),
		)
		.await
		.unwrap();

	// 1 initial attempt + 3 retries at the flat 10s timeout.
	f.dispatcher.run_due_retries(UnixMillis(10_000)).await;
	f.dispatcher.run_due_retries(UnixMillis(20_000)).await;
	f.dispatcher.run_due_retries(UnixMillis(30_000)).await;

	let receipt = f.dispatcher.receipt(message.message_id, recipient).unwrap();
	assert_eq!(receipt.status, DeliveryStatus::Failed);
	assert_eq!(receipt.attempts, 4);
	assert!(receipt.last_error.is_some());
	assert_eq!(f.dispatcher.retry_queue_len(), 0);
	assert!(f.sink.delivered_to(recipient).is_empty());
}

#[tokio::test]
async fn best_effort_never_retries() {
	let f = fixture();
	let sender = player(&f, None);
	let recipient = player(&f, None);
	f.sink.fail_next(recipient, 1);

	let message = f
		.dispatcher
		.send_at(
			sender,
			ChannelType::Private,
			Some(recipient),
			"ambient chatter".into(),
			UnixMillis(0),
			Some(DeliveryTier::BestEffort),
			UnixMillis(0),
		)
		.await
		.unwrap();

	let receipt = f.dispatcher.receipt(message.message_id, recipient).unwrap();
	assert_eq!(receipt.status, DeliveryStatus::Failed);
	assert_eq!(receipt.attempts, 1);
	assert_eq!(f.dispatcher.retry_queue_len(), 0);
}

#[tokio::test]
async fn content_length_boundaries() {
	let f = fixture();
	let sender = player(&f, None);
	let recipient = player(&f, None);

	for (content, ok) in [
		("x".repeat(1), true),
		("x".repeat(1000), true),
		(String::new(), false),
		("x".repeat(1001), false),
	] {
		let result = f
			.dispatcher
			.send_at(
				sender,
				ChannelType::Private,
				Some(recipient),
				content,
				UnixMillis::now(),
				None,
				UnixMillis::now(),
			)
			.await;
		assert_eq!(result.is_ok(), ok);
	}
}

#[tokio::test]
async fn blocked_pairs_fail_in_both_directions() {
	let f = fixture();
	let a = player(&f, None);
	let b = player(&f, None);
	f.blocks.block(a, b);

	let err = f
		.dispatcher
		.send_at(b, ChannelType::Private, Some(a), "hey".into(), UnixMillis(0), None, UnixMillis(0))
		.await
		.unwrap_err();
	assert!(matches!(err, ChatError::Blocked));
	let err = f
		.dispatcher
		.send_at(a, ChannelType::Private, Some(b), "hey".into(), UnixMillis(0), None, UnixMillis(0))
		.await
		.unwrap_err();
	assert_eq!(err.reason_str(), "BLOCKED");
}

#[tokio::test]
async fn muted_senders_are_silenced_in_scope() {
	let f = fixture();
	let guild = GuildId::random();
	let sender = player(&f, Some(guild));
	let recipient = player(&f, Some(guild));
	f.moderation
		.mute(
			f.moderator,
			sender,
			MuteScope::Guild { guild_id: guild },
			600,
			None,
			UnixMillis(0),
		)
		.unwrap();

	// Guild channel: silenced.
	let err = f
		.dispatcher
		.send_at(
			sender,
			ChannelType::Guild { guild_id: guild },
			None,
			"psst".into(),
			UnixMillis(1),
			None,
			UnixMillis(1),
		)
		.await
		.unwrap_err();
	assert!(matches!(err, ChatError::Muted));
	assert_eq!(err.reason_str(), "MUTED");

	// Private messages are outside a guild-scoped mute.
	f.dispatcher
		.send_at(
			sender,
			ChannelType::Private,
			Some(recipient),
			"psst".into(),
			UnixMillis(2),
			None,
			UnixMillis(2),
		)
		.await
		.unwrap();
	assert_eq!(f.sink.delivered_to(recipient).len(), 1);

	// After expiry the guild channel opens up again.
	f.dispatcher
		.send_at(
			sender,
			ChannelType::Guild { guild_id: guild },
			None,
			"back".into(),
			UnixMillis(3),
			None,
			UnixMillis(700_000),
		)
		.await
		.unwrap();
	assert_eq!(f.sink.delivered_to(recipient).len(), 2);
}

#[tokio::test]
async fn arena_fanout_skips_sender_and_blocked() {
	let f = fixture();
	let arena = InstanceId::random();
	let sender = player(&f, None);
	let friendly = player(&f, None);
	let hostile = player(&f, None);
	for character in [sender, friendly, hostile] {
		f.sessions
			.create_active(character, UserId::random(), arena, UnixMillis(0))
			.unwrap();
	}
	f.blocks.block(hostile, sender);

	f.dispatcher
		.send_at(
			sender,
			ChannelType::Arena { instance_id: arena },
			None,
			"hello arena".into(),
			UnixMillis(0),
			None,
			UnixMillis(0),
		)
		.await
		.unwrap();

	assert_eq!(f.sink.delivered_to(friendly).len(), 1);
	assert!(f.sink.delivered_to(hostile).is_empty());
	assert!(f.sink.delivered_to(sender).is_empty());
}

#[tokio::test]
async fn global_broadcast_reaches_every_active_player() {
	let f = fixture();
	let sender = player(&f, None);
	let near = player(&f, None);
	let far = player(&f, None);
	let (arena_a, arena_b) = (InstanceId::random(), InstanceId::random());
	f.sessions
		.create_active(sender, UserId::random(), arena_a, UnixMillis(0))
		.unwrap();
	f.sessions
		.create_active(near, UserId::random(), arena_a, UnixMillis(0))
		.unwrap();
	f.sessions
		.create_active(far, UserId::random(), arena_b, UnixMillis(0))
		.unwrap();

	f.dispatcher
		.send_at(
			sender,
			ChannelType::Global,
			None,
			"server restart soon".into(),
			UnixMillis(0),
			None,
			UnixMillis(0),
		)
		.await
		.unwrap();

	assert_eq!(f.sink.delivered_to(near).len(), 1);
	assert_eq!(f.sink.delivered_to(far).len(), 1);
	assert!(f.sink.delivered_to(sender).is_empty());
}

#[tokio::test]
async fn chat_rate_limit_kicks_in() {
	let f = fixture();
	let sender = player(&f, None);
	let recipient = player(&f, None);

	for i in 0..20 {
		f.dispatcher
			.send_at(
				sender,
				ChannelType::Private,
				Some(recipient),
				format!("msg {i}"),
				UnixMillis(i),
				None,
				UnixMillis(i),
			)
			.await
			.unwrap();
	}
	let err = f
		.dispatcher
		.send_at(
			sender,
			ChannelType::Private,
			Some(recipient),
			"one too many".into(),
			UnixMillis(21),
			None,
			UnixMillis(21),
		)
		.await
		.unwrap_err();
	assert!(matches!(err, ChatError::RateLimited { .. }));
	assert_eq!(err.reason_str(), "RATE_LIMITED");
}
