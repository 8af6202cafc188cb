//! Wiring of every service the server runs.

use std::sync::Arc;

use dashmap::DashSet;
use mosaic_battle::{EndReason, ReplayStorage};
use mosaic_chat::ChatDispatcher;
use mosaic_control::admission::AdmissionController;
use mosaic_control::block_list::BlockListCache;
use mosaic_control::instance::InstanceRegistry;
use mosaic_control::moderation::ModerationService;
use mosaic_control::queue::AdmissionQueue;
use mosaic_control::rate_limit::RateLimiter;
use mosaic_control::rules::RuleConfigRegistry;
use mosaic_control::session::{SessionRegistry, SlotFreedReceiver};
use mosaic_control::store::{
	AuditLog, InMemoryBlockStore, InMemoryPlayerDirectory, Metrics, PlayerDirectory,
	TracingAuditLog, TracingMetrics,
};
use mosaic_core::config::ServerConfig;
use mosaic_core::InstanceId;
use mosaic_presence::quorum::QuorumDecision;
use mosaic_presence::{AiElasticityMonitor, ArenaQuorumMonitor, HeartbeatBook};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::battles::BattleManager;
use crate::channel::ClientHub;

/// Receivers the worker tasks consume; handed out once at construction.
pub struct AppChannels {
	pub slot_rx: SlotFreedReceiver,
	pub resolved_rx: mpsc::UnboundedReceiver<(InstanceId, EndReason)>,
	pub quorum_rx: mpsc::UnboundedReceiver<(InstanceId, QuorumDecision)>,
}

pub struct AppState {
	pub cfg: ServerConfig,
	pub directory: Arc<InMemoryPlayerDirectory>,
	pub block_store: Arc<InMemoryBlockStore>,
	pub audit: Arc<dyn AuditLog>,
	pub metrics: Arc<dyn Metrics>,
	pub rules: Arc<RuleConfigRegistry>,
	pub instances: Arc<InstanceRegistry>,
	pub sessions: Arc<SessionRegistry>,
	pub queue: Arc<AdmissionQueue>,
	pub rate: Arc<RateLimiter>,
	pub admission: Arc<AdmissionController>,
	pub blocks: Arc<BlockListCache>,
	pub moderation: Arc<ModerationService>,
	pub heartbeats: Arc<HeartbeatBook>,
	pub quorum: Arc<ArenaQuorumMonitor>,
	pub elasticity: Arc<AiElasticityMonitor>,
	pub chat: Arc<ChatDispatcher>,
	pub hub: Arc<ClientHub>,
	pub battles: Arc<BattleManager>,
	/// Where per-arena quorum workers report actionable decisions.
	pub quorum_tx: mpsc::UnboundedSender<(InstanceId, QuorumDecision)>,
	/// Arenas that already have a quorum worker.
	pub quorum_watched: DashSet<InstanceId>,
	pub shutdown: CancellationToken,
}

impl AppState {
	pub fn new(cfg: ServerConfig, replay_storage: Arc<dyn ReplayStorage>) -> (Arc<Self>, AppChannels) {
		let audit: Arc<dyn AuditLog> = Arc::new(TracingAuditLog);
		let metrics: Arc<dyn Metrics> = Arc::new(TracingMetrics);
		let directory = Arc::new(InMemoryPlayerDirectory::default());
		let directory_dyn: Arc<dyn PlayerDirectory> = directory.clone();

		let rules = Arc::new(RuleConfigRegistry::new(audit.clone()));
		let instances = Arc::new(InstanceRegistry::new(rules.clone()));
		let (sessions, slot_rx) = SessionRegistry::new(cfg.session.clone());
		let sessions = Arc::new(sessions);
		let queue = Arc::new(AdmissionQueue::new(cfg.queue.clone()));
		let rate = Arc::new(RateLimiter::new(cfg.rate.clone()));
		let admission = Arc::new(AdmissionController::new(
			cfg.session.clone(),
			cfg.queue.clone(),
			instances.clone(),
			sessions.clone(),
			queue.clone(),
			rate.clone(),
			metrics.clone(),
		));

		let hub = Arc::new(ClientHub::new(sessions.clone()));
		let block_store = Arc::new(InMemoryBlockStore::default());
		let blocks = Arc::new(BlockListCache::new(
			cfg.block_cache.clone(),
			block_store.clone(),
			metrics.clone(),
		));
		let moderation = Arc::new(ModerationService::new(
			directory_dyn.clone(),
			audit.clone(),
			sessions.clone(),
			hub.clone(),
		));
		let chat = Arc::new(ChatDispatcher::new(
			cfg.chat.clone(),
			rate.clone(),
			blocks.clone(),
			moderation.clone(),
			directory_dyn.clone(),
			sessions.clone(),
			hub.clone(),
			metrics.clone(),
		));

		let heartbeats = Arc::new(HeartbeatBook::new(cfg.heartbeat.clone()));
		let quorum = Arc::new(ArenaQuorumMonitor::new(
			cfg.quorum.clone(),
			heartbeats.clone(),
			instances.clone(),
		));
		let elasticity = Arc::new(AiElasticityMonitor::new(
			cfg.ai.clone(),
			Arc::new(mosaic_presence::elasticity::NoopActuator),
		));

		let shutdown = CancellationToken::new();
		let (resolved_tx, resolved_rx) = mpsc::unbounded_channel();
		let (quorum_tx, quorum_rx) = mpsc::unbounded_channel();
		let battles = Arc::new(BattleManager::new(
			cfg.battle.clone(),
			cfg.replay.clone(),
			instances.clone(),
			hub.clone(),
			replay_storage,
			metrics.clone(),
			resolved_tx,
			shutdown.clone(),
		));

		let state = Arc::new(Self {
			cfg,
			directory,
			block_store,
			audit,
			metrics,
			rules,
			instances,
			sessions,
			queue,
			rate,
			admission,
			blocks,
			moderation,
			heartbeats,
			quorum,
			elasticity,
			chat,
			hub,
			battles,
			quorum_tx,
			quorum_watched: DashSet::new(),
			shutdown,
		});
		(state, AppChannels { slot_rx, resolved_rx, quorum_rx })
	}
}
