//! The Mosaic game server binary: HTTP/WebSocket transport over the
//! control plane, plus the background workers that keep it honest.

pub mod admin;
pub mod battles;
pub mod channel;
pub mod http;
pub mod replay_fs;
pub mod state;
pub mod supervisor;

use std::net::{Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use color_eyre::eyre::Context as _;
use color_eyre::Result;
use mosaic_control::workers;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

use crate::state::{AppChannels, AppState};

/// Runs a mosaic game server.
#[derive(Parser, Debug, Clone)]
#[clap(author, version, about)]
pub struct Args {
	/// Port to listen on; 0 picks a free one.
	#[clap(short, long, default_value = "0")]
	pub port: u16,

	/// Path to a JSON runtime config; defaults apply when omitted.
	#[clap(long, env = "MOSAIC_CONFIG")]
	pub config: Option<PathBuf>,

	/// Directory for replay streams.
	#[clap(long, env = "MOSAIC_REPLAY_DIR", default_value = "replays")]
	pub replay_dir: PathBuf,
}

/// The full route table.
pub fn router(state: Arc<AppState>) -> Router {
	Router::new()
		.route("/healthz", get(http::healthz))
		.route("/instances/:id/admit", post(http::admit))
		.route("/instances/:id/reconnect", post(http::reconnect))
		.route("/instances/:id/status", get(http::status))
		.route("/instances/:id/queue/:character", get(http::queue_status))
		.route("/instances/:id/session", get(channel::session_channel))
		.route(
			"/admin/rule-configs",
			post(admin::create_rule_config).get(admin::list_rule_configs),
		)
		.route("/admin/rule-configs/:id", get(admin::get_rule_config))
		.route("/admin/rule-configs/:id/activate", post(admin::activate_rule_config))
		.route("/admin/rule-configs/:id/deactivate", post(admin::deactivate_rule_config))
		.route("/admin/instances", post(admin::create_instance))
		.route("/admin/instances/:id/drain", post(admin::set_drain))
		.route("/admin/blocks/add", post(admin::add_block))
		.route("/admin/blocks/remove", post(admin::remove_block))
		.route("/admin/moderation/mute", post(admin::mute))
		.route("/admin/moderation/unmute", post(admin::unmute))
		.route("/admin/moderation/kick", post(admin::kick))
		.route("/admin/moderation/dissolve-guild", post(admin::dissolve_guild))
		.layer(TraceLayer::new_for_http())
		.with_state(state)
}

/// Spawns every background worker against the shared state.
pub fn spawn_workers(state: Arc<AppState>, channels: AppChannels) {
	let AppChannels { slot_rx, resolved_rx, quorum_rx } = channels;
	let shutdown = state.shutdown.clone();

	let (promoted_tx, promoted_rx) = mpsc::unbounded_channel();
	tokio::spawn(mosaic_control::run_promotion_worker(
		state.admission.clone(),
		slot_rx,
		promoted_tx,
		shutdown.clone(),
	));
	tokio::spawn(supervisor::run_promotion_notifier(state.clone(), promoted_rx));
	tokio::spawn(supervisor::run_resolved_consumer(state.clone(), resolved_rx));
	tokio::spawn(supervisor::run_quorum_consumer(state.clone(), quorum_rx));
	tokio::spawn(supervisor::run_arena_sweep(state.clone()));

	mosaic_chat::spawn_retry_scheduler(state.chat.clone(), shutdown.clone());
	mosaic_presence::spawn_elasticity_worker(state.elasticity.clone(), shutdown.clone());

	let cfg = &state.cfg;
	workers::spawn_queue_reaper(
		state.queue.clone(),
		Duration::from_secs(cfg.queue.reap_interval_seconds),
		shutdown.clone(),
	);
	workers::spawn_grace_reaper(state.sessions.clone(), Duration::from_secs(1), shutdown.clone());
	workers::spawn_session_timeout_reaper(
		state.sessions.clone(),
		Duration::from_secs(60),
		shutdown.clone(),
	);
	mosaic_presence::spawn_liveness_sweep(
		state.heartbeats.clone(),
		Duration::from_secs(cfg.heartbeat.interval_seconds),
		shutdown.clone(),
	);
	workers::spawn_block_cache_reaper(
		state.blocks.clone(),
		Duration::from_secs(cfg.block_cache.reap_interval_seconds),
		shutdown.clone(),
	);
	workers::spawn_mute_reaper(
		state.moderation.clone(),
		Duration::from_secs(cfg.moderation.mute_reap_interval_seconds),
		shutdown.clone(),
	);
	workers::spawn_rate_window_reaper(
		state.rate.clone(),
		Duration::from_secs(60),
		shutdown.clone(),
	);
	{
		let chat = state.chat.clone();
		workers::spawn_periodic(
			"chat-dedup-reaper",
			Duration::from_secs(60),
			shutdown.clone(),
			move || chat.reap_dedup(mosaic_core::UnixMillis::now()),
		);
	}
}

pub async fn main(args: Args) -> Result<()> {
	color_eyre::install()?;
	let env_filter = EnvFilter::builder()
		.with_default_directive(LevelFilter::INFO.into())
		.from_env_lossy();
	tracing_subscriber::fmt()
		.with_target(true)
		.with_level(true)
		.with_env_filter(env_filter)
		.init();

	let cfg = match &args.config {
		Some(path) => {
			let raw = std::fs::read_to_string(path)
				.wrap_err_with(|| format!("failed to read config {}", path.display()))?;
			serde_json::from_str(&raw).wrap_err("failed to parse config")?
		}
		None => mosaic_core::config::ServerConfig::default(),
	};
	let storage = Arc::new(
		replay_fs::JsonLinesReplayStorage::new(args.replay_dir.clone())
			.map_err(|err| eyre::eyre!("failed to prepare replay dir: {err}"))?,
	);

	let (state, channels) = AppState::new(cfg, storage);
	spawn_workers(state.clone(), channels);

	let listener = tokio::net::TcpListener::bind(SocketAddr::new(
		Ipv6Addr::UNSPECIFIED.into(),
		args.port,
	))
	.await
	.wrap_err("failed to bind listener")?;
	info!("listening on {}", listener.local_addr()?);

	let shutdown = state.shutdown.clone();
	axum::serve(listener, router(state))
		.with_graceful_shutdown(async move {
			let _ = tokio::signal::ctrl_c().await;
			info!("shutdown signal received, draining");
			shutdown.cancel();
		})
		.await
		.wrap_err("server terminated")
}
