//! Long-running supervision: executes quorum decisions, disposes ended
//! battles, watches arena population, and surfaces queue promotions.

use std::sync::Arc;
use std::time::Duration;

use mosaic_battle::{BattleControl, EndReason};
use mosaic_control::admission::PromotedSession;
use mosaic_core::data_model::{ArenaTier, InstanceMode, TerminateReason};
use mosaic_core::messages::session::Clientbound;
use mosaic_core::{InstanceId, UnixMillis};
use mosaic_presence::{run_quorum_worker, QuorumAction, QuorumDecision};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::state::AppState;

/// Consumes battle-end reports: finalizes instance state and frees
/// every piece of bookkeeping tied to the battle.
pub async fn run_resolved_consumer(
	state: Arc<AppState>,
	mut resolved_rx: mpsc::UnboundedReceiver<(InstanceId, EndReason)>,
) {
	while let Some((instance_id, reason)) = resolved_rx.recv().await {
		let (instance_result, terminate_reason) = match reason {
			EndReason::QuorumLost | EndReason::Shutdown => {
				(state.instances.abort(instance_id), TerminateReason::InstanceAborted)
			}
			EndReason::Timeout | EndReason::Empty | EndReason::Resolved => {
				(state.instances.resolve(instance_id), TerminateReason::InstanceResolved)
			}
		};
		if let Err(err) = instance_result {
			warn!(instance = %instance_id, %err, "instance finalization refused");
		}
		for session in state.sessions.active_sessions(instance_id) {
			state.sessions.terminate(session, terminate_reason);
		}
		state.battles.remove(instance_id);
		state.admission.forget_instance(instance_id);
		state.heartbeats.forget_instance(instance_id);
		state.elasticity.forget_arena(instance_id);
		info!(instance = %instance_id, outcome = reason.as_str(), "instance disposed");
	}
}

/// Consumes actionable quorum decisions for arenas.
pub async fn run_quorum_consumer(
	state: Arc<AppState>,
	mut quorum_rx: mpsc::UnboundedReceiver<(InstanceId, QuorumDecision)>,
) {
	while let Some((arena, decision)) = quorum_rx.recv().await {
		match decision.action {
			QuorumAction::Continue => {}
			QuorumAction::Pause => {
				state.battles.control(arena, BattleControl::Pause);
				state.hub.broadcast_instance(
					arena,
					Clientbound::ArenaPaused { reason: "quorum_degraded".into() },
				);
			}
			QuorumAction::Migrate => migrate_arena(&state, arena),
			QuorumAction::Abort => abort_arena(state.clone(), arena, "quorum_lost").await,
		}
	}
}

/// Relocation: spin up a smaller arena, point the survivors at it and
/// drain the old one. Clients re-enter through normal admission.
fn migrate_arena(state: &Arc<AppState>, arena: InstanceId) {
	let Some(instance) = state.instances.get(arena) else {
		return;
	};
	let InstanceMode::Arena { tier } = instance.mode else {
		return;
	};
	let target_tier = match tier {
		ArenaTier::Epic => ArenaTier::Skirmish,
		ArenaTier::Skirmish | ArenaTier::Tutorial => ArenaTier::Tutorial,
	};
	let target = state
		.instances
		.create_arena(target_tier, &instance.shard_key, &instance.region);
	let _ = state.instances.activate(target.instance_id, 0);
	let _ = state.instances.set_drain(arena, true);
	state.hub.broadcast_instance(
		arena,
		Clientbound::SystemNotice {
			event: "arena_migrate".into(),
			data: serde_json::json!({"target": target.instance_id}),
		},
	);
	info!(from = %arena, to = %target.instance_id, "arena migration initiated");
}

/// Graceful arena shutdown: broadcast, drain, dispose.
pub async fn abort_arena(state: Arc<AppState>, arena: InstanceId, reason: &str) {
	let _ = state.instances.set_drain(arena, true);
	state
		.hub
		.broadcast_instance(arena, Clientbound::ArenaShutdown { reason: reason.to_owned() });
	if state.battles.is_running(arena) {
		state
			.battles
			.control(arena, BattleControl::Abort { reason: EndReason::QuorumLost });
		// The battle worker's end report drives disposal.
		return;
	}
	tokio::time::sleep(Duration::from_secs(state.cfg.quorum.shutdown_drain_seconds)).await;
	for session in state.sessions.active_sessions(arena) {
		state.sessions.terminate(session, TerminateReason::InstanceAborted);
	}
	if let Err(err) = state.instances.abort(arena) {
		warn!(%arena, %err, "arena abort refused");
	}
	state.admission.forget_instance(arena);
	state.heartbeats.forget_instance(arena);
	state.elasticity.forget_arena(arena);
	info!(%arena, reason, "arena disposed");
}

/// Periodic arena sweep: keeps the elasticity monitor fed with player
/// counts and lazily starts quorum workers once an arena has a real
/// population to guard.
pub async fn run_arena_sweep(state: Arc<AppState>) {
	let mut interval = tokio::time::interval(Duration::from_secs(5));
	interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
	interval.tick().await;
	loop {
		tokio::select! {
			() = state.shutdown.cancelled() => break,
			_ = interval.tick() => sweep_arenas(&state),
		}
	}
}

fn sweep_arenas(state: &Arc<AppState>) {
	for instance in state.instances.list() {
		if !instance.mode.is_arena() || instance.state.is_terminal() {
			continue;
		}
		let arena = instance.instance_id;
		let humans = state.sessions.active_count(arena);
		state.elasticity.set_player_count(arena, humans as u32);

		if instance.initial_human_count == 0 && humans >= 2 {
			let _ = state.instances.set_initial_humans(arena, humans as u32);
		}
		if instance.initial_human_count > 0 || humans >= 2 {
			if state.quorum_watched.insert(arena) {
				tokio::spawn(run_quorum_worker(
					state.quorum.clone(),
					arena,
					state.quorum_tx.clone(),
					state.shutdown.child_token(),
				));
				info!(%arena, "quorum worker started");
			}
		}
	}
}

/// Surfaces queue promotions to clients that still have a channel open
/// from an earlier session; everyone else discovers theirs through the
/// admission API.
pub async fn run_promotion_notifier(
	state: Arc<AppState>,
	mut promoted_rx: mpsc::UnboundedReceiver<PromotedSession>,
) {
	while let Some(promotion) = promoted_rx.recv().await {
		let character = promotion.entry.character_id;
		state.heartbeats.register(
			promotion.entry.instance_id,
			character,
			UnixMillis::now(),
		);
		state.hub.push(
			character,
			Clientbound::SystemNotice {
				event: "admitted_from_queue".into(),
				data: serde_json::json!({
					"instance": promotion.entry.instance_id,
					"session_token": promotion.session_id,
				}),
			},
		);
	}
}
