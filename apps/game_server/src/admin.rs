//! The admin API: rule configs, instances, moderation commands.
//!
//! Every mutation lands in the audit log. The moderator principal comes
//! from the `x-admin-user` header; moderation commands additionally
//! authenticate it against the player directory.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use mosaic_control::moderation::ModerationError;
use mosaic_control::rules::RulesError;
use mosaic_core::data_model::{ArenaTier, AuditEntry, BattleSize, RuleConfigType};
use mosaic_core::messages::api::{
	BlockEdgeRequest, CommandAck, CreateRuleConfigRequest, DissolveGuildRequest, KickRequest,
	MuteRequest, UnmuteRequest,
};
use mosaic_core::{InstanceId, RejectReason, RuleConfigId, UnixMillis, UserId};
use serde::Deserialize;
use uuid::Uuid;

use crate::state::AppState;

pub const ADMIN_HEADER: &str = "x-admin-user";

fn admin_from_headers(headers: &HeaderMap) -> Option<UserId> {
	let raw = headers.get(ADMIN_HEADER)?.to_str().ok()?;
	raw.parse::<Uuid>().ok().map(UserId::from)
}

fn ack() -> Json<CommandAck> {
	Json(CommandAck { ok: true, at: UnixMillis::now(), reason: None })
}

fn nack(status: StatusCode, reason: Option<RejectReason>) -> Response {
	(status, Json(CommandAck { ok: false, at: UnixMillis::now(), reason })).into_response()
}

fn moderation_error(err: ModerationError) -> Response {
	match err {
		ModerationError::NotAuthorized | ModerationError::ModeratorInactive => {
			nack(StatusCode::FORBIDDEN, None)
		}
		ModerationError::TargetNotFound => nack(StatusCode::NOT_FOUND, None),
		ModerationError::Store(_) => {
			nack(StatusCode::INTERNAL_SERVER_ERROR, Some(RejectReason::InternalError))
		}
	}
}

// -- rule configs --

#[derive(Debug, Deserialize)]
pub struct ListRulesQuery {
	#[serde(rename = "type")]
	pub config_type: Option<RuleConfigType>,
}

pub async fn create_rule_config(
	State(state): State<Arc<AppState>>,
	headers: HeaderMap,
	Json(request): Json<CreateRuleConfigRequest>,
) -> Response {
	let Some(actor) = admin_from_headers(&headers) else {
		return StatusCode::UNAUTHORIZED.into_response();
	};
	match state
		.rules
		.create(request.config_type, request.version, request.config, actor)
	{
		Ok(record) => Json(record).into_response(),
		Err(RulesError::DuplicateVersion) => {
			nack(StatusCode::CONFLICT, Some(RejectReason::Duplicate))
		}
		Err(RulesError::NotFound) => nack(StatusCode::NOT_FOUND, None),
	}
}

pub async fn list_rule_configs(
	State(state): State<Arc<AppState>>,
	Query(query): Query<ListRulesQuery>,
) -> Response {
	Json(state.rules.list(query.config_type)).into_response()
}

pub async fn get_rule_config(
	State(state): State<Arc<AppState>>,
	Path(id): Path<RuleConfigId>,
) -> Response {
	match state.rules.get(id) {
		Some(record) => Json(record).into_response(),
		None => StatusCode::NOT_FOUND.into_response(),
	}
}

pub async fn activate_rule_config(
	State(state): State<Arc<AppState>>,
	Path(id): Path<RuleConfigId>,
	headers: HeaderMap,
) -> Response {
	let Some(actor) = admin_from_headers(&headers) else {
		return StatusCode::UNAUTHORIZED.into_response();
	};
	match state.rules.activate(id, actor) {
		Ok(()) => ack().into_response(),
		Err(RulesError::NotFound) => StatusCode::NOT_FOUND.into_response(),
		Err(RulesError::DuplicateVersion) => StatusCode::CONFLICT.into_response(),
	}
}

pub async fn deactivate_rule_config(
	State(state): State<Arc<AppState>>,
	Path(id): Path<RuleConfigId>,
	headers: HeaderMap,
) -> Response {
	let Some(actor) = admin_from_headers(&headers) else {
		return StatusCode::UNAUTHORIZED.into_response();
	};
	match state.rules.deactivate(id, actor) {
		Ok(()) => ack().into_response(),
		Err(_) => StatusCode::NOT_FOUND.into_response(),
	}
}

// -- instances --

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum CreateInstanceRequest {
	Battle { size: BattleSize, shard_key: String, region: String },
	Arena { tier: ArenaTier, shard_key: String, region: String },
}

pub async fn create_instance(
	State(state): State<Arc<AppState>>,
	headers: HeaderMap,
	Json(request): Json<CreateInstanceRequest>,
) -> Response {
	let Some(actor) = admin_from_headers(&headers) else {
		return StatusCode::UNAUTHORIZED.into_response();
	};
	let instance = match request {
		CreateInstanceRequest::Battle { size, shard_key, region } => {
			state.instances.create_battle(size, &shard_key, &region)
		}
		CreateInstanceRequest::Arena { tier, shard_key, region } => {
			let arena = state.instances.create_arena(tier, &shard_key, &region);
			// Arenas are long-running: active from the start, watched by
			// the sweep once populated.
			let _ = state.instances.activate(arena.instance_id, 0);
			state.elasticity.register_arena(arena.instance_id, arena.capacity());
			state.instances.get(arena.instance_id).unwrap_or(arena)
		}
	};
	state.audit.append(AuditEntry {
		at: UnixMillis::now(),
		actor,
		action: "instance.create".into(),
		subject: instance.instance_id.to_string(),
		detail: serde_json::json!({"mode": instance.mode}),
	});
	Json(instance).into_response()
}

#[derive(Debug, Deserialize)]
pub struct DrainRequest {
	pub drain: bool,
}

pub async fn set_drain(
	State(state): State<Arc<AppState>>,
	Path(id): Path<InstanceId>,
	headers: HeaderMap,
	Json(request): Json<DrainRequest>,
) -> Response {
	let Some(actor) = admin_from_headers(&headers) else {
		return StatusCode::UNAUTHORIZED.into_response();
	};
	match state.instances.set_drain(id, request.drain) {
		Ok(()) => {
			state.audit.append(AuditEntry {
				at: UnixMillis::now(),
				actor,
				action: "instance.drain".into(),
				subject: id.to_string(),
				detail: serde_json::json!({"drain": request.drain}),
			});
			ack().into_response()
		}
		Err(_) => StatusCode::NOT_FOUND.into_response(),
	}
}

// -- block relation --

/// Adds a directed block edge and invalidates the cached pair so chat
/// sees it immediately.
pub async fn add_block(
	State(state): State<Arc<AppState>>,
	headers: HeaderMap,
	Json(request): Json<BlockEdgeRequest>,
) -> Response {
	let Some(actor) = admin_from_headers(&headers) else {
		return StatusCode::UNAUTHORIZED.into_response();
	};
	state.block_store.block(request.owner, request.blocked);
	state.blocks.invalidate_pair(request.owner, request.blocked);
	state.audit.append(AuditEntry {
		at: UnixMillis::now(),
		actor,
		action: "block.add".into(),
		subject: request.owner.to_string(),
		detail: serde_json::json!({"blocked": request.blocked}),
	});
	ack().into_response()
}

pub async fn remove_block(
	State(state): State<Arc<AppState>>,
	headers: HeaderMap,
	Json(request): Json<BlockEdgeRequest>,
) -> Response {
	let Some(actor) = admin_from_headers(&headers) else {
		return StatusCode::UNAUTHORIZED.into_response();
	};
	state.block_store.unblock(request.owner, request.blocked);
	state.blocks.invalidate_pair(request.owner, request.blocked);
	state.audit.append(AuditEntry {
		at: UnixMillis::now(),
		actor,
		action: "block.remove".into(),
		subject: request.owner.to_string(),
		detail: serde_json::json!({"blocked": request.blocked}),
	});
	ack().into_response()
}

// -- moderation --

pub async fn mute(
	State(state): State<Arc<AppState>>,
	headers: HeaderMap,
	Json(request): Json<MuteRequest>,
) -> Response {
	let Some(actor) = admin_from_headers(&headers) else {
		return StatusCode::UNAUTHORIZED.into_response();
	};
	match state.moderation.mute(
		actor,
		request.player_id,
		request.scope,
		request.duration_seconds,
		request.reason,
		UnixMillis::now(),
	) {
		Ok(_) => ack().into_response(),
		Err(err) => moderation_error(err),
	}
}

pub async fn unmute(
	State(state): State<Arc<AppState>>,
	headers: HeaderMap,
	Json(request): Json<UnmuteRequest>,
) -> Response {
	let Some(actor) = admin_from_headers(&headers) else {
		return StatusCode::UNAUTHORIZED.into_response();
	};
	match state
		.moderation
		.unmute(actor, request.player_id, request.scope, UnixMillis::now())
	{
		Ok(()) => ack().into_response(),
		Err(err) => moderation_error(err),
	}
}

pub async fn kick(
	State(state): State<Arc<AppState>>,
	headers: HeaderMap,
	Json(request): Json<KickRequest>,
) -> Response {
	let Some(actor) = admin_from_headers(&headers) else {
		return StatusCode::UNAUTHORIZED.into_response();
	};
	match state
		.moderation
		.kick(actor, request.character_id, request.reason, UnixMillis::now())
	{
		Ok(()) => ack().into_response(),
		Err(err) => moderation_error(err),
	}
}

pub async fn dissolve_guild(
	State(state): State<Arc<AppState>>,
	headers: HeaderMap,
	Json(request): Json<DissolveGuildRequest>,
) -> Response {
	let Some(actor) = admin_from_headers(&headers) else {
		return StatusCode::UNAUTHORIZED.into_response();
	};
	match state
		.moderation
		.dissolve_guild(actor, request.guild_id, UnixMillis::now())
	{
		Ok(()) => ack().into_response(),
		Err(err) => moderation_error(err),
	}
}
