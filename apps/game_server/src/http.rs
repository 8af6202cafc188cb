//! The public client API: admission, reconnection, instance status.
//!
//! Authentication issuance is out of scope; the adapter trusts the
//! `x-user-id` header put there by the fronting gateway.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use mosaic_control::admission::{AdmitOutcome, ReconnectError};
use mosaic_control::store::PlayerDirectory;
use mosaic_core::data_model::SessionState;
use mosaic_core::messages::api::{
	AdmitRequest, AdmitResponse, AdmitStatus, InstanceStatusResponse, QueueStanding,
	QueueStatusResponse, ReconnectRequest, ReconnectResponse,
};
use mosaic_core::{CharacterId, InstanceId, RejectReason, UserId};
use uuid::Uuid;

use crate::state::AppState;

pub const USER_HEADER: &str = "x-user-id";

pub fn user_from_headers(headers: &HeaderMap) -> Option<UserId> {
	let raw = headers.get(USER_HEADER)?.to_str().ok()?;
	raw.parse::<Uuid>().ok().map(UserId::from)
}

fn rejected(reason: RejectReason) -> AdmitResponse {
	AdmitResponse {
		status: AdmitStatus::Rejected,
		session_token: None,
		reconnection_token: None,
		replacement_token: None,
		queue_position: None,
		queue_depth: None,
		estimated_wait_seconds: None,
		reason: Some(reason),
	}
}

fn admit_response(outcome: AdmitOutcome) -> AdmitResponse {
	match outcome {
		AdmitOutcome::Admitted { session_id, reconnection_token } => AdmitResponse {
			status: AdmitStatus::Admitted,
			session_token: Some(session_id),
			reconnection_token,
			replacement_token: None,
			queue_position: None,
			queue_depth: None,
			estimated_wait_seconds: None,
			reason: None,
		},
		AdmitOutcome::Replaced { session_id, reconnection_token } => AdmitResponse {
			status: AdmitStatus::Replaced,
			session_token: Some(session_id),
			reconnection_token,
			replacement_token: None,
			queue_position: None,
			queue_depth: None,
			estimated_wait_seconds: None,
			reason: None,
		},
		AdmitOutcome::Queued { position, depth, estimated_wait_seconds } => AdmitResponse {
			status: AdmitStatus::Queued,
			session_token: None,
			reconnection_token: None,
			replacement_token: None,
			queue_position: Some(position),
			queue_depth: Some(depth),
			estimated_wait_seconds: Some(estimated_wait_seconds),
			reason: None,
		},
		AdmitOutcome::ReplaceRequired { replacement_token, .. } => AdmitResponse {
			status: AdmitStatus::ReplaceRequired,
			session_token: None,
			reconnection_token: None,
			replacement_token: Some(replacement_token),
			queue_position: None,
			queue_depth: None,
			estimated_wait_seconds: None,
			reason: None,
		},
		AdmitOutcome::Rejected { reason } => rejected(reason),
	}
}

/// `POST /instances/{id}/admit`
pub async fn admit(
	State(state): State<Arc<AppState>>,
	Path(instance_id): Path<InstanceId>,
	headers: HeaderMap,
	Json(request): Json<AdmitRequest>,
) -> Response {
	let Some(user_id) = user_from_headers(&headers) else {
		return StatusCode::UNAUTHORIZED.into_response();
	};

	// Character ownership: authoritative only where the directory knows
	// the character.
	match state.directory.player(request.character_id) {
		Ok(Some(record)) if record.user_id != user_id => {
			return Json(rejected(RejectReason::CharacterNotOwned)).into_response();
		}
		_ => {}
	}

	let outcome = state.admission.admit(
		instance_id,
		request.character_id,
		user_id,
		request.replace_token.as_ref(),
	);
	Json(admit_response(outcome)).into_response()
}

/// `POST /instances/{id}/reconnect`
pub async fn reconnect(
	State(state): State<Arc<AppState>>,
	Path(instance_id): Path<InstanceId>,
	Json(request): Json<ReconnectRequest>,
) -> Response {
	match state.admission.reconnect(&request.reconnection_token) {
		Ok(session) => {
			if session.instance_id != instance_id {
				return StatusCode::NOT_FOUND.into_response();
			}
			let Some(token) = session.reconnection_token else {
				return StatusCode::INTERNAL_SERVER_ERROR.into_response();
			};
			state.hub.push(
				session.character_id,
				mosaic_core::messages::session::Clientbound::ReconnectionSuccess {
					session_id: session.session_id,
				},
			);
			Json(ReconnectResponse {
				session_token: session.session_id,
				reconnection_token: token,
			})
			.into_response()
		}
		Err(ReconnectError::NotFound) => StatusCode::NOT_FOUND.into_response(),
		Err(ReconnectError::Expired) => StatusCode::GONE.into_response(),
		Err(ReconnectError::CapacityFull) => (
			StatusCode::CONFLICT,
			Json(rejected(RejectReason::CapacityFull)),
		)
			.into_response(),
	}
}

/// `GET /instances/{id}/status`
pub async fn status(
	State(state): State<Arc<AppState>>,
	Path(instance_id): Path<InstanceId>,
) -> Response {
	match state.admission.occupancy(instance_id) {
		Some(occupancy) => Json(InstanceStatusResponse {
			available: occupancy.available,
			total: occupancy.total,
			queue_depth: occupancy.queue_depth,
			drain_mode: occupancy.drain_mode,
		})
		.into_response(),
		None => StatusCode::NOT_FOUND.into_response(),
	}
}

/// `GET /instances/{id}/queue/{character}` — lets a waiting client poll
/// its standing; a queue promotion shows up here as `admitted`.
pub async fn queue_status(
	State(state): State<Arc<AppState>>,
	Path((instance_id, character_id)): Path<(InstanceId, CharacterId)>,
) -> Response {
	if state.instances.get(instance_id).is_none() {
		return StatusCode::NOT_FOUND.into_response();
	}
	if let Some(session) = state.sessions.live_session_of(character_id) {
		if session.instance_id == instance_id && session.state == SessionState::Active {
			return Json(QueueStatusResponse {
				standing: QueueStanding::Admitted,
				session_token: Some(session.session_id),
				position: None,
				depth: None,
				estimated_wait_seconds: None,
			})
			.into_response();
		}
	}
	match state.queue.position_of(instance_id, character_id) {
		Some(position) => {
			let depth = state.queue.depth(instance_id);
			Json(QueueStatusResponse {
				standing: QueueStanding::Queued,
				session_token: None,
				position: Some(position),
				depth: Some(depth),
				estimated_wait_seconds: Some(
					state.queue.estimated_wait_seconds(position, depth),
				),
			})
			.into_response()
		}
		None => Json(QueueStatusResponse {
			standing: QueueStanding::None,
			session_token: None,
			position: None,
			depth: None,
			estimated_wait_seconds: None,
		})
		.into_response(),
	}
}

/// `GET /healthz`
pub async fn healthz() -> &'static str {
	"ok"
}
