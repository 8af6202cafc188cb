//! Request/response documents for the client and admin HTTP APIs.

use serde::{Deserialize, Serialize};

use crate::data_model::{MuteScope, RuleConfigType, RuleVersion};
use crate::error::RejectReason;
use crate::token::{ReconnectionToken, ReplacementToken};
use crate::{CharacterId, GuildId, RuleConfigId, SessionId, UnixMillis};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmitRequest {
	pub character_id: CharacterId,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub replace_token: Option<ReplacementToken>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmitStatus {
	Admitted,
	Queued,
	ReplaceRequired,
	Replaced,
	Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmitResponse {
	pub status: AdmitStatus,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub session_token: Option<SessionId>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub reconnection_token: Option<ReconnectionToken>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub replacement_token: Option<ReplacementToken>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub queue_position: Option<usize>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub queue_depth: Option<usize>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub estimated_wait_seconds: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub reason: Option<RejectReason>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectRequest {
	pub reconnection_token: ReconnectionToken,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectResponse {
	pub session_token: SessionId,
	/// Replaces the consumed token for the next drop.
	pub reconnection_token: ReconnectionToken,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceStatusResponse {
	pub available: usize,
	pub total: usize,
	pub queue_depth: usize,
	pub drain_mode: bool,
}

/// Where a character stands with one instance: holding a session,
/// waiting in the queue, or neither.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStanding {
	Admitted,
	Queued,
	None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStatusResponse {
	pub standing: QueueStanding,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub session_token: Option<SessionId>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub position: Option<usize>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub depth: Option<usize>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub estimated_wait_seconds: Option<u64>,
}

// -- admin API --

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRuleConfigRequest {
	pub config_type: RuleConfigType,
	pub version: RuleVersion,
	pub config: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivateRuleConfigRequest {
	pub id: RuleConfigId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MuteRequest {
	pub player_id: CharacterId,
	pub scope: MuteScope,
	pub duration_seconds: u64,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnmuteRequest {
	pub player_id: CharacterId,
	pub scope: MuteScope,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KickRequest {
	pub character_id: CharacterId,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DissolveGuildRequest {
	pub guild_id: GuildId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockEdgeRequest {
	pub owner: CharacterId,
	pub blocked: CharacterId,
}

/// Uniform admin-command acknowledgement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandAck {
	pub ok: bool,
	pub at: UnixMillis,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub reason: Option<RejectReason>,
}
