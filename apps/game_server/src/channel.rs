//! The per-session bidirectional channel and the client hub.
//!
//! The hub is the single place that knows which character is reachable
//! over which socket. Chat delivery, battle broadcasts and moderation
//! notices all fan out through it, so the core crates never see a
//! transport type.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use mosaic_battle::PlacementAttempt;
use mosaic_chat::{DeliveryFailure, DeliverySink};
use mosaic_control::moderation::{SystemEvent, SystemNotifier};
use mosaic_control::rate_limit::RateChannel;
use mosaic_control::session::SessionRegistry;
use mosaic_core::data_model::{CharacterSession, ChatMessage, SessionState};
use mosaic_core::messages::session::{Clientbound, Serverbound};
use mosaic_core::{CharacterId, InstanceId, SessionId, UnixMillis};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, Instrument};

use crate::state::AppState;

/// Outbound routing per connected character.
pub struct ClientHub {
	sessions: Arc<SessionRegistry>,
	clients: DashMap<CharacterId, mpsc::UnboundedSender<Clientbound>>,
}

impl ClientHub {
	pub fn new(sessions: Arc<SessionRegistry>) -> Self {
		Self { sessions, clients: DashMap::new() }
	}

	pub fn register(&self, character: CharacterId, tx: mpsc::UnboundedSender<Clientbound>) {
		self.clients.insert(character, tx);
	}

	pub fn unregister(&self, character: CharacterId) {
		self.clients.remove(&character);
	}

	pub fn is_connected(&self, character: CharacterId) -> bool {
		self.clients.contains_key(&character)
	}

	/// Sends to one character; `false` when they are not connected.
	pub fn push(&self, character: CharacterId, message: Clientbound) -> bool {
		match self.clients.get(&character) {
			Some(tx) => tx.send(message).is_ok(),
			None => false,
		}
	}

	pub fn broadcast_instance(&self, instance: InstanceId, message: Clientbound) {
		for character in self.sessions.active_characters(instance) {
			self.push(character, message.clone());
		}
	}
}

impl mosaic_battle::BattleBroadcast for ClientHub {
	fn broadcast(&self, instance: InstanceId, message: Clientbound) {
		self.broadcast_instance(instance, message);
	}

	fn send_to(&self, character: CharacterId, message: Clientbound) {
		self.push(character, message);
	}
}

#[async_trait]
impl DeliverySink for ClientHub {
	async fn deliver(
		&self,
		recipient: CharacterId,
		message: &ChatMessage,
	) -> Result<(), DeliveryFailure> {
		if self.push(recipient, Clientbound::ChatMessage { message: message.clone() }) {
			Ok(())
		} else {
			Err(DeliveryFailure::Unreachable("recipient not connected".into()))
		}
	}
}

impl SystemNotifier for ClientHub {
	fn notify(&self, event: SystemEvent) {
		match event {
			SystemEvent::PlayerKicked { character_id, instance_id, reason } => {
				self.push(
					character_id,
					Clientbound::SystemNotice {
						event: "kicked".into(),
						data: serde_json::json!({"instance": instance_id, "reason": reason}),
					},
				);
				if let Some(instance) = instance_id {
					self.broadcast_instance(
						instance,
						Clientbound::SystemNotice {
							event: "player_kicked".into(),
							data: serde_json::json!({"character": character_id}),
						},
					);
				}
			}
			SystemEvent::GuildDissolved { guild_id, members } => {
				for member in members {
					self.push(
						member,
						Clientbound::SystemNotice {
							event: "guild_dissolved".into(),
							data: serde_json::json!({"guild": guild_id}),
						},
					);
				}
			}
		}
	}
}

#[derive(Debug, Deserialize)]
pub struct SessionQuery {
	pub session_token: SessionId,
}

/// `GET /instances/{id}/session` — upgrades an admitted session to the
/// bidirectional channel.
pub async fn session_channel(
	State(state): State<Arc<AppState>>,
	Path(instance_id): Path<InstanceId>,
	Query(query): Query<SessionQuery>,
	ws: WebSocketUpgrade,
) -> Response {
	let Some(session) = state.sessions.get(query.session_token) else {
		return StatusCode::NOT_FOUND.into_response();
	};
	if session.instance_id != instance_id || session.state != SessionState::Active {
		return StatusCode::CONFLICT.into_response();
	}
	let span = info_span!("session", id = %session.session_id, character = %session.character_id);
	ws.on_upgrade(move |socket| client_session(state, session, socket).instrument(span))
}

async fn client_session(state: Arc<AppState>, session: CharacterSession, socket: WebSocket) {
	let character = session.character_id;
	let instance = session.instance_id;
	let (mut ws_tx, mut ws_rx) = socket.split();
	let (tx, mut rx) = mpsc::unbounded_channel();
	state.hub.register(character, tx);
	state.heartbeats.register(instance, character, UnixMillis::now());
	state
		.battles
		.set_population(instance, state.sessions.active_count(instance));
	info!("channel open");

	let mut left_cleanly = false;
	loop {
		tokio::select! {
			outbound = rx.recv() => {
				let Some(outbound) = outbound else { break };
				let Ok(text) = serde_json::to_string(&outbound) else { continue };
				if ws_tx.send(Message::Text(text)).await.is_err() {
					break;
				}
			}
			incoming = ws_rx.next() => {
				match incoming {
					Some(Ok(Message::Text(text))) => {
						if handle_client_message(&state, &session, &text).await {
							left_cleanly = true;
							break;
						}
					}
					Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
					Some(Ok(_)) => {}
				}
			}
		}
	}

	state.hub.unregister(character);
	state.heartbeats.unregister(instance, character);
	if left_cleanly {
		state
			.sessions
			.terminate(session.session_id, mosaic_core::data_model::TerminateReason::Leave);
	} else if state
		.sessions
		.get(session.session_id)
		.is_some_and(|s| s.state == SessionState::Active)
	{
		// Unclean drop: the grace window opens and the slot frees.
		let _ = state.sessions.begin_grace(session.session_id, UnixMillis::now());
	}
	state
		.battles
		.set_population(instance, state.sessions.active_count(instance));
	info!("channel closed");
}

/// Handles one client message. Returns `true` when the client leaves.
async fn handle_client_message(
	state: &Arc<AppState>,
	session: &CharacterSession,
	text: &str,
) -> bool {
	let character = session.character_id;
	let instance = session.instance_id;
	let message: Serverbound = match serde_json::from_str(text) {
		Ok(message) => message,
		Err(err) => {
			debug!(%err, "unparseable client message");
			state
				.hub
				.push(character, Clientbound::MessageRejected { reason: "INVALID_CONTENT".into() });
			return false;
		}
	};

	match message {
		Serverbound::Heartbeat { sent_at } => {
			let now = UnixMillis::now();
			let rtt = if now >= sent_at {
				u32::try_from(now.saturating_since(sent_at)).ok()
			} else {
				None
			};
			state.heartbeats.record_heartbeat(character, now, rtt);
			state.sessions.touch_heartbeat(session.session_id, now);
			state
				.hub
				.push(character, Clientbound::HeartbeatAck { sent_at, server_time: now });
		}
		Serverbound::PlaceTile { x, y, sequence } => {
			let now = UnixMillis::now();
			let decision =
				state
					.rate
					.check_and_record(character.into(), RateChannel::Action, now);
			if !decision.allowed {
				state
					.hub
					.push(character, Clientbound::MessageRejected { reason: "RATE_LIMITED".into() });
				return false;
			}
			let routed = state.battles.route_attempt(
				instance,
				PlacementAttempt { character_id: character, x, y, sequence, timestamp: now },
			);
			if !routed {
				state.hub.push(
					character,
					Clientbound::MessageRejected { reason: "INSTANCE_UNAVAILABLE".into() },
				);
			}
		}
		Serverbound::Chat { channel, recipient_id, content, timestamp, tier } => {
			let result = state
				.chat
				.send(character, channel, recipient_id, content, timestamp, tier)
				.await;
			if let Err(err) = result {
				state
					.hub
					.push(character, Clientbound::MessageRejected { reason: err.reason_str().into() });
			}
		}
		Serverbound::Ready => {
			let active = state.sessions.active_count(instance);
			state.battles.note_ready(instance, character, active);
		}
		Serverbound::Leave => return true,
	}
	false
}

