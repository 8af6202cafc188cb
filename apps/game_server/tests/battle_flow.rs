//! Battle lifecycle through the full wiring: admission, ready-up, tick
//! resolution, abort and disposal.

use std::sync::Arc;
use std::time::Duration;

use game_server::state::AppState;
use mosaic_battle::{BattleControl, EndReason, InMemoryReplayStorage, PlacementAttempt};
use mosaic_control::admission::AdmitOutcome;
use mosaic_core::config::ServerConfig;
use mosaic_core::data_model::{BattleSize, InstanceState};
use mosaic_core::messages::session::Clientbound;
use mosaic_core::{CharacterId, UnixMillis, UserId};
use tokio::sync::mpsc;

fn admitted(outcome: AdmitOutcome) -> mosaic_core::SessionId {
	match outcome {
		AdmitOutcome::Admitted { session_id, .. } => session_id,
		other => panic!("expected Admitted, got {other:?}"),
	}
}

#[tokio::test(start_paused = true)]
async fn battle_runs_from_ready_to_disposal() {
	let storage = Arc::new(InMemoryReplayStorage::default());
	let (state, channels) = AppState::new(ServerConfig::default(), storage.clone());
	game_server::spawn_workers(state.clone(), channels);

	let battle = state.instances.create_battle(BattleSize::Skirmish, "s0", "eu");
	let id = battle.instance_id;
	let (alice, bob) = (CharacterId::random(), CharacterId::random());
	admitted(state.admission.admit(id, alice, UserId::random(), None));
	admitted(state.admission.admit(id, bob, UserId::random(), None));

	// Wire both players into the hub so broadcasts are observable.
	let (tx_a, mut rx_a) = mpsc::unbounded_channel();
	let (tx_b, mut rx_b) = mpsc::unbounded_channel();
	state.hub.register(alice, tx_a);
	state.hub.register(bob, tx_b);

	// Both ready: the battle activates and starts ticking.
	state.battles.note_ready(id, alice, 2);
	assert!(!state.battles.is_running(id));
	state.battles.note_ready(id, bob, 2);
	assert!(state.battles.is_running(id));
	assert_eq!(state.instances.get(id).unwrap().state, InstanceState::Active);

	// Same position, bob earlier: bob wins the conflict.
	assert!(state.battles.route_attempt(
		id,
		PlacementAttempt {
			character_id: alice,
			x: 3,
			y: 4,
			sequence: 1,
			timestamp: UnixMillis(200),
		},
	));
	assert!(state.battles.route_attempt(
		id,
		PlacementAttempt {
			character_id: bob,
			x: 3,
			y: 4,
			sequence: 1,
			timestamp: UnixMillis(100),
		},
	));

	tokio::time::sleep(Duration::from_millis(1_200)).await;

	let mut saw_started = false;
	let mut saw_batch = false;
	while let Ok(message) = rx_b.try_recv() {
		match message {
			Clientbound::BattleStarted { instance_id, .. } => {
				assert_eq!(instance_id, id);
				saw_started = true;
			}
			Clientbound::TilesUpdated { tick, placements, conflicts_resolved } => {
				assert_eq!(tick, 1);
				assert_eq!(placements.len(), 1);
				assert_eq!(placements[0].character_id, bob);
				assert_eq!(conflicts_resolved, 1);
				saw_batch = true;
			}
			_ => {}
		}
	}
	assert!(saw_started && saw_batch);
	// The loser got a direct conflict rejection.
	let mut alice_rejected = false;
	while let Ok(message) = rx_a.try_recv() {
		if matches!(message, Clientbound::TileRejected { .. }) {
			alice_rejected = true;
		}
	}
	assert!(alice_rejected);

	// Abort: the worker seals the replay and the supervisor disposes.
	assert!(state
		.battles
		.control(id, BattleControl::Abort { reason: EndReason::Resolved }));
	tokio::time::sleep(Duration::from_millis(200)).await;

	assert_eq!(state.instances.get(id).unwrap().state, InstanceState::Resolved);
	assert!(state.sessions.live_session_of(alice).is_none());
	assert!(state.sessions.live_session_of(bob).is_none());
	assert!(!state.battles.is_running(id));

	let events = storage.events(id);
	assert!(!events.is_empty());
	let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
	assert_eq!(seqs, (1..=events.len() as u64).collect::<Vec<_>>());
	assert!(storage.summary(id).is_some());

	state.shutdown.cancel();
}
