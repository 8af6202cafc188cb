//! Registry of live instances: battles and arenas.
//!
//! Lifecycle is forward-only (`pending → active → resolved | aborted`).
//! Every created instance is stamped with the active rule config of its
//! mode, and a draining instance stops admitting without stopping play.

use std::sync::Arc;

use dashmap::DashMap;
use mosaic_core::data_model::{
	ArenaTier, BattleSize, Instance, InstanceMode, InstanceState, RuleConfigType,
};
use mosaic_core::{InstanceId, UnixMillis};
use tracing::info;

use crate::rules::RuleConfigRegistry;

#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum InstanceError {
	#[error("no such instance")]
	NotFound,
	#[error("illegal lifecycle transition")]
	IllegalTransition,
}

#[derive(Debug, Clone)]
pub struct NewInstance {
	pub mode: InstanceMode,
	pub shard_key: String,
	pub region: String,
}

pub struct InstanceRegistry {
	instances: DashMap<InstanceId, Instance>,
	rules: Arc<RuleConfigRegistry>,
}

impl InstanceRegistry {
	pub fn new(rules: Arc<RuleConfigRegistry>) -> Self {
		Self { instances: DashMap::new(), rules }
	}

	pub fn create_battle(&self, size: BattleSize, shard_key: &str, region: &str) -> Instance {
		self.create(NewInstance {
			mode: InstanceMode::Battle { size },
			shard_key: shard_key.to_owned(),
			region: region.to_owned(),
		})
	}

	pub fn create_arena(&self, tier: ArenaTier, shard_key: &str, region: &str) -> Instance {
		self.create(NewInstance {
			mode: InstanceMode::Arena { tier },
			shard_key: shard_key.to_owned(),
			region: region.to_owned(),
		})
	}

	pub fn create(&self, params: NewInstance) -> Instance {
		let now = UnixMillis::now();
		let stamp_type = match params.mode {
			InstanceMode::Battle { .. } => RuleConfigType::Battle,
			InstanceMode::Arena { .. } => RuleConfigType::Arena,
		};
		let instance = Instance {
			instance_id: InstanceId::random(),
			mode: params.mode,
			state: InstanceState::Pending,
			rule_stamp: self.rules.stamp_for(stamp_type, now),
			shard_key: params.shard_key,
			region: params.region,
			initial_human_count: 0,
			created_at: now,
			drain_mode: false,
		};
		self.instances.insert(instance.instance_id, instance.clone());
		info!(instance = %instance.instance_id, mode = ?instance.mode, "instance created");
		instance
	}

	pub fn get(&self, id: InstanceId) -> Option<Instance> {
		self.instances.get(&id).map(|i| i.clone())
	}

	/// `pending → active`, recording the quorum denominator.
	pub fn activate(&self, id: InstanceId, initial_human_count: u32) -> Result<(), InstanceError> {
		self.transition(id, InstanceState::Active, |instance| {
			instance.initial_human_count = initial_human_count;
		})
	}

	pub fn resolve(&self, id: InstanceId) -> Result<(), InstanceError> {
		self.transition(id, InstanceState::Resolved, |_| {})
	}

	pub fn abort(&self, id: InstanceId) -> Result<(), InstanceError> {
		self.transition(id, InstanceState::Aborted, |_| {})
	}

	/// Records the quorum denominator once an arena's population settles.
	pub fn set_initial_humans(&self, id: InstanceId, count: u32) -> Result<(), InstanceError> {
		let mut instance = self.instances.get_mut(&id).ok_or(InstanceError::NotFound)?;
		instance.initial_human_count = count;
		Ok(())
	}

	pub fn set_drain(&self, id: InstanceId, drain: bool) -> Result<(), InstanceError> {
		let mut instance = self.instances.get_mut(&id).ok_or(InstanceError::NotFound)?;
		instance.drain_mode = drain;
		info!(instance = %id, drain, "drain mode set");
		Ok(())
	}

	/// Whether the instance can take a new admission right now.
	pub fn admittable(&self, id: InstanceId) -> Result<Instance, InstanceError> {
		let instance = self.get(id).ok_or(InstanceError::NotFound)?;
		if instance.state.is_terminal() || instance.drain_mode {
			return Err(InstanceError::IllegalTransition);
		}
		Ok(instance)
	}

	pub fn list(&self) -> Vec<Instance> {
		self.instances.iter().map(|i| i.clone()).collect()
	}

	fn transition(
		&self,
		id: InstanceId,
		next: InstanceState,
		mutate: impl FnOnce(&mut Instance),
	) -> Result<(), InstanceError> {
		let mut instance = self.instances.get_mut(&id).ok_or(InstanceError::NotFound)?;
		if !instance.state.can_transition_to(next) {
			return Err(InstanceError::IllegalTransition);
		}
		instance.state = next;
		mutate(&mut instance);
		info!(instance = %id, state = ?next, "instance state changed");
		Ok(())
	}
}
