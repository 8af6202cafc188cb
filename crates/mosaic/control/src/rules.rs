//! Append-only registry of versioned rule configurations.
//!
//! At most one config per type is active at a time. Activation swaps the
//! read-mostly active table; battles and replays carry the immutable
//! stamp of whatever was active when they were created.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use mosaic_core::data_model::{
	AuditEntry, RuleConfig, RuleConfigType, RuleVersion, RuleVersionStamp,
};
use mosaic_core::{RuleConfigId, UnixMillis, UserId};
use parking_lot::Mutex;
use tracing::info;

use crate::store::AuditLog;

#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum RulesError {
	#[error("no such rule config")]
	NotFound,
	#[error("a config with this type and version already exists")]
	DuplicateVersion,
}

type ActiveTable = HashMap<RuleConfigType, Arc<RuleConfig>>;

pub struct RuleConfigRegistry {
	configs: DashMap<RuleConfigId, RuleConfig>,
	active: ArcSwap<ActiveTable>,
	/// Serializes activate/deactivate; reads never take it.
	activation: Mutex<()>,
	audit: Arc<dyn AuditLog>,
}

impl RuleConfigRegistry {
	pub fn new(audit: Arc<dyn AuditLog>) -> Self {
		Self {
			configs: DashMap::new(),
			active: ArcSwap::from_pointee(ActiveTable::new()),
			activation: Mutex::new(()),
			audit,
		}
	}

	/// Appends a new config record. Versions are unique per type.
	pub fn create(
		&self,
		config_type: RuleConfigType,
		version: RuleVersion,
		config: serde_json::Value,
		created_by: UserId,
	) -> Result<RuleConfig, RulesError> {
		let duplicate = self
			.configs
			.iter()
			.any(|c| c.config_type == config_type && c.version == version);
		if duplicate {
			return Err(RulesError::DuplicateVersion);
		}
		let record = RuleConfig::new(config_type, version, config, created_by);
		self.configs.insert(record.id, record.clone());
		self.audit.append(AuditEntry {
			at: record.created_at,
			actor: created_by,
			action: "rule_config.create".into(),
			subject: record.id.to_string(),
			detail: serde_json::json!({
				"type": record.config_type,
				"version": record.version,
				"checksum": record.checksum,
			}),
		});
		Ok(record)
	}

	pub fn get(&self, id: RuleConfigId) -> Option<RuleConfig> {
		self.configs.get(&id).map(|c| c.clone())
	}

	pub fn list(&self, config_type: Option<RuleConfigType>) -> Vec<RuleConfig> {
		let mut out: Vec<RuleConfig> = self
			.configs
			.iter()
			.filter(|c| config_type.is_none() || config_type == Some(c.config_type))
			.map(|c| c.clone())
			.collect();
		out.sort_by_key(|c| (c.created_at, c.id));
		out
	}

	/// Atomically deactivates the current active config of the target's
	/// type (if any) and activates the target.
	pub fn activate(&self, id: RuleConfigId, actor: UserId) -> Result<(), RulesError> {
		let _guard = self.activation.lock();
		let target = self.configs.get(&id).ok_or(RulesError::NotFound)?.clone();

		let mut table: ActiveTable = (**self.active.load()).clone();
		if let Some(previous) = table.get(&target.config_type) {
			if let Some(mut prev) = self.configs.get_mut(&previous.id) {
				prev.is_active = false;
			}
		}
		if let Some(mut record) = self.configs.get_mut(&id) {
			record.is_active = true;
		}
		let mut activated = target.clone();
		activated.is_active = true;
		table.insert(target.config_type, Arc::new(activated));
		self.active.store(Arc::new(table));

		info!(config = %id, config_type = ?target.config_type, version = %target.version, "rule config activated");
		self.audit.append(AuditEntry {
			at: UnixMillis::now(),
			actor,
			action: "rule_config.activate".into(),
			subject: id.to_string(),
			detail: serde_json::json!({"type": target.config_type, "version": target.version}),
		});
		Ok(())
	}

	/// Deactivates without activating a successor. Never deletes and
	/// never alters stamps already emitted.
	pub fn deactivate(&self, id: RuleConfigId, actor: UserId) -> Result<(), RulesError> {
		let _guard = self.activation.lock();
		let target = self.configs.get(&id).ok_or(RulesError::NotFound)?.clone();

		let mut table: ActiveTable = (**self.active.load()).clone();
		let was_active = table
			.get(&target.config_type)
			.is_some_and(|active| active.id == id);
		if was_active {
			table.remove(&target.config_type);
			self.active.store(Arc::new(table));
			if let Some(mut record) = self.configs.get_mut(&id) {
				record.is_active = false;
			}
		}
		self.audit.append(AuditEntry {
			at: UnixMillis::now(),
			actor,
			action: "rule_config.deactivate".into(),
			subject: id.to_string(),
			detail: serde_json::json!({"was_active": was_active}),
		});
		Ok(())
	}

	/// The active config of a type, if one is set.
	pub fn active(&self, config_type: RuleConfigType) -> Option<Arc<RuleConfig>> {
		self.active.load().get(&config_type).cloned()
	}

	/// Stamp of the active config of a type, for new instances/replays.
	pub fn stamp_for(&self, config_type: RuleConfigType, now: UnixMillis) -> Option<RuleVersionStamp> {
		self.active(config_type).map(|config| config.stamp(now))
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::store::InMemoryAuditLog;

	fn registry() -> (RuleConfigRegistry, Arc<InMemoryAuditLog>) {
		let audit = Arc::new(InMemoryAuditLog::default());
		(RuleConfigRegistry::new(audit.clone()), audit)
	}

	#[test]
	fn at_most_one_active_per_type() {
		let (reg, _) = registry();
		let actor = UserId::random();
		let v1 = reg
			.create(RuleConfigType::Battle, "1.0.0".parse().unwrap(), serde_json::json!({}), actor)
			.unwrap();
		let v2 = reg
			.create(RuleConfigType::Battle, "1.1.0".parse().unwrap(), serde_json::json!({}), actor)
			.unwrap();

		reg.activate(v1.id, actor).unwrap();
		assert_eq!(reg.active(RuleConfigType::Battle).unwrap().id, v1.id);

		reg.activate(v2.id, actor).unwrap();
		assert_eq!(reg.active(RuleConfigType::Battle).unwrap().id, v2.id);
		// The predecessor is deactivated but never deleted.
		let stored = reg.get(v1.id).unwrap();
		assert!(!stored.is_active);
	}

	#[test]
	fn duplicate_type_version_is_rejected() {
		let (reg, _) = registry();
		let actor = UserId::random();
		reg.create(RuleConfigType::Chat, "1.0.0".parse().unwrap(), serde_json::json!({}), actor)
			.unwrap();
		assert_eq!(
			reg.create(
				RuleConfigType::Chat,
				"1.0.0".parse().unwrap(),
				serde_json::json!({"other": true}),
				actor,
			)
			.unwrap_err(),
			RulesError::DuplicateVersion
		);
	}

	#[test]
	fn stamps_survive_deactivation() {
		let (reg, _) = registry();
		let actor = UserId::random();
		let cfg = reg
			.create(RuleConfigType::Arena, "3.2.1".parse().unwrap(), serde_json::json!({"x": 1}), actor)
			.unwrap();
		reg.activate(cfg.id, actor).unwrap();
		let stamp = reg.stamp_for(RuleConfigType::Arena, UnixMillis(7)).unwrap();

		reg.deactivate(cfg.id, actor).unwrap();
		assert!(reg.active(RuleConfigType::Arena).is_none());
		// The stamp we already emitted is untouched.
		assert_eq!(stamp.id, cfg.id);
		assert_eq!(stamp.version, cfg.version);
		assert_eq!(stamp.checksum, cfg.checksum);
	}

	#[test]
	fn every_mutation_is_audited() {
		let (reg, audit) = registry();
		let actor = UserId::random();
		let cfg = reg
			.create(RuleConfigType::System, "0.1.0".parse().unwrap(), serde_json::json!({}), actor)
			.unwrap();
		reg.activate(cfg.id, actor).unwrap();
		reg.deactivate(cfg.id, actor).unwrap();

		let actions: Vec<String> =
			audit.entries().into_iter().map(|e| e.action).collect();
		assert_eq!(
			actions,
			vec!["rule_config.create", "rule_config.activate", "rule_config.deactivate"]
		);
	}
}
