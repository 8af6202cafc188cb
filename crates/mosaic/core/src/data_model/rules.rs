//! Versioned rule configurations and the stamps carried by battles and replays.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{RuleConfigId, UnixMillis, UserId};

/// Which subsystem a rule configuration governs.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleConfigType {
	Arena,
	Battle,
	Chat,
	Guild,
	Player,
	Moderation,
	System,
}

impl RuleConfigType {
	pub const ALL: [RuleConfigType; 7] = [
		Self::Arena,
		Self::Battle,
		Self::Chat,
		Self::Guild,
		Self::Player,
		Self::Moderation,
		Self::System,
	];
}

/// `major.minor.patch`, ordered numerically.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct RuleVersion {
	pub major: u32,
	pub minor: u32,
	pub patch: u32,
}

impl fmt::Display for RuleVersion {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
	}
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
#[error("invalid version string, expected major.minor.patch")]
pub struct ParseVersionError;

impl FromStr for RuleVersion {
	type Err = ParseVersionError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let mut parts = s.split('.');
		let mut next = || {
			parts
				.next()
				.and_then(|p| p.parse::<u32>().ok())
				.ok_or(ParseVersionError)
		};
		let (major, minor, patch) = (next()?, next()?, next()?);
		if parts.next().is_some() {
			return Err(ParseVersionError);
		}
		Ok(Self { major, minor, patch })
	}
}

impl Serialize for RuleVersion {
	fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.collect_str(self)
	}
}

impl<'de> Deserialize<'de> for RuleVersion {
	fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let raw = String::deserialize(deserializer)?;
		raw.parse().map_err(serde::de::Error::custom)
	}
}

/// One immutable rule configuration record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
	pub id: RuleConfigId,
	pub config_type: RuleConfigType,
	pub version: RuleVersion,
	/// Opaque to the registry; interpreted by the governed subsystem.
	pub config: serde_json::Value,
	pub is_active: bool,
	pub created_at: UnixMillis,
	pub created_by: UserId,
	/// Hex SHA-256 over the serialized `config` document.
	pub checksum: String,
}

impl RuleConfig {
	pub fn new(
		config_type: RuleConfigType,
		version: RuleVersion,
		config: serde_json::Value,
		created_by: UserId,
	) -> Self {
		let checksum = config_checksum(&config);
		Self {
			id: RuleConfigId::random(),
			config_type,
			version,
			config,
			is_active: false,
			created_at: UnixMillis::now(),
			created_by,
			checksum,
		}
	}

	/// The immutable stamp attached to instances and replays.
	pub fn stamp(&self, stamped_at: UnixMillis) -> RuleVersionStamp {
		RuleVersionStamp {
			config_type: self.config_type,
			id: self.id,
			version: self.version,
			checksum: self.checksum.clone(),
			stamped_at,
		}
	}
}

/// Hex SHA-256 of a config document's canonical JSON serialization.
pub fn config_checksum(config: &serde_json::Value) -> String {
	use fmt::Write as _;

	let bytes = serde_json::to_vec(config).unwrap_or_default();
	let digest = Sha256::digest(&bytes);
	let mut out = String::with_capacity(digest.len() * 2);
	for byte in digest {
		let _ = write!(out, "{byte:02x}");
	}
	out
}

/// Immutable record of the rule config a battle or replay ran under.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleVersionStamp {
	pub config_type: RuleConfigType,
	pub id: RuleConfigId,
	pub version: RuleVersion,
	pub checksum: String,
	pub stamped_at: UnixMillis,
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn version_parses_and_orders() {
		let a: RuleVersion = "1.2.3".parse().unwrap();
		let b: RuleVersion = "1.10.0".parse().unwrap();
		assert!(a < b);
		assert_eq!(a.to_string(), "1.2.3");
		assert!("1.2".parse::<RuleVersion>().is_err());
		assert!("1.2.3.4".parse::<RuleVersion>().is_err());
		assert!("1.x.3".parse::<RuleVersion>().is_err());
	}

	#[test]
	fn checksum_is_stable_per_document() {
		let doc = serde_json::json!({"max_players": 16});
		assert_eq!(config_checksum(&doc), config_checksum(&doc));
		assert_ne!(
			config_checksum(&doc),
			config_checksum(&serde_json::json!({"max_players": 8}))
		);
	}

	#[test]
	fn stamp_carries_identity_and_checksum() {
		let cfg = RuleConfig::new(
			RuleConfigType::Battle,
			"2.0.1".parse().unwrap(),
			serde_json::json!({"board": 32}),
			UserId::random(),
		);
		let stamp = cfg.stamp(UnixMillis(42));
		assert_eq!(stamp.id, cfg.id);
		assert_eq!(stamp.checksum, cfg.checksum);
		assert_eq!(stamp.stamped_at, UnixMillis(42));
	}
}
