//! Shared data model and wire types for the Mosaic game server.
//!
//! Everything the server subsystems have to agree on lives here: id
//! newtypes, the entity model, the runtime configuration surface, the
//! stable rejection reasons and the messages exchanged over the session
//! channel and the client API.

pub mod config;
pub mod data_model;
pub mod error;
pub mod messages;
pub mod token;

pub use self::error::RejectReason;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! make_uuid {
    {$(
        $(#[$meta:meta])*
        $vis:vis struct $ident:ident;
    )*} => {$(
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        $vis struct $ident(Uuid);

        impl $ident {
            pub fn random() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn uuid(&self) -> &Uuid {
                &self.0
            }

            pub fn into_uuid(self) -> Uuid {
                self.0
            }
        }

        impl From<Uuid> for $ident {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl std::fmt::Display for $ident {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }

        impl From<$ident> for PrincipalId {
            fn from(id: $ident) -> Self {
                PrincipalId(id.0)
            }
        }
    )*}
}

make_uuid! {
	/// Identifies a game instance (battle or arena). Globally unique.
	pub struct InstanceId;

	/// Identifies one character's presence in one instance.
	pub struct SessionId;

	/// Identifies a character. Globally unique.
	pub struct CharacterId;

	/// Identifies a user account. A user may own several characters.
	pub struct UserId;

	/// Identifies a chat message.
	pub struct MessageId;

	/// Identifies an AI entity within an arena.
	pub struct AiEntityId;

	/// Identifies a guild.
	pub struct GuildId;

	/// Identifies a rule configuration record.
	pub struct RuleConfigId;

	/// Identifies one admission attempt, for queue bookkeeping.
	pub struct AttemptId;
}

/// A rate-limiting principal: either a user account or a character,
/// depending on the channel being limited.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PrincipalId(Uuid);

impl std::fmt::Display for PrincipalId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		self.0.fmt(f)
	}
}

/// Wall-clock timestamp in milliseconds since the unix epoch.
///
/// Used everywhere a timestamp crosses the wire or is persisted. Purely
/// in-process deadlines use [`std::time::Instant`] instead.
#[derive(
	Debug, Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct UnixMillis(pub u64);

impl UnixMillis {
	pub fn now() -> Self {
		let ms = std::time::SystemTime::now()
			.duration_since(std::time::UNIX_EPOCH)
			.map(|d| d.as_millis() as u64)
			.unwrap_or(0);
		Self(ms)
	}

	pub fn as_u64(self) -> u64 {
		self.0
	}

	pub fn saturating_add_secs(self, secs: u64) -> Self {
		Self(self.0.saturating_add(secs.saturating_mul(1000)))
	}

	pub fn saturating_add_millis(self, millis: u64) -> Self {
		Self(self.0.saturating_add(millis))
	}

	/// Milliseconds elapsed from `earlier` to `self`, zero if `self` is older.
	pub fn saturating_since(self, earlier: UnixMillis) -> u64 {
		self.0.saturating_sub(earlier.0)
	}
}

impl std::fmt::Display for UnixMillis {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		self.0.fmt(f)
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn ids_roundtrip_through_serde() {
		let id = InstanceId::random();
		let json = serde_json::to_string(&id).unwrap();
		let back: InstanceId = serde_json::from_str(&json).unwrap();
		assert_eq!(id, back);
	}

	#[test]
	fn unix_millis_arithmetic_saturates() {
		let t = UnixMillis(u64::MAX - 10);
		assert_eq!(t.saturating_add_secs(5), UnixMillis(u64::MAX));
		assert_eq!(UnixMillis(5).saturating_since(UnixMillis(10)), 0);
		assert_eq!(UnixMillis(10).saturating_since(UnixMillis(4)), 6);
	}
}
