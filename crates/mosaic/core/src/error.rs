//! Stable, client-visible error vocabulary.
//!
//! Clients switch on these strings, so variants are append-only and the
//! wire spelling never changes.

use serde::{Deserialize, Serialize};

/// Reason attached to a rejected request.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectReason {
	#[error("RATE_LIMITED")]
	RateLimited,
	#[error("CAPACITY_FULL")]
	CapacityFull,
	#[error("QUEUE_FULL")]
	QueueFull,
	#[error("ALREADY_IN_SESSION")]
	AlreadyInSession,
	#[error("INSTANCE_UNAVAILABLE")]
	InstanceUnavailable,
	#[error("INVALID_INSTANCE")]
	InvalidInstance,
	#[error("INTERNAL_ERROR")]
	InternalError,
	#[error("CHARACTER_NOT_OWNED")]
	CharacterNotOwned,
	#[error("DUPLICATE")]
	Duplicate,
	#[error("BLOCKED")]
	Blocked,
	#[error("TOKEN_EXPIRED")]
	TokenExpired,
	#[error("MAX_ATTEMPTS_EXCEEDED")]
	MaxAttemptsExceeded,
}

impl RejectReason {
	pub fn as_str(&self) -> &'static str {
		match self {
			Self::RateLimited => "RATE_LIMITED",
			Self::CapacityFull => "CAPACITY_FULL",
			Self::QueueFull => "QUEUE_FULL",
			Self::AlreadyInSession => "ALREADY_IN_SESSION",
			Self::InstanceUnavailable => "INSTANCE_UNAVAILABLE",
			Self::InvalidInstance => "INVALID_INSTANCE",
			Self::InternalError => "INTERNAL_ERROR",
			Self::CharacterNotOwned => "CHARACTER_NOT_OWNED",
			Self::Duplicate => "DUPLICATE",
			Self::Blocked => "BLOCKED",
			Self::TokenExpired => "TOKEN_EXPIRED",
			Self::MaxAttemptsExceeded => "MAX_ATTEMPTS_EXCEEDED",
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn wire_spelling_is_screaming_snake() {
		let json = serde_json::to_string(&RejectReason::QueueFull).unwrap();
		assert_eq!(json, "\"QUEUE_FULL\"");
		assert_eq!(RejectReason::TokenExpired.as_str(), "TOKEN_EXPIRED");
		assert_eq!(
			RejectReason::RateLimited.to_string(),
			RejectReason::RateLimited.as_str()
		);
	}
}
