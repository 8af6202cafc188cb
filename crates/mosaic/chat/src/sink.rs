//! Seam to the transport's per-recipient delivery path.

use async_trait::async_trait;
use dashmap::DashMap;
use mosaic_core::data_model::ChatMessage;
use mosaic_core::CharacterId;
use parking_lot::Mutex;

/// A failed delivery attempt. Transport failures are recoverable and
/// retried per tier; everything permanent is decided before the sink.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DeliveryFailure {
	#[error("recipient unreachable: {0}")]
	Unreachable(String),
	#[error("transport overloaded")]
	Overloaded,
}

#[async_trait]
pub trait DeliverySink: Send + Sync {
	async fn deliver(
		&self,
		recipient: CharacterId,
		message: &ChatMessage,
	) -> Result<(), DeliveryFailure>;
}

/// Records deliveries in memory and can be told to fail the first N
/// attempts per recipient, for retry tests.
#[derive(Debug, Default)]
pub struct InMemorySink {
	delivered: Mutex<Vec<(CharacterId, ChatMessage)>>,
	failures_left: DashMap<CharacterId, u32>,
}

impl InMemorySink {
	pub fn fail_next(&self, recipient: CharacterId, attempts: u32) {
		self.failures_left.insert(recipient, attempts);
	}

	pub fn delivered(&self) -> Vec<(CharacterId, ChatMessage)> {
		self.delivered.lock().clone()
	}

	pub fn delivered_to(&self, recipient: CharacterId) -> Vec<ChatMessage> {
		self.delivered
			.lock()
			.iter()
			.filter(|(r, _)| *r == recipient)
			.map(|(_, m)| m.clone())
			.collect()
	}
}

#[async_trait]
impl DeliverySink for InMemorySink {
	async fn deliver(
		&self,
		recipient: CharacterId,
		message: &ChatMessage,
	) -> Result<(), DeliveryFailure> {
		if let Some(mut left) = self.failures_left.get_mut(&recipient) {
			if *left > 0 {
				*left -= 1;
				return Err(DeliveryFailure::Unreachable("injected failure".into()));
			}
		}
		self.delivered.lock().push((recipient, message.clone()));
		Ok(())
	}
}
