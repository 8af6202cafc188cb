//! The connection-and-session control plane.
//!
//! This crate owns who is inside which instance: atomic admission with
//! capacity and queueing, the session state machine with reconnection
//! grace, sliding-window rate limits, versioned rule configs, the
//! block-list cache and moderation commands. Tick simulation, chat
//! delivery and liveness tracking build on top of it.

pub mod admission;
pub mod block_list;
pub mod instance;
pub mod moderation;
pub mod queue;
pub mod rate_limit;
pub mod rules;
pub mod session;
pub mod store;
pub mod workers;

pub use self::admission::{
	AdmissionController, AdmitOutcome, InstanceOccupancy, PromotedSession, ReconnectError,
	run_promotion_worker,
};
pub use self::block_list::BlockListCache;
pub use self::instance::{InstanceError, InstanceRegistry, NewInstance};
pub use self::moderation::{ModerationService, SystemEvent, SystemNotifier};
pub use self::queue::AdmissionQueue;
pub use self::rate_limit::{RateChannel, RateDecision, RateLimiter};
pub use self::rules::RuleConfigRegistry;
pub use self::session::{SessionRegistry, SlotFreedReceiver};
