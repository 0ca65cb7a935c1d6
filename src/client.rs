//! Pub/sub facade
//!
//! [`PubSub`] is the entry point: it provisions topics and subscriptions for
//! message types, runs one subscription loop per subscribed type, and
//! publishes typed messages.

/// Facade error types
pub mod error;
/// The facade itself
pub mod pubsub;

pub use error::PubSubError;
pub use pubsub::PubSub;
