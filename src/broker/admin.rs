use async_trait::async_trait;

use super::BrokerError;

/// Administrative API of a topic broker.
///
/// `ensure_*` calls are idempotent: calling them for an existing entity is a
/// no-op and never creates a duplicate.
#[async_trait]
pub trait BrokerAdmin: Send + Sync {
	/// Whether a topic with this name exists.
	async fn topic_exists(&self, topic: &str) -> Result<bool, BrokerError>;

	/// Create the topic unless it already exists.
	async fn ensure_topic(&self, topic: &str) -> Result<(), BrokerError>;

	/// Whether `subscription` exists under `topic`.
	async fn subscription_exists(
		&self,
		topic: &str,
		subscription: &str,
	) -> Result<bool, BrokerError>;

	/// Create the subscription under `topic` unless it already exists.
	///
	/// The topic must exist.
	async fn ensure_subscription(
		&self,
		topic: &str,
		subscription: &str,
	) -> Result<(), BrokerError>;

	/// Delete the topic together with every subscription under it.
	///
	/// Returns `EntityNotFound` when there is no such topic.
	async fn delete_topic(&self, topic: &str) -> Result<(), BrokerError>;
}
