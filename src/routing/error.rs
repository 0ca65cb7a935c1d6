use arcstr::ArcStr;
use thiserror::Error;

use crate::broker::BrokerError;

/// Failure inside a running subscription loop.
///
/// These never reach the caller of `subscribe`; they are handed to the error
/// observers registered on the facade.
#[derive(Debug, Clone, Error)]
pub enum SubscriptionError {
	/// The receive call itself failed. The loop re-arms after a backoff.
	#[error("receive on {topic}/{subscription} failed: {source}")]
	Receive {
		/// Topic of the failing subscription
		topic: ArcStr,
		/// Subscription name
		subscription: ArcStr,
		/// Broker failure
		source: BrokerError,
	},
	/// A delivered body could not be turned into the subscribed type.
	#[error(
		"message {message_id} on {topic}/{subscription} could not be \
		 deserialized: {reason}"
	)]
	Deserialize {
		/// Topic of the subscription
		topic: ArcStr,
		/// Subscription name
		subscription: ArcStr,
		/// Broker message id
		message_id: u64,
		/// Serializer error, rendered
		reason: String,
	},
}

impl SubscriptionError {
	/// Topic the failing loop is bound to.
	pub fn topic(&self) -> &ArcStr {
		match self {
			| SubscriptionError::Receive { topic, .. }
			| SubscriptionError::Deserialize { topic, .. } => topic,
		}
	}

	/// Subscription the failing loop is bound to.
	pub fn subscription(&self) -> &ArcStr {
		match self {
			| SubscriptionError::Receive { subscription, .. }
			| SubscriptionError::Deserialize { subscription, .. } => subscription,
		}
	}
}
