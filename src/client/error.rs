use arcstr::ArcStr;
use thiserror::Error;

use crate::broker::BrokerError;

/// Errors surfaced synchronously by [`PubSub`](crate::PubSub) operations.
///
/// Failures inside running subscription loops are not reported here; see
/// [`SubscriptionError`](crate::SubscriptionError).
#[derive(Debug, Error)]
pub enum PubSubError {
	/// Lazy connection to the broker failed
	#[error("failed to connect to broker: {0}")]
	Connection(#[source] BrokerError),

	/// Topic or subscription could not be created or looked up
	#[error("failed to provision {entity}: {source}")]
	Provisioning {
		/// Topic or `topic/subscription` being provisioned
		entity: ArcStr,
		/// Broker failure
		source: BrokerError,
	},

	/// Subscriber handle could not be opened
	#[error("failed to open subscriber for {topic}/{subscription}: {source}")]
	OpenSubscriber {
		/// Topic name
		topic: ArcStr,
		/// Subscription name
		subscription: ArcStr,
		/// Broker failure
		source: BrokerError,
	},

	/// Publisher could not be opened or the send failed
	#[error("failed to publish to {topic}: {source}")]
	Publish {
		/// Topic name
		topic: ArcStr,
		/// Broker failure
		source: BrokerError,
	},

	/// Subscriber handle failed to close
	#[error("failed to close subscriber for {topic}/{subscription}: {source}")]
	Close {
		/// Topic name
		topic: ArcStr,
		/// Subscription name
		subscription: ArcStr,
		/// Broker failure
		source: BrokerError,
	},

	/// Topic deletion failed
	#[error("failed to delete topic {topic}: {source}")]
	Administration {
		/// Topic name
		topic: ArcStr,
		/// Broker failure
		source: BrokerError,
	},

	/// Message could not be serialized
	#[error("serialization error: {0}")]
	Serialization(String),

	/// Type name does not produce a valid broker entity name
	#[error("invalid entity name '{name}': {reason}")]
	InvalidEntityName {
		/// Offending type name
		name: String,
		/// What is wrong with it
		reason: String,
	},

	/// Connection settings are incomplete
	#[error("configuration error: {0}")]
	Configuration(String),

	/// `subscribe` was called after `close`
	#[error("facade is closed")]
	Closed,
}

impl PubSubError {
	pub(crate) fn invalid_name(name: &str, reason: impl Into<String>) -> Self {
		PubSubError::InvalidEntityName {
			name: name.to_string(),
			reason: reason.into(),
		}
	}

	/// The underlying broker error, if any.
	pub fn broker_error(&self) -> Option<&BrokerError> {
		match self {
			| PubSubError::Connection(source)
			| PubSubError::Provisioning { source, .. }
			| PubSubError::OpenSubscriber { source, .. }
			| PubSubError::Publish { source, .. }
			| PubSubError::Close { source, .. }
			| PubSubError::Administration { source, .. } => Some(source),
			| _ => None,
		}
	}
}
