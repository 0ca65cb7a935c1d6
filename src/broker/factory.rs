use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;

use super::BrokerError;

/// How the broker hands messages to a subscriber.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum DeliveryMode {
	/// Removed by the broker when handed out. At-most-once: a failed handler
	/// loses the message.
	#[default]
	AutoDelete,
	/// Locked to the receiver until completed or abandoned. At-least-once: an
	/// unsettled or abandoned message is delivered again.
	PeekLock,
}

impl fmt::Display for DeliveryMode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			| DeliveryMode::AutoDelete => f.write_str("auto-delete"),
			| DeliveryMode::PeekLock => f.write_str("peek-lock"),
		}
	}
}

/// Proof that a peek-locked message is held by this receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockToken(pub u64);

impl fmt::Display for LockToken {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// A message handed to a subscriber.
#[derive(Debug, Clone)]
pub struct Delivery {
	/// Broker-assigned id, stable across redeliveries
	pub message_id: u64,
	/// Serialized payload
	pub body: Bytes,
	/// How many times this message has been handed out, this one included
	pub delivery_count: u32,
	/// Present only in [`DeliveryMode::PeekLock`]
	pub lock: Option<LockToken>,
}

/// Short-lived sending handle bound to one topic.
#[async_trait]
pub trait TopicSender: Send {
	/// Send one payload to every subscription of the topic.
	async fn send(&mut self, payload: Bytes) -> Result<(), BrokerError>;

	/// Release the handle. Further sends fail with `Closed`.
	async fn close(&mut self) -> Result<(), BrokerError>;
}

/// Long-lived receiving handle bound to one subscription.
///
/// Shared between the subscription loop (which receives and settles) and the
/// facade (which closes it), hence `&self` everywhere.
#[async_trait]
pub trait SubscriptionReceiver: Send + Sync {
	/// Wait up to `wait` for a message. `Ok(None)` means the wait elapsed
	/// with nothing to deliver, which is not an error.
	async fn receive(
		&self,
		wait: Duration,
	) -> Result<Option<Delivery>, BrokerError>;

	/// Remove a peek-locked message from the subscription.
	async fn complete(&self, lock: &LockToken) -> Result<(), BrokerError>;

	/// Release a peek-locked message so the broker can redeliver it.
	async fn abandon(&self, lock: &LockToken) -> Result<(), BrokerError>;

	/// Close the handle. A pending `receive` fails with `Closed`.
	async fn close(&self) -> Result<(), BrokerError>;

	/// Whether `close` has been called.
	fn is_closed(&self) -> bool;
}

/// Produces publisher and subscriber handles.
#[async_trait]
pub trait ClientFactory: Send + Sync {
	/// Open a sender for `topic`.
	async fn open_publisher(
		&self,
		topic: &str,
	) -> Result<Box<dyn TopicSender>, BrokerError>;

	/// Open a receiver for `subscription` under `topic`.
	async fn open_subscriber(
		&self,
		topic: &str,
		subscription: &str,
		mode: DeliveryMode,
	) -> Result<Arc<dyn SubscriptionReceiver>, BrokerError>;
}
