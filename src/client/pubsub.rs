use std::sync::{
	Arc,
	atomic::{AtomicBool, Ordering},
};

use arcstr::ArcStr;
use bytes::Bytes;
use futures::future::join_all;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, error, info, trace, warn};

use super::error::PubSubError;
use crate::{
	broker::{BrokerConnection, Connector, DeliveryMode, SubscriptionReceiver},
	config::ConnectionConfig,
	message::{BusMessage, EntityNames},
	message_serializer::{BincodeSerializer, MessageSerializer},
	routing::{
		ErrorObservers, HandlerOutcome, LoopController, ObserverId,
		SubscriptionError, SubscriptionLoop, TypedDispatcher,
	},
};

/// Typed publish/subscribe facade over a topic broker.
///
/// Each message type `T` maps to the topic `Topic_<T::TYPE_NAME>` and the
/// subscription `Subscription_<T::TYPE_NAME>`. Subscribing provisions both
/// (idempotently) and starts a loop that feeds every delivery to the handler;
/// publishing sends to the topic through a short-lived publisher.
///
/// The broker connection is opened on first use and shared by every
/// publisher and subscriber of this facade.
///
/// ```rust,no_run
/// use bincode::{Decode, Encode};
/// use typed_pubsub::{
///     BincodeSerializer, BusMessage, ConnectionConfig, DeliveryMode,
///     InMemoryBroker, PubSub,
/// };
///
/// #[derive(BusMessage, Encode, Decode, Debug)]
/// struct SimpleMessage {
///     title: String,
///     id: u128,
/// }
///
/// # async fn run() -> typed_pubsub::Result<()> {
/// let bus = PubSub::<BincodeSerializer>::setup(
///     ConnectionConfig::new("local", "owner", "secret"),
///     InMemoryBroker::new(),
/// );
/// bus.on_error(|err| eprintln!("receive failed: {err}"));
///
/// bus.subscribe(
///     |msg: SimpleMessage| println!("got {}", msg.title),
///     DeliveryMode::PeekLock,
/// )
/// .await?
/// .publish(&SimpleMessage { title: "hello".into(), id: 1 })
/// .await?;
///
/// bus.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct PubSub<F = BincodeSerializer> {
	config: ConnectionConfig,
	connector: Arc<dyn Connector>,
	connection: OnceCell<BrokerConnection>,
	registrations: Mutex<Vec<Registration>>,
	observers: ErrorObservers,
	serializer: F,
	closed: AtomicBool,
}

/// One successful `subscribe` call.
struct Registration {
	names: EntityNames,
	receiver: Arc<dyn SubscriptionReceiver>,
	controller: Option<LoopController>,
}

impl Registration {
	/// Whether the loop is still alive. A loop whose handle was closed
	/// underneath it counts as stopped.
	fn is_running(&self) -> bool {
		self.controller
			.as_ref()
			.is_some_and(|controller| !controller.is_finished())
	}

	/// Stop the loop, then close its handle. Safe to call twice.
	async fn shut_down(&mut self) -> Result<(), PubSubError> {
		if let Some(controller) = self.controller.take() {
			// Join failures are already logged by the controller.
			let _ = controller.shutdown().await;
		}
		if self.receiver.is_closed() {
			return Ok(());
		}
		self.receiver.close().await.map_err(|source| {
			warn!(
				topic = %self.names.topic,
				subscription = %self.names.subscription,
				error = %source,
				"Failed to close subscriber"
			);
			PubSubError::Close {
				topic: self.names.topic.clone(),
				subscription: self.names.subscription.clone(),
				source,
			}
		})
	}
}

impl<F> PubSub<F>
where F: Default + Clone + Send + Sync + 'static
{
	/// Capture connection settings. No I/O happens until the first
	/// subscribe, publish or clear.
	pub fn setup(
		config: ConnectionConfig,
		connector: impl Connector + 'static,
	) -> Self {
		Self::setup_with_serializer(config, connector, F::default())
	}

	/// Same as [`setup`](Self::setup) with an explicitly configured
	/// serializer.
	pub fn setup_with_serializer(
		config: ConnectionConfig,
		connector: impl Connector + 'static,
		serializer: F,
	) -> Self {
		debug!(config = ?config, "Pub/sub facade set up");
		Self {
			config,
			connector: Arc::new(connector),
			connection: OnceCell::new(),
			registrations: Mutex::new(Vec::new()),
			observers: ErrorObservers::new(),
			serializer,
			closed: AtomicBool::new(false),
		}
	}

	async fn connection(&self) -> Result<&BrokerConnection, PubSubError> {
		self.connection
			.get_or_try_init(|| async {
				info!(namespace = %self.config.namespace, "Connecting to broker");
				self.connector
					.connect(&self.config)
					.await
					.map_err(PubSubError::Connection)
			})
			.await
	}

	/// Subscribe `handler` to every message of type `T`.
	///
	/// Ensures the topic and subscription exist, opens a subscriber in the
	/// given delivery mode, and starts its loop. Subscribing the same type
	/// twice starts a second, independent loop on the same subscription.
	///
	/// The handler runs on the loop task; the next receive is not issued
	/// until it returns. Returning an error (or panicking) counts as a
	/// failure: peek-locked messages are abandoned for redelivery,
	/// auto-deleted ones are lost.
	pub async fn subscribe<T, H, R>(
		&self,
		handler: H,
		mode: DeliveryMode,
	) -> Result<&Self, PubSubError>
	where
		T: BusMessage + 'static,
		F: MessageSerializer<T>,
		H: Fn(T) -> R + Send + Sync + 'static,
		R: HandlerOutcome,
	{
		let names = EntityNames::of::<T>()?;
		let connection = self.connection().await?;

		let mut registrations = self.registrations.lock().await;
		if self.closed.load(Ordering::SeqCst) {
			return Err(PubSubError::Closed);
		}

		connection.admin.ensure_topic(&names.topic).await.map_err(
			|source| PubSubError::Provisioning {
				entity: names.topic.clone(),
				source,
			},
		)?;
		connection
			.admin
			.ensure_subscription(&names.topic, &names.subscription)
			.await
			.map_err(|source| PubSubError::Provisioning {
				entity: arcstr::format!("{}/{}", names.topic, names.subscription),
				source,
			})?;

		let receiver = connection
			.factory
			.open_subscriber(&names.topic, &names.subscription, mode)
			.await
			.map_err(|source| PubSubError::OpenSubscriber {
				topic: names.topic.clone(),
				subscription: names.subscription.clone(),
				source,
			})?;

		let dispatcher =
			TypedDispatcher::<T, F, H>::new(self.serializer.clone(), handler);
		let controller = SubscriptionLoop::spawn(
			&names,
			mode,
			Arc::clone(&receiver),
			Box::new(dispatcher),
			self.observers.clone(),
		);

		info!(
			topic = %names.topic,
			subscription = %names.subscription,
			mode = %mode,
			"Subscribed"
		);
		registrations.push(Registration {
			names,
			receiver,
			controller: Some(controller),
		});
		Ok(self)
	}

	/// Publish `message` to the topic of `T`.
	///
	/// Opens a publisher, sends, and closes the publisher whether or not
	/// the send succeeded. The topic must already exist (some process has
	/// subscribed to `T`).
	pub async fn publish<T>(&self, message: &T) -> Result<&Self, PubSubError>
	where
		T: BusMessage,
		F: MessageSerializer<T>,
	{
		let names = EntityNames::of::<T>()?;
		let payload = self
			.serializer
			.serialize(message)
			.map_err(|e| PubSubError::Serialization(format!("{e:?}")))?;
		let connection = self.connection().await?;

		let mut sender = connection
			.factory
			.open_publisher(&names.topic)
			.await
			.map_err(|source| PubSubError::Publish {
				topic: names.topic.clone(),
				source,
			})?;
		let sent = sender.send(Bytes::from(payload)).await;
		if let Err(err) = sender.close().await {
			warn!(topic = %names.topic, error = %err, "Failed to close publisher");
		}

		sent.map_err(|source| PubSubError::Publish {
			topic: names.topic.clone(),
			source,
		})?;
		trace!(topic = %names.topic, "Message published");
		Ok(self)
	}

	/// Stop every subscription loop and close every subscriber handle.
	///
	/// Waits for each loop to finish its current delivery. Registrations
	/// are kept, so [`clear_topics`](Self::clear_topics) still works
	/// afterwards. Subsequent `subscribe` calls fail with
	/// [`PubSubError::Closed`].
	pub async fn close(&self) -> Result<&Self, PubSubError> {
		let mut registrations = self.registrations.lock().await;
		self.closed.store(true, Ordering::SeqCst);

		let results = join_all(
			registrations.iter_mut().map(|registration| registration.shut_down()),
		)
		.await;
		info!(subscriptions = registrations.len(), "Pub/sub facade closed");

		results.into_iter().collect::<Result<Vec<()>, _>>()?;
		Ok(self)
	}

	/// Delete every topic this facade has subscribed to, together with its
	/// subscriptions. Irreversible; meant for development and test resets.
	///
	/// Loops bound to the deleted topics are stopped first and their
	/// registrations removed.
	pub async fn clear_topics(&self) -> Result<&Self, PubSubError> {
		let mut registrations = self.registrations.lock().await;
		if registrations.is_empty() {
			debug!("No registered topics to clear");
			return Ok(self);
		}
		let connection = self.connection().await?;

		let results = join_all(
			registrations.iter_mut().map(|registration| registration.shut_down()),
		)
		.await;
		for result in results {
			// The topic is about to disappear; a stuck handle must not
			// block the reset.
			if let Err(err) = result {
				debug!(error = %err, "Ignoring close failure during topic reset");
			}
		}

		let mut topics: Vec<ArcStr> = Vec::new();
		for registration in registrations.iter() {
			if !topics.contains(&registration.names.topic) {
				topics.push(registration.names.topic.clone());
			}
		}

		for topic in topics {
			match connection.admin.delete_topic(&topic).await {
				| Ok(()) => info!(topic = %topic, "Topic deleted"),
				| Err(err) if err.is_not_found() => {
					debug!(topic = %topic, "Topic already gone");
				}
				| Err(source) => {
					return Err(PubSubError::Administration { topic, source });
				}
			}
			registrations.retain(|registration| registration.names.topic != topic);
		}
		Ok(self)
	}

	/// Register an observer for loop-level errors (failed receives,
	/// undecodable messages). Every registered observer is called.
	pub fn on_error<O>(&self, observer: O) -> ObserverId
	where O: Fn(&SubscriptionError) + Send + Sync + 'static {
		self.observers.subscribe(observer)
	}

	/// Remove an observer added with [`on_error`](Self::on_error).
	pub fn remove_error_observer(&self, id: ObserverId) -> bool {
		self.observers.unsubscribe(id)
	}

	/// Number of `subscribe` registrations currently held.
	pub async fn subscription_count(&self) -> usize {
		self.registrations.lock().await.len()
	}

	/// Topics of the current registrations, in subscription order.
	pub async fn topics(&self) -> Vec<ArcStr> {
		self.registrations
			.lock()
			.await
			.iter()
			.map(|registration| registration.names.topic.clone())
			.collect()
	}

	/// Connection settings this facade was set up with.
	pub fn config(&self) -> &ConnectionConfig {
		&self.config
	}
}

impl<F> std::fmt::Debug for PubSub<F> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("PubSub")
			.field("config", &self.config)
			.finish_non_exhaustive()
	}
}

impl<F> Drop for PubSub<F> {
	fn drop(&mut self) {
		let running = self
			.registrations
			.get_mut()
			.iter()
			.filter(|registration| registration.is_running())
			.count();
		if running > 0 {
			error!(
				running,
				"PubSub dropped without calling close(). Please call close() \
				 and await its completion before dropping."
			);
		}
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use super::*;
	use crate::{
		broker::{BrokerAdmin, ClientFactory, InMemoryBroker},
		routing::{Dispatch, DispatchError},
	};

	struct Ignore;

	impl Dispatch for Ignore {
		fn dispatch(&self, _body: &[u8]) -> Result<(), DispatchError> {
			Ok(())
		}
	}

	async fn registration(broker: &InMemoryBroker) -> Registration {
		let names = EntityNames::for_type_name("Widget").unwrap();
		broker.ensure_topic(&names.topic).await.unwrap();
		broker
			.ensure_subscription(&names.topic, &names.subscription)
			.await
			.unwrap();
		let receiver = broker
			.open_subscriber(
				&names.topic,
				&names.subscription,
				DeliveryMode::AutoDelete,
			)
			.await
			.unwrap();
		let controller = SubscriptionLoop::spawn(
			&names,
			DeliveryMode::AutoDelete,
			Arc::clone(&receiver),
			Box::new(Ignore),
			ErrorObservers::new(),
		);
		Registration {
			names,
			receiver,
			controller: Some(controller),
		}
	}

	#[tokio::test]
	async fn loop_stopped_by_closed_handle_is_not_running() {
		let broker = InMemoryBroker::new();
		let mut registration = registration(&broker).await;
		assert!(registration.is_running());

		registration.receiver.close().await.unwrap();
		tokio::time::timeout(Duration::from_secs(1), async {
			while registration.is_running() {
				tokio::time::sleep(Duration::from_millis(5)).await;
			}
		})
		.await
		.expect("loop kept running after its handle closed");

		registration.shut_down().await.unwrap();
		assert!(!registration.is_running());
	}

	#[tokio::test]
	async fn shut_down_registration_is_not_running() {
		let broker = InMemoryBroker::new();
		let mut registration = registration(&broker).await;

		registration.shut_down().await.unwrap();
		assert!(!registration.is_running());
		assert!(registration.receiver.is_closed());
	}
}
