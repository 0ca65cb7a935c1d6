//! MQTT backend on top of `rumqttc`
//!
//! The connection namespace is the broker address (`host` or `host:port`),
//! the issuer and its secret become the MQTT username and password.
//!
//! MQTT has no administrative API: topics exist implicitly. Provisioning is
//! therefore tracked per connection, and deleting a topic only forgets it and
//! clears its retained message. A subscription `S` on topic `T` becomes the
//! shared subscription `$share/S/T` at QoS 1 with manual acks:
//!
//! - auto-delete acks a message as soon as it is received,
//! - peek-lock acks on `complete`,
//! - `abandon` keeps the ack withheld and queues the message on the receiver
//!   for local redelivery, ahead of anything new. After
//!   [`MAX_DELIVERY_COUNT`] deliveries it is acked and dropped instead.
//!   MQTT has no negative ack.
//!
//! Incoming publishes carry only the plain topic, so a session serves at most
//! one subscription per topic. Opening a second one is rejected.

use std::{
	collections::{HashMap, HashSet, VecDeque},
	sync::{
		Arc,
		atomic::{AtomicBool, AtomicU64, Ordering},
	},
	time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rumqttc::{
	AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, Publish,
	QoS,
};
use tokio::{sync::mpsc, task::JoinHandle, time};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use super::{
	BrokerAdmin, BrokerConnection, BrokerError, ClientFactory, Connector,
	Delivery, DeliveryMode, LockToken, SubscriptionReceiver, TopicSender,
};
use crate::{config::ConnectionConfig, routing::subscription_loop::retry_delay};

/// Port used when the namespace does not name one.
pub const DEFAULT_PORT: u16 = 1883;
const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(10);
const REQUEST_CAPACITY: usize = 64;
/// Deliveries after which an abandoned message is acked and dropped.
pub const MAX_DELIVERY_COUNT: u32 = 10;

type Inbound = Result<Publish, BrokerError>;

/// [`Connector`] that opens one MQTT session per facade.
#[derive(Debug, Clone)]
pub struct MqttConnector {
	client_id_prefix: String,
	keep_alive: Duration,
}

impl Default for MqttConnector {
	fn default() -> Self {
		Self {
			client_id_prefix: "typed-pubsub".to_string(),
			keep_alive: DEFAULT_KEEP_ALIVE,
		}
	}
}

impl MqttConnector {
	/// Connector with a random client id and a 10 s keep-alive.
	pub fn new() -> Self {
		Self::default()
	}

	/// Prefix of the generated client id (`<prefix>-<uuid>`).
	pub fn with_client_id_prefix(mut self, prefix: impl Into<String>) -> Self {
		self.client_id_prefix = prefix.into();
		self
	}

	/// MQTT keep-alive interval.
	pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
		self.keep_alive = keep_alive;
		self
	}
}

#[async_trait]
impl Connector for MqttConnector {
	async fn connect(
		&self,
		config: &ConnectionConfig,
	) -> Result<BrokerConnection, BrokerError> {
		let (host, port) = parse_namespace(&config.namespace)?;
		let client_id =
			format!("{}-{}", self.client_id_prefix, Uuid::new_v4().simple());

		let mut options = MqttOptions::new(client_id.clone(), host.clone(), port);
		options.set_keep_alive(self.keep_alive);
		options.set_clean_session(false);
		options.set_manual_acks(true);
		if !config.issuer.is_empty() {
			options.set_credentials(
				config.issuer.clone(),
				config.issuer_secret.clone(),
			);
		}

		let (client, event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);
		let router = Arc::new(Router::default());
		let event_loop_handle = tokio::spawn(run_event_loop(
			event_loop,
			client.clone(),
			Arc::clone(&router),
		));
		info!(host = %host, port, client_id = %client_id, "MQTT session started");

		let broker = MqttBroker {
			session: Arc::new(Session {
				client,
				router,
				topics: Mutex::new(HashMap::new()),
				next_message_id: AtomicU64::new(1),
				next_receiver_id: AtomicU64::new(1),
				event_loop: Mutex::new(Some(event_loop_handle)),
			}),
		};
		Ok(BrokerConnection::new(
			Arc::new(broker.clone()),
			Arc::new(broker),
		))
	}
}

/// Split `host[:port]`.
fn parse_namespace(namespace: &str) -> Result<(String, u16), BrokerError> {
	let namespace = namespace.trim();
	if namespace.is_empty() {
		return Err(BrokerError::Rejected("namespace is empty".into()));
	}
	match namespace.rsplit_once(':') {
		| Some((host, port)) => {
			let port = port.parse::<u16>().map_err(|_| {
				BrokerError::Rejected(format!("invalid port in '{namespace}'"))
			})?;
			if host.is_empty() {
				return Err(BrokerError::Rejected(format!(
					"missing host in '{namespace}'"
				)));
			}
			Ok((host.to_string(), port))
		}
		| None => Ok((namespace.to_string(), DEFAULT_PORT)),
	}
}

fn shared_filter(topic: &str, subscription: &str) -> String {
	format!("$share/{subscription}/{topic}")
}

fn transport(err: rumqttc::ClientError) -> BrokerError {
	BrokerError::Transport(err.to_string())
}

async fn run_event_loop(
	mut event_loop: EventLoop,
	client: AsyncClient,
	router: Arc<Router>,
) {
	let mut error_count: u32 = 0;
	loop {
		match event_loop.poll().await {
			| Ok(Event::Incoming(Packet::Publish(publish))) => {
				error_count = 0;
				trace!(
					topic = %publish.topic,
					payload_size = publish.payload.len(),
					"Received MQTT message"
				);
				router.route(&client, publish);
			}
			| Ok(Event::Incoming(Packet::Disconnect)) => {
				info!("Received MQTT Disconnect packet from server");
				break;
			}
			| Ok(Event::Outgoing(Outgoing::Disconnect)) => {
				info!("Sent MQTT Disconnect packet to server");
				break;
			}
			| Ok(notification) => {
				error_count = 0;
				trace!(notification = ?notification, "MQTT notification");
			}
			| Err(err) => {
				error_count = error_count.saturating_add(1);
				error!(error_count, error = %err, "MQTT event loop error");
				router.broadcast(&BrokerError::Transient(err.to_string()));

				let delay = retry_delay(error_count);
				warn!(delay = ?delay, error_count, "Retrying MQTT connection");
				time::sleep(delay).await;
			}
		}
	}
	info!("MQTT event loop terminated");
}

/// Incoming messages are spread over the receivers of their topic.
#[derive(Default)]
struct Router {
	routes: Mutex<HashMap<String, Route>>,
}

#[derive(Default)]
struct Route {
	receivers: Vec<RouteEntry>,
	next: usize,
}

struct RouteEntry {
	id: u64,
	subscription: String,
	inbox: mpsc::UnboundedSender<Inbound>,
}

impl Router {
	/// Returns true when this is the first receiver of the subscription.
	fn attach(
		&self,
		topic: &str,
		subscription: &str,
		id: u64,
		inbox: mpsc::UnboundedSender<Inbound>,
	) -> Result<bool, BrokerError> {
		let mut routes = self.routes.lock();
		let route = routes.entry(topic.to_string()).or_default();
		if let Some(other) = route
			.receivers
			.iter()
			.find(|entry| entry.subscription != subscription)
		{
			return Err(BrokerError::Rejected(format!(
				"topic '{topic}' is already consumed through '{}' in this \
				 session",
				other.subscription
			)));
		}
		let first = route.receivers.is_empty();
		route.receivers.push(RouteEntry {
			id,
			subscription: subscription.to_string(),
			inbox,
		});
		Ok(first)
	}

	/// Returns true when the last receiver of the subscription left.
	fn detach(&self, topic: &str, subscription: &str, id: u64) -> bool {
		let mut routes = self.routes.lock();
		let Some(route) = routes.get_mut(topic) else {
			return false;
		};
		route.receivers.retain(|entry| entry.id != id);
		let last = !route
			.receivers
			.iter()
			.any(|entry| entry.subscription == subscription);
		if route.receivers.is_empty() {
			routes.remove(topic);
		}
		last
	}

	fn route(&self, client: &AsyncClient, publish: Publish) {
		let topic = publish.topic.clone();
		let mut pending = Some(publish);
		if let Some(route) = self.routes.lock().get_mut(&topic) {
			while !route.receivers.is_empty() {
				let Some(message) = pending.take() else {
					break;
				};
				let index = route.next % route.receivers.len();
				route.next = index + 1;
				match route.receivers[index].inbox.send(Ok(message)) {
					| Ok(()) => break,
					| Err(mpsc::error::SendError(inbound)) => {
						// Receiver dropped without closing.
						route.receivers.remove(index);
						pending = inbound.ok();
					}
				}
			}
		}
		if let Some(orphan) = pending {
			debug!(topic = %topic, "No receiver for MQTT message, acking");
			if let Err(err) = client.try_ack(&orphan) {
				warn!(error = %err, "Failed to ack unrouted message");
			}
		}
	}

	fn broadcast(&self, err: &BrokerError) {
		for route in self.routes.lock().values() {
			for entry in &route.receivers {
				let _ = entry.inbox.send(Err(err.clone()));
			}
		}
	}
}

struct Session {
	client: AsyncClient,
	router: Arc<Router>,
	/// topic -> subscriptions provisioned through this session
	topics: Mutex<HashMap<String, HashSet<String>>>,
	next_message_id: AtomicU64,
	next_receiver_id: AtomicU64,
	event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Session {
	fn drop(&mut self) {
		if let Err(err) = self.client.try_disconnect() {
			warn!(error = %err, "Failed to disconnect MQTT client");
			if let Some(handle) = self.event_loop.lock().take() {
				handle.abort();
			}
		}
	}
}

/// Admin API and handle factory of one MQTT session.
#[derive(Clone)]
struct MqttBroker {
	session: Arc<Session>,
}

#[async_trait]
impl BrokerAdmin for MqttBroker {
	async fn topic_exists(&self, topic: &str) -> Result<bool, BrokerError> {
		Ok(self.session.topics.lock().contains_key(topic))
	}

	async fn ensure_topic(&self, topic: &str) -> Result<(), BrokerError> {
		self.session
			.topics
			.lock()
			.entry(topic.to_string())
			.or_default();
		Ok(())
	}

	async fn subscription_exists(
		&self,
		topic: &str,
		subscription: &str,
	) -> Result<bool, BrokerError> {
		Ok(self
			.session
			.topics
			.lock()
			.get(topic)
			.is_some_and(|subscriptions| subscriptions.contains(subscription)))
	}

	async fn ensure_subscription(
		&self,
		topic: &str,
		subscription: &str,
	) -> Result<(), BrokerError> {
		let mut topics = self.session.topics.lock();
		let subscriptions = topics
			.get_mut(topic)
			.ok_or_else(|| BrokerError::EntityNotFound(topic.to_string()))?;
		subscriptions.insert(subscription.to_string());
		Ok(())
	}

	async fn delete_topic(&self, topic: &str) -> Result<(), BrokerError> {
		if self.session.topics.lock().remove(topic).is_none() {
			return Err(BrokerError::EntityNotFound(topic.to_string()));
		}
		// An empty retained payload clears the retained message.
		self.session
			.client
			.publish(topic, QoS::AtLeastOnce, true, Vec::<u8>::new())
			.await
			.map_err(transport)?;
		debug!(topic, "MQTT topic forgotten and retained message cleared");
		Ok(())
	}
}

#[async_trait]
impl ClientFactory for MqttBroker {
	async fn open_publisher(
		&self,
		topic: &str,
	) -> Result<Box<dyn TopicSender>, BrokerError> {
		Ok(Box::new(MqttSender {
			client: self.session.client.clone(),
			topic: topic.to_string(),
			closed: false,
		}))
	}

	async fn open_subscriber(
		&self,
		topic: &str,
		subscription: &str,
		mode: DeliveryMode,
	) -> Result<Arc<dyn SubscriptionReceiver>, BrokerError> {
		if !self.subscription_exists(topic, subscription).await? {
			return Err(BrokerError::EntityNotFound(format!(
				"{topic}/{subscription}"
			)));
		}
		let id = self.session.next_receiver_id.fetch_add(1, Ordering::SeqCst);
		let (tx, rx) = mpsc::unbounded_channel();
		let first = self.session.router.attach(topic, subscription, id, tx)?;
		let receiver = MqttReceiver::new(
			Arc::clone(&self.session),
			id,
			topic,
			subscription,
			mode,
			rx,
		);

		if first {
			let filter = shared_filter(topic, subscription);
			if let Err(err) =
				self.session.client.subscribe(&filter, QoS::AtLeastOnce).await
			{
				self.session.router.detach(topic, subscription, id);
				receiver.closed.store(true, Ordering::SeqCst);
				return Err(transport(err));
			}
			debug!(filter = %filter, "MQTT shared subscription requested");
		}
		Ok(Arc::new(receiver))
	}
}

struct MqttSender {
	client: AsyncClient,
	topic: String,
	closed: bool,
}

#[async_trait]
impl TopicSender for MqttSender {
	async fn send(&mut self, payload: Bytes) -> Result<(), BrokerError> {
		if self.closed {
			return Err(BrokerError::Closed);
		}
		self.client
			.publish(&self.topic, QoS::AtLeastOnce, false, payload.to_vec())
			.await
			.map_err(transport)
	}

	async fn close(&mut self) -> Result<(), BrokerError> {
		self.closed = true;
		Ok(())
	}
}

/// A received publish whose ack is still withheld.
struct Unacked {
	publish: Publish,
	delivery_count: u32,
}

struct MqttReceiver {
	session: Arc<Session>,
	id: u64,
	topic: String,
	subscription: String,
	mode: DeliveryMode,
	inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<Inbound>>,
	/// Abandoned messages, served before the inbox
	redeliver: Mutex<VecDeque<Unacked>>,
	/// lock token -> locked message
	locks: Mutex<HashMap<u64, Unacked>>,
	closed: AtomicBool,
}

impl MqttReceiver {
	fn new(
		session: Arc<Session>,
		id: u64,
		topic: &str,
		subscription: &str,
		mode: DeliveryMode,
		inbox: mpsc::UnboundedReceiver<Inbound>,
	) -> Self {
		Self {
			session,
			id,
			topic: topic.to_string(),
			subscription: subscription.to_string(),
			mode,
			inbox: tokio::sync::Mutex::new(inbox),
			redeliver: Mutex::new(VecDeque::new()),
			locks: Mutex::new(HashMap::new()),
			closed: AtomicBool::new(false),
		}
	}

	async fn next_unacked(
		&self,
		wait: Duration,
	) -> Result<Option<Unacked>, BrokerError> {
		if let Some(mut unacked) = self.redeliver.lock().pop_front() {
			unacked.delivery_count += 1;
			return Ok(Some(unacked));
		}
		let mut inbox = self.inbox.lock().await;
		match time::timeout(wait, inbox.recv()).await {
			| Err(_elapsed) => Ok(None),
			| Ok(None) => Err(BrokerError::Closed),
			| Ok(Some(inbound)) => {
				let publish = inbound?;
				let delivery_count = if publish.dup { 2 } else { 1 };
				Ok(Some(Unacked {
					publish,
					delivery_count,
				}))
			}
		}
	}

	fn ensure_open(&self) -> Result<(), BrokerError> {
		if self.closed.load(Ordering::SeqCst) {
			Err(BrokerError::Closed)
		} else {
			Ok(())
		}
	}
}

#[async_trait]
impl SubscriptionReceiver for MqttReceiver {
	async fn receive(
		&self,
		wait: Duration,
	) -> Result<Option<Delivery>, BrokerError> {
		self.ensure_open()?;
		let Some(unacked) = self.next_unacked(wait).await? else {
			return Ok(None);
		};

		let message_id =
			self.session.next_message_id.fetch_add(1, Ordering::SeqCst);
		let delivery_count = unacked.delivery_count;
		let body = unacked.publish.payload.clone();
		let lock = match self.mode {
			| DeliveryMode::AutoDelete => {
				self.session
					.client
					.ack(&unacked.publish)
					.await
					.map_err(transport)?;
				None
			}
			| DeliveryMode::PeekLock => {
				self.locks.lock().insert(message_id, unacked);
				Some(LockToken(message_id))
			}
		};
		Ok(Some(Delivery {
			message_id,
			body,
			delivery_count,
			lock,
		}))
	}

	async fn complete(&self, lock: &LockToken) -> Result<(), BrokerError> {
		self.ensure_open()?;
		let unacked = self
			.locks
			.lock()
			.remove(&lock.0)
			.ok_or(BrokerError::LockLost(lock.0))?;
		self.session
			.client
			.ack(&unacked.publish)
			.await
			.map_err(transport)
	}

	async fn abandon(&self, lock: &LockToken) -> Result<(), BrokerError> {
		self.ensure_open()?;
		let unacked = self
			.locks
			.lock()
			.remove(&lock.0)
			.ok_or(BrokerError::LockLost(lock.0))?;
		if unacked.delivery_count >= MAX_DELIVERY_COUNT {
			warn!(
				topic = %self.topic,
				lock = %lock,
				delivery_count = unacked.delivery_count,
				"Delivery limit reached, acking and dropping message"
			);
			return self
				.session
				.client
				.ack(&unacked.publish)
				.await
				.map_err(transport);
		}
		debug!(
			topic = %self.topic,
			lock = %lock,
			delivery_count = unacked.delivery_count,
			"Message queued for redelivery"
		);
		self.redeliver.lock().push_back(unacked);
		Ok(())
	}

	async fn close(&self) -> Result<(), BrokerError> {
		if self.closed.swap(true, Ordering::SeqCst) {
			return Ok(());
		}
		let last =
			self.session
				.router
				.detach(&self.topic, &self.subscription, self.id);
		if last {
			let filter = shared_filter(&self.topic, &self.subscription);
			self.session
				.client
				.unsubscribe(&filter)
				.await
				.map_err(transport)?;
			debug!(filter = %filter, "MQTT shared subscription released");
		}
		Ok(())
	}

	fn is_closed(&self) -> bool {
		self.closed.load(Ordering::SeqCst)
	}
}

impl Drop for MqttReceiver {
	fn drop(&mut self) {
		if !self.closed.load(Ordering::SeqCst)
			&& self
				.session
				.router
				.detach(&self.topic, &self.subscription, self.id)
		{
			let filter = shared_filter(&self.topic, &self.subscription);
			let _ = self.session.client.try_unsubscribe(filter);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn publish(topic: &str, body: &'static [u8]) -> Publish {
		Publish::new(topic, QoS::AtLeastOnce, body)
	}

	fn offline_client() -> AsyncClient {
		let (client, _event_loop) =
			AsyncClient::new(MqttOptions::new("test", "localhost", 1883), 8);
		client
	}

	/// Peek-lock receiver on a session that is never polled. The event loop
	/// is returned so acks can still be queued.
	fn peek_lock_receiver()
	-> (MqttReceiver, mpsc::UnboundedSender<Inbound>, EventLoop) {
		let (client, event_loop) = AsyncClient::new(
			MqttOptions::new("test", "localhost", 1883),
			REQUEST_CAPACITY,
		);
		let session = Arc::new(Session {
			client,
			router: Arc::new(Router::default()),
			topics: Mutex::new(HashMap::new()),
			next_message_id: AtomicU64::new(1),
			next_receiver_id: AtomicU64::new(1),
			event_loop: Mutex::new(None),
		});
		let (tx, rx) = mpsc::unbounded_channel();
		let receiver =
			MqttReceiver::new(session, 1, "T", "S", DeliveryMode::PeekLock, rx);
		(receiver, tx, event_loop)
	}

	fn inbound(body: &'static [u8]) -> Inbound {
		let mut message = publish("T", body);
		message.pkid = 1;
		Ok(message)
	}

	#[test]
	fn namespace_parsing() {
		assert_eq!(
			parse_namespace("broker.local").unwrap(),
			("broker.local".to_string(), DEFAULT_PORT)
		);
		assert_eq!(
			parse_namespace(" broker.local:8883 ").unwrap(),
			("broker.local".to_string(), 8883)
		);
		assert!(parse_namespace("broker.local:http").is_err());
		assert!(parse_namespace(":1883").is_err());
		assert!(parse_namespace("  ").is_err());
	}

	#[test]
	fn shared_filter_layout() {
		assert_eq!(
			shared_filter("Topic_Order", "Subscription_Order"),
			"$share/Subscription_Order/Topic_Order"
		);
	}

	#[test]
	fn only_first_and_last_receiver_touch_the_subscription() {
		let router = Router::default();
		let (tx, _rx) = mpsc::unbounded_channel();
		assert!(router.attach("T", "S", 1, tx.clone()).unwrap());
		assert!(!router.attach("T", "S", 2, tx.clone()).unwrap());
		assert!(router.attach("T2", "Other", 3, tx).unwrap());

		assert!(!router.detach("T", "S", 1));
		assert!(router.detach("T", "S", 2));
		assert!(router.detach("T2", "Other", 3));
		assert!(router.routes.lock().is_empty());
	}

	#[test]
	fn second_subscription_on_a_topic_is_rejected() {
		let router = Router::default();
		let (tx, _rx) = mpsc::unbounded_channel();
		router.attach("T", "S", 1, tx.clone()).unwrap();

		assert!(matches!(
			router.attach("T", "Other", 2, tx.clone()),
			Err(BrokerError::Rejected(_))
		));
		assert_eq!(router.routes.lock()["T"].receivers.len(), 1);

		assert!(router.detach("T", "S", 1));
		assert!(router.attach("T", "Other", 3, tx).unwrap());
	}

	#[tokio::test]
	async fn abandoned_message_is_redelivered_before_new_ones() {
		let (receiver, tx, _event_loop) = peek_lock_receiver();
		tx.send(inbound(b"first")).unwrap();
		tx.send(inbound(b"second")).unwrap();
		let wait = Duration::from_millis(50);

		let delivery = receiver.receive(wait).await.unwrap().unwrap();
		assert_eq!(delivery.body, Bytes::from_static(b"first"));
		assert_eq!(delivery.delivery_count, 1);
		receiver.abandon(&delivery.lock.unwrap()).await.unwrap();

		let delivery = receiver.receive(wait).await.unwrap().unwrap();
		assert_eq!(delivery.body, Bytes::from_static(b"first"));
		assert_eq!(delivery.delivery_count, 2);
		receiver.complete(&delivery.lock.unwrap()).await.unwrap();

		let delivery = receiver.receive(wait).await.unwrap().unwrap();
		assert_eq!(delivery.body, Bytes::from_static(b"second"));
		assert!(receiver.locks.lock().contains_key(&delivery.message_id));
	}

	#[tokio::test]
	async fn message_is_dropped_after_delivery_limit() {
		let (receiver, tx, _event_loop) = peek_lock_receiver();
		tx.send(inbound(b"poison")).unwrap();
		let wait = Duration::from_millis(20);

		for expected in 1 ..= MAX_DELIVERY_COUNT {
			let delivery = receiver.receive(wait).await.unwrap().unwrap();
			assert_eq!(delivery.delivery_count, expected);
			receiver.abandon(&delivery.lock.unwrap()).await.unwrap();
		}

		assert!(receiver.receive(wait).await.unwrap().is_none());
		assert!(receiver.redeliver.lock().is_empty());
		assert!(receiver.locks.lock().is_empty());
	}

	#[tokio::test]
	async fn messages_alternate_between_competing_receivers() {
		let router = Router::default();
		let client = offline_client();
		let (tx_a, mut rx_a) = mpsc::unbounded_channel();
		let (tx_b, mut rx_b) = mpsc::unbounded_channel();
		router.attach("T", "S", 1, tx_a).unwrap();
		router.attach("T", "S", 2, tx_b).unwrap();

		for body in [b"1", b"2", b"3"] {
			router.route(&client, publish("T", body));
		}

		let first = rx_a.recv().await.unwrap().unwrap();
		let second = rx_b.recv().await.unwrap().unwrap();
		let third = rx_a.recv().await.unwrap().unwrap();
		assert_eq!(first.payload, Bytes::from_static(b"1"));
		assert_eq!(second.payload, Bytes::from_static(b"2"));
		assert_eq!(third.payload, Bytes::from_static(b"3"));
	}

	#[tokio::test]
	async fn dropped_receiver_is_skipped() {
		let router = Router::default();
		let client = offline_client();
		let (tx_a, rx_a) = mpsc::unbounded_channel();
		let (tx_b, mut rx_b) = mpsc::unbounded_channel();
		router.attach("T", "S", 1, tx_a).unwrap();
		router.attach("T", "S", 2, tx_b).unwrap();
		drop(rx_a);

		router.route(&client, publish("T", b"x"));

		assert_eq!(
			rx_b.recv().await.unwrap().unwrap().payload,
			Bytes::from_static(b"x")
		);
		assert_eq!(router.routes.lock()["T"].receivers.len(), 1);
	}

	#[tokio::test]
	async fn event_loop_errors_reach_every_receiver() {
		let router = Router::default();
		let (tx_a, mut rx_a) = mpsc::unbounded_channel();
		let (tx_b, mut rx_b) = mpsc::unbounded_channel();
		router.attach("T1", "S1", 1, tx_a).unwrap();
		router.attach("T2", "S2", 2, tx_b).unwrap();

		router.broadcast(&BrokerError::Transient("connection reset".into()));

		for rx in [&mut rx_a, &mut rx_b] {
			assert!(matches!(
				rx.recv().await.unwrap(),
				Err(BrokerError::Transient(_))
			));
		}
	}
}
