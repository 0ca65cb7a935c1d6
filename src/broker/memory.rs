//! In-process broker
//!
//! Reference backend for the seams in [`crate::broker`]. It keeps topics and
//! subscriptions in memory and implements both delivery modes:
//!
//! - a topic copies every sent message into each of its subscriptions;
//! - receivers on the same subscription compete for its messages;
//! - auto-delete receivers remove the message as they take it;
//! - peek-lock receivers lock it for `lock_duration`. `complete` removes it,
//!   `abandon` puts it back at the head of the queue, and an expired lock puts
//!   it back on the next receive attempt;
//! - a message released after `max_delivery_count` deliveries is parked with
//!   the subscription's dead letters instead.
//!
//! Failure injection (`fail_next_receives`, `fail_next_sends`,
//! `fail_next_admin`) and a few counters exist so tests can drive the facade
//! through broker faults.

use std::{
	collections::{HashMap, VecDeque},
	sync::{
		Arc,
		atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering},
	},
	time::Duration,
};

use arcstr::ArcStr;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::{sync::Notify, time::Instant};
use tracing::{debug, trace};

use super::{
	BrokerAdmin, BrokerConnection, BrokerError, ClientFactory, Connector,
	Delivery, DeliveryMode, LockToken, SubscriptionReceiver, TopicSender,
};
use crate::config::ConnectionConfig;

/// Lock duration used by [`InMemoryBroker::new`].
pub const DEFAULT_LOCK_DURATION: Duration = Duration::from_secs(30);
/// Deliveries after which a peek-locked message is dead-lettered.
pub const DEFAULT_MAX_DELIVERY_COUNT: u32 = 10;

/// Cheaply cloneable handle to an in-memory broker.
#[derive(Clone)]
pub struct InMemoryBroker {
	inner: Arc<Inner>,
}

struct Inner {
	topics: Mutex<HashMap<ArcStr, Topic>>,
	send_faults: Mutex<HashMap<ArcStr, u32>>,
	admin_faults: AtomicU32,
	lock_duration: Duration,
	max_delivery_count: AtomicU32,
	next_message_id: AtomicU64,
	next_lock: AtomicU64,
	open_publishers: AtomicUsize,
	open_subscribers: AtomicUsize,
	connections: AtomicUsize,
}

#[derive(Default)]
struct Topic {
	subscriptions: HashMap<ArcStr, Arc<SubscriptionQueue>>,
}

struct SubscriptionQueue {
	name: ArcStr,
	state: Mutex<QueueState>,
	notify: Notify,
}

#[derive(Default)]
struct QueueState {
	ready: VecDeque<StoredMessage>,
	locked: HashMap<u64, LockedMessage>,
	dead_letters: VecDeque<StoredMessage>,
	receive_faults: u32,
	deleted: bool,
}

#[derive(Clone)]
struct StoredMessage {
	id: u64,
	body: Bytes,
	delivery_count: u32,
}

struct LockedMessage {
	message: StoredMessage,
	expires_at: Instant,
}

impl QueueState {
	/// Put a released message back at the head of the queue, or park it
	/// with the dead letters once it has used up its deliveries.
	fn requeue(&mut self, message: StoredMessage, max_delivery_count: u32) {
		if message.delivery_count >= max_delivery_count {
			debug!(
				message_id = message.id,
				delivery_count = message.delivery_count,
				"Message dead-lettered"
			);
			self.dead_letters.push_back(message);
		} else {
			self.ready.push_front(message);
		}
	}

	/// Requeue every message whose lock has expired.
	fn release_expired(&mut self, now: Instant, max_delivery_count: u32) {
		let expired: Vec<u64> = self
			.locked
			.iter()
			.filter(|(_, locked)| locked.expires_at <= now)
			.map(|(token, _)| *token)
			.collect();
		for token in expired {
			if let Some(locked) = self.locked.remove(&token) {
				trace!(message_id = locked.message.id, "Message lock expired");
				self.requeue(locked.message, max_delivery_count);
			}
		}
	}

	fn next_expiry(&self) -> Option<Instant> {
		self.locked.values().map(|locked| locked.expires_at).min()
	}
}

impl SubscriptionQueue {
	fn new(name: ArcStr) -> Self {
		Self {
			name,
			state: Mutex::new(QueueState::default()),
			notify: Notify::new(),
		}
	}

	fn push(&self, message: StoredMessage) {
		self.state.lock().ready.push_back(message);
		self.notify.notify_waiters();
	}

	fn mark_deleted(&self) {
		self.state.lock().deleted = true;
		self.notify.notify_waiters();
	}
}

impl Default for InMemoryBroker {
	fn default() -> Self {
		Self::new()
	}
}

impl InMemoryBroker {
	/// Empty broker with the default lock duration.
	pub fn new() -> Self {
		Self::with_lock_duration(DEFAULT_LOCK_DURATION)
	}

	/// Empty broker whose peek-locks expire after `lock_duration`.
	pub fn with_lock_duration(lock_duration: Duration) -> Self {
		Self {
			inner: Arc::new(Inner {
				topics: Mutex::new(HashMap::new()),
				send_faults: Mutex::new(HashMap::new()),
				admin_faults: AtomicU32::new(0),
				lock_duration,
				max_delivery_count: AtomicU32::new(DEFAULT_MAX_DELIVERY_COUNT),
				next_message_id: AtomicU64::new(1),
				next_lock: AtomicU64::new(1),
				open_publishers: AtomicUsize::new(0),
				open_subscribers: AtomicUsize::new(0),
				connections: AtomicUsize::new(0),
			}),
		}
	}

	/// Dead-letter peek-locked messages once they have been delivered
	/// `max_delivery_count` times (default 10) without being completed.
	pub fn with_max_delivery_count(self, max_delivery_count: u32) -> Self {
		self.inner
			.max_delivery_count
			.store(max_delivery_count.max(1), Ordering::SeqCst);
		self
	}

	/// Make the next `count` receive calls on the subscription fail with a
	/// transient error.
	pub fn fail_next_receives(
		&self,
		topic: &str,
		subscription: &str,
		count: u32,
	) -> Result<(), BrokerError> {
		let queue = self.inner.queue(topic, subscription)?;
		queue.state.lock().receive_faults += count;
		// Wake parked receivers so the fault surfaces now.
		queue.notify.notify_waiters();
		Ok(())
	}

	/// Make the next `count` provisioning or deletion calls fail with a
	/// transient error.
	pub fn fail_next_admin(&self, count: u32) {
		self.inner.admin_faults.fetch_add(count, Ordering::SeqCst);
	}

	/// Make the next `count` sends to the topic fail with a transient error.
	pub fn fail_next_sends(&self, topic: &str, count: u32) {
		*self
			.inner
			.send_faults
			.lock()
			.entry(ArcStr::from(topic))
			.or_default() += count;
	}

	/// Messages waiting in the subscription, locked ones excluded.
	pub fn pending_count(&self, topic: &str, subscription: &str) -> Option<usize> {
		let queue = self.inner.queue(topic, subscription).ok()?;
		let state = queue.state.lock();
		Some(state.ready.len())
	}

	/// Messages parked after exhausting their deliveries.
	pub fn dead_letter_count(
		&self,
		topic: &str,
		subscription: &str,
	) -> Option<usize> {
		let queue = self.inner.queue(topic, subscription).ok()?;
		let state = queue.state.lock();
		Some(state.dead_letters.len())
	}

	/// Messages currently peek-locked in the subscription.
	pub fn locked_count(&self, topic: &str, subscription: &str) -> Option<usize> {
		let queue = self.inner.queue(topic, subscription).ok()?;
		let state = queue.state.lock();
		Some(state.locked.len())
	}

	/// Publisher handles opened and not yet closed.
	pub fn open_publishers(&self) -> usize {
		self.inner.open_publishers.load(Ordering::SeqCst)
	}

	/// Subscriber handles opened and not yet closed.
	pub fn open_subscribers(&self) -> usize {
		self.inner.open_subscribers.load(Ordering::SeqCst)
	}

	/// How many times [`Connector::connect`] succeeded.
	pub fn connection_count(&self) -> usize {
		self.inner.connections.load(Ordering::SeqCst)
	}

	/// Number of subscriptions under `topic`.
	pub fn subscription_count(&self, topic: &str) -> Option<usize> {
		self.inner
			.topics
			.lock()
			.get(topic)
			.map(|topic| topic.subscriptions.len())
	}
}

impl Inner {
	fn queue(
		&self,
		topic: &str,
		subscription: &str,
	) -> Result<Arc<SubscriptionQueue>, BrokerError> {
		let topics = self.topics.lock();
		let entry = topics
			.get(topic)
			.ok_or_else(|| BrokerError::EntityNotFound(topic.to_string()))?;
		entry.subscriptions.get(subscription).cloned().ok_or_else(|| {
			BrokerError::EntityNotFound(format!("{topic}/{subscription}"))
		})
	}

	fn max_delivery_count(&self) -> u32 {
		self.max_delivery_count.load(Ordering::SeqCst)
	}

	fn take_admin_fault(&self) -> Result<(), BrokerError> {
		let taken = self.admin_faults.fetch_update(
			Ordering::SeqCst,
			Ordering::SeqCst,
			|remaining| remaining.checked_sub(1),
		);
		match taken {
			| Ok(_) => Err(BrokerError::Transient("injected admin failure".into())),
			| Err(_) => Ok(()),
		}
	}

	fn take_send_fault(&self, topic: &str) -> bool {
		let mut faults = self.send_faults.lock();
		match faults.get_mut(topic) {
			| Some(remaining) if *remaining > 0 => {
				*remaining -= 1;
				true
			}
			| _ => false,
		}
	}
}

#[async_trait]
impl Connector for InMemoryBroker {
	async fn connect(
		&self,
		config: &ConnectionConfig,
	) -> Result<BrokerConnection, BrokerError> {
		if config.namespace.trim().is_empty() {
			return Err(BrokerError::Rejected("namespace is empty".into()));
		}
		self.inner.connections.fetch_add(1, Ordering::SeqCst);
		debug!(namespace = %config.namespace, "In-memory broker connected");
		Ok(BrokerConnection::new(
			Arc::new(self.clone()),
			Arc::new(self.clone()),
		))
	}
}

#[async_trait]
impl BrokerAdmin for InMemoryBroker {
	async fn topic_exists(&self, topic: &str) -> Result<bool, BrokerError> {
		Ok(self.inner.topics.lock().contains_key(topic))
	}

	async fn ensure_topic(&self, topic: &str) -> Result<(), BrokerError> {
		self.inner.take_admin_fault()?;
		let mut topics = self.inner.topics.lock();
		if !topics.contains_key(topic) {
			debug!(topic, "Creating topic");
			topics.insert(ArcStr::from(topic), Topic::default());
		}
		Ok(())
	}

	async fn subscription_exists(
		&self,
		topic: &str,
		subscription: &str,
	) -> Result<bool, BrokerError> {
		let topics = self.inner.topics.lock();
		let entry = topics
			.get(topic)
			.ok_or_else(|| BrokerError::EntityNotFound(topic.to_string()))?;
		Ok(entry.subscriptions.contains_key(subscription))
	}

	async fn ensure_subscription(
		&self,
		topic: &str,
		subscription: &str,
	) -> Result<(), BrokerError> {
		self.inner.take_admin_fault()?;
		let mut topics = self.inner.topics.lock();
		let entry = topics
			.get_mut(topic)
			.ok_or_else(|| BrokerError::EntityNotFound(topic.to_string()))?;
		entry
			.subscriptions
			.entry(ArcStr::from(subscription))
			.or_insert_with_key(|name| {
				debug!(topic, subscription = %name, "Creating subscription");
				Arc::new(SubscriptionQueue::new(name.clone()))
			});
		Ok(())
	}

	async fn delete_topic(&self, topic: &str) -> Result<(), BrokerError> {
		self.inner.take_admin_fault()?;
		let removed = self
			.inner
			.topics
			.lock()
			.remove(topic)
			.ok_or_else(|| BrokerError::EntityNotFound(topic.to_string()))?;
		for queue in removed.subscriptions.values() {
			queue.mark_deleted();
		}
		debug!(
			topic,
			subscriptions = removed.subscriptions.len(),
			"Deleted topic"
		);
		Ok(())
	}
}

#[async_trait]
impl ClientFactory for InMemoryBroker {
	async fn open_publisher(
		&self,
		topic: &str,
	) -> Result<Box<dyn TopicSender>, BrokerError> {
		self.inner.open_publishers.fetch_add(1, Ordering::SeqCst);
		Ok(Box::new(MemorySender {
			broker: Arc::clone(&self.inner),
			topic: ArcStr::from(topic),
			closed: false,
		}))
	}

	async fn open_subscriber(
		&self,
		topic: &str,
		subscription: &str,
		mode: DeliveryMode,
	) -> Result<Arc<dyn SubscriptionReceiver>, BrokerError> {
		let queue = self.inner.queue(topic, subscription)?;
		self.inner.open_subscribers.fetch_add(1, Ordering::SeqCst);
		Ok(Arc::new(MemoryReceiver {
			broker: Arc::clone(&self.inner),
			queue,
			mode,
			closed: AtomicBool::new(false),
			close_notify: Notify::new(),
		}))
	}
}

struct MemorySender {
	broker: Arc<Inner>,
	topic: ArcStr,
	closed: bool,
}

#[async_trait]
impl TopicSender for MemorySender {
	async fn send(&mut self, payload: Bytes) -> Result<(), BrokerError> {
		if self.closed {
			return Err(BrokerError::Closed);
		}
		if self.broker.take_send_fault(&self.topic) {
			return Err(BrokerError::Transient("injected send failure".into()));
		}
		let queues: Vec<Arc<SubscriptionQueue>> = {
			let topics = self.broker.topics.lock();
			let topic = topics.get(&self.topic).ok_or_else(|| {
				BrokerError::EntityNotFound(self.topic.to_string())
			})?;
			topic.subscriptions.values().cloned().collect()
		};
		let id = self.broker.next_message_id.fetch_add(1, Ordering::SeqCst);
		trace!(topic = %self.topic, message_id = id, fan_out = queues.len(), "Message sent");
		for queue in queues {
			queue.push(StoredMessage {
				id,
				body: payload.clone(),
				delivery_count: 0,
			});
		}
		Ok(())
	}

	async fn close(&mut self) -> Result<(), BrokerError> {
		if !self.closed {
			self.closed = true;
			self.broker.open_publishers.fetch_sub(1, Ordering::SeqCst);
		}
		Ok(())
	}
}

impl Drop for MemorySender {
	fn drop(&mut self) {
		if !self.closed {
			self.broker.open_publishers.fetch_sub(1, Ordering::SeqCst);
		}
	}
}

struct MemoryReceiver {
	broker: Arc<Inner>,
	queue: Arc<SubscriptionQueue>,
	mode: DeliveryMode,
	closed: AtomicBool,
	close_notify: Notify,
}

impl MemoryReceiver {
	fn ensure_open(&self) -> Result<(), BrokerError> {
		if self.closed.load(Ordering::SeqCst) {
			Err(BrokerError::Closed)
		} else {
			Ok(())
		}
	}
}

#[async_trait]
impl SubscriptionReceiver for MemoryReceiver {
	async fn receive(
		&self,
		wait: Duration,
	) -> Result<Option<Delivery>, BrokerError> {
		// Stand-in for the network round-trip a real broker would make.
		tokio::task::yield_now().await;
		let deadline = Instant::now() + wait;
		let max_delivery_count = self.broker.max_delivery_count();
		loop {
			// Register for wakeups before looking at the state, otherwise a
			// send or close landing in between would be missed.
			let arrived = self.queue.notify.notified();
			let closed = self.close_notify.notified();
			self.ensure_open()?;

			let wake_at = {
				let mut state = self.queue.state.lock();
				if state.deleted {
					return Err(BrokerError::EntityNotFound(
						self.queue.name.to_string(),
					));
				}
				if state.receive_faults > 0 {
					state.receive_faults -= 1;
					return Err(BrokerError::Transient(
						"injected receive failure".into(),
					));
				}
				let now = Instant::now();
				state.release_expired(now, max_delivery_count);
				if let Some(mut message) = state.ready.pop_front() {
					message.delivery_count += 1;
					let lock = match self.mode {
						| DeliveryMode::AutoDelete => None,
						| DeliveryMode::PeekLock => {
							let token = LockToken(
								self.broker.next_lock.fetch_add(1, Ordering::SeqCst),
							);
							state.locked.insert(token.0, LockedMessage {
								message: message.clone(),
								expires_at: now + self.broker.lock_duration,
							});
							Some(token)
						}
					};
					return Ok(Some(Delivery {
						message_id: message.id,
						body: message.body,
						delivery_count: message.delivery_count,
						lock,
					}));
				}
				if now >= deadline {
					return Ok(None);
				}
				state
					.next_expiry()
					.map_or(deadline, |expiry| expiry.min(deadline))
			};

			tokio::select! {
				_ = arrived => {}
				_ = closed => {}
				_ = tokio::time::sleep_until(wake_at) => {}
			}
		}
	}

	async fn complete(&self, lock: &LockToken) -> Result<(), BrokerError> {
		self.ensure_open()?;
		let max_delivery_count = self.broker.max_delivery_count();
		let mut state = self.queue.state.lock();
		state.release_expired(Instant::now(), max_delivery_count);
		state
			.locked
			.remove(&lock.0)
			.map(|_| ())
			.ok_or(BrokerError::LockLost(lock.0))
	}

	async fn abandon(&self, lock: &LockToken) -> Result<(), BrokerError> {
		self.ensure_open()?;
		let max_delivery_count = self.broker.max_delivery_count();
		{
			let mut state = self.queue.state.lock();
			state.release_expired(Instant::now(), max_delivery_count);
			let locked = state
				.locked
				.remove(&lock.0)
				.ok_or(BrokerError::LockLost(lock.0))?;
			state.requeue(locked.message, max_delivery_count);
		}
		self.queue.notify.notify_waiters();
		Ok(())
	}

	async fn close(&self) -> Result<(), BrokerError> {
		if !self.closed.swap(true, Ordering::SeqCst) {
			self.broker.open_subscribers.fetch_sub(1, Ordering::SeqCst);
			self.close_notify.notify_waiters();
		}
		Ok(())
	}

	fn is_closed(&self) -> bool {
		self.closed.load(Ordering::SeqCst)
	}
}

impl Drop for MemoryReceiver {
	fn drop(&mut self) {
		if !self.closed.load(Ordering::SeqCst) {
			self.broker.open_subscribers.fetch_sub(1, Ordering::SeqCst);
		}
	}
}
