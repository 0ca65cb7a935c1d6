//! The per-subscription receive loop
//!
//! ```text
//!            +------------------ timeout ------------------+
//!            v                                             |
//!   ---> [Armed] --message--> [Delivered] --handler--> settle (peek-lock)
//!         ^   |                                            |
//!         |   +--receive error--> report, back off --------+
//!         +------------------------------------------------+
//! ```
//!
//! A failed handler abandons its peek-locked message. A body that does not
//! decode is reported but left locked, so it comes back only after the lock
//! expires and stops coming back once the broker's delivery limit is hit.
//!
//! Shutdown is checked every time the loop is about to re-arm and while it
//! waits, so [`LoopController::shutdown`] returns as soon as the current
//! delivery (if any) has been handled and settled.

use std::{sync::Arc, time::Duration};

use arcstr::ArcStr;
use tokio::{
	sync::oneshot,
	task::{JoinError, JoinHandle},
	time,
};
use tracing::{debug, error, info, trace, warn};

use super::{
	Dispatch, DispatchError, ErrorObservers, SubscriptionError,
};
use crate::{
	broker::{Delivery, DeliveryMode, LockToken, SubscriptionReceiver},
	message::EntityNames,
};

/// Bounded wait of one receive call (long poll).
pub const RECEIVE_WAIT: Duration = Duration::from_secs(5 * 60);
/// Upper bound on a complete/abandon call before the loop moves on.
pub const SETTLE_TIMEOUT: Duration = Duration::from_secs(30);

const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(100);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Why a loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
	/// The controller asked it to stop (or was dropped)
	Shutdown,
	/// The receiver handle was closed underneath it
	HandleClosed,
}

#[derive(Debug, Clone, Copy)]
enum Outcome {
	Handled,
	Failed,
	Undecodable,
}

/// Receive-dispatch-settle loop bound to one subscriber handle.
pub struct SubscriptionLoop {
	topic: ArcStr,
	subscription: ArcStr,
	mode: DeliveryMode,
	receiver: Arc<dyn SubscriptionReceiver>,
	dispatcher: Box<dyn Dispatch>,
	observers: ErrorObservers,
	shutdown_rx: oneshot::Receiver<()>,
}

impl SubscriptionLoop {
	/// Start the loop on a new tokio task.
	pub fn spawn(
		names: &EntityNames,
		mode: DeliveryMode,
		receiver: Arc<dyn SubscriptionReceiver>,
		dispatcher: Box<dyn Dispatch>,
		observers: ErrorObservers,
	) -> LoopController {
		let (shutdown_tx, shutdown_rx) = oneshot::channel();
		let subscription_loop = Self {
			topic: names.topic.clone(),
			subscription: names.subscription.clone(),
			mode,
			receiver,
			dispatcher,
			observers,
			shutdown_rx,
		};
		let join_handle = tokio::spawn(subscription_loop.run());
		LoopController {
			shutdown_tx,
			join_handle,
		}
	}

	async fn run(mut self) -> LoopExit {
		debug!(
			topic = %self.topic,
			subscription = %self.subscription,
			mode = %self.mode,
			"Subscription loop started"
		);
		let mut consecutive_failures: u32 = 0;

		let exit = loop {
			trace!(topic = %self.topic, subscription = %self.subscription, "Arming receive");
			let received = tokio::select! {
				biased;
				_ = &mut self.shutdown_rx => break LoopExit::Shutdown,
				received = self.receiver.receive(RECEIVE_WAIT) => received,
			};

			match received {
				| Ok(None) => {
					consecutive_failures = 0;
					trace!(
						topic = %self.topic,
						subscription = %self.subscription,
						"Receive wait elapsed without a message"
					);
				}
				| Ok(Some(delivery)) => {
					consecutive_failures = 0;
					self.process(delivery).await;
				}
				| Err(err) if err.is_closed() => break LoopExit::HandleClosed,
				| Err(err) => {
					consecutive_failures += 1;
					error!(
						topic = %self.topic,
						subscription = %self.subscription,
						error_count = consecutive_failures,
						error = %err,
						"Receive failed"
					);
					self.observers.notify(&SubscriptionError::Receive {
						topic: self.topic.clone(),
						subscription: self.subscription.clone(),
						source: err,
					});

					let delay = retry_delay(consecutive_failures);
					debug!(delay = ?delay, "Re-arming receive after backoff");
					tokio::select! {
						biased;
						_ = &mut self.shutdown_rx => break LoopExit::Shutdown,
						_ = time::sleep(delay) => {}
					}
				}
			}
		};

		info!(
			topic = %self.topic,
			subscription = %self.subscription,
			exit = ?exit,
			"Subscription loop stopped"
		);
		exit
	}

	async fn process(&mut self, delivery: Delivery) {
		debug!(
			topic = %self.topic,
			subscription = %self.subscription,
			message_id = delivery.message_id,
			delivery_count = delivery.delivery_count,
			"Message delivered"
		);

		let outcome = match self.dispatcher.dispatch(&delivery.body) {
			| Ok(()) => Outcome::Handled,
			| Err(DispatchError::Deserialize(reason)) => {
				warn!(
					topic = %self.topic,
					subscription = %self.subscription,
					message_id = delivery.message_id,
					error = %reason,
					"Message body could not be decoded"
				);
				self.observers.notify(&SubscriptionError::Deserialize {
					topic: self.topic.clone(),
					subscription: self.subscription.clone(),
					message_id: delivery.message_id,
					reason,
				});
				Outcome::Undecodable
			}
			| Err(err) => {
				warn!(
					topic = %self.topic,
					subscription = %self.subscription,
					message_id = delivery.message_id,
					error = %err,
					"Message handling failed"
				);
				Outcome::Failed
			}
		};

		match (delivery.lock, outcome) {
			| (Some(lock), Outcome::Handled) => {
				self.settle(lock, true, delivery.message_id).await
			}
			| (Some(lock), Outcome::Failed) => {
				self.settle(lock, false, delivery.message_id).await
			}
			// Abandoning would hand the same bytes straight back. The lock is
			// left to expire so the broker's delivery limit applies.
			| (Some(lock), Outcome::Undecodable) => {
				debug!(
					topic = %self.topic,
					message_id = delivery.message_id,
					lock = %lock,
					"Leaving undecodable message locked until expiry"
				);
			}
			| (None, Outcome::Handled) => {}
			| (None, _) => {
				warn!(
					topic = %self.topic,
					message_id = delivery.message_id,
					"Auto-deleted message lost after failed handling"
				);
			}
		}
	}

	/// Complete or abandon a peek-locked message and wait (bounded) for the
	/// broker to confirm before the loop re-arms.
	async fn settle(&self, lock: LockToken, handled: bool, message_id: u64) {
		let (action, settlement) = if handled {
			("complete", self.receiver.complete(&lock))
		} else {
			("abandon", self.receiver.abandon(&lock))
		};

		match time::timeout(SETTLE_TIMEOUT, settlement).await {
			| Ok(Ok(())) => {
				trace!(message_id, lock = %lock, action, "Message settled");
			}
			| Ok(Err(err)) => {
				warn!(
					topic = %self.topic,
					message_id,
					action,
					error = %err,
					"Message settlement failed"
				);
			}
			| Err(_) => {
				warn!(
					topic = %self.topic,
					message_id,
					action,
					timeout_ms = SETTLE_TIMEOUT.as_millis() as u64,
					"Message settlement timed out"
				);
			}
		}
	}
}

/// Exponential backoff shared by every retry loop in the crate.
pub(crate) fn retry_delay(consecutive_failures: u32) -> Duration {
	let delay = INITIAL_RETRY_DELAY
		* 2_u32.pow(consecutive_failures.saturating_sub(1).min(10));
	delay.min(MAX_RETRY_DELAY)
}

/// Stops a running [`SubscriptionLoop`].
///
/// Dropping the controller also stops the loop at its next re-arm.
pub struct LoopController {
	shutdown_tx: oneshot::Sender<()>,
	join_handle: JoinHandle<LoopExit>,
}

impl LoopController {
	/// Signal the loop and wait for its task to finish.
	pub async fn shutdown(self) -> Result<LoopExit, JoinError> {
		// The loop may already be gone (handle closed); that is fine.
		let _ = self.shutdown_tx.send(());
		self.join_handle.await.inspect_err(|e| {
			warn!(error = ?e, "Subscription loop task failed");
		})
	}

	/// Whether the loop task has ended.
	pub fn is_finished(&self) -> bool {
		self.join_handle.is_finished()
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicU32, Ordering};

	use bytes::Bytes;
	use parking_lot::Mutex;

	use super::*;
	use crate::broker::{
		BrokerAdmin, ClientFactory, InMemoryBroker, TopicSender,
	};

	struct Recorder {
		calls: Arc<AtomicU32>,
		fail: bool,
	}

	impl Dispatch for Recorder {
		fn dispatch(&self, _body: &[u8]) -> Result<(), DispatchError> {
			self.calls.fetch_add(1, Ordering::SeqCst);
			if self.fail {
				Err(DispatchError::Handler("nope".into()))
			} else {
				Ok(())
			}
		}
	}

	struct Garbled {
		calls: Arc<AtomicU32>,
	}

	impl Dispatch for Garbled {
		fn dispatch(&self, _body: &[u8]) -> Result<(), DispatchError> {
			self.calls.fetch_add(1, Ordering::SeqCst);
			Err(DispatchError::Deserialize("unexpected end of input".into()))
		}
	}

	async fn setup(
		mode: DeliveryMode,
	) -> (InMemoryBroker, EntityNames, Arc<dyn SubscriptionReceiver>) {
		let broker = InMemoryBroker::new();
		let names = EntityNames::for_type_name("Widget").unwrap();
		broker.ensure_topic(&names.topic).await.unwrap();
		broker
			.ensure_subscription(&names.topic, &names.subscription)
			.await
			.unwrap();
		let receiver = broker
			.open_subscriber(&names.topic, &names.subscription, mode)
			.await
			.unwrap();
		(broker, names, receiver)
	}

	async fn send(broker: &InMemoryBroker, names: &EntityNames) {
		let mut sender = broker.open_publisher(&names.topic).await.unwrap();
		sender.send(Bytes::from_static(b"body")).await.unwrap();
		sender.close().await.unwrap();
	}

	async fn wait_for(calls: &AtomicU32, expected: u32) {
		time::timeout(Duration::from_secs(5), async {
			while calls.load(Ordering::SeqCst) < expected {
				time::sleep(Duration::from_millis(5)).await;
			}
		})
		.await
		.expect("handler was not called in time");
	}

	#[test]
	fn retry_delay_doubles_and_caps() {
		assert_eq!(retry_delay(1), Duration::from_millis(100));
		assert_eq!(retry_delay(2), Duration::from_millis(200));
		assert_eq!(retry_delay(4), Duration::from_millis(800));
		assert_eq!(retry_delay(20), MAX_RETRY_DELAY);
	}

	#[tokio::test]
	async fn shutdown_stops_an_idle_loop() {
		let (_broker, names, receiver) = setup(DeliveryMode::AutoDelete).await;
		let controller = SubscriptionLoop::spawn(
			&names,
			DeliveryMode::AutoDelete,
			receiver,
			Box::new(Recorder {
				calls: Arc::new(AtomicU32::new(0)),
				fail: false,
			}),
			ErrorObservers::new(),
		);

		let exit = time::timeout(Duration::from_secs(1), controller.shutdown())
			.await
			.expect("shutdown must not wait for the long poll")
			.unwrap();
		assert_eq!(exit, LoopExit::Shutdown);
	}

	#[tokio::test]
	async fn closing_the_handle_ends_the_loop() {
		let (_broker, names, receiver) = setup(DeliveryMode::AutoDelete).await;
		let controller = SubscriptionLoop::spawn(
			&names,
			DeliveryMode::AutoDelete,
			Arc::clone(&receiver),
			Box::new(Recorder {
				calls: Arc::new(AtomicU32::new(0)),
				fail: false,
			}),
			ErrorObservers::new(),
		);
		receiver.close().await.unwrap();

		let exit = time::timeout(Duration::from_secs(1), controller.join_handle)
			.await
			.unwrap()
			.unwrap();
		assert_eq!(exit, LoopExit::HandleClosed);
	}

	#[tokio::test]
	async fn peek_lock_success_completes_before_next_receive() {
		let (broker, names, receiver) = setup(DeliveryMode::PeekLock).await;
		let calls = Arc::new(AtomicU32::new(0));
		let controller = SubscriptionLoop::spawn(
			&names,
			DeliveryMode::PeekLock,
			receiver,
			Box::new(Recorder {
				calls: Arc::clone(&calls),
				fail: false,
			}),
			ErrorObservers::new(),
		);

		send(&broker, &names).await;
		wait_for(&calls, 1).await;
		controller.shutdown().await.unwrap();

		assert_eq!(calls.load(Ordering::SeqCst), 1);
		assert_eq!(broker.locked_count(&names.topic, &names.subscription), Some(0));
		assert_eq!(broker.pending_count(&names.topic, &names.subscription), Some(0));
	}

	#[tokio::test]
	async fn peek_lock_failure_abandons_for_redelivery() {
		let (broker, names, receiver) = setup(DeliveryMode::PeekLock).await;
		let calls = Arc::new(AtomicU32::new(0));
		let controller = SubscriptionLoop::spawn(
			&names,
			DeliveryMode::PeekLock,
			receiver,
			Box::new(Recorder {
				calls: Arc::clone(&calls),
				fail: true,
			}),
			ErrorObservers::new(),
		);

		send(&broker, &names).await;
		wait_for(&calls, 3).await;
		controller.shutdown().await.unwrap();
	}

	#[tokio::test]
	async fn undecodable_peek_lock_message_stays_locked() {
		let (broker, names, receiver) = setup(DeliveryMode::PeekLock).await;
		let calls = Arc::new(AtomicU32::new(0));
		let reported = Arc::new(Mutex::new(Vec::new()));
		let observers = ErrorObservers::new();
		{
			let reported = Arc::clone(&reported);
			observers.subscribe(move |err| reported.lock().push(err.clone()));
		}
		let controller = SubscriptionLoop::spawn(
			&names,
			DeliveryMode::PeekLock,
			receiver,
			Box::new(Garbled {
				calls: Arc::clone(&calls),
			}),
			observers,
		);

		send(&broker, &names).await;
		wait_for(&calls, 1).await;
		time::sleep(Duration::from_millis(200)).await;
		controller.shutdown().await.unwrap();

		assert_eq!(calls.load(Ordering::SeqCst), 1);
		assert_eq!(broker.locked_count(&names.topic, &names.subscription), Some(1));
		assert_eq!(broker.pending_count(&names.topic, &names.subscription), Some(0));
		let reported = reported.lock();
		assert_eq!(reported.len(), 1);
		assert!(matches!(reported[0], SubscriptionError::Deserialize { .. }));
	}

	#[tokio::test(start_paused = true)]
	async fn receive_failure_is_reported_once_then_loop_continues() {
		let (broker, names, receiver) = setup(DeliveryMode::AutoDelete).await;
		let calls = Arc::new(AtomicU32::new(0));
		let reported = Arc::new(Mutex::new(Vec::new()));
		let observers = ErrorObservers::new();
		{
			let reported = Arc::clone(&reported);
			observers.subscribe(move |err| reported.lock().push(err.clone()));
		}
		broker
			.fail_next_receives(&names.topic, &names.subscription, 1)
			.unwrap();

		let controller = SubscriptionLoop::spawn(
			&names,
			DeliveryMode::AutoDelete,
			receiver,
			Box::new(Recorder {
				calls: Arc::clone(&calls),
				fail: false,
			}),
			observers,
		);
		send(&broker, &names).await;
		wait_for(&calls, 1).await;
		controller.shutdown().await.unwrap();

		let reported = reported.lock();
		assert_eq!(reported.len(), 1);
		assert!(matches!(reported[0], SubscriptionError::Receive { .. }));
	}
}
