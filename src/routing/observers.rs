use std::{
	fmt,
	panic::{AssertUnwindSafe, catch_unwind},
	sync::{
		Arc,
		atomic::{AtomicU64, Ordering},
	},
};

use parking_lot::RwLock;
use tracing::{error, trace};

use super::SubscriptionError;

type Observer = Arc<dyn Fn(&SubscriptionError) + Send + Sync>;

/// Handle returned when an observer is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Ordered list of callbacks that receive loop-level errors.
///
/// Clones share the same list, so the facade and all of its loops see
/// registrations made at any time.
#[derive(Clone, Default)]
pub struct ErrorObservers {
	inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
	next_id: AtomicU64,
	observers: RwLock<Vec<(ObserverId, Observer)>>,
}

impl ErrorObservers {
	/// Empty list.
	pub fn new() -> Self {
		Self::default()
	}

	/// Append an observer. It will be called after every observer
	/// registered before it.
	pub fn subscribe<F>(&self, observer: F) -> ObserverId
	where F: Fn(&SubscriptionError) + Send + Sync + 'static {
		let id = ObserverId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
		self.inner.observers.write().push((id, Arc::new(observer)));
		id
	}

	/// Remove an observer. Returns `false` if it was not registered.
	pub fn unsubscribe(&self, id: ObserverId) -> bool {
		let mut observers = self.inner.observers.write();
		let before = observers.len();
		observers.retain(|(existing, _)| *existing != id);
		observers.len() != before
	}

	pub(crate) fn len(&self) -> usize {
		self.inner.observers.read().len()
	}

	/// Call every observer with `err`, returning how many were called.
	///
	/// Runs on a snapshot so observers may register or remove observers.
	/// A panicking observer is logged and skipped.
	pub fn notify(&self, err: &SubscriptionError) -> usize {
		let snapshot: Vec<(ObserverId, Observer)> =
			self.inner.observers.read().clone();
		if snapshot.is_empty() {
			trace!(error = %err, "No error observers registered");
		}
		for (id, observer) in &snapshot {
			if catch_unwind(AssertUnwindSafe(|| observer(err))).is_err() {
				error!(observer = ?id, error = %err, "Error observer panicked");
			}
		}
		snapshot.len()
	}
}

impl fmt::Debug for ErrorObservers {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ErrorObservers")
			.field("len", &self.len())
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use parking_lot::Mutex;

	use super::*;
	use crate::broker::BrokerError;

	fn receive_error() -> SubscriptionError {
		SubscriptionError::Receive {
			topic: arcstr::literal!("Topic_A"),
			subscription: arcstr::literal!("Subscription_A"),
			source: BrokerError::Transient("flaky".into()),
		}
	}

	#[test]
	fn every_observer_is_called_in_order() {
		let observers = ErrorObservers::new();
		let calls = Arc::new(Mutex::new(Vec::new()));
		for name in ["first", "second"] {
			let calls = Arc::clone(&calls);
			observers.subscribe(move |_| calls.lock().push(name));
		}

		assert_eq!(observers.notify(&receive_error()), 2);
		assert_eq!(*calls.lock(), vec!["first", "second"]);
	}

	#[test]
	fn unsubscribe_removes_only_that_observer() {
		let observers = ErrorObservers::new();
		let first = observers.subscribe(|_| {});
		let _second = observers.subscribe(|_| {});

		assert!(observers.unsubscribe(first));
		assert!(!observers.unsubscribe(first));
		assert_eq!(observers.len(), 1);
	}

	#[test]
	fn clones_share_registrations() {
		let observers = ErrorObservers::new();
		let clone = observers.clone();
		observers.subscribe(|_| {});
		assert_eq!(clone.len(), 1);
	}

	#[test]
	fn panicking_observer_does_not_stop_the_rest() {
		let observers = ErrorObservers::new();
		let reached = Arc::new(Mutex::new(false));
		observers.subscribe(|_| panic!("observer bug"));
		{
			let reached = Arc::clone(&reached);
			observers.subscribe(move |_| *reached.lock() = true);
		}

		observers.notify(&receive_error());
		assert!(*reached.lock());
	}

	#[test]
	fn observer_may_register_during_notify() {
		let observers = ErrorObservers::new();
		let nested = observers.clone();
		observers.subscribe(move |_| {
			nested.subscribe(|_| {});
		});

		assert_eq!(observers.notify(&receive_error()), 1);
		assert_eq!(observers.len(), 2);
	}
}
