use std::{
	any::Any,
	marker::PhantomData,
	panic::{AssertUnwindSafe, catch_unwind},
};

use thiserror::Error;

use crate::message_serializer::MessageSerializer;

/// Boxed error a handler may return.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// What a message handler may return.
///
/// Implemented for `()` (always succeeds) and for `Result<(), E>`, so both
/// `|msg| println!(..)` and `|msg| -> anyhow-like Result` closures work.
pub trait HandlerOutcome {
	/// Collapse into success or a boxed error.
	fn into_result(self) -> Result<(), BoxError>;
}

impl HandlerOutcome for () {
	fn into_result(self) -> Result<(), BoxError> {
		Ok(())
	}
}

impl<E> HandlerOutcome for Result<(), E>
where E: Into<BoxError>
{
	fn into_result(self) -> Result<(), BoxError> {
		self.map_err(Into::into)
	}
}

/// Why a delivery could not be handled.
#[derive(Debug, Error)]
pub enum DispatchError {
	/// Body did not decode into the subscribed type
	#[error("deserialization failed: {0}")]
	Deserialize(String),
	/// Handler returned an error or panicked
	#[error("handler failed: {0}")]
	Handler(String),
}

/// Runs a raw delivery body through deserialization and the user handler.
///
/// Called synchronously on the subscription loop task.
pub trait Dispatch: Send + Sync + 'static {
	/// Handle one body.
	fn dispatch(&self, body: &[u8]) -> Result<(), DispatchError>;
}

/// [`Dispatch`] for a message type `T`, a serializer and a handler closure.
pub struct TypedDispatcher<T, F, H> {
	serializer: F,
	handler: H,
	_phantom: PhantomData<fn() -> T>,
}

impl<T, F, H> TypedDispatcher<T, F, H> {
	/// Bind a handler to a serializer.
	pub fn new(serializer: F, handler: H) -> Self {
		Self {
			serializer,
			handler,
			_phantom: PhantomData,
		}
	}
}

impl<T, F, H, R> Dispatch for TypedDispatcher<T, F, H>
where
	T: 'static,
	F: MessageSerializer<T>,
	H: Fn(T) -> R + Send + Sync + 'static,
	R: HandlerOutcome,
{
	fn dispatch(&self, body: &[u8]) -> Result<(), DispatchError> {
		let message = self
			.serializer
			.deserialize(body)
			.map_err(|e| DispatchError::Deserialize(format!("{e:?}")))?;
		match catch_unwind(AssertUnwindSafe(|| (self.handler)(message).into_result()))
		{
			| Ok(Ok(())) => Ok(()),
			| Ok(Err(err)) => Err(DispatchError::Handler(err.to_string())),
			| Err(panic) => Err(DispatchError::Handler(panic_message(panic))),
		}
	}
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
	if let Some(message) = panic.downcast_ref::<&str>() {
		format!("handler panicked: {message}")
	} else if let Some(message) = panic.downcast_ref::<String>() {
		format!("handler panicked: {message}")
	} else {
		"handler panicked".to_string()
	}
}

#[cfg(test)]
mod tests {
	use std::sync::{
		Arc,
		atomic::{AtomicU32, Ordering},
	};

	use super::*;
	use crate::message_serializer::BincodeSerializer;

	fn encode(value: &u32) -> Vec<u8> {
		MessageSerializer::<u32>::serialize(&BincodeSerializer::new(), value)
			.unwrap()
	}

	#[test]
	fn unit_handler_always_succeeds() {
		let seen = Arc::new(AtomicU32::new(0));
		let dispatcher = {
			let seen = Arc::clone(&seen);
			TypedDispatcher::new(BincodeSerializer::new(), move |value: u32| {
				seen.store(value, Ordering::SeqCst);
			})
		};

		dispatcher.dispatch(&encode(&7)).unwrap();
		assert_eq!(seen.load(Ordering::SeqCst), 7);
	}

	#[test]
	fn handler_error_is_reported() {
		let dispatcher = TypedDispatcher::new(
			BincodeSerializer::new(),
			|value: u32| -> Result<(), String> { Err(format!("rejected {value}")) },
		);

		let err = dispatcher.dispatch(&encode(&3)).unwrap_err();
		assert!(matches!(err, DispatchError::Handler(reason) if reason == "rejected 3"));
	}

	#[test]
	fn handler_panic_is_contained() {
		let dispatcher =
			TypedDispatcher::new(BincodeSerializer::new(), |_: u32| -> () {
				panic!("boom");
			});

		let err = dispatcher.dispatch(&encode(&1)).unwrap_err();
		assert!(matches!(err, DispatchError::Handler(reason) if reason.contains("boom")));
	}

	#[test]
	fn undecodable_body_never_reaches_handler() {
		let called = Arc::new(AtomicU32::new(0));
		let dispatcher = {
			let called = Arc::clone(&called);
			TypedDispatcher::new(BincodeSerializer::new(), move |_: String| {
				called.fetch_add(1, Ordering::SeqCst);
			})
		};

		// Length prefix promising far more bytes than present.
		let err = dispatcher.dispatch(&[0xFB, 0xFF, 0xFF]).unwrap_err();
		assert!(matches!(err, DispatchError::Deserialize(_)));
		assert_eq!(called.load(Ordering::SeqCst), 0);
	}
}
