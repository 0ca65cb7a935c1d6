//! Receive-dispatch-settle machinery
//!
//! Every subscribed message type gets one [`SubscriptionLoop`] running on its
//! own tokio task. The loop owns a receiver handle, hands each delivery to a
//! [`Dispatch`] implementation, settles peek-locked messages, and reports
//! loop-level failures to the [`ErrorObservers`] attached to the facade.

/// Typed dispatch of raw deliveries to user handlers
pub mod dispatch;
/// Loop-level error type
pub mod error;
/// Error observer list
pub mod observers;
pub mod subscription_loop;

pub use dispatch::{BoxError, Dispatch, DispatchError, HandlerOutcome, TypedDispatcher};
pub use error::SubscriptionError;
pub use observers::{ErrorObservers, ObserverId};
pub use subscription_loop::{
	LoopController, LoopExit, RECEIVE_WAIT, SETTLE_TIMEOUT, SubscriptionLoop,
};
