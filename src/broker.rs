//! Broker seams
//!
//! The facade never talks to a broker directly. It goes through the traits in
//! this module: [`BrokerAdmin`] provisions topics and subscriptions,
//! [`ClientFactory`] hands out send and receive handles, and a [`Connector`]
//! turns a [`ConnectionConfig`](crate::ConnectionConfig) into both.
//!
//! [`memory::InMemoryBroker`] is the reference backend. The `mqtt` feature
//! adds a backend on top of `rumqttc`.

/// Topic and subscription provisioning
pub mod admin;
/// Lazy connection establishment
pub mod connector;
/// Broker error type
pub mod error;
/// Publisher and subscriber handles
pub mod factory;
pub mod memory;
#[cfg(feature = "mqtt")]
pub mod mqtt;

pub use admin::BrokerAdmin;
pub use connector::{BrokerConnection, Connector};
pub use error::BrokerError;
pub use factory::{
	ClientFactory, Delivery, DeliveryMode, LockToken, SubscriptionReceiver,
	TopicSender,
};
pub use memory::InMemoryBroker;
