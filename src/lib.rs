//! # Typed Pub/Sub
//!
//! A typed publish/subscribe facade over a topic broker.
//!
//! Every message type gets its own topic and subscription, named after the
//! type. Subscribing provisions both and starts a background loop that
//! decodes each delivery and hands it to your handler; publishing encodes a
//! value and sends it to the matching topic.
//!
//! ## Features
//!
//! - **Type-derived naming**: `Topic_<TypeName>` / `Subscription_<TypeName>`
//! - **Two delivery modes**: auto-delete or peek-lock with complete/abandon
//! - **Error observers**: receive failures are surfaced, never fatal
//! - **Pluggable brokers**: in-memory reference backend, MQTT behind the
//!   `mqtt` feature
//! - **Pluggable serialization**: Bincode by default, JSON behind `json`
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use bincode::{Decode, Encode};
//! use typed_pubsub::{
//!     BusMessage, ConnectionConfig, DeliveryMode, InMemoryBroker, PubSub,
//! };
//!
//! #[derive(BusMessage, Encode, Decode, Debug)]
//! struct SensorData {
//!     temperature: f64,
//!     humidity: f64,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let bus: PubSub = PubSub::setup(
//!         ConnectionConfig::new("local", "owner", "secret"),
//!         InMemoryBroker::new(),
//!     );
//!
//!     bus.subscribe(
//!         |data: SensorData| println!("{:.1}°C", data.temperature),
//!         DeliveryMode::AutoDelete,
//!     )
//!     .await?;
//!
//!     bus.publish(&SensorData { temperature: 23.5, humidity: 45.0 })
//!         .await?;
//!
//!     bus.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Custom Serialization
//!
//! Implement the `MessageSerializer` trait for custom serialization:
//!
//! ```rust
//! use typed_pubsub::MessageSerializer;
//!
//! #[derive(Clone, Default)]
//! struct Utf8Serializer;
//!
//! impl MessageSerializer<String> for Utf8Serializer {
//!     type SerializeError = std::convert::Infallible;
//!     type DeserializeError = std::str::Utf8Error;
//!
//!     fn serialize(&self, data: &String) -> Result<Vec<u8>, Self::SerializeError> {
//!         Ok(data.as_bytes().to_vec())
//!     }
//!
//!     fn deserialize(&self, bytes: &[u8]) -> Result<String, Self::DeserializeError> {
//!         std::str::from_utf8(bytes).map(str::to_owned)
//!     }
//! }
//! ```

#![warn(missing_docs)]

// The derive expands to `::typed_pubsub::...` paths, which must also resolve
// inside this crate's own tests and doctests.
extern crate self as typed_pubsub;

pub mod broker;
pub mod client;
pub mod config;
pub mod message;
pub mod message_serializer;
pub mod routing;

// === Core Public API ===
pub use client::{PubSub, PubSubError};
pub use config::ConnectionConfig;
pub use message::{BusMessage, EntityNames};

// Message serialization
#[cfg(feature = "json")]
pub use message_serializer::JsonSerializer;
pub use message_serializer::{BincodeSerializer, MessageSerializer};

// Derive macro for `BusMessage`
#[cfg(feature = "macros")]
pub use typed_pubsub_macros::BusMessage;

// Broker backends and seams
pub use broker::{
	BrokerAdmin, BrokerConnection, BrokerError, ClientFactory, Connector,
	DeliveryMode, InMemoryBroker, SubscriptionReceiver, TopicSender,
};

// Handler and observer types
pub use routing::{HandlerOutcome, ObserverId, SubscriptionError};

/// Result type alias for operations that may fail with PubSubError
pub type Result<T> = std::result::Result<T, PubSubError>;

/// Prelude module for convenient imports
///
/// ```rust
/// use typed_pubsub::prelude::*;
/// ```
pub mod prelude {
	//! Essential types for most applications

	pub use crate::{
		BincodeSerializer, BusMessage, ConnectionConfig, DeliveryMode,
		InMemoryBroker, MessageSerializer, PubSub, PubSubError, Result,
	};
}

/// Error types used throughout the library
///
/// ```rust
/// use typed_pubsub::errors::*;
/// ```
pub mod errors {
	//! All error types used in the library

	pub use crate::{BrokerError, PubSubError, SubscriptionError};
	pub use crate::routing::DispatchError;
}
