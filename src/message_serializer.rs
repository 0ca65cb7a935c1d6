//! Message serialization traits and implementations.

use std::fmt::Debug;

use bincode::{Decode, Encode};

/// Trait for turning typed messages into broker payloads and back.
///
/// Implement this trait to use custom serialization formats.
pub trait MessageSerializer<T>:
	Default + Clone + Send + Sync + 'static
{
	/// Error type for serialization failures
	type SerializeError: Debug + Send + Sync + 'static;
	/// Error type for deserialization failures
	type DeserializeError: Debug + Send + Sync + 'static;

	/// Convert a message to the bytes sent to the topic
	fn serialize(&self, data: &T) -> Result<Vec<u8>, Self::SerializeError>;
	/// Convert a delivered body back into a message
	fn deserialize(&self, bytes: &[u8]) -> Result<T, Self::DeserializeError>;
}

/// Default serializer using bincode format.
///
/// Requires types to implement `bincode::Encode` and `bincode::Decode`.
#[derive(Clone, Default)]
pub struct BincodeSerializer {
	config: bincode::config::Configuration,
}

impl BincodeSerializer {
	/// Creates a new serializer with default configuration.
	pub fn new() -> Self {
		Self::default()
	}

	/// Creates a serializer with custom bincode configuration.
	pub fn with_config(config: bincode::config::Configuration) -> Self {
		Self { config }
	}
}

impl<T> MessageSerializer<T> for BincodeSerializer
where T: Encode + Decode<()> + 'static
{
	type SerializeError = bincode::error::EncodeError;
	type DeserializeError = bincode::error::DecodeError;

	fn serialize(&self, data: &T) -> Result<Vec<u8>, Self::SerializeError> {
		bincode::encode_to_vec(data, self.config)
	}

	fn deserialize(&self, bytes: &[u8]) -> Result<T, Self::DeserializeError> {
		bincode::decode_from_slice(bytes, self.config).map(|(value, _)| value)
	}
}

/// JSON serializer for serde types.
///
/// Handy when other, non-Rust consumers read the same topics.
#[cfg(feature = "json")]
#[derive(Clone, Default)]
pub struct JsonSerializer;

#[cfg(feature = "json")]
impl<T> MessageSerializer<T> for JsonSerializer
where T: serde::Serialize + serde::de::DeserializeOwned + 'static
{
	type SerializeError = serde_json::Error;
	type DeserializeError = serde_json::Error;

	fn serialize(&self, data: &T) -> Result<Vec<u8>, Self::SerializeError> {
		serde_json::to_vec(data)
	}

	fn deserialize(&self, bytes: &[u8]) -> Result<T, Self::DeserializeError> {
		serde_json::from_slice(bytes)
	}
}
