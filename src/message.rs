//! Message type identity and the broker entity names derived from it.

use arcstr::ArcStr;

use crate::client::PubSubError;

/// Prefix of every topic created by the facade.
pub const TOPIC_PREFIX: &str = "Topic_";
/// Prefix of every subscription created by the facade.
pub const SUBSCRIPTION_PREFIX: &str = "Subscription_";
/// Longest entity name a broker is expected to accept.
pub const MAX_ENTITY_NAME_LEN: usize = 260;

/// A type that can travel over the bus.
///
/// `TYPE_NAME` decides which topic and subscription the type maps to, so it
/// must stay stable across releases: consumers reconnect to their backlog by
/// name. Two distinct types with the same `TYPE_NAME` share a topic.
///
/// Usually derived:
///
/// ```rust
/// use typed_pubsub::BusMessage;
///
/// #[derive(BusMessage)]
/// struct OrderPlaced {
///     id: u64,
/// }
///
/// #[derive(BusMessage)]
/// #[bus_message(name = "LegacyOrderPlaced")]
/// struct OrderPlacedV1 {
///     id: u64,
/// }
///
/// assert_eq!(OrderPlaced::TYPE_NAME, "OrderPlaced");
/// assert_eq!(OrderPlacedV1::TYPE_NAME, "LegacyOrderPlaced");
/// ```
pub trait BusMessage {
	/// Stable, broker-visible name of the type
	const TYPE_NAME: &'static str;
}

/// Topic and subscription names for one message type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityNames {
	/// `Topic_<TypeName>`
	pub topic: ArcStr,
	/// `Subscription_<TypeName>`
	pub subscription: ArcStr,
}

impl EntityNames {
	/// Names for `T`, validated.
	pub fn of<T: BusMessage>() -> Result<Self, PubSubError> {
		Self::for_type_name(T::TYPE_NAME)
	}

	/// Names for an arbitrary type name, validated.
	pub fn for_type_name(type_name: &str) -> Result<Self, PubSubError> {
		validate_type_name(type_name)?;
		Ok(Self {
			topic: arcstr::format!("{TOPIC_PREFIX}{type_name}"),
			subscription: arcstr::format!("{SUBSCRIPTION_PREFIX}{type_name}"),
		})
	}
}

fn validate_type_name(type_name: &str) -> Result<(), PubSubError> {
	if type_name.is_empty() {
		return Err(PubSubError::invalid_name(type_name, "type name is empty"));
	}
	if let Some(bad) = type_name
		.chars()
		.find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_')))
	{
		return Err(PubSubError::invalid_name(
			type_name,
			format!("character {bad:?} is not allowed in entity names"),
		));
	}
	// The subscription prefix is the longer of the two.
	if SUBSCRIPTION_PREFIX.len() + type_name.len() > MAX_ENTITY_NAME_LEN {
		return Err(PubSubError::invalid_name(
			type_name,
			format!("entity name exceeds {MAX_ENTITY_NAME_LEN} characters"),
		));
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	struct SimpleMessage;

	impl BusMessage for SimpleMessage {
		const TYPE_NAME: &'static str = "SimpleMessage";
	}

	#[test]
	fn names_follow_prefix_contract() {
		let names = EntityNames::of::<SimpleMessage>().unwrap();
		assert_eq!(names.topic, "Topic_SimpleMessage");
		assert_eq!(names.subscription, "Subscription_SimpleMessage");
	}

	#[test]
	fn names_are_deterministic() {
		assert_eq!(
			EntityNames::for_type_name("Order").unwrap(),
			EntityNames::for_type_name("Order").unwrap()
		);
	}

	#[test]
	fn rejects_empty_and_illegal_names() {
		assert!(matches!(
			EntityNames::for_type_name(""),
			Err(PubSubError::InvalidEntityName { .. })
		));
		assert!(EntityNames::for_type_name("Order/Placed").is_err());
		assert!(EntityNames::for_type_name("Order Placed").is_err());
		assert!(EntityNames::for_type_name("Vec<u8>").is_err());
		assert!(EntityNames::for_type_name("orders.v2-final_x").is_ok());
	}

	#[test]
	fn rejects_overlong_names() {
		let limit = MAX_ENTITY_NAME_LEN - SUBSCRIPTION_PREFIX.len();
		assert!(EntityNames::for_type_name(&"a".repeat(limit)).is_ok());
		assert!(EntityNames::for_type_name(&"a".repeat(limit + 1)).is_err());
	}
}
