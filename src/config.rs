//! Connection configuration captured once when a facade is set up.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::client::PubSubError;

/// Environment variable holding the broker namespace.
pub const NAMESPACE_ENV: &str = "PUBSUB_NAMESPACE";
/// Environment variable holding the credential issuer.
pub const ISSUER_ENV: &str = "PUBSUB_ISSUER";
/// Environment variable holding the issuer secret.
pub const ISSUER_SECRET_ENV: &str = "PUBSUB_ISSUER_SECRET";

/// Broker identity and credential.
///
/// Immutable once handed to [`PubSub::setup`](crate::PubSub::setup). Nothing
/// here opens a connection; the connector reads it lazily on first use.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
	/// Namespace (or host) that identifies the broker instance
	pub namespace: String,
	/// Name of the credential issuer
	pub issuer: String,
	/// Shared secret for the issuer
	pub issuer_secret: String,
}

impl ConnectionConfig {
	/// Create a config from its three parts.
	///
	/// # Example
	/// ```rust
	/// use typed_pubsub::ConnectionConfig;
	///
	/// let config = ConnectionConfig::new("orders-ns", "owner", "s3cret");
	/// assert_eq!(config.namespace, "orders-ns");
	/// ```
	pub fn new(
		namespace: impl Into<String>,
		issuer: impl Into<String>,
		issuer_secret: impl Into<String>,
	) -> Self {
		Self {
			namespace: namespace.into(),
			issuer: issuer.into(),
			issuer_secret: issuer_secret.into(),
		}
	}

	/// Read the config from `PUBSUB_NAMESPACE`, `PUBSUB_ISSUER` and
	/// `PUBSUB_ISSUER_SECRET`.
	///
	/// The namespace is mandatory; issuer and secret default to empty, which
	/// anonymous brokers accept.
	pub fn from_env() -> Result<Self, PubSubError> {
		Self::from_lookup(|key| std::env::var(key).ok())
	}

	/// Same as [`from_env`](Self::from_env) but with an injectable lookup.
	pub fn from_lookup<L>(lookup: L) -> Result<Self, PubSubError>
	where L: Fn(&str) -> Option<String> {
		let namespace = lookup(NAMESPACE_ENV)
			.filter(|value| !value.trim().is_empty())
			.ok_or_else(|| {
				PubSubError::Configuration(format!("{NAMESPACE_ENV} is not set"))
			})?;
		Ok(Self {
			namespace,
			issuer: lookup(ISSUER_ENV).unwrap_or_default(),
			issuer_secret: lookup(ISSUER_SECRET_ENV).unwrap_or_default(),
		})
	}
}

impl fmt::Debug for ConnectionConfig {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ConnectionConfig")
			.field("namespace", &self.namespace)
			.field("issuer", &self.issuer)
			.field("issuer_secret", &"<redacted>")
			.finish()
	}
}
