use std::{fmt, sync::Arc};

use async_trait::async_trait;

use super::{BrokerAdmin, BrokerError, ClientFactory};
use crate::config::ConnectionConfig;

/// One live session with a broker.
///
/// Every publisher and subscriber a facade opens is derived from the same
/// connection.
#[derive(Clone)]
pub struct BrokerConnection {
	/// Provisioning API
	pub admin: Arc<dyn BrokerAdmin>,
	/// Handle factory
	pub factory: Arc<dyn ClientFactory>,
}

impl BrokerConnection {
	/// Bundle an admin API and a factory.
	pub fn new(
		admin: Arc<dyn BrokerAdmin>,
		factory: Arc<dyn ClientFactory>,
	) -> Self {
		Self { admin, factory }
	}
}

impl fmt::Debug for BrokerConnection {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("BrokerConnection").finish_non_exhaustive()
	}
}

/// Opens a [`BrokerConnection`] from connection settings.
///
/// The facade calls this at most once, on first use.
#[async_trait]
pub trait Connector: Send + Sync {
	/// Establish the session.
	async fn connect(
		&self,
		config: &ConnectionConfig,
	) -> Result<BrokerConnection, BrokerError>;
}
