use thiserror::Error;

/// Failures reported by a broker backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
	/// Topic or subscription does not exist
	#[error("entity '{0}' not found")]
	EntityNotFound(String),
	/// The handle (or its connection) has been closed
	#[error("handle closed")]
	Closed,
	/// The lock expired or was never handed out
	#[error("message lock {0} lost")]
	LockLost(u64),
	/// Temporary broker-side failure; retrying may succeed
	#[error("transient broker failure: {0}")]
	Transient(String),
	/// Broker refused the request (credentials, quota, bad name)
	#[error("request rejected: {0}")]
	Rejected(String),
	/// Low-level transport failure
	#[error("transport error: {0}")]
	Transport(String),
}

impl BrokerError {
	/// True when the handle can never succeed again.
	///
	/// The subscription loop stops on this instead of re-arming.
	pub fn is_closed(&self) -> bool {
		matches!(self, BrokerError::Closed)
	}

	/// True for `EntityNotFound`.
	pub fn is_not_found(&self) -> bool {
		matches!(self, BrokerError::EntityNotFound(_))
	}
}
