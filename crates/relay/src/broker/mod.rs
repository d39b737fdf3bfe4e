//! Broker connection actor
//!
//! One task owns the TCP connection to the broker. Callers talk to it
//! through a cloneable [`BrokerHandle`]; acknowledgments and connection
//! loss come back as [`BrokerEvent`]s on a separate queue.

pub mod actor;
pub mod connection;

pub use actor::{BrokerActor, BrokerHandle};
pub use connection::Connection;

use crate::types::{DeliveryTag, Epoch, NameTooLong};
use thiserror::Error;

/// Channel carrying basic.publish traffic, in confirm mode
pub const MESSAGE_CHANNEL: u16 = 1;
/// Channel carrying synchronous control methods
pub const METHOD_CHANNEL: u16 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("could not connect to broker: {0}")]
    Connect(String),
    #[error("login rejected: {0}")]
    Auth(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("rpc failed: {code} {text}")]
    Rpc { code: u16, text: String },
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("broker actor is not running")]
    Closed,
    /// Refused before anything was written; the connection is unaffected
    #[error("invalid request: {0}")]
    Invalid(String),
}

impl From<NameTooLong> for BrokerError {
    fn from(e: NameTooLong) -> Self {
        BrokerError::Invalid(e.to_string())
    }
}

impl BrokerError {
    /// Whether reconnecting may cure the error
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BrokerError::Connect(_) | BrokerError::ConnectionLost(_) | BrokerError::Timeout(_)
        )
    }
}

/// Asynchronous notifications from the actor to its owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    /// Delivery tags the broker confirmed on connection `epoch`, in
    /// arrival order
    Acked { epoch: Epoch, tags: Vec<DeliveryTag> },
    /// The connection dropped; everything unconfirmed must be replayed
    ConnectionLost,
    /// The broker sent something this client cannot continue after
    Fatal(BrokerError),
}
