use bytes::Bytes;
use std::fmt;
use thiserror::Error;

/// Staging key of a message. Strictly increasing, never reused.
pub type Sequence = u64;

/// Broker-assigned number of one publish on the message channel.
pub type DeliveryTag = u64;

/// Number of a broker connection, bumped on every successful connect.
/// Delivery tags are only meaningful together with their epoch.
pub type Epoch = u64;

/// Longest exchange name or routing key the wire format can carry
pub const MAX_NAME_LEN: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field} is {len} bytes long, at most {MAX_NAME_LEN} are allowed")]
pub struct NameTooLong {
    pub field: &'static str,
    pub len: usize,
}

/// Reject names that would not fit an AMQP short string
pub fn check_name(field: &'static str, name: &str) -> Result<(), NameTooLong> {
    if name.len() > MAX_NAME_LEN {
        return Err(NameTooLong {
            field,
            len: name.len(),
        });
    }
    Ok(())
}

/// A message held in the staging store until the broker confirms it
///
/// Created once at publish time and never mutated afterwards; the record is
/// only ever deleted, either when its ack is correlated or when a replay
/// policy gives up on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedMessage {
    pub sequence: Sequence,
    pub exchange: String,
    pub routing_key: String,
    pub payload: Bytes,
}

/// Synchronous control operations issued on the method channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rpc {
    ExchangeDeclare { exchange: String, kind: String },
    ExchangeDelete { exchange: String },
}

impl Rpc {
    /// Build an rpc request from its action name and positional arguments
    /// (`exchange.declare <name> <type>`, `exchange.delete <name>`).
    pub fn parse(action: &str, args: &[&str]) -> Result<Self, RpcParseError> {
        let rpc = match (action, args) {
            ("exchange.declare", [exchange, kind]) => Ok(Rpc::ExchangeDeclare {
                exchange: exchange.to_string(),
                kind: kind.to_string(),
            }),
            ("exchange.declare", _) => Err(RpcParseError::WrongArity {
                action: "exchange.declare",
                expected: 2,
            }),
            ("exchange.delete", [exchange]) => Ok(Rpc::ExchangeDelete {
                exchange: exchange.to_string(),
            }),
            ("exchange.delete", _) => Err(RpcParseError::WrongArity {
                action: "exchange.delete",
                expected: 1,
            }),
            (other, _) => Err(RpcParseError::UnknownAction(other.to_string())),
        }?;
        rpc.check()?;
        Ok(rpc)
    }

    /// Check that every name fits on the wire
    pub fn check(&self) -> Result<(), NameTooLong> {
        match self {
            Rpc::ExchangeDeclare { exchange, kind } => {
                check_name("exchange", exchange)?;
                check_name("exchange type", kind)
            }
            Rpc::ExchangeDelete { exchange } => check_name("exchange", exchange),
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            Rpc::ExchangeDeclare { .. } => "exchange.declare",
            Rpc::ExchangeDelete { .. } => "exchange.delete",
        }
    }
}

impl fmt::Display for Rpc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rpc::ExchangeDeclare { exchange, kind } => {
                write!(f, "exchange.declare {} ({})", exchange, kind)
            }
            Rpc::ExchangeDelete { exchange } => write!(f, "exchange.delete {}", exchange),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcParseError {
    #[error("unknown rpc action '{0}'")]
    UnknownAction(String),
    #[error("'{action}' takes {expected} argument(s)")]
    WrongArity { action: &'static str, expected: usize },
    #[error(transparent)]
    Name(#[from] NameTooLong),
}

/// Lifecycle of the broker connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    ChannelsOpen,
    ConfirmMode,
    Running,
    Closing,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::ChannelsOpen => "channels-open",
            ConnectionState::ConfirmMode => "confirm-mode",
            ConnectionState::Running => "running",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_parse_declare() {
        let rpc = Rpc::parse("exchange.declare", &["x-test", "direct"]).unwrap();
        assert_eq!(
            rpc,
            Rpc::ExchangeDeclare {
                exchange: "x-test".to_string(),
                kind: "direct".to_string()
            }
        );
        assert_eq!(rpc.action(), "exchange.declare");
    }

    #[test]
    fn test_rpc_parse_delete() {
        let rpc = Rpc::parse("exchange.delete", &["x-test"]).unwrap();
        assert_eq!(
            rpc,
            Rpc::ExchangeDelete {
                exchange: "x-test".to_string()
            }
        );
    }

    #[test]
    fn test_rpc_parse_rejects_bad_input() {
        assert_eq!(
            Rpc::parse("exchange.delete", &[]),
            Err(RpcParseError::WrongArity {
                action: "exchange.delete",
                expected: 1
            })
        );
        assert!(matches!(
            Rpc::parse("queue.purge", &["q"]),
            Err(RpcParseError::UnknownAction(_))
        ));
    }

    #[test]
    fn test_rpc_parse_error_messages() {
        let err = Rpc::parse("exchange.declare", &["x"]).unwrap_err();
        assert_eq!(err.to_string(), "'exchange.declare' takes 2 argument(s)");
        let err = Rpc::parse("queue.purge", &[]).unwrap_err();
        assert_eq!(err.to_string(), "unknown rpc action 'queue.purge'");
    }

    #[test]
    fn test_rpc_parse_rejects_long_exchange_name() {
        let name = "x".repeat(MAX_NAME_LEN + 1);
        assert_eq!(
            Rpc::parse("exchange.delete", &[name.as_str()]),
            Err(RpcParseError::Name(NameTooLong {
                field: "exchange",
                len: 256
            }))
        );
        let fits = "x".repeat(MAX_NAME_LEN);
        assert!(Rpc::parse("exchange.delete", &[fits.as_str()]).is_ok());
    }

    #[test]
    fn test_check_name_counts_bytes() {
        // 128 two-byte characters
        let name = "é".repeat(128);
        assert_eq!(
            check_name("routing key", &name),
            Err(NameTooLong {
                field: "routing key",
                len: 256
            })
        );
    }
}
