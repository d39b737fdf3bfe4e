// Architecture modules
pub mod amqp;
pub mod api;
pub mod broker;
pub mod config;
pub mod network;
pub mod proto;
pub mod relay;
pub mod resp;
pub mod sequencer;
pub mod service;
pub mod storage;
pub mod types;

// Public exports
pub use api::{ApiServer, PROTOCOL_VERSION};
pub use broker::{BrokerActor, BrokerError, BrokerEvent, BrokerHandle};
pub use config::Config;
pub use network::{Backend, InMemoryBackend};
pub use relay::Relay;
pub use sequencer::{RelayError, Sequencer};
pub use storage::{SqliteStore, StoreError};
pub use types::{ConnectionState, DeliveryTag, Rpc, Sequence, StagedMessage};
