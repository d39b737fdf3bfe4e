use crate::broker::BrokerError;
use crate::network::Backend;
use crate::proto::encode_message;
use crate::storage::{Direction, Lookup, SqliteStore, StoreError};
use crate::types::{DeliveryTag, Epoch, NameTooLong, Rpc, Sequence, StagedMessage, check_name};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),
    /// Refused before staging
    #[error("invalid message: {0}")]
    Invalid(#[from] NameTooLong),
    /// Staged durably but not handed to the broker; it will be replayed
    #[error("message {sequence} staged but not sent: {source}")]
    Unsent {
        sequence: Sequence,
        source: BrokerError,
    },
}

struct SequencerState {
    next_sequence: Sequence,
    /// Connection the correlation table belongs to, None while down
    epoch: Option<Epoch>,
    /// Correlation table for the current connection only
    in_flight: HashMap<DeliveryTag, Sequence>,
    /// Replays per record since this process started
    replays: HashMap<Sequence, u32>,
    /// False between a connection loss and the end of the next replay
    connected: bool,
}

/// Stages messages, hands them to the broker and retires them on ack
///
/// One lock serialises staging, retirement and replay, so sequences come
/// out gap-free and a replay never interleaves with a fresh publish.
pub struct Sequencer<B: Backend> {
    store: Arc<SqliteStore>,
    backend: Arc<B>,
    max_replays: Option<u32>,
    state: Mutex<SequencerState>,
}

impl<B: Backend> Sequencer<B> {
    /// Continue numbering after the highest sequence still staged
    pub fn new(
        store: Arc<SqliteStore>,
        backend: Arc<B>,
        max_replays: Option<u32>,
    ) -> Result<Self, RelayError> {
        let next_sequence = store.last_key()?.map_or(1, |last| last + 1);
        debug!("sequencer starts at {}", next_sequence);

        Ok(Self {
            store,
            backend,
            max_replays,
            state: Mutex::new(SequencerState {
                next_sequence,
                epoch: None,
                in_flight: HashMap::new(),
                replays: HashMap::new(),
                connected: false,
            }),
        })
    }

    /// Stage a message durably, then send it
    ///
    /// The record is committed before anything goes to the broker. When
    /// the send fails the sequence is still returned inside
    /// `RelayError::Unsent`; the record is replayed after reconnecting.
    /// Names the broker could not carry are refused up front.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Bytes,
    ) -> Result<Sequence, RelayError> {
        check_name("exchange", exchange)?;
        check_name("routing key", routing_key)?;

        let mut state = self.state.lock().await;

        let message = StagedMessage {
            sequence: state.next_sequence,
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            payload,
        };
        self.stage(&message)?;
        state.next_sequence += 1;
        let sequence = message.sequence;

        if !state.connected {
            trace!("message {} staged while disconnected", sequence);
            return Err(RelayError::Unsent {
                sequence,
                source: BrokerError::ConnectionLost("broker connection is down".to_string()),
            });
        }

        match self
            .backend
            .publish(&message.exchange, &message.routing_key, message.payload)
            .await
        {
            Ok(tag) => {
                trace!("message {} sent as delivery tag {}", sequence, tag);
                state.in_flight.insert(tag, sequence);
                Ok(sequence)
            }
            Err(e) => {
                warn!("message {} staged but not sent: {}", sequence, e);
                Err(RelayError::Unsent {
                    sequence,
                    source: e,
                })
            }
        }
    }

    fn stage(&self, message: &StagedMessage) -> Result<(), StoreError> {
        let mut cursor = self.store.begin()?;
        cursor.set_key(message.sequence);
        match cursor.put(&encode_message(message)) {
            Ok(()) => cursor.end(true),
            Err(e) => {
                error!("failed to stage message {}: {}", message.sequence, e);
                cursor.end(false)?;
                Err(e)
            }
        }
    }

    /// Retire the record for `sequence`; absent records are ignored
    pub async fn on_ack(&self, sequence: Sequence) -> Result<(), RelayError> {
        let mut state = self.state.lock().await;
        state.replays.remove(&sequence);
        self.retire(sequence)?;
        Ok(())
    }

    /// Retire the records behind a batch of acknowledged delivery tags
    ///
    /// Acks from any connection but the current one are stale and
    /// dropped whole; tags unknown on the current one are duplicates.
    pub async fn confirm(&self, epoch: Epoch, tags: &[DeliveryTag]) -> Result<(), RelayError> {
        let mut state = self.state.lock().await;
        if state.epoch != Some(epoch) {
            debug!(
                "dropping {} ack(s) from connection {}, current is {:?}",
                tags.len(),
                epoch,
                state.epoch
            );
            return Ok(());
        }

        for tag in tags {
            match state.in_flight.remove(tag) {
                Some(sequence) => {
                    state.replays.remove(&sequence);
                    self.retire(sequence)?;
                }
                None => trace!("ignoring ack for unknown delivery tag {}", tag),
            }
        }
        Ok(())
    }

    fn retire(&self, sequence: Sequence) -> Result<(), StoreError> {
        let mut cursor = self.store.begin()?;
        let deleted = match cursor.get(sequence) {
            Ok(Lookup::Found) => cursor.delete().map(|()| true),
            Ok(Lookup::NotFound) => Ok(false),
            Err(e) => Err(e),
        };

        match deleted {
            Ok(found) => {
                cursor.end(true)?;
                if found {
                    trace!("retired message {}", sequence);
                } else {
                    trace!("message {} already retired", sequence);
                }
                Ok(())
            }
            Err(e) => {
                error!("failed to retire message {}: {}", sequence, e);
                cursor.end(false)?;
                Err(e)
            }
        }
    }

    /// Forget every tag of the dropped connection
    ///
    /// The store is untouched: whatever was unacknowledged is still staged
    /// and goes out again on the next replay.
    pub async fn on_connection_lost(&self) {
        let mut state = self.state.lock().await;
        if !state.in_flight.is_empty() {
            info!(
                "{} message(s) in flight when the connection dropped",
                state.in_flight.len()
            );
        }
        state.in_flight.clear();
        state.epoch = None;
        state.connected = false;
    }

    /// Publish every staged record again, in sequence order
    pub async fn replay(&self) -> Result<usize, RelayError> {
        let mut state = self.state.lock().await;
        self.replay_locked(&mut state).await
    }

    /// Connect the backend, then replay before accepting fresh publishes
    pub async fn reconnect(&self) -> Result<usize, RelayError> {
        let epoch = self.backend.connect().await?;

        let mut state = self.state.lock().await;
        state.epoch = Some(epoch);
        let replayed = self.replay_locked(&mut state).await?;
        state.connected = true;
        Ok(replayed)
    }

    async fn replay_locked(&self, state: &mut SequencerState) -> Result<usize, RelayError> {
        state.in_flight.clear();

        let mut cursor = self.store.begin()?;
        let mut replayed = 0;

        let walked = async {
            while cursor.sibling(Direction::Next)? == Lookup::Found {
                let message = cursor.message()?;
                let sequence = message.sequence;

                let names = check_name("exchange", &message.exchange)
                    .and_then(|()| check_name("routing key", &message.routing_key));
                if let Err(e) = names {
                    error!("dropping message {} that can never be sent: {}", sequence, e);
                    cursor.delete()?;
                    state.replays.remove(&sequence);
                    continue;
                }

                let attempts = state.replays.get(&sequence).copied().unwrap_or(0);

                if let Some(max) = self.max_replays {
                    if attempts >= max {
                        error!(
                            "dropping message {} for {}/{} after {} replays",
                            sequence, message.exchange, message.routing_key, attempts
                        );
                        cursor.delete()?;
                        state.replays.remove(&sequence);
                        continue;
                    }
                }

                let tag = self
                    .backend
                    .publish(&message.exchange, &message.routing_key, message.payload)
                    .await?;
                state.in_flight.insert(tag, sequence);
                state.replays.insert(sequence, attempts + 1);
                replayed += 1;
            }
            Ok::<(), RelayError>(())
        }
        .await;

        match walked {
            Ok(()) => {
                // commits deletions made by the replay limit, if any
                cursor.end(true)?;
                if replayed > 0 {
                    info!("replayed {} staged message(s)", replayed);
                }
                Ok(replayed)
            }
            Err(e) => {
                warn!("replay stopped after {} message(s): {}", replayed, e);
                cursor.end(false)?;
                Err(e)
            }
        }
    }

    /// Forward a control method to the broker
    pub async fn rpc(&self, rpc: Rpc) -> Result<(), RelayError> {
        rpc.check()?;
        debug!("rpc {}", rpc);
        self.backend.rpc(rpc).await?;
        Ok(())
    }

    /// Number of records waiting for an acknowledgment
    pub async fn staged_count(&self) -> Result<u64, RelayError> {
        let _state = self.state.lock().await;
        Ok(self.store.count()?)
    }
}
