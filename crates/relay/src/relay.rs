use crate::broker::BrokerEvent;
use crate::config::RelayConfig;
use crate::network::Backend;
use crate::sequencer::{RelayError, Sequencer};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Glue between the broker actor's events and the sequencer
///
/// - acknowledgments retire staged records
/// - a lost connection is re-established with backoff, then replayed
/// - a fatal broker error ends `run` and is handed to the process
pub struct Relay<B: Backend> {
    sequencer: Arc<Sequencer<B>>,
    config: RelayConfig,
}

impl<B: Backend> Relay<B> {
    pub fn new(sequencer: Arc<Sequencer<B>>, config: RelayConfig) -> Self {
        Self { sequencer, config }
    }

    /// Connect for the first time and replay whatever survived the last run
    pub async fn start(&self) -> Result<usize, RelayError> {
        let replayed = self.reconnect().await?;
        info!("relay started, {} staged message(s) replayed", replayed);
        Ok(replayed)
    }

    /// Process broker events until the actor goes away or fails
    pub async fn run(&self, mut events: mpsc::UnboundedReceiver<BrokerEvent>) -> Result<(), RelayError> {
        while let Some(event) = events.recv().await {
            match event {
                BrokerEvent::Acked { epoch, tags } => self.sequencer.confirm(epoch, &tags).await?,
                BrokerEvent::ConnectionLost => {
                    self.sequencer.on_connection_lost().await;
                    self.reconnect().await?;
                }
                BrokerEvent::Fatal(e) => {
                    error!("broker connection failed: {}", e);
                    return Err(e.into());
                }
            }
        }

        info!("broker event queue closed");
        Ok(())
    }

    async fn reconnect(&self) -> Result<usize, RelayError> {
        let max_backoff = Duration::from_millis(self.config.max_backoff_ms);
        let mut backoff = Duration::from_millis(self.config.retry_backoff_ms);

        loop {
            match self.sequencer.reconnect().await {
                Ok(replayed) => return Ok(replayed),
                Err(RelayError::Broker(e)) if e.is_transient() => {
                    warn!("broker unavailable ({}), retrying in {:?}", e, backoff);
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(max_backoff);
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn sequencer(&self) -> Arc<Sequencer<B>> {
        Arc::clone(&self.sequencer)
    }
}
