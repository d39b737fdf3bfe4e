use crate::api::ApiServer;
use crate::broker::BrokerActor;
use crate::config::Config;
use crate::relay::Relay;
use crate::sequencer::Sequencer;
use crate::storage::SqliteStore;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Run the relay until `shutdown` resolves, the gateway dies or the broker
/// connection fails for good
///
/// The gateway accepts clients from the start. Messages published before
/// the first broker connection are staged and go out with the first replay.
pub async fn run<F>(config: Config, listener: TcpListener, shutdown: F) -> Result<(), BoxError>
where
    F: Future<Output = ()>,
{
    if let Some(parent) = config.storage.db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    info!("Opening staging store at: {:?}", config.storage.db_path);
    let store = Arc::new(SqliteStore::open(&config.storage.db_path, &config.storage)?);

    let (actor, events) = BrokerActor::spawn(config.broker.clone()).await?;
    info!("Broker actor started for {}", config.broker.addr());

    let sequencer = Arc::new(Sequencer::new(
        store,
        Arc::new(actor.handle()),
        config.relay.max_replays,
    )?);

    let api_server = ApiServer::new(Arc::clone(&sequencer));
    let mut api_handle = tokio::spawn(async move {
        if let Err(e) = api_server.serve(listener).await {
            error!("API server error: {}", e);
        }
    });

    let relay = Relay::new(sequencer, config.relay.clone());
    let relaying = async {
        relay.start().await?;
        info!("Relay server fully initialized and running");
        relay.run(events).await
    };

    let result: Result<(), BoxError> = tokio::select! {
        result = relaying => result.map_err(|e| e.into()),
        _ = &mut api_handle => Err("API server stopped".into()),
        _ = shutdown => {
            info!("Shutting down");
            Ok(())
        }
    };

    api_handle.abort();
    actor.stop().await;
    result
}
