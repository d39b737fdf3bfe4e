use clap::Parser;
use relay::Config;
use relay::service::{self, BoxError};
use tokio::net::TcpListener;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "Stage messages durably and relay them to an AMQP broker", long_about = None)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let config = Config::from_file(&args.config)?;
    info!("Starting relay server");

    let listener = TcpListener::bind(&config.gateway.addr).await?;
    service::run(config, listener, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}
