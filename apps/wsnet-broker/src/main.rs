use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use wsnet_broker::config::Config;
use wsnet_broker::{router, RelayState};

#[derive(Parser, Debug)]
#[command(name = "wsnet-broker")]
#[command(about = "Signalling relay pairing wsnet listeners with dialers")]
struct Cli {
    /// Address to bind
    #[arg(long, env = "WSNET_BROKER_BIND")]
    bind: Option<String>,

    /// Port to listen on
    #[arg(short, long, env = "WSNET_BROKER_PORT")]
    port: Option<u16>,
}

impl Cli {
    fn apply(self, mut config: Config) -> Config {
        if let Some(bind) = self.bind {
            config.bind = bind;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "warn");
    }
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Cli::parse().apply(Config::from_env());
    let address = config.address();
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("bind {address}"))?;
    info!("wsnet broker listening on {}", address);

    axum::serve(listener, router(RelayState::default()))
        .await
        .context("serve broker")?;
    Ok(())
}
