use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use vibepit_proxy::ProxyConfig;
use vibepit_proxy::ProxyServer;

#[derive(Debug, Parser)]
#[command(name = "vibepit-proxy", about = "vibepit sandbox network proxy")]
struct Args {
    /// Path to the merged session configuration JSON written by the launcher.
    #[arg(long, value_name = "FILE")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let config = ProxyConfig::load(&args.config)?;
    let server = ProxyServer::from_config(config)?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            cancel.cancel();
        }
    });

    server.run(cancel).await
}
