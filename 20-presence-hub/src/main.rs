use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use presence_hub::{
    cli::{Cli, Command},
    client,
    server::Server,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => {
            let listener = TcpListener::bind(args.listen)
                .await
                .with_context(|| format!("failed to bind {}", args.listen))?;
            let server = Server::new(listener, args.hub_config());
            let addr = server.local_addr()?;
            info!("presence hub listening on {}", addr);
            info!("websocket endpoint: ws://{}/ws?username=<name>", addr);
            if let Err(err) = server.run_until_ctrl_c().await {
                warn!("presence hub exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Probe(args) => client::run(args).await?,
    }

    Ok(())
}
