use std::sync::Arc;

use certkeeper_engine::{Engine, EngineConfig, clock::SystemClock};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = EngineConfig::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or("certkeeperd=info,certkeeper_engine=info".into()),
        )
        .pretty()
        .init();

    let engine = Engine::open(config, Arc::new(SystemClock)).await?;
    info!(certs_dir = %engine.config().certs_dir.display(), "Engine ready");

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down");
        }
        shutdown.cancel();
    });

    engine.run(cancel).await?;
    Ok(())
}
