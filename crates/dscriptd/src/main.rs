use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use dscriptd::Config;
use dscriptd::Engine;
use tracing::error;
use tracing::info;
use tracing::warn;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "dscriptd")]
#[command(about = "Integration daemon for Devantech dScript boards")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, short, default_value = "dscriptd.toml")]
    config: PathBuf,
}

fn init_tracing(config: &Config) {
    let mut targets = Targets::new().with_default(LevelFilter::from(config.logging.level));
    for (target, level) in &config.logging.overrides {
        targets = targets.with_target(target.clone(), LevelFilter::from(*level));
    }
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(targets)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::from_file(&cli.config)?;
    init_tracing(&config);

    info!("dscriptd starting");
    info!("Loaded config from: {}", cli.config.display());

    let engine = Arc::new(Engine::new());
    engine.register_integrations_from_config(&config);

    let engine_task = {
        let engine = engine.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.run().await {
                error!("Engine stopped with error: {}", e);
            }
        })
    };

    let (api_shutdown_tx, api_shutdown_rx) = tokio::sync::oneshot::channel();
    let api_task = match config.api.as_ref().filter(|api| api.enabled) {
        Some(api) => {
            let listen = api.listen.clone();
            let port = api.port;
            let engine = engine.clone();
            Some(tokio::spawn(async move {
                if let Err(e) = dscriptd::api::serve(listen, port, engine, api_shutdown_rx).await {
                    error!("HTTP API server failed: {}", e);
                }
            }))
        }
        None => {
            info!("HTTP API disabled");
            None
        }
    };

    info!("Press Ctrl+C to exit");
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal"),
        Err(e) => error!("Failed to listen for shutdown signal: {}", e),
    }

    if let Some(api_task) = api_task {
        let _ = api_shutdown_tx.send(());
        if let Err(e) = api_task.await {
            warn!("HTTP API task ended abnormally: {}", e);
        }
    }

    info!("Shutting down integrations...");
    engine.shutdown().await;
    engine_task.abort();

    info!("dscriptd shutdown complete");
    Ok(())
}
