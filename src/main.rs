//! Judge worker entry point: configuration, logging, signal handling.

use anyhow::Result;
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use judger::config::Config;
use judger::languages;
use judger::scheduler::Scheduler;

fn init_tracing(config: &Config) -> Result<()> {
    let directive = if config.debug {
        "judger=debug"
    } else {
        "judger=info"
    };
    let filter = EnvFilter::from_default_env().add_directive(directive.parse()?);
    let console_layer = tracing_subscriber::fmt::layer();

    if config.log_file.is_empty() {
        tracing_subscriber::registry()
            .with(filter)
            .with(console_layer)
            .init();
    } else {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.log_file)?;
        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(std::sync::Mutex::new(file));
        tracing_subscriber::registry()
            .with(filter)
            .with(console_layer)
            .with(file_layer)
            .init();
    }
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = sigterm.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<()> {
    Ok(tokio::signal::ctrl_c().await?)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::from_env();
    init_tracing(&config)?;

    languages::init_languages()?;
    info!("Loaded language configurations");

    info!(
        "Starting with redis_url={}, sandbox_endpoint={}, init_concurrent={}, log_file='{}'",
        config.redis_url, config.sandbox_endpoint, config.init_concurrent, config.log_file
    );

    let mut scheduler = Scheduler::new(&config);
    scheduler.start()?;

    wait_for_shutdown().await?;
    info!("Shutdown signal received");
    scheduler.stop().await;

    Ok(())
}
