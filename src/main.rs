use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use salas::clock::SystemClock;
use salas::config::Config;
use salas::engine::Engine;
use salas::mirror::InMemoryCalendar;
use salas::sweeper;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::from_env()?;
    salas::observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;

    let calendar = Arc::new(InMemoryCalendar::new(
        config.timezone,
        config.finalized_color.clone(),
    ));
    let engine = Arc::new(Engine::new(
        config.wal_path(),
        config.engine_options(),
        calendar,
        Arc::new(SystemClock),
    )?);

    info!("salas started");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  timezone: {}", config.timezone);
    info!("  sweep_interval: {}s", config.sweep_interval.as_secs());
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let shutdown = CancellationToken::new();
    let sweeper = tokio::spawn(sweeper::run_sweeper(
        engine.clone(),
        config.sweep_interval,
        shutdown.clone(),
    ));
    let compactor = tokio::spawn(sweeper::run_compactor(
        engine.clone(),
        config.compact_threshold,
        config.sweep_interval,
        shutdown.clone(),
    ));

    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await?;
    }

    info!("shutdown signal received, stopping background tasks");
    shutdown.cancel();
    let _ = tokio::join!(sweeper, compactor);

    info!("salas stopped");
    Ok(())
}
