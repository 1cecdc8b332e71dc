use anyhow::{Context, Result};
use regscan::{AlarmManager, Config, DeviceIoManager, MemoryAlarmStore, Poller, SignalBus};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("regscan=info")),
        )
        .init();

    info!(
        "regscan v{} starting ({})",
        regscan::VERSION,
        regscan::build_info::build_info_string()
    );

    let Some(config_path) = std::env::args().nth(1) else {
        error!("Usage: regscan <config.yaml>");
        std::process::exit(1);
    };

    let config = Config::from_file(&config_path)
        .with_context(|| format!("loading configuration from {}", config_path))?;
    info!("Loaded {} devices from {}", config.devices.len(), config_path);

    let io = Arc::new(DeviceIoManager::connect_tcp(&config.devices)?);
    let alarms = Arc::new(AlarmManager::new(Arc::new(MemoryAlarmStore::new())));
    let bus = SignalBus::new();

    let mut events = alarms.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            info!(
                "Alarm {} [{}] {} -> {}: {}",
                event.occurrence_id,
                event.key,
                event.prev_state.map(|s| s.as_str()).unwrap_or("NEW"),
                event.new_state,
                event.message
            );
        }
    });

    let mut pollers = Vec::with_capacity(config.devices.len());
    let mut handles = Vec::with_capacity(config.devices.len());
    for device in &config.devices {
        let poller = Arc::new(
            Poller::new(device, &config.scan, io.clone(), bus.clone(), alarms.clone())
                .with_context(|| format!("building scan plan for {}", device.name))?,
        );
        if !io.ensure_connected(&device.name).await {
            warn!("Device '{}' not reachable yet, polling anyway", device.name);
        }
        handles.push(tokio::spawn({
            let poller = poller.clone();
            async move { poller.run().await }
        }));
        pollers.push(poller);
    }

    signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("Received shutdown signal");

    for poller in &pollers {
        poller.stop();
    }
    for handle in handles {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Poller error: {}", e),
            Err(e) => error!("Poller task failed: {}", e),
        }
    }
    io.shutdown().await;

    for poller in &pollers {
        let stats = poller.stats();
        info!(
            "Final stats for '{}': {} cycles, {} failed blocks, {} alarm errors",
            stats.device, stats.cycles, stats.failed_blocks, stats.alarm_errors
        );
    }
    info!(
        "{} alarms active at shutdown",
        alarms.active_snapshot()?.len()
    );

    Ok(())
}
