// src/bin/regscan_plan.rs - Print the scan plan of every configured device
use anyhow::{Context, Result};
use regscan::{Config, ScanPlan};
use serde::Serialize;

#[derive(Serialize)]
struct DevicePlan<'a> {
    device: &'a str,
    host: &'a str,
    port: u16,
    unit_id: u8,
    #[serde(flatten)]
    plan: ScanPlan,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("regscan=warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let Some(config_path) = std::env::args().nth(1) else {
        eprintln!("Usage: regscan-plan <config.yaml> [device]");
        std::process::exit(1);
    };
    let only = std::env::args().nth(2);

    let config = Config::from_file(&config_path)
        .with_context(|| format!("loading configuration from {}", config_path))?;

    let mut plans = Vec::new();
    for device in &config.devices {
        if only.as_deref().is_some_and(|name| name != device.name) {
            continue;
        }
        let plan = ScanPlan::build(&device.tags, &config.scan)
            .with_context(|| format!("building scan plan for {}", device.name))?;
        plans.push(DevicePlan {
            device: &device.name,
            host: &device.host,
            port: device.port,
            unit_id: device.unit_id,
            plan,
        });
    }

    if let Some(name) = only {
        if plans.is_empty() {
            anyhow::bail!("device '{}' is not configured", name);
        }
    }

    println!("{}", serde_json::to_string_pretty(&plans)?);
    Ok(())
}
