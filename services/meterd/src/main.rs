//! meterd - Modbus energy meters to MQTT

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use meter_protocols::ProfileRegistry;
use tracing::{error, info};

use meterd::link::connector_for;
use meterd::publisher::SharedPublisher;
use meterd::{MeterdConfig, MqttPublisher, NullPublisher, Poller};

#[derive(Parser, Debug)]
#[command(author, version, about = "meterd - energy meter poller")]
struct Args {
    /// Configuration file
    #[arg(short, long, value_name = "FILE", env = "METERD_CONFIG", default_value = "config.yaml")]
    config: PathBuf,

    /// Poll once and exit
    #[arg(long)]
    oneshot: bool,

    /// Log states instead of publishing them
    #[arg(long)]
    dry_run: bool,

    /// Override the configured log level
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Validate the configuration and list buses and devices
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = MeterdConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    let _log_guard = common::init_logging("meterd", &config.logging)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    let registry = ProfileRegistry::builtin();
    config.validate(&registry)?;

    info!("Starting meterd v{}", env!("CARGO_PKG_VERSION"));

    match args.command {
        Some(Commands::Check) => check(&config, &registry),
        None => run(config, registry, args.oneshot, args.dry_run).await,
    }
}

fn check(config: &MeterdConfig, registry: &ProfileRegistry) -> anyhow::Result<()> {
    let poller = Poller::new(config, registry, Arc::new(NullPublisher), connector_for)?;
    for device in &config.devices {
        println!(
            "{:>3}  {:<8} {:<24} {}",
            device.id,
            device.model(),
            device.display_name(),
            config.bus_spec(device)
        );
    }
    println!(
        "{} devices on {} buses, {} discovery configs",
        poller.device_count(),
        poller.bus_count(),
        poller.discovery_messages().len()
    );
    Ok(())
}

async fn run(
    config: MeterdConfig,
    registry: ProfileRegistry,
    oneshot: bool,
    dry_run: bool,
) -> anyhow::Result<()> {
    let publisher: SharedPublisher = if dry_run {
        Arc::new(NullPublisher)
    } else {
        Arc::new(MqttPublisher::connect(&config.mqtt)?)
    };

    let poller = Poller::new(&config, &registry, Arc::clone(&publisher), connector_for)?;
    let cancel = common::cancel_on_shutdown();

    let outcome = poller.run(cancel, oneshot).await;
    if let Err(e) = &outcome {
        error!("Poller failed: {}", e);
    }
    publisher.shutdown().await?;

    outcome?;
    info!("meterd stopped");
    Ok(())
}
