//! meterctl - read and reconfigure DDS661 / SDM230 meters
//!
//! Examples:
//!   meterctl --config config.yaml --slave 5 read
//!   meterctl --config config.yaml --slave 5 write --baud 9600 --parity-new 0 --slave-new 6

mod commands;
mod target;

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use common::LogConfig;
use meter_protocols::{BusLink, PacingConfig, ProfileRegistry};
use meterd::config::{MeterdConfig, PollingConfig};
use tracing::debug;

use crate::commands::WriteRequest;
use crate::target::{LinkArgs, Target};

#[derive(Parser, Debug)]
#[command(name = "meterctl", author, version, about = "Modbus energy meter tool")]
struct Cli {
    /// Optional meterd config: serial defaults and the device list
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(flatten)]
    link: LinkArgs,

    /// Debug logging on stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Read parameters (holding) and measurements (input)
    Read,

    /// Write parameters; values the meter already holds are left alone
    Write {
        /// New baud rate, e.g. 9600 (SDM230 codes are handled internally)
        #[arg(long)]
        baud: Option<f32>,

        /// New parity code (meter specific)
        #[arg(long = "parity-new")]
        parity_new: Option<f32>,

        /// New Modbus unit id 1..247
        #[arg(long = "slave-new")]
        slave_new: Option<f32>,

        /// Write even unchanged values
        #[arg(long)]
        force: bool,
    },

    /// Show the register maps of the supported meters
    Profiles,
}

#[tokio::main]
async fn main() -> Result<()> {
    let Cli {
        config,
        link,
        verbose,
        command,
    } = Cli::parse();

    let log = LogConfig {
        level: if verbose { "debug" } else { "warn" }.to_string(),
        stderr: true,
        ..LogConfig::default()
    };
    let _log_guard = common::init_logging("meterctl", &log)
        .map_err(|e| anyhow!("Failed to initialize logging: {}", e))?;

    let registry = ProfileRegistry::builtin();
    match command {
        Commands::Profiles => print!("{}", commands::profiles(&registry)),
        Commands::Read => {
            let opened = open(config.as_deref(), &link, &registry)?;
            let mut bus = opened.link;
            let doc = commands::read(&mut bus, &opened.target, &opened.pacing).await?;
            print_json(&doc)?;
        },
        Commands::Write {
            baud,
            parity_new,
            slave_new,
            force,
        } => {
            let request = WriteRequest {
                baud,
                parity: parity_new,
                slave: slave_new,
                force,
            };
            let opened = open(config.as_deref(), &link, &registry)?;
            let mut bus = opened.link;
            let (doc, report) =
                commands::write(&mut bus, &opened.target, &opened.pacing, request).await?;
            commands::print_write_warnings(&report);
            print_json(&doc)?;
        },
    }
    Ok(())
}

/// Resolved meter, request pacing and an unopened link to it
struct Opened {
    target: Target,
    pacing: PacingConfig,
    link: BusLink,
}

fn open(config: Option<&Path>, args: &LinkArgs, registry: &ProfileRegistry) -> Result<Opened> {
    let config = config.map(MeterdConfig::load).transpose()?;
    let target = Target::resolve(args, config.as_ref(), registry)?;
    let pacing = config
        .as_ref()
        .map(|c| c.polling.pacing())
        .unwrap_or_else(|| PollingConfig::default().pacing());
    debug!("{} unit {} via {}", target.model, target.unit.value(), target.bus);

    let link = BusLink::new(target.connector(args.simulate));
    Ok(Opened {
        target,
        pacing,
        link,
    })
}

fn print_json(doc: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(doc)?);
    Ok(())
}
